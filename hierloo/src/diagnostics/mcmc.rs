//! MCMC quality metrics
//!
//! This module provides functionality to:
//! - Compute split R-hat and effective sample sizes (rank-normalized bulk and tail)
//! - Count divergent transitions
//! - Grade overall fit quality
//!
//! Nothing here runs unless asked for; fitting never checks convergence on
//! its own.

use crate::error::{Error, Result};
use crate::fit::Fit;
use crate::math;
use serde::{Deserialize, Serialize};

/// MCMC statistics for a single parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamMcmcStats {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub rhat: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
    pub q05: f64,
    pub q50: f64,
    pub q95: f64,
}

/// Summary of MCMC fit quality
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitMcmcSummary {
    pub n_draws: usize,
    pub n_chains: usize,
    pub n_divergent: usize,
    pub params: Vec<ParamMcmcStats>,
    pub overall_quality: FitQuality,
}

/// Overall fit quality assessment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitQuality {
    pub has_convergence_issues: bool,
    pub has_sampling_issues: bool,
    pub max_rhat: f64,
    pub min_ess_bulk: f64,
    pub quality_grade: String, // "A", "B", "C", "D", "F"
}

/// Convergence summary of every column of a sampled fit.
pub fn summarize_mcmc(fit: &Fit) -> Result<FitMcmcSummary> {
    let draws = fit.draws().ok_or_else(|| {
        Error::InvalidConfig("MCMC diagnostics need posterior draws, not a point estimate".to_string())
    })?;
    if draws.n_draws() == 0 {
        return Err(Error::InvalidConfig("fit has no draws".to_string()));
    }

    let mut param_stats = Vec::with_capacity(fit.columns().len());
    let mut max_rhat: f64 = 0.0;
    let mut min_ess_bulk = f64::INFINITY;

    for (idx, name) in fit.columns().iter().enumerate() {
        let per_chain: Vec<Vec<f64>> = draws
            .chains
            .iter()
            .map(|chain| chain.iter().map(|row| row[idx]).collect())
            .collect();
        let flat: Vec<f64> = per_chain.iter().flatten().copied().collect();
        let sorted = math::sorted_copy(&flat);

        let rhat = split_rhat(&per_chain);
        let ess_bulk = bulk_ess(&per_chain);
        let ess_tail = tail_ess(&per_chain, &sorted);

        if rhat.is_finite() {
            max_rhat = max_rhat.max(rhat);
        }
        if ess_bulk.is_finite() {
            min_ess_bulk = min_ess_bulk.min(ess_bulk);
        }

        param_stats.push(ParamMcmcStats {
            name: name.clone(),
            mean: math::mean(&flat),
            sd: math::sd(&flat),
            rhat,
            ess_bulk,
            ess_tail,
            q05: math::quantile_sorted(&sorted, 0.05),
            q50: math::quantile_sorted(&sorted, 0.50),
            q95: math::quantile_sorted(&sorted, 0.95),
        });
    }

    let n_draws = draws.n_draws();
    let n_divergent = draws.divergent;
    let has_convergence_issues = max_rhat > 1.01 || min_ess_bulk < 100.0;
    let has_sampling_issues = n_divergent > 0;

    let quality_grade = if !has_convergence_issues && !has_sampling_issues {
        "A" // Excellent
    } else if max_rhat < 1.05 && min_ess_bulk > 50.0 && n_divergent < 10 {
        "B" // Good
    } else if max_rhat < 1.10 && min_ess_bulk > 20.0 {
        "C" // Acceptable with caution
    } else if max_rhat < 1.20 {
        "D" // Poor, proceed with extreme caution
    } else {
        "F" // Failed convergence
    };

    Ok(FitMcmcSummary {
        n_draws,
        n_chains: draws.n_chains(),
        n_divergent,
        params: param_stats,
        overall_quality: FitQuality {
            has_convergence_issues,
            has_sampling_issues,
            max_rhat,
            min_ess_bulk,
            quality_grade: quality_grade.to_string(),
        },
    })
}

impl FitMcmcSummary {
    pub fn render_table(&self) -> String {
        let mut out = format!(
            "{:<14} {:>9} {:>9} {:>9} {:>9} {:>9} {:>7} {:>8} {:>8}\n",
            "Parameter", "Mean", "SD", "5%", "50%", "95%", "Rhat", "ESS_bulk", "ESS_tail"
        );
        out.push_str(&format!("{}\n", "-".repeat(90)));
        for p in &self.params {
            out.push_str(&format!(
                "{:<14} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>7.3} {:>8.0} {:>8.0}\n",
                p.name, p.mean, p.sd, p.q05, p.q50, p.q95, p.rhat, p.ess_bulk, p.ess_tail
            ));
        }
        out.push_str(&format!(
            "\nchains: {}  draws: {}  divergent: {}  max Rhat: {:.3}  min ESS: {:.0}  grade: {}\n",
            self.n_chains,
            self.n_draws,
            self.n_divergent,
            self.overall_quality.max_rhat,
            self.overall_quality.min_ess_bulk,
            self.overall_quality.quality_grade
        ));
        out
    }
}

/// Split each chain into its first and second half (the middle draw of an
/// odd-length chain is dropped).
fn split_chains(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    chains
        .iter()
        .flat_map(|chain| {
            let half = chain.len() / 2;
            let second = chain.len() - half;
            vec![chain[..half].to_vec(), chain[second..].to_vec()]
        })
        .filter(|c| !c.is_empty())
        .collect()
}

/// Potential scale reduction on split chains.
pub fn split_rhat(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    let m = split.len();
    if m < 2 {
        return f64::NAN;
    }
    let n = split.iter().map(|c| c.len()).min().unwrap_or(0);
    if n < 2 {
        return f64::NAN;
    }

    let means: Vec<f64> = split.iter().map(|c| math::mean(c)).collect();
    let within = split.iter().map(|c| math::variance(c)).sum::<f64>() / m as f64;
    let between = n as f64 * math::variance(&means);
    if within <= 0.0 {
        // constant chains agree only if their values agree
        return if between <= 0.0 { 1.0 } else { f64::INFINITY };
    }
    let var_plus = ((n - 1) as f64 * within + between) / n as f64;
    (var_plus / within).sqrt()
}

/// Effective sample size from split chains, Geyer's initial positive
/// sequence with monotone correction.
pub fn ess(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    let m = split.len();
    if m == 0 {
        return f64::NAN;
    }
    let n = split.iter().map(|c| c.len()).min().unwrap_or(0);
    if n < 4 {
        return f64::NAN;
    }
    let split: Vec<&[f64]> = split.iter().map(|c| &c[..n]).collect();

    let means: Vec<f64> = split.iter().map(|c| math::mean(c)).collect();
    let mean_var = split.iter().map(|c| math::variance(c)).sum::<f64>() / m as f64;
    let var_plus = if m > 1 {
        mean_var * (n - 1) as f64 / n as f64 + math::variance(&means)
    } else {
        mean_var * (n - 1) as f64 / n as f64
    };
    if var_plus <= 0.0 {
        return f64::NAN;
    }

    // average biased autocovariance across chains at lag t
    let acov = |t: usize| -> f64 {
        split
            .iter()
            .zip(&means)
            .map(|(c, mean)| {
                (0..n - t)
                    .map(|i| (c[i] - mean) * (c[i + t] - mean))
                    .sum::<f64>()
                    / n as f64
            })
            .sum::<f64>()
            / m as f64
    };
    let rho = |t: usize| 1.0 - (mean_var * (n - 1) as f64 / n as f64 - acov(t)) / var_plus;

    let mut sum = 0.0;
    let mut prev_pair = f64::INFINITY;
    let mut t = 0;
    while t + 1 < n {
        let pair = if t == 0 { 1.0 + rho(1) } else { rho(t) + rho(t + 1) };
        if pair < 0.0 {
            break;
        }
        let pair = pair.min(prev_pair);
        sum += pair;
        prev_pair = pair;
        t += 2;
    }
    let tau = (-1.0 + 2.0 * sum).max(1.0 / ((m * n) as f64).log10());
    (m * n) as f64 / tau
}

/// ESS of the rank-normalized draws (Vehtari et al. 2021).
pub fn bulk_ess(chains: &[Vec<f64>]) -> f64 {
    ess(&rank_normalize(chains))
}

/// Replace each draw by `Phi^-1((r - 3/8) / (S + 1/4))`, where `r` is its
/// rank among all `S` draws; ties share their average rank.
fn rank_normalize(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut order: Vec<(usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(c, chain)| (0..chain.len()).map(move |i| (c, i)))
        .collect();
    order.sort_by(|a, b| chains[a.0][a.1].total_cmp(&chains[b.0][b.1]));

    let total = order.len() as f64;
    let mut out: Vec<Vec<f64>> = chains.iter().map(|c| vec![0.0; c.len()]).collect();
    let mut start = 0;
    while start < order.len() {
        let (c0, i0) = order[start];
        let value = chains[c0][i0];
        let mut end = start + 1;
        while end < order.len() && chains[order[end].0][order[end].1] == value {
            end += 1;
        }
        // 1-based average rank of the tied block
        let rank = (start + 1 + end) as f64 / 2.0;
        let z = math::std_normal_quantile((rank - 0.375) / (total + 0.25));
        for &(c, i) in &order[start..end] {
            out[c][i] = z;
        }
        start = end;
    }
    out
}

/// Smaller of the ESS of the 5% and 95% quantile indicators.
fn tail_ess(chains: &[Vec<f64>], sorted: &[f64]) -> f64 {
    let q05 = math::quantile_sorted(sorted, 0.05);
    let q95 = math::quantile_sorted(sorted, 0.95);
    let lower = ess(&indicator(chains, |x| x <= q05));
    let upper = ess(&indicator(chains, |x| x >= q95));
    lower.min(upper)
}

fn indicator(chains: &[Vec<f64>], pred: impl Fn(f64) -> bool) -> Vec<Vec<f64>> {
    chains
        .iter()
        .map(|c| c.iter().map(|&x| if pred(x) { 1.0 } else { 0.0 }).collect())
        .collect()
}
