//! Posterior summaries
//!
//! Per-column mean, standard deviation and an interval whose bounds are
//! explicit probabilities. Point fits summarize to the point value with a
//! zero-width interval.

use crate::data::SaveDataset;
use crate::datagen::Truth;
use crate::error::{Error, Result};
use crate::fit::{Fit, FitOutput};
use crate::math;
use serde::{Deserialize, Serialize};

/// Lower and upper quantile probabilities of a posterior interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

impl Default for Interval {
    /// Central 95%.
    fn default() -> Self {
        Self {
            lower: 0.025,
            upper: 0.975,
        }
    }
}

impl Interval {
    /// Central interval holding `mass` of the posterior, e.g. 0.9.
    pub fn central(mass: f64) -> Result<Self> {
        let interval = Self {
            lower: (1.0 - mass) / 2.0,
            upper: 1.0 - (1.0 - mass) / 2.0,
        };
        interval.validate()?;
        Ok(interval)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0 <= self.lower && self.lower < self.upper && self.upper <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "interval bounds must satisfy 0 <= lower < upper <= 1, got {} and {}",
                self.lower, self.upper
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SummaryOptions {
    pub interval: Interval,
    /// Only these columns, in this order; all columns when empty
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub low: f64,
    pub high: f64,
    pub truth: Option<f64>,
}

pub fn summarize(fit: &Fit, options: &SummaryOptions) -> Result<Vec<ParamSummary>> {
    options.interval.validate()?;
    let names: Vec<String> = if options.columns.is_empty() {
        fit.columns().to_vec()
    } else {
        options.columns.clone()
    };

    names
        .into_iter()
        .map(|name| {
            let values = fit.column(&name).ok_or_else(|| {
                Error::InvalidConfig(format!("fit of {} has no column {}", fit.model().name(), name))
            })?;
            Ok(match fit.output() {
                FitOutput::Point(_) => ParamSummary {
                    name,
                    mean: values[0],
                    sd: 0.0,
                    low: values[0],
                    high: values[0],
                    truth: None,
                },
                FitOutput::Draws(_) => {
                    let sorted = math::sorted_copy(&values);
                    ParamSummary {
                        name,
                        mean: math::mean(&values),
                        sd: math::sd(&values),
                        low: math::quantile_sorted(&sorted, options.interval.lower),
                        high: math::quantile_sorted(&sorted, options.interval.upper),
                        truth: None,
                    }
                }
            })
        })
        .collect()
}

/// Attach known generating values by parameter name.
pub fn with_truth(mut summaries: Vec<ParamSummary>, truth: &Truth) -> Vec<ParamSummary> {
    for s in summaries.iter_mut() {
        s.truth = truth.get(&s.name).copied();
    }
    summaries
}

pub fn render_table(summaries: &[ParamSummary], interval: &Interval) -> String {
    let width = summaries
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(9)
        .max(9);
    let low = format!("{:.1}%", interval.lower * 100.0);
    let high = format!("{:.1}%", interval.upper * 100.0);
    let mut out = format!(
        "{:<width$} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
        "Parameter",
        "Mean",
        "SD",
        low,
        high,
        "True",
        width = width
    );
    out.push_str(&format!("{}\n", "-".repeat(width + 50)));
    for s in summaries {
        let truth = s
            .truth
            .map(|t| format!("{:.3}", t))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<width$} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9}\n",
            s.name,
            s.mean,
            s.sd,
            s.low,
            s.high,
            truth,
            width = width
        ));
    }
    out
}

/// Per-group counts with the closed-form posterior under a uniform prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group: String,
    pub successes: u32,
    pub failures: u32,
    /// `s / (s + f)`, NaN for a group with no trials
    pub empirical_rate: f64,
    /// Mean of Beta(s + 1, f + 1)
    pub posterior_mean: f64,
    pub posterior_sd: f64,
}

pub fn group_summaries(data: &SaveDataset) -> Vec<GroupSummary> {
    data.groups
        .iter()
        .zip(data.counts())
        .map(|(group, (s, f))| {
            let a = s as f64 + 1.0;
            let b = f as f64 + 1.0;
            let n = (s + f) as f64;
            GroupSummary {
                group: group.clone(),
                successes: s,
                failures: f,
                empirical_rate: if n > 0.0 { s as f64 / n } else { f64::NAN },
                posterior_mean: a / (a + b),
                posterior_sd: (a * b / ((a + b).powi(2) * (a + b + 1.0))).sqrt(),
            }
        })
        .collect()
}

pub fn render_groups(groups: &[GroupSummary]) -> String {
    let width = groups.iter().map(|g| g.group.len()).max().unwrap_or(5).max(5);
    let mut out = format!(
        "{:<width$} {:>6} {:>6} {:>9} {:>9} {:>9}\n",
        "Group",
        "Saves",
        "Goals",
        "Rate",
        "PostMean",
        "PostSD",
        width = width
    );
    for g in groups {
        out.push_str(&format!(
            "{:<width$} {:>6} {:>6} {:>9.3} {:>9.3} {:>9.3}\n",
            g.group,
            g.successes,
            g.failures,
            g.empirical_rate,
            g.posterior_mean,
            g.posterior_sd,
            width = width
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Shot;
    use crate::fit::{Draws, Method, PointEstimate, Termination};
    use crate::model::{ModelSpec, SaveRateSpec};

    fn draws_fit(values: Vec<f64>) -> Fit {
        let rows = values.into_iter().map(|v| vec![v]).collect();
        Fit::new(
            ModelSpec::SaveRate(SaveRateSpec::independent()),
            Method::Sample,
            "test",
            vec!["p[1]".to_string()],
            1,
            FitOutput::Draws(Draws {
                chains: vec![rows],
                lp: vec![vec![]],
                divergent: 0,
                step_sizes: vec![],
            }),
            None,
        )
    }

    #[test]
    fn test_summary_quantiles_interpolate() {
        let fit = draws_fit((0..=100).map(|i| i as f64).collect());
        let s = summarize(&fit, &SummaryOptions::default()).unwrap();
        assert_eq!(s.len(), 1);
        assert!((s[0].mean - 50.0).abs() < 1e-12);
        assert!((s[0].low - 2.5).abs() < 1e-12);
        assert!((s[0].high - 97.5).abs() < 1e-12);
    }

    #[test]
    fn test_custom_interval() {
        let fit = draws_fit((0..=100).map(|i| i as f64).collect());
        let options = SummaryOptions {
            interval: Interval::central(0.5).unwrap(),
            ..SummaryOptions::default()
        };
        let s = summarize(&fit, &options).unwrap();
        assert!((s[0].low - 25.0).abs() < 1e-12);
        assert!((s[0].high - 75.0).abs() < 1e-12);
        assert!(Interval::central(1.5).is_err());
    }

    #[test]
    fn test_point_fit_has_zero_width() {
        let fit = Fit::new(
            ModelSpec::SaveRate(SaveRateSpec::independent()),
            Method::Optimize,
            "test",
            vec!["p[1]".to_string()],
            1,
            FitOutput::Point(PointEstimate {
                values: vec![0.6],
                log_density: -1.0,
                iterations: 3,
                termination: Termination::Gradient,
            }),
            None,
        );
        let s = summarize(&fit, &SummaryOptions::default()).unwrap();
        assert_eq!((s[0].low, s[0].mean, s[0].high), (0.6, 0.6, 0.6));
    }

    #[test]
    fn test_unknown_column() {
        let fit = draws_fit(vec![1.0, 2.0]);
        let options = SummaryOptions {
            columns: vec!["tau".to_string()],
            ..SummaryOptions::default()
        };
        assert!(summarize(&fit, &options).is_err());
    }

    #[test]
    fn test_truth_joined_by_name() {
        let fit = draws_fit(vec![0.5, 0.7]);
        let mut truth = Truth::new();
        truth.insert("p[1]".to_string(), 0.65);
        truth.insert("tau".to_string(), 0.5);
        let s = with_truth(summarize(&fit, &SummaryOptions::default()).unwrap(), &truth);
        assert_eq!(s[0].truth, Some(0.65));
        assert!(render_table(&s, &Interval::default()).contains("0.650"));
    }

    #[test]
    fn test_group_summaries_closed_form() {
        let mut shots = vec![Shot { group: 0, saved: true }; 7];
        shots.extend(vec![Shot { group: 0, saved: false }; 3]);
        shots.push(Shot { group: 1, saved: false });
        let data = SaveDataset::new(vec!["a".to_string(), "b".to_string()], shots).unwrap();
        let g = group_summaries(&data);
        assert_eq!((g[0].successes, g[0].failures), (7, 3));
        assert!((g[0].posterior_mean - 8.0 / 12.0).abs() < 1e-12);
        assert!((g[0].empirical_rate - 0.7).abs() < 1e-12);
        assert!((g[1].posterior_mean - 1.0 / 3.0).abs() < 1e-12);
        // Beta(8, 4): var = 32 / (144 * 13)
        assert!((g[0].posterior_sd - (32.0f64 / (144.0 * 13.0)).sqrt()).abs() < 1e-12);
    }
}
