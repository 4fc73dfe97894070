//! CmdStan execution
//!
//! This module provides functionality to:
//! - Detect a cmdstan installation
//! - Compile generated Stan programs (memoized by [`ModelCache`])
//! - Run `sample` and `optimize` with data written as Stan JSON
//! - Parse the output CSV back into a [`Fit`]
//!
//! Plumbing errors are `anyhow` with context; they become
//! [`crate::Error::Engine`] at the [`FitEngine`] boundary.

use crate::cache::ModelCache;
use crate::data::{poll_stan_json, save_stan_json, DataSet};
use crate::engine::FitEngine;
use crate::fit::{Draws, Fit, FitOutput, LogLikMatrix, Method, PointEstimate, Termination};
use crate::model::{LogDensity, ModelSpec, Pooling};
use crate::optimize::OptimizeConfig;
use crate::sampler::SampleConfig;
use anyhow::{bail, Context, Result};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Detect cmdstan installation
pub fn detect_cmdstan() -> Result<PathBuf> {
    find_cmdstan(std::env::var("CMDSTAN").ok(), std::env::var("HOME").ok())
}

fn find_cmdstan(env: Option<String>, home: Option<String>) -> Result<PathBuf> {
    if let Some(path) = env {
        let cmdstan_path = PathBuf::from(&path);
        if cmdstan_path.exists() {
            return Ok(cmdstan_path);
        }
    }

    let mut common_paths = Vec::new();
    if let Some(home) = home {
        common_paths.push(format!("{}/.cmdstan", home));
        common_paths.push(format!("{}/cmdstan", home));
    }
    common_paths.push("/usr/local/cmdstan".to_string());
    common_paths.push("/opt/cmdstan".to_string());

    for path in common_paths {
        let cmdstan_path = PathBuf::from(&path);
        if cmdstan_path.exists() {
            // installs live in versioned subdirectories; take the latest
            if let Ok(entries) = fs::read_dir(&cmdstan_path) {
                let mut versions: Vec<_> = entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_dir())
                    .collect();
                versions.sort_by_key(|e| e.path());
                if let Some(latest) = versions.last() {
                    return Ok(latest.path());
                }
            }
        }
    }

    bail!("cmdstan not found. Please set CMDSTAN environment variable or install cmdstan")
}

/// Compile a Stan model to an executable next to the source file.
pub fn compile_stan_model(stan_file: &Path, cmdstan_path: &Path) -> Result<PathBuf> {
    let model_name = stan_file
        .file_stem()
        .context("Invalid Stan file name")?
        .to_string_lossy()
        .to_string();
    let exe_path = stan_file.with_extension("");

    info!(model = %model_name, "compiling Stan model");
    let output = Command::new("make")
        .current_dir(cmdstan_path)
        .arg(exe_path.to_string_lossy().to_string())
        .output()
        .context("Failed to execute make")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("Stan compilation failed:\n{}", stderr);
    }

    debug!(model = %model_name, path = %exe_path.display(), "compilation successful");
    Ok(exe_path)
}

/// Run one CmdStan process per chain. Returns the chain CSV paths.
pub fn run_sample(
    exe_path: &Path,
    data_file: &Path,
    output_dir: &Path,
    config: &SampleConfig,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir).context("Failed to create output directory")?;

    let mut chain_files = Vec::with_capacity(config.num_chains);
    for chain_id in 1..=config.num_chains {
        let output_file = output_dir.join(format!("output_{}.csv", chain_id));
        debug!(chain = chain_id, chains = config.num_chains, "running chain");

        let output = Command::new(exe_path)
            .arg("sample")
            .arg(format!("num_warmup={}", config.num_warmup))
            .arg(format!("num_samples={}", config.num_samples))
            .arg("adapt")
            .arg(format!("delta={}", config.adapt_delta))
            .arg("data")
            .arg(format!("file={}", data_file.display()))
            .arg(format!("init={}", config.init_radius))
            .arg("output")
            .arg(format!("file={}", output_file.display()))
            .arg("random")
            .arg(format!("seed={}", config.seed.wrapping_add(chain_id as u64 - 1)))
            .arg(format!("id={}", chain_id))
            .output()
            .context("Failed to execute Stan model")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Chain {} failed:\n{}", chain_id, stderr);
        }
        chain_files.push(output_file);
    }
    Ok(chain_files)
}

/// Run CmdStan's L-BFGS optimizer, writing the mode to `output_file`.
pub fn run_optimize(
    exe_path: &Path,
    data_file: &Path,
    output_file: &Path,
    config: &OptimizeConfig,
) -> Result<Termination> {
    if let Some(dir) = output_file.parent() {
        fs::create_dir_all(dir).context("Failed to create output directory")?;
    }
    let output = Command::new(exe_path)
        .arg("optimize")
        .arg("algorithm=lbfgs")
        .arg(format!("iter={}", config.max_iterations))
        .arg(format!("tol_obj={:e}", config.tol_obj))
        .arg(format!("tol_rel_obj={:e}", config.tol_rel_obj / f64::EPSILON))
        .arg(format!("tol_grad={:e}", config.tol_grad))
        .arg(format!("tol_param={:e}", config.tol_param))
        .arg(format!("history_size={}", config.history_size))
        .arg("data")
        .arg(format!("file={}", data_file.display()))
        .arg(format!("init={}", config.init_radius))
        .arg("output")
        .arg(format!("file={}", output_file.display()))
        .arg("random")
        .arg(format!("seed={}", config.seed))
        .output()
        .context("Failed to execute Stan model")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let termination = termination_from_output(&stdout);
    // line search failures exit non-zero but still write the last iterate
    if !output.status.success() && !output_file.exists() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("Optimization failed:\n{}", stderr);
    }
    Ok(termination)
}

/// Map CmdStan's optimizer exit message to a [`Termination`].
pub fn termination_from_output(stdout: &str) -> Termination {
    if stdout.contains("absolute change in objective function") {
        Termination::AbsoluteObjective
    } else if stdout.contains("relative change in objective function") {
        Termination::RelativeObjective
    } else if stdout.contains("gradient magnitude") {
        Termination::Gradient
    } else if stdout.contains("absolute parameter change") {
        Termination::Parameter
    } else if stdout.contains("Maximum number of iterations") {
        Termination::MaxIterations
    } else {
        Termination::LineSearchFailed
    }
}

/// Contents of one CmdStan output CSV.
#[derive(Debug, Clone, PartialEq)]
pub struct CmdStanCsv {
    /// Column names with Stan's `name.1.2` indices rewritten as `name[1,2]`
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl CmdStanCsv {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

pub fn read_cmdstan_csv(path: &Path) -> Result<CmdStanCsv> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read Stan output {}", path.display()))?;
    parse_cmdstan_csv(&content).with_context(|| format!("Invalid Stan output {}", path.display()))
}

/// Parse CmdStan CSV: `#` comment lines, one header line, numeric rows.
pub fn parse_cmdstan_csv(content: &str) -> Result<CmdStanCsv> {
    let mut lines = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.starts_with('#') && !line.trim().is_empty());

    let (_, header) = lines.next().context("No header found in CSV")?;
    let columns: Vec<String> = header.split(',').map(|s| stan_to_column(s.trim())).collect();

    let mut rows = Vec::new();
    for (line_no, line) in lines {
        let values = line
            .split(',')
            .map(|s| s.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<f64>, _>>()
            .with_context(|| format!("line {}: cannot parse value", line_no + 1))?;
        if values.len() != columns.len() {
            bail!(
                "line {}: expected {} values, found {}",
                line_no + 1,
                columns.len(),
                values.len()
            );
        }
        rows.push(values);
    }
    Ok(CmdStanCsv { columns, rows })
}

fn stan_to_column(name: &str) -> String {
    let mut parts = name.split('.');
    let base = parts.next().unwrap_or_default();
    let indices: Vec<&str> = parts.collect();
    if indices.is_empty() {
        base.to_string()
    } else {
        format!("{}[{}]", base, indices.join(","))
    }
}

/// Assemble a [`Fit`] from parsed CmdStan output, in the native column order.
pub fn fit_from_csv(
    spec: &ModelSpec,
    data: &DataSet,
    method: Method,
    outputs: &[CmdStanCsv],
    termination: Termination,
) -> Result<Fit> {
    let model = spec.bind(data)?;
    let n_params = model.param_names().len();
    let mut columns = model.param_names();
    columns.extend(model.generated_names());
    let log_lik_columns: Vec<String> = (1..=model.n_obs())
        .map(|i| format!("log_lik[{}]", i))
        .collect();

    let first = outputs.first().context("No Stan output to read")?;
    let value_idx = column_indices(first, &columns)?;
    let ll_idx = if model.has_log_lik() {
        Some(column_indices(first, &log_lik_columns)?)
    } else {
        None
    };
    let lp_idx = first.column("lp__").context("Stan output has no lp__ column")?;

    let log_lik_rows = |csv: &CmdStanCsv| -> Vec<Vec<f64>> {
        match &ll_idx {
            Some(idx) => csv
                .rows
                .iter()
                .map(|row| idx.iter().map(|&k| row[k]).collect())
                .collect(),
            None => Vec::new(),
        }
    };

    let mut log_lik_values = Vec::new();
    let output = match method {
        Method::Sample => {
            let mut chains: Vec<Vec<Vec<f64>>> = Vec::with_capacity(outputs.len());
            let mut lp: Vec<Vec<f64>> = Vec::with_capacity(outputs.len());
            let mut divergent = 0;
            let mut step_sizes = Vec::with_capacity(outputs.len());
            for csv in outputs {
                if csv.columns != first.columns {
                    bail!("Stan chains have different columns");
                }
                chains.push(
                    csv.rows
                        .iter()
                        .map(|row| value_idx.iter().map(|&k| row[k]).collect())
                        .collect(),
                );
                lp.push(csv.rows.iter().map(|row| row[lp_idx]).collect());
                if let Some(k) = csv.column("divergent__") {
                    divergent += csv.rows.iter().filter(|row| row[k] > 0.5).count();
                }
                if let Some(k) = csv.column("stepsize__") {
                    if let Some(row) = csv.rows.first() {
                        step_sizes.push(row[k]);
                    }
                }
                log_lik_values.extend(log_lik_rows(csv));
            }
            FitOutput::Draws(Draws {
                chains,
                lp,
                divergent,
                step_sizes,
            })
        }
        Method::Optimize => {
            let row = first.rows.last().context("Stan optimize output has no rows")?;
            FitOutput::Point(PointEstimate {
                values: value_idx.iter().map(|&k| row[k]).collect(),
                log_density: row[lp_idx],
                iterations: 0,
                termination,
            })
        }
    };

    let log_lik = match (method, model.has_log_lik()) {
        (Method::Sample, true) => Some(LogLikMatrix::new(
            log_lik_values,
            model.n_obs(),
            model.data_fingerprint(),
        )),
        _ => None,
    };
    Ok(Fit::new(
        spec.clone(),
        method,
        "cmdstan",
        columns,
        n_params,
        output,
        log_lik,
    ))
}

fn column_indices(csv: &CmdStanCsv, names: &[String]) -> Result<Vec<usize>> {
    names
        .iter()
        .map(|name| {
            csv.column(name)
                .with_context(|| format!("Stan output has no column {}", name))
        })
        .collect()
}

/// Write Stan JSON data for `spec` applied to `data`.
pub fn write_stan_data(spec: &ModelSpec, data: &DataSet, path: &Path) -> Result<()> {
    let value = match (spec, data) {
        (ModelSpec::SaveRate(s), DataSet::Saves(d)) => {
            let tau = match s.pooling {
                Pooling::FixedScale(tau) => Some(tau),
                _ => None,
            };
            save_stan_json(d, tau)
        }
        (ModelSpec::Polling(s), DataSet::Polls(d)) => poll_stan_json(d, s.length_scale),
        _ => bail!("{} cannot be fit to this dataset", spec.name()),
    };
    let json = serde_json::to_string_pretty(&value).context("Failed to serialize Stan data")?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// [`FitEngine`] backed by an external CmdStan installation.
pub struct CmdStanEngine {
    cmdstan: PathBuf,
    work_dir: PathBuf,
    cache: RefCell<ModelCache>,
}

impl CmdStanEngine {
    /// `work_dir` holds compiled models, data files and outputs.
    pub fn new(cmdstan: PathBuf, work_dir: PathBuf) -> Self {
        let cache = ModelCache::new(work_dir.join("models"));
        Self {
            cmdstan,
            work_dir,
            cache: RefCell::new(cache),
        }
    }

    /// Use the detected cmdstan installation.
    pub fn detect(work_dir: PathBuf) -> Result<Self> {
        Ok(Self::new(detect_cmdstan()?, work_dir))
    }

    fn prepare(&self, spec: &ModelSpec, data: &DataSet) -> Result<(PathBuf, PathBuf)> {
        // surface contract violations before compiling anything
        spec.bind(data)?;
        let exe = self.cache.borrow_mut().executable(spec, |stan_file| {
            compile_stan_model(stan_file, &self.cmdstan).map_err(crate::Error::from)
        })?;
        let run_dir = self
            .work_dir
            .join("runs")
            .join(format!("{}-{}", spec.name(), &data.fingerprint()[..12]));
        fs::create_dir_all(&run_dir).context("Failed to create run directory")?;
        let data_file = run_dir.join("data.json");
        write_stan_data(spec, data, &data_file)?;
        Ok((exe, run_dir))
    }
}

impl FitEngine for CmdStanEngine {
    fn name(&self) -> &str {
        "cmdstan"
    }

    fn sample(
        &self,
        spec: &ModelSpec,
        data: &DataSet,
        config: &SampleConfig,
    ) -> crate::Result<Fit> {
        config.validate()?;
        info!(model = %spec.name(), chains = config.num_chains, "sampling with cmdstan");
        let (exe, run_dir) = self.prepare(spec, data)?;
        let files = run_sample(&exe, &run_dir.join("data.json"), &run_dir.join("sample"), config)?;
        let outputs = files
            .iter()
            .map(|f| read_cmdstan_csv(f))
            .collect::<Result<Vec<_>>>()?;
        Ok(fit_from_csv(
            spec,
            data,
            Method::Sample,
            &outputs,
            Termination::MaxIterations,
        )?)
    }

    fn optimize(
        &self,
        spec: &ModelSpec,
        data: &DataSet,
        config: &OptimizeConfig,
    ) -> crate::Result<Fit> {
        config.validate()?;
        info!(model = %spec.name(), "optimizing with cmdstan");
        let (exe, run_dir) = self.prepare(spec, data)?;
        let output_file = run_dir.join("optimize").join("output.csv");
        let termination = run_optimize(&exe, &run_dir.join("data.json"), &output_file, config)?;
        let output = read_cmdstan_csv(&output_file)?;
        Ok(fit_from_csv(
            spec,
            data,
            Method::Optimize,
            &[output],
            termination,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SaveDataset, Shot};
    use crate::model::{Link, SaveRateSpec};
    use tempfile::TempDir;

    fn two_groups() -> DataSet {
        SaveDataset::new(
            vec!["a".to_string(), "b".to_string()],
            vec![
                Shot { group: 0, saved: true },
                Shot { group: 1, saved: false },
            ],
        )
        .unwrap()
        .into()
    }

    const SAMPLE_CSV: &str = "\
# model = saves_tau0p5_logit_loglik
# method = sample (Default)
lp__,accept_stat__,stepsize__,treedepth__,n_leapfrog__,divergent__,energy__,mu,alpha.1,alpha.2,p.1,p.2,log_lik.1,log_lik.2
# Adaptation terminated
-3.1,0.9,0.7,2,3,0,3.5,0.5,1.0,-1.0,0.73,0.27,-0.31,-0.31
-3.4,0.8,0.7,2,3,1,3.9,0.4,0.8,-0.6,0.69,0.35,-0.37,-0.43
# Elapsed Time: 0.01 seconds
";

    #[test]
    fn test_parse_rewrites_indices() {
        let csv = parse_cmdstan_csv(SAMPLE_CSV).unwrap();
        assert_eq!(csv.rows.len(), 2);
        assert_eq!(csv.column("alpha[2]"), Some(9));
        assert_eq!(csv.column("log_lik[1]"), Some(12));
        assert_eq!(stan_to_column("Sigma.1.2"), "Sigma[1,2]");
    }

    #[test]
    fn test_parse_rejects_ragged_rows() {
        let bad = "a,b\n1.0,2.0\n3.0\n";
        assert!(parse_cmdstan_csv(bad).is_err());
        assert!(parse_cmdstan_csv("# only comments\n").is_err());
    }

    #[test]
    fn test_fit_from_sample_csv() {
        let spec = ModelSpec::SaveRate(SaveRateSpec::fixed_scale(0.5, Link::Logit)).with_log_lik();
        let data = two_groups();
        let csv = parse_cmdstan_csv(SAMPLE_CSV).unwrap();
        let fit = fit_from_csv(
            &spec,
            &data,
            Method::Sample,
            &[csv.clone(), csv],
            Termination::MaxIterations,
        )
        .unwrap();

        assert_eq!(fit.columns(), &["mu", "alpha[1]", "alpha[2]", "p[1]", "p[2]"]);
        let draws = fit.draws().unwrap();
        assert_eq!(draws.n_chains(), 2);
        assert_eq!(draws.n_draws(), 4);
        assert_eq!(draws.divergent, 2);
        assert_eq!(fit.column("mu").unwrap(), vec![0.5, 0.4, 0.5, 0.4]);
        let ll = fit.log_lik().unwrap();
        assert_eq!(ll.n_draws(), 4);
        assert_eq!(ll.data_fingerprint(), data.fingerprint());
    }

    #[test]
    fn test_fit_from_csv_missing_column() {
        let spec = ModelSpec::SaveRate(SaveRateSpec::estimated_scale(
            crate::model::ScalePrior::HalfNormal(1.0),
            Link::Logit,
        ));
        let csv = parse_cmdstan_csv(SAMPLE_CSV).unwrap();
        let err = fit_from_csv(&spec, &two_groups(), Method::Sample, &[csv], Termination::MaxIterations)
            .unwrap_err();
        assert!(format!("{:#}", err).contains("tau"));
    }

    #[test]
    fn test_fit_from_optimize_csv() {
        let spec = ModelSpec::SaveRate(SaveRateSpec::independent());
        let csv = parse_cmdstan_csv("lp__,p.1,p.2\n0,0.5,0.25\n-1.5,0.99,0.01\n").unwrap();
        let fit = fit_from_csv(
            &spec,
            &two_groups(),
            Method::Optimize,
            &[csv],
            Termination::RelativeObjective,
        )
        .unwrap();
        let point = fit.point().unwrap();
        assert_eq!(point.values, vec![0.99, 0.01]);
        assert_eq!(point.log_density, -1.5);
        assert!(fit.log_lik().is_none());
    }

    #[test]
    fn test_termination_messages() {
        let out = "Optimization terminated normally: \n  Convergence detected: relative change in objective function was below tolerance";
        assert_eq!(termination_from_output(out), Termination::RelativeObjective);
        let out = "Optimization terminated with error: \n  Line search failed to achieve a sufficient decrease, no more progress can be made";
        assert_eq!(termination_from_output(out), Termination::LineSearchFailed);
    }

    #[test]
    fn test_write_stan_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");
        let spec = ModelSpec::SaveRate(SaveRateSpec::fixed_scale(0.5, Link::Logit));
        write_stan_data(&spec, &two_groups(), &path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["J"], 2);
        assert_eq!(value["tau"], 0.5);
        assert_eq!(value["group"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_find_cmdstan_prefers_env() {
        let dir = TempDir::new().unwrap();
        let found = find_cmdstan(Some(dir.path().display().to_string()), None).unwrap();
        assert_eq!(found, dir.path());
    }
}
