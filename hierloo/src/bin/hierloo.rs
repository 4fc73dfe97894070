// hierloo CLI
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};

use hierloo::codegen::generate_stan;
use hierloo::config::{EngineKind, WorkflowConfig};
use hierloo::data::{DataSet, PollDataset, SaveDataset};
use hierloo::datagen::{heldout_saves, simulate_polls, simulate_saves, Truth};
use hierloo::diagnostics::summarize_mcmc;
use hierloo::engine::NativeEngine;
use hierloo::fit::Method;
use hierloo::model::{Link, ModelSpec, PollingSpec, SaveRateSpec, ScalePrior};
use hierloo::stanrun::CmdStanEngine;
use hierloo::summary::{group_summaries, render_groups, render_table};
use hierloo::workflow::Workflow;

#[derive(Parser)]
#[command(name = "hierloo")]
#[command(version)]
#[command(about = "Hierarchical save-rate and polling models with PSIS-LOO", long_about = None)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    /// Workflow configuration (JSON); flags override it
    #[arg(long, global = true, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Fit engine, overriding the config file
    #[arg(long, global = true, value_enum)]
    engine: Option<EngineArg>,

    /// Emit JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a dataset with known truth
    Generate {
        #[arg(value_enum)]
        kind: DataKind,

        /// Output CSV file
        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,

        /// Also write the generating values as JSON
        #[arg(long, value_name = "TRUTH")]
        truth: Option<PathBuf>,

        /// Random seed (defaults to the config seed)
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Fit one model and print its summary
    Fit {
        #[command(flatten)]
        model: ModelArgs,

        /// Sample the posterior or find its mode
        #[arg(long, value_enum, default_value = "sample")]
        method: MethodArg,

        /// Generating values to show next to the estimates
        #[arg(long, value_name = "TRUTH")]
        truth: Option<PathBuf>,

        /// Also print R-hat, ESS and divergences
        #[arg(long)]
        diagnostics: bool,

        /// Compute PSIS-LOO (implies log-likelihood output)
        #[arg(long)]
        loo: bool,
    },

    /// Rank fixed group scales by PSIS-LOO
    CompareScales {
        /// Shot data CSV
        #[arg(short, long, value_name = "DATA")]
        data: PathBuf,

        /// Held-out shots with the same keepers
        #[arg(long, value_name = "HELDOUT")]
        heldout: Option<PathBuf>,

        /// Scales to compare (defaults to the config grid)
        #[arg(long, value_delimiter = ',')]
        taus: Vec<f64>,
    },

    /// Compare logit and probit links by PSIS-LOO
    CompareLinks {
        /// Shot data CSV
        #[arg(short, long, value_name = "DATA")]
        data: PathBuf,
    },

    /// Optimize a model whose posterior has no mode
    Improper {
        /// Shot data CSV
        #[arg(short, long, value_name = "DATA")]
        data: PathBuf,

        /// Optimizer tolerances (defaults to the config list)
        #[arg(long, value_delimiter = ',')]
        tolerances: Vec<f64>,
    },

    /// Write the Stan program for a model
    Stan {
        #[command(flatten)]
        model: ModelArgs,

        /// Output file (stdout when omitted)
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<PathBuf>,
    },

    /// Run the whole pipeline on simulated keepers
    Demo,
}

#[derive(Args)]
struct ModelArgs {
    /// Data CSV (`keeper,saved` or `time,successes,trials`)
    #[arg(short, long, value_name = "DATA")]
    data: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "estimated")]
    pooling: PoolingArg,

    /// Group scale for `--pooling fixed`
    #[arg(long, default_value = "0.5")]
    tau: f64,

    /// Prior on the group scale for `--pooling estimated`
    #[arg(long, value_enum, default_value = "half-normal")]
    prior: PriorArg,

    /// Scale (half-normal) or rate (exponential) of the prior
    #[arg(long, default_value = "1.0")]
    prior_param: f64,

    #[arg(long, value_enum, default_value = "logit")]
    link: LinkArg,

    /// Correlation time of the polling walk for `--pooling walk`
    #[arg(long, default_value = "10.0")]
    length_scale: f64,

    /// Emit per-observation log-likelihood
    #[arg(long)]
    log_lik: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum DataKind {
    Saves,
    Polls,
}

#[derive(Clone, Copy, ValueEnum)]
enum PoolingArg {
    Independent,
    Fixed,
    Estimated,
    /// Latent-walk polling model
    Walk,
}

#[derive(Clone, Copy, ValueEnum)]
enum PriorArg {
    Flat,
    HalfNormal,
    Exponential,
}

#[derive(Clone, Copy, ValueEnum)]
enum LinkArg {
    Logit,
    Probit,
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodArg {
    Sample,
    Optimize,
}

#[derive(Clone, Copy, ValueEnum)]
enum EngineArg {
    Native,
    Cmdstan,
}

impl ModelArgs {
    fn spec(&self) -> ModelSpec {
        let link = match self.link {
            LinkArg::Logit => Link::Logit,
            LinkArg::Probit => Link::Probit,
        };
        let spec = match self.pooling {
            PoolingArg::Independent => ModelSpec::SaveRate(SaveRateSpec::independent()),
            PoolingArg::Fixed => ModelSpec::SaveRate(SaveRateSpec::fixed_scale(self.tau, link)),
            PoolingArg::Estimated => {
                let prior = match self.prior {
                    PriorArg::Flat => ScalePrior::Flat,
                    PriorArg::HalfNormal => ScalePrior::HalfNormal(self.prior_param),
                    PriorArg::Exponential => ScalePrior::Exponential(self.prior_param),
                };
                ModelSpec::SaveRate(SaveRateSpec::estimated_scale(prior, link))
            }
            PoolingArg::Walk => ModelSpec::Polling(PollingSpec::new(self.length_scale)),
        };
        if self.log_lik {
            spec.with_log_lik()
        } else {
            spec
        }
    }

    fn dataset(&self) -> Result<DataSet> {
        let path = self.data.as_ref().context("--data is required")?;
        Ok(match self.pooling {
            PoolingArg::Walk => PollDataset::from_csv(path)
                .with_context(|| format!("Failed to read polls from {}", path.display()))?
                .into(),
            _ => read_saves(path)?.into(),
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => WorkflowConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => WorkflowConfig::default(),
    };
    if let Some(engine) = cli.engine {
        config.engine = match engine {
            EngineArg::Native => EngineKind::Native,
            EngineArg::Cmdstan => EngineKind::CmdStan,
        };
    }
    let json = cli.json;

    match cli.command {
        Commands::Generate {
            kind,
            output,
            truth,
            seed,
        } => generate_command(&config, kind, &output, truth.as_deref(), seed),
        Commands::Fit {
            model,
            method,
            truth,
            diagnostics,
            loo,
        } => fit_command(config, &model, method, truth.as_deref(), diagnostics, loo, json),
        Commands::CompareScales {
            data,
            heldout,
            taus,
        } => compare_scales_command(config, &data, heldout.as_deref(), taus, json),
        Commands::CompareLinks { data } => compare_links_command(config, &data, json),
        Commands::Improper { data, tolerances } => {
            improper_command(config, &data, tolerances, json)
        }
        Commands::Stan { model, output } => stan_command(&model, output.as_deref()),
        Commands::Demo => demo_command(config, json),
    }
}

fn build_workflow(config: WorkflowConfig) -> Result<Workflow> {
    Ok(match config.engine {
        EngineKind::Native => Workflow::new(NativeEngine, config),
        EngineKind::CmdStan => {
            let engine = CmdStanEngine::detect(config.work_dir.clone()).context(
                "Failed to detect cmdstan. Please install cmdstan or set CMDSTAN environment variable",
            )?;
            Workflow::new(engine, config)
        }
    })
}

fn read_saves(path: &Path) -> Result<SaveDataset> {
    SaveDataset::from_csv(path).with_context(|| format!("Failed to read shots from {}", path.display()))
}

fn read_truth(path: &Path) -> Result<Truth> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Invalid truth file {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn generate_command(
    config: &WorkflowConfig,
    kind: DataKind,
    output: &Path,
    truth_path: Option<&Path>,
    seed: Option<u64>,
) -> Result<()> {
    let seed = seed.unwrap_or(config.seed);
    let (truth, rows) = match kind {
        DataKind::Saves => {
            let sim = simulate_saves(&config.saves, seed)?;
            sim.data.write_csv(output)?;
            (sim.truth, sim.data.len())
        }
        DataKind::Polls => {
            let sim = simulate_polls(&config.polls, seed)?;
            sim.data.write_csv(output)?;
            (sim.truth, sim.data.len())
        }
    };
    if let Some(path) = truth_path {
        fs::write(path, serde_json::to_string_pretty(&truth)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    eprintln!("wrote {} rows to {} (seed {})", rows, output.display(), seed);
    Ok(())
}

fn fit_command(
    config: WorkflowConfig,
    model: &ModelArgs,
    method: MethodArg,
    truth_path: Option<&Path>,
    diagnostics: bool,
    loo: bool,
    json: bool,
) -> Result<()> {
    let mut spec = model.spec();
    if loo {
        spec = spec.with_log_lik();
    }
    let data = model.dataset()?;
    let truth = truth_path.map(read_truth).transpose()?;
    let method = match method {
        MethodArg::Sample => Method::Sample,
        MethodArg::Optimize => Method::Optimize,
    };
    if loo && method == Method::Optimize {
        bail!("--loo needs posterior draws; use --method sample");
    }

    let workflow = build_workflow(config)?;
    let report = workflow.fit_and_summarize(&spec, &data, method, truth.as_ref())?;
    let mcmc = if diagnostics && report.fit.draws().is_some() {
        Some(summarize_mcmc(&report.fit)?)
    } else {
        None
    };
    let loo_result = if loo {
        Some(workflow.loo(&report.fit)?)
    } else {
        None
    };

    if json {
        return print_json(&serde_json::json!({
            "model": spec.name(),
            "engine": report.fit.engine(),
            "summaries": report.summaries,
            "diagnostics": mcmc,
            "loo": loo_result,
        }));
    }

    println!("{} ({}, {})", spec.name(), workflow.engine_name(), report.fit.engine());
    if let DataSet::Saves(saves) = &data {
        println!("\n{}", render_groups(&group_summaries(saves)));
    }
    println!("{}", render_table(&report.summaries, &workflow.config().interval));
    if let Some(point) = report.fit.point() {
        println!(
            "log density {:.4} after {} iterations ({:?})",
            point.log_density, point.iterations, point.termination
        );
    }
    if let Some(mcmc) = mcmc {
        println!("\n{}", mcmc.render_table());
    }
    if let Some(loo) = loo_result {
        println!(
            "\nelpd_loo {:.2} (se {:.2})  p_loo {:.2}  looic {:.2}  k > {:.2}: {}",
            loo.elpd_loo,
            loo.se_elpd_loo,
            loo.p_loo,
            loo.looic,
            loo.diagnostics.threshold,
            loo.diagnostics.n_high
        );
    }
    Ok(())
}

fn compare_scales_command(
    config: WorkflowConfig,
    data: &Path,
    heldout: Option<&Path>,
    taus: Vec<f64>,
    json: bool,
) -> Result<()> {
    let data = read_saves(data)?;
    let heldout = heldout.map(read_saves).transpose()?;
    let taus = if taus.is_empty() {
        config.scale_grid.clone()
    } else {
        taus
    };
    let workflow = build_workflow(config)?;
    let sweep = workflow.scale_sweep(&data, &taus, heldout.as_ref())?;

    if json {
        return print_json(&sweep);
    }
    println!("{}", sweep.comparison.render_table());
    if heldout.is_some() {
        for entry in &sweep.entries {
            if let Some(elpd) = entry.heldout_elpd {
                println!("tau {:<6} held-out elpd {:.2}", entry.tau, elpd);
            }
        }
    }
    Ok(())
}

fn compare_links_command(config: WorkflowConfig, data: &Path, json: bool) -> Result<()> {
    let data = read_saves(data)?;
    let workflow = build_workflow(config)?;
    let result = workflow.link_comparison(&data, &[Link::Logit, Link::Probit])?;
    if json {
        return print_json(&result);
    }
    println!("{}", result.comparison.render_table());
    Ok(())
}

fn improper_command(
    config: WorkflowConfig,
    data: &Path,
    tolerances: Vec<f64>,
    json: bool,
) -> Result<()> {
    let data = read_saves(data)?;
    let tolerances = if tolerances.is_empty() {
        config.improper_tolerances.clone()
    } else {
        tolerances
    };
    let workflow = build_workflow(config)?;
    let steps = workflow.improper_demo(&data, &tolerances)?;
    if json {
        return print_json(&steps);
    }
    println!("{:>10} {:>14} {:>14} {:>6}  stop", "tolerance", "tau", "log density", "iter");
    for s in &steps {
        println!(
            "{:>10.0e} {:>14.6e} {:>14.4} {:>6}  {:?}",
            s.tolerance, s.tau, s.log_density, s.iterations, s.termination
        );
    }
    Ok(())
}

fn stan_command(model: &ModelArgs, output: Option<&Path>) -> Result<()> {
    let program = generate_stan(&model.spec())?;
    match output {
        Some(path) => {
            fs::write(path, program).with_context(|| format!("Failed to write {}", path.display()))?
        }
        None => print!("{}", program),
    }
    Ok(())
}

fn demo_command(config: WorkflowConfig, json: bool) -> Result<()> {
    let sim = simulate_saves(&config.saves, config.seed)?;
    let heldout = heldout_saves(&sim, config.heldout_shots, config.seed.wrapping_add(1))?;
    let taus = config.scale_grid.clone();
    let tolerances = config.improper_tolerances.clone();
    let workflow = build_workflow(config)?;
    let data: DataSet = sim.data.clone().into();

    let hierarchical = ModelSpec::SaveRate(SaveRateSpec::estimated_scale(
        workflow.config().scale_prior,
        Link::Logit,
    ));
    let report = workflow.fit_and_summarize(&hierarchical, &data, Method::Sample, Some(&sim.truth))?;
    let sweep = workflow.scale_sweep(&sim.data, &taus, Some(&heldout))?;
    let links = workflow.link_comparison(&sim.data, &[Link::Logit, Link::Probit])?;
    let improper = workflow.improper_demo(&sim.data, &tolerances)?;

    if json {
        return print_json(&serde_json::json!({
            "groups": group_summaries(&sim.data),
            "hierarchical": report.summaries,
            "scale_sweep": sweep,
            "links": links,
            "improper": improper,
        }));
    }

    println!("Simulated keepers (seed {})\n", sim.seed);
    println!("{}", render_groups(&group_summaries(&sim.data)));
    println!("{}\n", hierarchical.name());
    println!("{}", render_table(&report.summaries, &workflow.config().interval));
    println!("Fixed scales by PSIS-LOO\n");
    println!("{}", sweep.comparison.render_table());
    if let (Some(by_loo), Some(by_heldout)) = (sweep.best_by_loo(), sweep.best_by_heldout()) {
        println!("best tau by LOO: {}  by held-out data: {}\n", by_loo, by_heldout);
    }
    println!("Link functions by PSIS-LOO\n");
    println!("{}", links.comparison.render_table());
    println!("Flat prior on tau, optimizer\n");
    for s in &improper {
        println!("tol {:>8.0e}  tau {:.3e}  {:?}", s.tolerance, s.tau, s.termination);
    }
    Ok(())
}
