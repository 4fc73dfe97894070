use hierloo::config::WorkflowConfig;
use hierloo::data::{DataSet, SaveDataset, Shot};
use hierloo::datagen::{heldout_saves, simulate_polls, simulate_saves, PollConfig, SaveRateConfig};
use hierloo::engine::NativeEngine;
use hierloo::fit::Method;
use hierloo::math;
use hierloo::model::{Link, ModelSpec, PollingSpec, SaveRateSpec, ScalePrior};
use hierloo::summary::group_summaries;
use hierloo::workflow::Workflow;

fn quick_config() -> WorkflowConfig {
    let mut config = WorkflowConfig::default();
    config.sample.num_warmup = 500;
    config.sample.num_samples = 1000;
    config
}

/// Keepers with exactly the given saves out of `shots` each.
fn keepers(saves: &[u32], shots: u32) -> SaveDataset {
    let mut data = Vec::new();
    for (group, &s) in saves.iter().enumerate() {
        for k in 0..shots {
            data.push(Shot {
                group,
                saved: k < s,
            });
        }
    }
    let names = (0..saves.len()).map(|j| format!("keeper{}", j)).collect();
    SaveDataset::new(names, data).unwrap()
}

#[test]
fn test_same_seed_same_draws() {
    let data: DataSet = keepers(&[14, 16, 18], 20).into();
    let spec = ModelSpec::SaveRate(SaveRateSpec::estimated_scale(
        ScalePrior::HalfNormal(1.0),
        Link::Logit,
    ));

    let a = Workflow::new(NativeEngine, quick_config())
        .fit(&spec, &data, Method::Sample)
        .unwrap();
    let b = Workflow::new(NativeEngine, quick_config())
        .fit(&spec, &data, Method::Sample)
        .unwrap();
    assert_eq!(a.column("tau"), b.column("tau"));
    assert_eq!(a.column("p[3]"), b.column("p[3]"));

    let mut other = quick_config();
    other.sample.seed += 1;
    let c = Workflow::new(NativeEngine, other)
        .fit(&spec, &data, Method::Sample)
        .unwrap();
    assert_ne!(a.column("tau"), c.column("tau"));
}

#[test]
fn test_independent_matches_beta_posterior() {
    let saves = keepers(&[7, 30, 2], 40);
    let closed_form = group_summaries(&saves);
    let workflow = Workflow::new(NativeEngine, quick_config());
    let report = workflow
        .fit_and_summarize(
            &ModelSpec::SaveRate(SaveRateSpec::independent()),
            &saves.into(),
            Method::Sample,
            None,
        )
        .unwrap();

    for (j, group) in closed_form.iter().enumerate() {
        let s = report
            .summaries
            .iter()
            .find(|s| s.name == format!("p[{}]", j + 1))
            .unwrap();
        assert!(
            (s.mean - group.posterior_mean).abs() < 0.02,
            "p[{}]: sampled {} vs exact {}",
            j + 1,
            s.mean,
            group.posterior_mean
        );
        assert!((s.sd - group.posterior_sd).abs() < 0.015);
        assert!(s.low < group.posterior_mean && group.posterior_mean < s.high);
    }
}

#[test]
fn test_fixed_scale_shrinks_every_keeper() {
    let sim = simulate_saves(&SaveRateConfig::default(), 3).unwrap();
    let workflow = Workflow::new(NativeEngine, WorkflowConfig::default());
    let fit = workflow
        .fit(
            &ModelSpec::SaveRate(SaveRateSpec::fixed_scale(0.1, Link::Logit)),
            &sim.data.clone().into(),
            Method::Sample,
        )
        .unwrap();

    let population = math::inv_logit(fit.mean("mu").unwrap());
    for (j, group) in group_summaries(&sim.data).iter().enumerate() {
        let posterior = fit.mean(&format!("p[{}]", j + 1)).unwrap();
        let low = group.empirical_rate.min(population);
        let high = group.empirical_rate.max(population);
        assert!(
            low < posterior && posterior < high,
            "{}: posterior {} not between empirical {} and population {}",
            group.group,
            posterior,
            group.empirical_rate,
            population
        );
    }
}

#[test]
fn test_optimize_fixed_scale_converges() {
    let saves = keepers(&[12, 14, 17], 20);
    let workflow = Workflow::new(NativeEngine, quick_config());
    let fit = workflow
        .fit(
            &ModelSpec::SaveRate(SaveRateSpec::fixed_scale(0.5, Link::Logit)),
            &saves.into(),
            Method::Optimize,
        )
        .unwrap();
    let point = fit.point().unwrap();
    assert!(point.termination.converged(), "{:?}", point.termination);
    assert!(point.log_density.is_finite());
    let p: Vec<f64> = (1..=3).map(|j| fit.mean(&format!("p[{}]", j)).unwrap()).collect();
    assert!(p[0] < p[1] && p[1] < p[2]);
}

#[test]
fn test_loo_and_heldout_agree_on_scale() {
    let mut config = quick_config();
    config.saves = SaveRateConfig {
        tau: 1.2,
        min_shots: 40,
        max_shots: 80,
        ..SaveRateConfig::default()
    };
    let sim = simulate_saves(&config.saves, 11).unwrap();
    let heldout = heldout_saves(&sim, 200, 12).unwrap();

    let workflow = Workflow::new(NativeEngine, config);
    let sweep = workflow
        .scale_sweep(&sim.data, &[0.1, 1.0], Some(&heldout))
        .unwrap();

    assert_eq!(sweep.entries.len(), 2);
    assert_eq!(sweep.best_by_loo(), Some(1.0));
    assert_eq!(sweep.best_by_heldout(), Some(1.0));
    assert_eq!(sweep.comparison.rows[0].elpd_diff, 0.0);
    assert!(sweep.comparison.rows[1].elpd_diff < 0.0);
    assert!(sweep
        .entries
        .iter()
        .all(|e| e.loo.n_obs() == sim.data.len()));
}

#[test]
fn test_link_comparison_independent_of_order() {
    let sim = simulate_saves(&SaveRateConfig::default(), 5).unwrap();
    let workflow = Workflow::new(NativeEngine, quick_config());

    let forward = workflow
        .link_comparison(&sim.data, &[Link::Logit, Link::Probit])
        .unwrap();
    let backward = workflow
        .link_comparison(&sim.data, &[Link::Probit, Link::Logit])
        .unwrap();

    assert_eq!(forward.comparison.ranking(), backward.comparison.ranking());
    for row in &forward.comparison.rows {
        let other = backward
            .comparison
            .rows
            .iter()
            .find(|r| r.name == row.name)
            .unwrap();
        assert_eq!(row.elpd_loo, other.elpd_loo);
        assert_eq!(row.elpd_diff, other.elpd_diff);
    }
    assert!(forward.comparison.rows[1].elpd_diff <= 0.0);
}

#[test]
fn test_polling_walk_tracks_observed_share() {
    let config = PollConfig {
        n_steps: 15,
        trials_per_step: 800,
        ..PollConfig::default()
    };
    let sim = simulate_polls(&config, 3).unwrap();
    let spec = ModelSpec::Polling(PollingSpec::new(config.length_scale)).with_log_lik();
    let workflow = Workflow::new(NativeEngine, quick_config());
    let fit = workflow.fit(&spec, &sim.data.clone().into(), Method::Sample).unwrap();

    for t in 0..sim.data.len() {
        let observed = sim.data.successes[t] as f64 / sim.data.trials[t] as f64;
        let estimate = fit.mean(&format!("p[{}]", t + 1)).unwrap();
        assert!(
            (estimate - observed).abs() < 0.05,
            "step {}: {} vs observed {}",
            t + 1,
            estimate,
            observed
        );
    }

    let loo = workflow.loo(&fit).unwrap();
    assert_eq!(loo.n_obs(), sim.data.len());
    assert!(loo.elpd_loo.is_finite());
}
