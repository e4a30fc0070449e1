use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::{bail, Result};
use clap::{Parser, ValueHint};
use floatlm::prune::{parse_steps, PruneOptions, Pruner, Step, TargetOptions};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

/// Prunes a language model to an entropy threshold or a target size.
#[derive(Parser)]
pub struct Opts {
    /// Input language-model directory.
    #[arg(value_hint = ValueHint::DirPath)]
    lm_dir_in: PathBuf,
    /// Output language-model directory.
    #[arg(value_hint = ValueHint::DirPath)]
    lm_dir_out: PathBuf,
    /// Pruning threshold, interpreted as entropy change times overall
    /// weighted data count. Required unless a target size is given.
    #[arg(long)]
    final_threshold: Option<f64>,
    /// Prune down to this many n-grams, excluding unigrams. Overrides the
    /// schedule.
    #[arg(long)]
    target_num_ngrams: Option<u64>,
    /// First threshold tried by the target search.
    #[arg(default_value = "0.25", long)]
    initial_threshold: f64,
    /// Acceptable relative deviation from the target size.
    #[arg(default_value = "0.05", long)]
    tolerance: f64,
    /// Pruning iterations allowed in the target search.
    #[arg(default_value = "20", long)]
    max_iter: usize,
    /// The pruning schedule.
    #[arg(
        default_value = "prune*0.25 EM EM EM prune*0.5 EM EM EM prune*1.0 EM EM EM prune*1.0 EM EM EM",
        long
    )]
    steps: String,
    /// Keep dead history states instead of sweeping them; only useful for
    /// debugging, results are identical.
    #[arg(long)]
    keep_zeros: bool,
    /// Skip the exact-divergence measurement.
    #[arg(long)]
    no_exact_divergence: bool,
}

impl Subcommand for Opts {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let model = helpers::read_lm_dir(&self.lm_dir_in)?;
        let options = PruneOptions {
            remove_zeros: !self.keep_zeros,
            check_exact_divergence: !self.no_exact_divergence,
            sort: helpers::sort_config(cfg)?,
        };
        let mut pruner = Pruner::new(model, options)?;
        let last_step_was_em;
        if let Some(target) = self.target_num_ngrams {
            let target_options = TargetOptions {
                initial_threshold: self.initial_threshold,
                tolerance: self.tolerance,
                max_iterations: self.max_iter,
                ..TargetOptions::default()
            };
            pruner.prune_to_target(target, &target_options)?;
            last_step_was_em = true;
        } else {
            let Some(threshold) = self.final_threshold else {
                bail!("either --final-threshold or --target-num-ngrams is required");
            };
            if threshold <= 0.0 {
                bail!("--final-threshold must be positive, got {threshold}");
            }
            let steps = parse_steps(&self.steps)?;
            last_step_was_em = steps.last() == Some(&Step::Em);
            if !self.no_exact_divergence && !last_step_was_em {
                log::warn!(
                    "the schedule does not end with EM, so the exact divergence \
                     cannot be measured"
                );
            }
            pruner.run_schedule(&steps, threshold)?;
        }
        let report = pruner.report(last_step_was_em);
        let pruned_to: u64 = report.final_num_ngrams.iter().skip(1).sum();
        log::info!(
            "reduced the model from {} to {pruned_to} n-grams above order 1",
            report.initial_num_xgrams
        );
        log::info!("approximate K-L divergence {:.6}", report.approximate_kl_divergence);
        if let Some(exact) = report.exact_kl_divergence {
            log::info!("exact K-L divergence {exact:.6}");
        }
        helpers::write_lm_dir(&self.lm_dir_out, pruner.model(), None)?;
        fs::write(self.lm_dir_out.join("was_pruned"), "true\n")?;
        for f in ["metaparameters", "names", "words.txt"] {
            let src = self.lm_dir_in.join(f);
            if src.exists() {
                fs::copy(&src, self.lm_dir_out.join(f))?;
            }
        }
        Ok(ExitCode::SUCCESS)
    }
}
