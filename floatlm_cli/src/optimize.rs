use super::{GlobalConfiguration, Subcommand};
use anyhow::Result;
use clap::{Parser, ValueHint};
use floatlm::count::TrainingCounts;
use floatlm::metaparams::Metaparams;
use floatlm::optimize::{optimize, read_inv_hessian, OptimizerConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

/// Optimizes the metaparameters against the dev set.
#[derive(Parser)]
pub struct Opts {
    /// Directory holding the integer counts.
    #[arg(value_hint = ValueHint::DirPath)]
    count_dir: PathBuf,
    /// Directory for per-iteration files and the final result.
    #[arg(value_hint = ValueHint::DirPath)]
    optimize_dir: PathBuf,
    /// Starting metaparameters; defaults to the built-in initialization.
    #[arg(long, value_hint = ValueHint::FilePath)]
    initial_metaparameters: Option<PathBuf>,
    /// Warm-start from a previous optimization of (a subset of) this data:
    /// takes `final.metaparams` and `final.inv_hessian` from there.
    #[arg(conflicts_with_all = ["initial_metaparameters"], long, value_hint = ValueHint::DirPath)]
    warm_start_dir: Option<PathBuf>,
    /// Gradient norm at which to stop.
    #[arg(default_value = "0.000125", long)]
    gradient_tolerance: f64,
    /// Amortized objective progress at which to stop.
    #[arg(default_value = "1e-6", long)]
    progress_tolerance: f64,
    /// Number of parallel history shards.
    #[arg(default_value = "1", long)]
    num_shards: usize,
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let counts = TrainingCounts::read_dir(&self.count_dir)?;
        let (initial, inv_hessian) = if let Some(warm) = &self.warm_start_dir {
            let initial = Metaparams::read_validated(
                &warm.join("final.metaparams"),
                counts.num_train_sets,
                counts.order,
            )?;
            let hessian = read_inv_hessian(&warm.join("final.inv_hessian"), initial.dim())?;
            (initial, Some(hessian))
        } else if let Some(path) = &self.initial_metaparameters {
            let initial =
                Metaparams::read_validated(path, counts.num_train_sets, counts.order)?;
            (initial, None)
        } else {
            (Metaparams::initialize(counts.num_train_sets, counts.order, None), None)
        };
        let config = OptimizerConfig {
            gradient_tolerance: self.gradient_tolerance,
            progress_tolerance: self.progress_tolerance,
            num_shards: self.num_shards,
        };
        let cancel = AtomicBool::new(false);
        let outcome =
            optimize(&counts, &initial, inv_hessian, &self.optimize_dir, &config, &cancel)?;
        log::info!(
            "wrote final metaparameters to {}; dev log-prob per word {:.6}",
            self.optimize_dir.join("final.metaparams").display(),
            outcome.final_objf
        );
        Ok(ExitCode::SUCCESS)
    }
}
