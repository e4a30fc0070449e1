use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::Result;
use clap::{Parser, ValueHint};
use floatlm::count::TrainingCounts;
use floatlm::metaparams::Metaparams;
use floatlm::pipeline::{estimate_model, objf_and_derivs};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

/// Estimates float counts from a count directory and scores the dev set.
#[derive(Parser)]
pub struct Opts {
    /// Directory holding the integer counts.
    #[arg(value_hint = ValueHint::DirPath)]
    count_dir: PathBuf,
    /// Metaparameters file.
    #[arg(value_hint = ValueHint::FilePath)]
    metaparameters: PathBuf,
    /// File to write the per-word dev log-probability to.
    #[arg(value_hint = ValueHint::FilePath)]
    objf_out: PathBuf,
    /// Also write the derivatives w.r.t. every metaparameter.
    #[arg(long, value_hint = ValueHint::FilePath)]
    derivs_out: Option<PathBuf>,
    /// Also write the estimated model as a language-model directory.
    #[arg(long, value_hint = ValueHint::DirPath)]
    lm_dir_out: Option<PathBuf>,
    /// Number of parallel history shards.
    #[arg(default_value = "1", long)]
    num_shards: usize,
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let counts = TrainingCounts::read_dir(&self.count_dir)?;
        let metaparams = Metaparams::read_validated(
            &self.metaparameters,
            counts.num_train_sets,
            counts.order,
        )?;
        let (objf, model) = if let Some(derivs_out) = &self.derivs_out {
            let result = objf_and_derivs(&counts, &metaparams, self.num_shards)?;
            result.derivs.write_derivs(derivs_out)?;
            (result.objf, result.model)
        } else {
            let (model, eval) = estimate_model(&counts, &metaparams, self.num_shards)?;
            (eval.log_prob_per_word(), model)
        };
        writeln!(File::create(&self.objf_out)?, "{objf}")?;
        log::info!("dev log-prob per word is {objf:.6} (perplexity {:.3})", (-objf).exp());
        if let Some(lm_dir) = &self.lm_dir_out {
            helpers::write_lm_dir(lm_dir, &model, Some(&metaparams))?;
        }
        Ok(ExitCode::SUCCESS)
    }
}
