use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::Result;
use clap::{Parser, ValueHint};
use std::path::PathBuf;
use std::process::ExitCode;

/// Shows the size and shape of a language model.
#[derive(Parser)]
pub struct Opts {
    /// Language-model directory.
    #[arg(value_hint = ValueHint::DirPath)]
    lm_dir: PathBuf,
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let model = helpers::read_lm_dir(&self.lm_dir)?;
        println!("ngram_order {}", model.order());
        println!("num_words {}", model.num_words());
        for (i, count) in model.num_ngrams().iter().enumerate() {
            println!(
                "order {}: {count} ngrams in {} history states",
                i + 1,
                model.states(i + 1).len()
            );
        }
        println!("num_xgrams {}", model.num_xgrams());
        Ok(ExitCode::SUCCESS)
    }
}
