use super::{GlobalConfiguration, Subcommand};
use anyhow::{bail, Context, Result};
use clap::{Parser, ValueHint};
use floatlm::metaparams::Metaparams;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Writes an initial metaparameters file.
#[derive(Parser)]
pub struct Opts {
    /// The n-gram order of the final model.
    #[arg(long)]
    ngram_order: usize,
    /// The number of training sources.
    #[arg(long)]
    num_train_sets: usize,
    /// Per-source starting weights from a unigram-level estimation, as
    /// `name weight` lines; a better starting point than all-equal.
    #[arg(long, requires = "names", value_hint = ValueHint::FilePath)]
    weights: Option<PathBuf>,
    /// The `names` file mapping source numbers to names, needed to
    /// interpret the weights.
    #[arg(long, value_hint = ValueHint::FilePath)]
    names: Option<PathBuf>,
    /// Where to write the metaparameters.
    #[arg(value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        if self.ngram_order < 2 {
            bail!("--ngram-order must be at least 2");
        }
        if self.num_train_sets < 1 {
            bail!("--num-train-sets must be positive");
        }
        let weights = match (&self.weights, &self.names) {
            (Some(weights), Some(names)) => {
                Some(self.resolve_weights(weights, names)?)
            }
            _ => None,
        };
        let metaparams =
            Metaparams::initialize(self.num_train_sets, self.ngram_order, weights.as_deref());
        metaparams.write(&self.output)?;
        Ok(ExitCode::SUCCESS)
    }
}

impl Opts {
    fn resolve_weights(&self, weights: &Path, names: &Path) -> Result<Vec<f64>> {
        let mut number_to_name = HashMap::new();
        for line in fs::read_to_string(names)?.lines() {
            let mut fields = line.split_whitespace();
            let (Some(number), Some(name), None) =
                (fields.next(), fields.next(), fields.next())
            else {
                bail!("bad line {line:?} in {}", names.display());
            };
            let number: usize = number
                .parse()
                .with_context(|| format!("bad source number in {}", names.display()))?;
            if number_to_name.insert(number, name.to_owned()).is_some() {
                bail!("duplicate source number {number} in {}", names.display());
            }
        }
        let mut name_to_weight = HashMap::new();
        for line in fs::read_to_string(weights)?.lines() {
            let mut fields = line.split_whitespace();
            let (Some(name), Some(weight), None) =
                (fields.next(), fields.next(), fields.next())
            else {
                bail!("bad line {line:?} in {}", weights.display());
            };
            let weight: f64 = weight
                .parse()
                .with_context(|| format!("bad weight in {}", weights.display()))?;
            if name_to_weight.insert(name.to_owned(), weight).is_some() {
                bail!("duplicate name {name:?} in {}", weights.display());
            }
        }
        (1..=self.num_train_sets)
            .map(|n| {
                let name = number_to_name
                    .get(&n)
                    .with_context(|| format!("source {n} has no name in {}", names.display()))?;
                name_to_weight.get(name).copied().with_context(|| {
                    format!("source {name:?} has no weight in {}", weights.display())
                })
            })
            .collect()
    }
}
