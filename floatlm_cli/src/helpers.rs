use crate::GlobalConfiguration;
use anyhow::{Context, Result};
use floatlm::count::{read_single_integer, write_num_ngrams, write_single_integer};
use floatlm::metaparams::Metaparams;
use floatlm::model::Model;
use floatlm::sort::SortConfig;
use std::fs;
use std::path::Path;

pub fn sort_config(cfg: &GlobalConfiguration) -> Result<SortConfig> {
    Ok(match cfg.max_memory {
        Some(size) => SortConfig::with_budget(size.resolve()?, std::env::temp_dir()),
        None => SortConfig::in_memory(),
    })
}

/// Reads the model of a language-model directory.
pub fn read_lm_dir(dir: &Path) -> Result<Model> {
    let model = Model::read(&dir.join("float.all"))
        .with_context(|| format!("reading the model in {}", dir.display()))?;
    let order = read_single_integer(&dir.join("ngram_order"))? as usize;
    anyhow::ensure!(
        order == model.order(),
        "{} says order {order} but the model has order {}",
        dir.display(),
        model.order()
    );
    Ok(model)
}

/// Writes a language-model directory: the float counts plus the metadata
/// files describing them.
pub fn write_lm_dir(dir: &Path, model: &Model, metaparams: Option<&Metaparams>) -> Result<()> {
    fs::create_dir_all(dir)?;
    model.write(&dir.join("float.all"))?;
    write_num_ngrams(&dir.join("num_ngrams"), &model.num_ngrams())?;
    write_single_integer(&dir.join("ngram_order"), model.order() as u64)?;
    write_single_integer(&dir.join("num_words"), u64::from(model.num_words()))?;
    if let Some(metaparams) = metaparams {
        metaparams.write(&dir.join("metaparameters"))?;
    }
    Ok(())
}
