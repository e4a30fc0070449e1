//! Dev-set probability evaluation: resolves each dev n-gram down the
//! back-off chain, accumulates the log-likelihood, and back-propagates to
//! per-order float-count derivatives.

use crate::count::{IntCount, Word};
use crate::error::{Error, Result};
use crate::model::{Model, ModelDerivs, StateId};
use std::path::Path;

/// The result of scoring a dev stream against a model.
#[derive(Clone, Copy, Debug)]
pub struct DevEval {
    /// Total dev count, the normalizer for per-word quantities.
    pub num_dev_words: u64,
    /// Total log-likelihood of the dev stream (natural log, unnormalized).
    pub total_log_like: f64,
}

impl DevEval {
    /// Log-probability per dev word.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn log_prob_per_word(&self) -> f64 {
        self.total_log_like / self.num_dev_words as f64
    }
}

/// Scores `dev` against `model`.
///
/// # Errors
///
/// Fails if a dev record is out of the closed vocabulary.
pub fn compute_probs(model: &Model, dev: &[IntCount]) -> Result<DevEval> {
    walk(model, dev, None)
}

/// Scores `dev` and produces the derivatives of the total log-likelihood
/// w.r.t. every float count and back-off weight of the model.
///
/// Per-record derivative terms that are shared by a whole state (the
/// dependence through the state total) are accumulated as one scalar per
/// state and distributed in a final left-fold pass, which keeps results
/// bit-for-bit reproducible for identical inputs.
///
/// # Errors
///
/// Fails if a dev record is out of the closed vocabulary.
pub fn compute_probs_with_derivs(
    model: &Model,
    dev: &[IntCount],
) -> Result<(DevEval, ModelDerivs)> {
    let mut derivs = ModelDerivs::zeros(model);
    let mut total_terms: Vec<Vec<f64>> = (1..=model.order())
        .map(|o| vec![0.0; model.states(o).len()])
        .collect();
    let eval = walk(model, dev, Some((&mut derivs, &mut total_terms)))?;
    for (o, terms) in total_terms.iter().enumerate() {
        for (state, &term) in derivs.by_order[o].iter_mut().zip(terms) {
            for slot in &mut state.preds {
                *slot += term;
            }
            state.backoff += term;
        }
    }
    Ok((eval, derivs))
}

type DerivSinks<'a> = (&'a mut ModelDerivs, &'a mut Vec<Vec<f64>>);

#[allow(clippy::cast_precision_loss)]
fn walk(model: &Model, dev: &[IntCount], mut sinks: Option<DerivSinks>) -> Result<DevEval> {
    let uniform = 1.0 / f64::from(model.num_words());
    let mut num_dev_words = 0_u64;
    let mut total_log_like = 0.0;
    let mut chain: Vec<(StateId, f64)> = Vec::with_capacity(model.order());
    for record in dev {
        if record.word == 0 || record.word > model.num_words() {
            return Err(Error::malformed(
                Path::new("<dev counts>"),
                format!("dev word {} is outside the vocabulary", record.word),
            ));
        }
        // resolve bottom up through the existing prefixes of the history
        chain.clear();
        let unigram = model.state_id(&[]).expect("unigram state exists");
        let mut p = prob_at(model, unigram, record.word, uniform);
        chain.push((unigram, p));
        let max_len = record.hist.len().min(model.order() - 1);
        for len in 1..=max_len {
            if let Some(id) = model.state_id(&record.hist[..len]) {
                p = prob_at(model, id, record.word, p);
                chain.push((id, p));
            }
        }
        let count = record.count as f64;
        num_dev_words += record.count;
        total_log_like += count * p.ln();
        if let Some((derivs, total_terms)) = sinks.as_mut() {
            backprop(model, &chain, record.word, count / p, uniform, derivs, total_terms);
        }
    }
    Ok(DevEval { num_dev_words, total_log_like })
}

fn prob_at(model: &Model, id: StateId, word: Word, below: f64) -> f64 {
    let state = model.state_by_id(id);
    (state.float_count(word) + state.backoff * below) / state.total
}

/// One record's backward pass down the chain built in `walk`. `g` enters
/// as d log-likelihood / d p at the top of the chain.
fn backprop(
    model: &Model,
    chain: &[(StateId, f64)],
    word: Word,
    mut g: f64,
    uniform: f64,
    derivs: &mut ModelDerivs,
    total_terms: &mut Vec<Vec<f64>>,
) {
    for (level, &((o, i), p)) in chain.iter().enumerate().rev() {
        let state = &model.states(o)[i];
        let below = if level == 0 { uniform } else { chain[level - 1].1 };
        let sink = &mut derivs.by_order[o - 1][i];
        if let Ok(slot) = state.preds.binary_search_by_key(&word, |&(w, _)| w) {
            sink.preds[slot] += g / state.total;
        }
        sink.backoff += g * below / state.total;
        total_terms[o - 1][i] -= g * p / state.total;
        g = g * state.backoff / state.total;
    }
}
