//! The estimation pipeline: merge and discount orders N down to 2, smooth
//! the unigram, score the dev set, and mirror the whole thing backward to
//! get metaparameter derivatives. Work splits into shards by the first
//! (most recent) history word, which keeps every back-off chain above
//! order 1 inside one shard; the unigram step is the barrier where shards
//! meet.

use crate::count::{FloatCount, IntCount, TrainingCounts, Word};
use crate::discount::{
    discount_counts, discount_counts_1gram, discount_counts_1gram_backward,
    discount_counts_backward,
};
use crate::error::Result;
use crate::evaluate::{compute_probs, compute_probs_with_derivs, DevEval};
use crate::merge::{merge_counts, merge_counts_backward};
use crate::metaparams::{Discounts, Metaparams};
use crate::model::{HistoryState, Model, StateDerivs};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;

/// Everything one shard computes on the way down to order 2.
struct ShardForward {
    /// Merged counts per order, index `o - 2`.
    merged: Vec<Vec<FloatCount>>,
    /// Discount stream flowing into each order `o` in 2..N, index `o - 2`.
    /// The top order has no incoming stream.
    discount_into: Vec<Vec<FloatCount>>,
    /// The shard's contribution to the order-1 stream.
    order1: Vec<FloatCount>,
    /// Float-count states per order, index `o - 2`.
    states: Vec<Vec<HistoryState>>,
}

fn shard_of(hist: &[Word], num_shards: usize) -> usize {
    hist[0] as usize % num_shards
}

fn filter_shard(records: &[IntCount], shard: usize, num_shards: usize) -> Vec<IntCount> {
    records
        .iter()
        .filter(|r| shard_of(&r.hist, num_shards) == shard)
        .cloned()
        .collect()
}

fn forward_shard(
    counts: &TrainingCounts,
    metaparams: &Metaparams,
    shard: usize,
    num_shards: usize,
) -> Result<ShardForward> {
    let order = counts.order;
    let mut merged_by_order = vec![Vec::new(); order - 1];
    let mut discount_into = vec![Vec::new(); order - 1];
    let mut states = vec![Vec::new(); order - 1];
    let mut order1 = Vec::new();
    let mut incoming: Option<Vec<FloatCount>> = None;
    for o in (2..=order).rev() {
        let shard_sources: Vec<Vec<IntCount>> = (1..=counts.num_train_sets)
            .map(|n| filter_shard(counts.source_order(n, o), shard, num_shards))
            .collect();
        let source_refs: Vec<&[IntCount]> =
            shard_sources.iter().map(Vec::as_slice).collect();
        let merged = merge_counts(&source_refs, &metaparams.scales, incoming.as_deref())?;
        let discounted = discount_counts(&merged, &metaparams.discounts[o - 2])?;
        merged_by_order[o - 2] = merged;
        states[o - 2] = discounted.states;
        if o > 2 {
            discount_into[o - 3] = discounted.discount.clone();
            incoming = Some(discounted.discount);
        } else {
            order1 = discounted.discount;
        }
    }
    Ok(ShardForward { merged: merged_by_order, discount_into, order1, states })
}

/// Merges the per-shard order-1 streams, summing counts per word in shard
/// order.
fn merge_order1_streams(shards: &[ShardForward]) -> Vec<FloatCount> {
    let mut positions = vec![0_usize; shards.len()];
    let mut merged: Vec<FloatCount> = Vec::new();
    loop {
        let mut min_word: Option<Word> = None;
        for (shard, &pos) in shards.iter().zip(&positions) {
            if let Some(record) = shard.order1.get(pos) {
                min_word = Some(min_word.map_or(record.word, |w| w.min(record.word)));
            }
        }
        let Some(word) = min_word else { break };
        let mut value = 0.0;
        for (shard, pos) in shards.iter().zip(&mut positions) {
            if let Some(record) = shard.order1.get(*pos) {
                if record.word == word {
                    value += record.value;
                    *pos += 1;
                }
            }
        }
        merged.push(FloatCount { hist: Vec::new(), word, value });
    }
    merged
}

/// Assembles the full model from the shard states and the unigram state,
/// restoring canonical order per n-gram order.
fn assemble_model(
    counts: &TrainingCounts,
    unigram: HistoryState,
    shards: &mut [ShardForward],
) -> Model {
    let mut by_order: Vec<Vec<HistoryState>> = vec![Vec::new(); counts.order];
    by_order[0].push(unigram);
    for o in 2..=counts.order {
        let mut states: Vec<HistoryState> = Vec::new();
        for shard in shards.iter_mut() {
            states.append(&mut shard.states[o - 2]);
        }
        states.sort_by(|a, b| a.hist.cmp(&b.hist));
        by_order[o - 1] = states;
    }
    Model::from_orders(counts.num_words, by_order)
}

/// Runs the forward pipeline and scores the dev set.
///
/// # Errors
///
/// Propagates malformed-input and infeasibility errors from the stages.
pub fn estimate_model(
    counts: &TrainingCounts,
    metaparams: &Metaparams,
    num_shards: usize,
) -> Result<(Model, DevEval)> {
    metaparams.check_feasible()?;
    let num_shards = num_shards.max(1);
    let mut shards: Vec<ShardForward> = (0..num_shards)
        .into_par_iter()
        .map(|s| forward_shard(counts, metaparams, s, num_shards))
        .collect::<Result<_>>()?;
    // the unigram step is the barrier; it mixes every shard's histories
    let order1 = merge_order1_streams(&shards);
    let unigram = discount_counts_1gram(&order1, counts.num_words)?;
    let model = assemble_model(counts, unigram, &mut shards);
    let eval = compute_probs(&model, &counts.dev)?;
    Ok((model, eval))
}

/// The objective (log-probability per dev word), its derivatives w.r.t.
/// every metaparameter, and the estimated model.
pub struct ObjectiveAndDerivs {
    /// Log-probability per dev word.
    pub objf: f64,
    /// Derivatives of the objective, metaparameter-shaped.
    pub derivs: Metaparams,
    /// The dev-set evaluation behind the objective.
    pub eval: DevEval,
    /// The model the metaparameters produce.
    pub model: Model,
}

/// Runs forward and backward pipelines: estimates the model, scores the
/// dev set, and back-propagates to the count scales and discount
/// constants. Derivatives are normalized per dev word, matching the
/// objective.
///
/// # Errors
///
/// Propagates malformed-input and infeasibility errors from the stages.
#[allow(clippy::similar_names, clippy::cast_precision_loss)]
pub fn objf_and_derivs(
    counts: &TrainingCounts,
    metaparams: &Metaparams,
    num_shards: usize,
) -> Result<ObjectiveAndDerivs> {
    metaparams.check_feasible()?;
    let num_shards = num_shards.max(1);
    let order = counts.order;
    let mut shards: Vec<ShardForward> = (0..num_shards)
        .into_par_iter()
        .map(|s| forward_shard(counts, metaparams, s, num_shards))
        .collect::<Result<_>>()?;
    let order1 = merge_order1_streams(&shards);
    let unigram = discount_counts_1gram(&order1, counts.num_words)?;
    // keep the shard states; the model clones them so the backward pass
    // can still walk each shard's streams
    let shard_states: Vec<Vec<Vec<HistoryState>>> =
        shards.iter().map(|s| s.states.clone()).collect();
    let model = assemble_model(counts, unigram, &mut shards);
    // forward is done; score every shard's slice of the dev set against
    // its own states plus the shared unigram
    let mut eval = DevEval { num_dev_words: 0, total_log_like: 0.0 };
    let mut unigram_derivs = StateDerivs {
        preds: vec![0.0; model.states(1)[0].preds.len()],
        backoff: 0.0,
    };
    let mut shard_model_derivs = Vec::with_capacity(num_shards);
    for (shard, states) in shard_states.iter().enumerate() {
        let mut by_order = vec![vec![model.states(1)[0].clone()]];
        by_order.extend(states.iter().cloned());
        let shard_model = Model::from_orders(counts.num_words, by_order);
        let dev: Vec<IntCount> = counts
            .dev
            .iter()
            .filter(|r| shard_of(&r.hist, num_shards) == shard)
            .cloned()
            .collect();
        let (shard_eval, derivs) = compute_probs_with_derivs(&shard_model, &dev)?;
        eval.num_dev_words += shard_eval.num_dev_words;
        eval.total_log_like += shard_eval.total_log_like;
        for (acc, term) in unigram_derivs.preds.iter_mut().zip(&derivs.order(1)[0].preds) {
            *acc += term;
        }
        unigram_derivs.backoff += derivs.order(1)[0].backoff;
        shard_model_derivs.push(derivs);
    }
    // the order-1 backward step completes before any shard goes back up
    let order1_derivs = discount_counts_1gram_backward(&unigram_derivs);
    let order1_deriv_by_word: FxHashMap<Word, f64> = order1
        .iter()
        .zip(&order1_derivs)
        .map(|(record, &d)| (record.word, d))
        .collect();
    let mut scale_derivs = vec![0.0; counts.num_train_sets];
    let mut d_derivs = vec![[0.0; 4]; order - 1];
    for (shard, model_derivs) in shard_model_derivs.iter().enumerate() {
        let forward = &shards[shard];
        let mut discount_derivs: Vec<f64> = forward
            .order1
            .iter()
            .map(|record| order1_deriv_by_word[&record.word])
            .collect();
        for o in 2..=order {
            let back = discount_counts_backward(
                &forward.merged[o - 2],
                &metaparams.discounts[o - 2],
                model_derivs.order(o),
                &discount_derivs,
            )?;
            for (acc, d) in d_derivs[o - 2].iter_mut().zip(back.d_derivs) {
                *acc += d;
            }
            let shard_sources: Vec<Vec<IntCount>> = (1..=counts.num_train_sets)
                .map(|n| filter_shard(counts.source_order(n, o), shard, num_shards))
                .collect();
            let source_refs: Vec<&[IntCount]> =
                shard_sources.iter().map(Vec::as_slice).collect();
            let incoming = (o < order).then(|| forward.discount_into[o - 2].as_slice());
            let merge_back =
                merge_counts_backward(&source_refs, incoming, &back.merged_derivs)?;
            for (acc, d) in scale_derivs.iter_mut().zip(merge_back.scale_derivs) {
                *acc += d;
            }
            discount_derivs = merge_back.discount_derivs;
        }
    }
    let norm = eval.num_dev_words as f64;
    let derivs = Metaparams {
        scales: scale_derivs.into_iter().map(|d| d / norm).collect(),
        discounts: d_derivs
            .into_iter()
            .map(|d| Discounts {
                d1: d[0] / norm,
                d2: d[1] / norm,
                d3: d[2] / norm,
                d4: d[3] / norm,
            })
            .collect(),
    };
    Ok(ObjectiveAndDerivs { objf: eval.log_prob_per_word(), derivs, eval, model })
}

/// Compares two models for exact equality of all counts, the check behind
/// the shard/merge reproducibility guarantee.
#[must_use]
pub fn models_identical(a: &Model, b: &Model) -> bool {
    if a.order() != b.order() || a.num_words() != b.num_words() {
        return false;
    }
    (1..=a.order()).all(|o| {
        a.states(o).len() == b.states(o).len()
            && a.states(o).iter().zip(b.states(o)).all(|(x, y)| {
                x.hist == y.hist
                    && x.backoff.total_cmp(&y.backoff) == Ordering::Equal
                    && x.preds.len() == y.preds.len()
                    && x.preds.iter().zip(&y.preds).all(|(&(wx, fx), &(wy, fy))| {
                        wx == wy && fx.total_cmp(&fy) == Ordering::Equal
                    })
            })
    })
}
