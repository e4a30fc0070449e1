//! End-to-end runs over a small synthetic corpus: estimation, metaparameter
//! optimization with a warm restart, and pruning down to a size target.

use floatlm::count::{IntCount, TrainingCounts, Word, BOS, EOS};
use floatlm::metaparams::Metaparams;
use floatlm::model::Model;
use floatlm::optimize::{optimize, read_inv_hessian, OptimizerConfig};
use floatlm::pipeline::{estimate_model, objf_and_derivs};
use floatlm::prune::{parse_steps, PruneOptions, Pruner, TargetOptions};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use tempfile::tempdir;

const ORDER: usize = 3;
const NUM_WORDS: Word = 13;

/// Draws sentences from a skewed distribution over words 4..=13.
fn sample_sentences(seed: u64, count: usize) -> Vec<Vec<Word>> {
    let mut rng = Pcg64::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let len = rng.gen_range(3..9);
            (0..len)
                .map(|_| {
                    // square the draw so low word ids dominate
                    let r: f64 = rng.gen();
                    4 + (r * r * 10.0) as Word
                })
                .collect()
        })
        .collect()
}

/// Collects n-gram counts of one order, histories most recent first and
/// BOS-padded at sentence starts, with EOS predicted at the end.
fn count_order(sentences: &[Vec<Word>], order: usize) -> Vec<IntCount> {
    let mut counts: BTreeMap<(Vec<Word>, Word), u64> = BTreeMap::new();
    for sentence in sentences {
        let mut padded = vec![BOS];
        padded.extend_from_slice(sentence);
        padded.push(EOS);
        for i in 1..padded.len() {
            let mut hist = Vec::with_capacity(order - 1);
            for back in 1..order {
                hist.push(if i >= back { padded[i - back] } else { BOS });
            }
            *counts.entry((hist, padded[i])).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .map(|((hist, word), count)| IntCount { hist, word, count })
        .collect()
}

fn synthetic_counts() -> TrainingCounts {
    let source1 = sample_sentences(7, 260);
    let source2 = sample_sentences(8, 120);
    let dev = sample_sentences(9, 60);
    TrainingCounts {
        order: ORDER,
        num_train_sets: 2,
        num_words: NUM_WORDS,
        sources: vec![
            vec![count_order(&source1, 2), count_order(&source1, 3)],
            vec![count_order(&source2, 2), count_order(&source2, 3)],
        ],
        dev: count_order(&dev, ORDER),
    }
}

#[test]
fn estimation_produces_a_normalized_model() {
    let counts = synthetic_counts();
    let metaparams = Metaparams::initialize(2, ORDER, None);
    let (model, eval) = estimate_model(&counts, &metaparams, 1).unwrap();
    assert!(eval.num_dev_words > 0);
    assert!(eval.log_prob_per_word() < 0.0);
    for o in 1..=model.order() {
        for state in model.states(o) {
            let total: f64 = (1..=model.num_words()).map(|w| model.prob(&state.hist, w)).sum();
            assert!((total - 1.0).abs() < 1e-9, "state {:?} sums to {total}", state.hist);
        }
    }
    // the model file round-trips through its on-disk form
    let dir = tempdir().unwrap();
    let path = dir.path().join("float.all");
    model.write(&path).unwrap();
    let back = Model::read(&path).unwrap();
    assert_eq!(back.num_ngrams(), model.num_ngrams());
}

#[test]
fn optimization_improves_the_dev_objective_and_warm_restarts() {
    let counts = synthetic_counts();
    let initial = Metaparams::initialize(2, ORDER, None);
    let dir = tempdir().unwrap();
    let config = OptimizerConfig { num_shards: 2, ..OptimizerConfig::default() };
    let cancel = AtomicBool::new(false);
    let outcome =
        optimize(&counts, &initial, None, &dir.path().join("opt"), &config, &cancel).unwrap();
    assert!(outcome.final_objf >= outcome.initial_objf - 1e-12);
    assert!(outcome.metaparams.is_feasible());
    // rerunning in the same work directory replays the identical
    // trajectory from the cached per-iteration files
    let resumed =
        optimize(&counts, &initial, None, &dir.path().join("opt"), &config, &cancel).unwrap();
    assert_eq!(resumed.final_objf, outcome.final_objf);
    assert_eq!(resumed.metaparams, outcome.metaparams);
    // the persisted artifacts load back
    let final_params =
        Metaparams::read_validated(&dir.path().join("opt/final.metaparams"), 2, ORDER).unwrap();
    let hessian =
        read_inv_hessian(&dir.path().join("opt/final.inv_hessian"), initial.dim()).unwrap();
    // warm-started reoptimization stands on the previous result and
    // converges at least as fast
    let rerun = optimize(
        &counts,
        &final_params,
        Some(hessian),
        &dir.path().join("opt2"),
        &config,
        &cancel,
    )
    .unwrap();
    assert!(rerun.final_objf >= outcome.final_objf - 1e-6);
}

#[test]
fn gradients_hold_up_at_the_optimized_point() {
    let counts = synthetic_counts();
    let metaparams = Metaparams {
        scales: vec![0.45, 0.6],
        ..Metaparams::initialize(2, ORDER, None)
    };
    let result = objf_and_derivs(&counts, &metaparams, 1).unwrap();
    let analytic = result.derivs.to_flat();
    let flat = metaparams.to_flat();
    let h = 1e-4;
    for i in 0..flat.len() {
        let objf = |values: &[f64]| {
            objf_and_derivs(&counts, &Metaparams::from_flat(values, 2, ORDER), 1)
                .unwrap()
                .objf
        };
        let mut plus = flat.clone();
        plus[i] += h;
        let mut minus = flat.clone();
        minus[i] -= h;
        let numeric = (objf(&plus) - objf(&minus)) / (2.0 * h);
        assert!(
            (analytic[i] - numeric).abs() <= 0.02 * numeric.abs().max(1e-8),
            "component {i}: analytic {} vs numeric {numeric}",
            analytic[i]
        );
    }
}

#[test]
fn a_zero_threshold_schedule_is_a_no_op() {
    let counts = synthetic_counts();
    let metaparams = Metaparams::initialize(2, ORDER, None);
    let (model, _) = estimate_model(&counts, &metaparams, 1).unwrap();
    let num_ngrams = model.num_ngrams();
    let mut pruner = Pruner::new(model, PruneOptions::default()).unwrap();
    pruner.run_schedule(&parse_steps("prune*1.0 EM").unwrap(), 0.0).unwrap();
    assert_eq!(pruner.model().num_ngrams(), num_ngrams);
    let report = pruner.report(true);
    let moved: f64 = report.logprob_changes.iter().sum();
    assert!(moved.abs() < 1e-10, "log-prob moved by {moved} per word");
}

#[test]
fn size_targeting_reaches_the_window() {
    let counts = synthetic_counts();
    let metaparams = Metaparams::initialize(2, ORDER, None);
    let (model, _) = estimate_model(&counts, &metaparams, 1).unwrap();
    let initial_xgrams = model.num_xgrams();
    assert!(initial_xgrams > 100, "corpus too small to exercise pruning");
    let target = initial_xgrams * 3 / 5;
    let mut pruner = Pruner::new(model, PruneOptions::default()).unwrap();
    let options = TargetOptions { tolerance: 0.2, ..TargetOptions::default() };
    pruner.prune_to_target(target, &options).unwrap();
    let xgrams = pruner.model().num_xgrams();
    let lower = (target as f64 * 0.8) as u64;
    let upper = (target as f64 * 1.2) as u64;
    assert!(
        (lower..=upper).contains(&xgrams),
        "landed at {xgrams} xgrams, wanted [{lower}, {upper}]"
    );
    let report = pruner.report(true);
    assert!(report.approximate_kl_divergence >= 0.0);
    // the pruned model still normalizes
    let model = pruner.into_model();
    for o in 1..=model.order() {
        for state in model.states(o) {
            let total: f64 = (1..=model.num_words()).map(|w| model.prob(&state.hist, w)).sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
    }
}
