//! Per-history sufficient statistics and the E-M reestimation step that
//! pruning interleaves with, plus the zero-removal sweep.
//!
//! The statistics describe the data the model itself implies. Writing
//! A(h, w) for the expected count of word-w data visiting state h, the
//! model is reproduced exactly by one E-M step when
//! A(h, w) = total(h) * P(w | h) on the state's support. Data visiting a
//! state is its own "direct" statistic plus the posterior back-off inflow
//! from its extension states, so the builder stores the direct part,
//! s(h, w) = A(h, w) - inflow(h, w), together with one epsilon entry for
//! back-off usage by words with no explicit entry at h (that mass re-emits
//! somewhere below h and is already counted in the direct statistics of
//! the state where it lands).

use crate::count::Word;
use crate::error::{Error, Result};
use crate::model::{read_state, write_state, HistoryState, Model};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Sufficient statistics for one history state: expected word-data counts
/// on (a superset of) the state's support, plus the epsilon entry.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsState {
    /// Expected (word, count) data, sorted by word.
    pub preds: Vec<(Word, f64)>,
    /// Expected back-off usage of words with no explicit entry.
    pub epsilon: f64,
}

impl StatsState {
    /// Total expected data visiting the state directly.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.preds.iter().fold(0.0, |acc, &(_, c)| acc + c) + self.epsilon
    }
}

/// Statistics for every state of a model, aligned index for index with the
/// model's states.
#[derive(Clone, Debug)]
pub struct Stats {
    /// `by_order[o - 1][i]` mirrors the model state `(o, i)`.
    pub by_order: Vec<Vec<StatsState>>,
}

/// What one E-M step (or a dry run of one) observed.
#[derive(Clone, Debug)]
pub struct EmReport {
    /// Total weighted data count.
    pub total_count: f64,
    /// Log-likelihood of the statistics under the model as given.
    pub total_like: f64,
    /// Auxiliary-objective improvement attributed to each order. Zero for
    /// every order exactly when the model is already the maximizer.
    pub like_change_per_order: Vec<f64>,
}

impl EmReport {
    /// Log-probability per data word under the model as given.
    #[must_use]
    pub fn log_prob_per_word(&self) -> f64 {
        self.total_like / self.total_count
    }

    /// Total auxiliary improvement across orders.
    #[must_use]
    pub fn like_change(&self) -> f64 {
        self.like_change_per_order.iter().sum()
    }
}

/// Builds the statistics that make `model` an exact E-M fixpoint. Valid on
/// a model fresh out of the estimation pipeline, whose state supports nest
/// (every extension state's word also has an entry at the back-off
/// target).
#[must_use]
pub fn build_stats(model: &Model) -> Stats {
    let uniform = 1.0 / f64::from(model.num_words());
    // gamma of every extension state, keyed per (receiving state, word);
    // flow lands in the longest existing prefix of the back-off target
    let mut child_gamma: FxHashMap<(crate::model::StateId, Word), f64> = FxHashMap::default();
    for o in 2..=model.order() {
        for child in model.states(o) {
            let target = existing_prefix(model, child.backoff_target());
            let id = model.state_id(&target).expect("the unigram state exists");
            for &(w, _) in &child.preds {
                *child_gamma.entry((id, w)).or_insert(0.0) += child.backoff;
            }
        }
    }
    let mut by_order: Vec<Vec<StatsState>> = vec![Vec::new(); model.order()];
    for o in (1..=model.order()).rev() {
        let mut states = Vec::with_capacity(model.states(o).len());
        for (i, state) in model.states(o).iter().enumerate() {
            let mut preds = Vec::with_capacity(state.preds.len());
            let mut support_q = 0.0;
            for &(w, f) in &state.preds {
                let q = if o == 1 { uniform } else { model.prob(state.backoff_target(), w) };
                support_q += q;
                let visits = f + state.backoff * q;
                let p = visits / state.total;
                let inflow = p * child_gamma.get(&((o, i), w)).copied().unwrap_or(0.0);
                preds.push((w, (visits - inflow).max(0.0)));
            }
            let epsilon = state.backoff * (1.0 - support_q).max(0.0);
            states.push(StatsState { preds, epsilon });
        }
        by_order[o - 1] = states;
    }
    Stats { by_order }
}

/// One E-M iteration: reestimates every float count to maximize the
/// likelihood of `stats` under the current topology, which stays fixed.
/// Returns the updated model and the report on the model as it was.
///
/// # Errors
///
/// Fails if `stats` does not align with the model.
pub fn em_step(model: &Model, stats: &Stats) -> Result<(Model, EmReport)> {
    let uniform = 1.0 / f64::from(model.num_words());
    let mut total_count = 0.0;
    let mut total_like = 0.0;
    let mut like_change_per_order = vec![0.0; model.order()];
    let mut new_orders: Vec<Vec<HistoryState>> = vec![Vec::new(); model.order()];
    // posterior back-off mass flowing down, keyed by the history of the
    // state it lands in next
    let mut inflow: FxHashMap<Vec<Word>, BTreeMap<Word, f64>> = FxHashMap::default();
    for o in (1..=model.order()).rev() {
        let order_stats = stats.by_order.get(o - 1).ok_or_else(stats_misaligned)?;
        if order_stats.len() != model.states(o).len() {
            return Err(stats_misaligned());
        }
        for (state, state_stats) in model.states(o).iter().zip(order_stats) {
            total_count += state_stats.total();
            // merge direct statistics with the inflow from above
            let mut arriving: BTreeMap<Word, f64> = state_stats.preds.iter().copied().collect();
            if let Some(flows) = inflow.remove(&state.hist) {
                for (w, flow) in flows {
                    *arriving.entry(w).or_insert(0.0) += flow;
                }
            }
            let mut new_preds = Vec::with_capacity(state.preds.len());
            let mut backoff_data = state_stats.epsilon;
            let mut explicit: FxHashMap<Word, f64> = FxHashMap::default();
            let flow_target = if o > 1 {
                Some(existing_prefix(model, state.backoff_target()))
            } else {
                None
            };
            for (&w, &a) in &arriving {
                let q = if o == 1 {
                    uniform
                } else {
                    model.prob(state.backoff_target(), w)
                };
                let f = state.float_count(w);
                let interpolated = f + state.backoff * q;
                if interpolated > 0.0 {
                    total_like += a * (interpolated / state.total).ln();
                }
                let e = if interpolated > 0.0 { a * f / interpolated } else { 0.0 };
                let b = a - e;
                backoff_data += b;
                if f > 0.0 {
                    explicit.insert(w, e);
                }
                if let (Some(target), true) = (&flow_target, b > 0.0) {
                    *inflow
                        .entry(target.clone())
                        .or_default()
                        .entry(w)
                        .or_insert(0.0) += b;
                }
            }
            if state_stats.epsilon > 0.0 && state.backoff > 0.0 {
                total_like += state_stats.epsilon * (state.backoff / state.total).ln();
            }
            for &(w, _) in &state.preds {
                new_preds.push((w, explicit.get(&w).copied().unwrap_or(0.0)));
            }
            // the unigram pseudo-count mass is fixed, everything else is
            // reestimated from the posterior counts
            let new_backoff = if o == 1 { state.backoff } else { backoff_data };
            let new_state = HistoryState::new(state.hist.clone(), new_preds, new_backoff);
            like_change_per_order[o - 1] +=
                state_aux(&new_state, &new_state, backoff_data) - state_aux(state, &new_state, backoff_data);
            new_orders[o - 1].push(new_state);
        }
    }
    debug_assert!(inflow.is_empty(), "all posterior flow ends in the unigram state");
    let report = EmReport { total_count, total_like, like_change_per_order };
    Ok((Model::from_orders(model.num_words(), new_orders), report))
}

/// The longest proper prefix of `hist` that exists as a state; the unigram
/// state catches everything.
fn existing_prefix(model: &Model, hist: &[Word]) -> Vec<Word> {
    for len in (1..=hist.len()).rev() {
        if model.state_id(&hist[..len]).is_some() {
            return hist[..len].to_vec();
        }
    }
    Vec::new()
}

/// The per-state E-M auxiliary objective: posterior counts scored against
/// the distribution of `params`.
fn state_aux(params: &HistoryState, posterior: &HistoryState, backoff_data: f64) -> f64 {
    let mut aux = 0.0;
    for (&(_, e), &(_, f)) in posterior.preds.iter().zip(&params.preds) {
        if e > 0.0 && f > 0.0 {
            aux += e * (f / params.total).ln();
        }
    }
    if backoff_data > 0.0 && params.backoff > 0.0 {
        aux += backoff_data * (params.backoff / params.total).ln();
    }
    aux
}

fn stats_misaligned() -> Error {
    Error::malformed(
        Path::new("<stats>"),
        "statistics do not align with the model states",
    )
}

/// Removes history states whose explicit mass has fallen to zero. Such a
/// state forwards every lookup to its back-off target unchanged, so
/// dropping it (and folding its statistics into the target) leaves all
/// probabilities and subsequent E-M steps identical. Returns the number of
/// states removed.
///
/// # Errors
///
/// Fails if `stats` does not align with the model.
pub fn remove_zeros(model: &mut Model, stats: &mut Stats) -> Result<usize> {
    let mut removed = 0;
    for o in (2..=model.order()).rev() {
        if stats.by_order[o - 1].len() != model.states(o).len() {
            return Err(stats_misaligned());
        }
        let dead: Vec<usize> = model
            .states(o)
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_dead())
            .map(|(i, _)| i)
            .collect();
        if dead.is_empty() {
            continue;
        }
        for &i in &dead {
            let hist = model.states(o)[i].hist.clone();
            let folded = stats.by_order[o - 1][i].clone();
            // fold into the longest surviving proper prefix state
            let mut target = None;
            for len in (0..hist.len()).rev() {
                if let Some(id) = model.state_id(&hist[..len]) {
                    target = Some(id);
                    break;
                }
            }
            let (to, ti) = target.expect("the unigram state survives");
            let sink = &mut stats.by_order[to - 1][ti];
            sink.epsilon += folded.epsilon;
            for (w, c) in folded.preds {
                match sink.preds.binary_search_by_key(&w, |&(sw, _)| sw) {
                    Ok(j) => sink.preds[j].1 += c,
                    Err(j) => sink.preds.insert(j, (w, c)),
                }
            }
        }
        let mut keep = dead.iter().copied().peekable();
        let mut index = 0;
        stats.by_order[o - 1].retain(|_| {
            let drop = keep.peek() == Some(&index);
            if drop {
                keep.next();
            }
            index += 1;
            !drop
        });
        let mut keep = dead.iter().copied().peekable();
        let mut index = 0;
        model.states_mut(o).retain(|_| {
            let drop = keep.peek() == Some(&index);
            if drop {
                keep.next();
            }
            index += 1;
            !drop
        });
        removed += dead.len();
    }
    if removed > 0 {
        model.rebuild_index();
        log::debug!("zero removal dropped {removed} dead history states");
    }
    Ok(removed)
}

impl Stats {
    /// Serializes the statistics in the float-count state format, with the
    /// epsilon entry in the back-off-weight slot.
    ///
    /// # Errors
    ///
    /// Fails on I/O trouble.
    pub fn write(&self, model: &Model, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        for (o, states) in self.by_order.iter().enumerate() {
            for (stats_state, state) in states.iter().zip(model.states(o + 1)) {
                let as_state = HistoryState::new(
                    state.hist.clone(),
                    stats_state.preds.clone(),
                    stats_state.epsilon,
                );
                write_state(&mut writer, &as_state)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads statistics written by [`Stats::write`], re-aligning them with
    /// `model`.
    ///
    /// # Errors
    ///
    /// Fails if the file does not hold exactly one record per model state,
    /// in model order.
    pub fn read(model: &Model, path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut by_order: Vec<Vec<StatsState>> = vec![Vec::new(); model.order()];
        while let Some(state) = read_state(&mut reader, path)? {
            let o = state.hist.len() + 1;
            if o > model.order() {
                return Err(Error::malformed(path, "stats state beyond the model order"));
            }
            by_order[o - 1].push(StatsState { preds: state.preds, epsilon: state.backoff });
        }
        for o in 1..=model.order() {
            if by_order[o - 1].len() != model.states(o).len() {
                return Err(Error::malformed(
                    path,
                    format!("order {o} has a different number of states than the model"),
                ));
            }
        }
        Ok(Self { by_order })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    /// A hand-built bigram model in estimation-pipeline shape: supports
    /// nest and every state has back-off mass.
    fn tiny_model() -> Model {
        Model::from_orders(
            4,
            vec![
                vec![HistoryState::new(vec![], vec![(2, 2.0), (4, 1.0)], 4.0)],
                vec![
                    HistoryState::new(vec![2], vec![(4, 0.5)], 0.5),
                    HistoryState::new(vec![4], vec![(2, 1.0), (4, 1.0)], 1.0),
                ],
            ],
        )
    }

    #[test]
    fn model_is_an_em_fixpoint_of_its_own_stats() {
        let model = tiny_model();
        let stats = build_stats(&model);
        let (new_model, report) = em_step(&model, &stats).unwrap();
        for o in 1..=2 {
            for (old, new) in model.states(o).iter().zip(new_model.states(o)) {
                for (&(_, f_old), &(_, f_new)) in old.preds.iter().zip(&new.preds) {
                    assert_approx_eq!(f64, f_old, f_new, epsilon = 1e-12);
                }
                assert_approx_eq!(f64, old.backoff, new.backoff, epsilon = 1e-12);
            }
        }
        assert!(
            report.like_change().abs() < 1e-10 * report.total_count,
            "like change {} should vanish at the fixpoint",
            report.like_change()
        );
    }

    #[test]
    fn em_recovers_mass_from_a_pruned_ngram() {
        let model = tiny_model();
        let stats = build_stats(&model);
        let mut pruned = model.clone();
        {
            let state = &mut pruned.states_mut(2)[1];
            // fold (4, 4) into the back-off weight, as the pruner would
            let f = state.preds[1].1;
            state.preds.remove(1);
            state.backoff += f;
            state.recompute_total();
        }
        // keep stats aligned after the topology change: nothing to do,
        // stats may carry words the model no longer has
        let (reestimated, report) = em_step(&pruned, &stats).unwrap();
        assert!(report.like_change() >= -1e-12, "E-M must not decrease the objective");
        // the surviving bigram keeps explicit mass, the removed one stays gone
        assert_eq!(reestimated.states(2)[1].preds.len(), 1);
        assert!(reestimated.states(2)[1].preds[0].1 > 0.0);
        // the state's data total is conserved through the reshuffle
        let t: f64 = reestimated.states(2)[1].total;
        assert_approx_eq!(f64, t, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn zero_removal_preserves_probabilities() {
        let mut model = Model::from_orders(
            4,
            vec![
                vec![HistoryState::new(vec![], vec![(2, 2.0), (4, 1.0)], 4.0)],
                vec![
                    HistoryState::new(vec![2], vec![(4, 0.0)], 1.5),
                    HistoryState::new(vec![4], vec![(2, 1.0)], 1.0),
                ],
            ],
        );
        let mut stats = build_stats(&model);
        let before: Vec<f64> = (1..=4).map(|w| model.prob(&[2], w)).collect();
        let removed = remove_zeros(&mut model, &mut stats).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(model.states(2).len(), 1);
        let after: Vec<f64> = (1..=4).map(|w| model.prob(&[2], w)).collect();
        for (b, a) in before.iter().zip(&after) {
            assert_approx_eq!(f64, *b, *a, epsilon = 1e-12);
        }
    }

    #[test]
    fn stats_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.all");
        let model = tiny_model();
        let stats = build_stats(&model);
        stats.write(&model, &path).unwrap();
        let back = Stats::read(&model, &path).unwrap();
        for (a, b) in stats.by_order.iter().flatten().zip(back.by_order.iter().flatten()) {
            assert_eq!(a.preds.len(), b.preds.len());
            for (&(wa, ca), &(wb, cb)) in a.preds.iter().zip(&b.preds) {
                assert_eq!(wa, wb);
                assert_approx_eq!(f64, ca, cb);
            }
            assert_approx_eq!(f64, a.epsilon, b.epsilon);
        }
    }
}
