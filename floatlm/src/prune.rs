//! Entropy-based pruning: removes n-grams whose removal barely changes the
//! modeled log-likelihood, interleaved with E-M reestimation, plus the
//! step language and the driver that searches for a size target.

use crate::error::{Error, Result};
use crate::model::{Model, ProtectedSet};
use crate::size_model::{Action, SizeModel};
use crate::sort::SortConfig;
use crate::stats::{build_stats, em_step, remove_zeros, Stats};
use rustc_hash::FxHashMap;
use std::path::Path;

/// One step of a pruning schedule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Step {
    /// Prune with the given multiple of the final threshold.
    Prune(f64),
    /// One E-M reestimation iteration.
    Em,
}

impl Step {
    /// The default schedule: three rounds of pruning at increasing
    /// fractions of the final threshold, then one more full-threshold
    /// round, each followed by three E-M iterations.
    #[must_use]
    pub fn default_schedule() -> Vec<Self> {
        parse_steps("prune*0.25 EM EM EM prune*0.5 EM EM EM prune*1.0 EM EM EM prune*1.0 EM EM EM")
            .expect("the default schedule parses")
    }
}

/// Parses a schedule like `prune*0.25 EM EM EM prune*1.0`.
///
/// # Errors
///
/// Fails on an unknown token or a zero prune factor.
pub fn parse_steps(steps: &str) -> Result<Vec<Step>> {
    let mut parsed = Vec::new();
    for token in steps.split_whitespace() {
        if token == "EM" {
            parsed.push(Step::Em);
        } else if let Some(factor) = token.strip_prefix("prune*") {
            let factor: f64 = factor.parse().map_err(|_| bad_step(token))?;
            if factor == 0.0 {
                return Err(bad_step(token));
            }
            parsed.push(Step::Prune(factor));
        } else {
            return Err(bad_step(token));
        }
    }
    if parsed.is_empty() {
        return Err(Error::malformed(Path::new("<steps>"), "the schedule is empty"));
    }
    Ok(parsed)
}

fn bad_step(token: &str) -> Error {
    Error::malformed(
        Path::new("<steps>"),
        format!("invalid step {token:?}; expected EM or prune*<factor>"),
    )
}

/// Counters of one pruning pass.
#[derive(Clone, Debug)]
pub struct PruneSummary {
    /// Overall weighted data count, the normalizer for per-word changes.
    pub weighted_count: f64,
    /// Total modeled log-likelihood change of the removals (negative).
    pub like_change: f64,
    /// Explicit n-grams of order two and up before the pass.
    pub total_xgrams: u64,
    /// Entries whose float count had already fallen to zero.
    pub shadowed: u64,
    /// Candidates kept because a longer history state depends on them.
    pub protected: u64,
    /// N-grams removed by this pass.
    pub pruned: u64,
    /// Explicit n-grams per order after the pass.
    pub num_ngrams: Vec<u64>,
}

/// Prunes every unprotected n-gram of order two and up whose removal
/// changes the modeled log-likelihood by less than `threshold` (in
/// count-weighted units), folding the removed mass into the back-off
/// weight. All decisions are made against the model as it was when the
/// pass started.
#[must_use]
pub fn prune_pass(model: &mut Model, protected: &ProtectedSet, threshold: f64) -> PruneSummary {
    let mut summary = PruneSummary {
        weighted_count: 0.0,
        like_change: 0.0,
        total_xgrams: 0,
        shadowed: 0,
        protected: 0,
        pruned: 0,
        num_ngrams: Vec::new(),
    };
    for o in 1..=model.order() {
        for state in model.states(o) {
            summary.weighted_count += state.total;
        }
    }
    // (order, state index) -> pred indices to fold away
    let mut removals: FxHashMap<(usize, usize), Vec<usize>> = FxHashMap::default();
    for o in 2..=model.order() {
        for (i, state) in model.states(o).iter().enumerate() {
            let gamma = state.backoff;
            let q: Vec<f64> = state
                .preds
                .iter()
                .map(|&(w, _)| model.prob(state.backoff_target(), w))
                .collect();
            let support_q: f64 = q.iter().sum();
            for (j, (&(_, f), &qj)) in state.preds.iter().zip(&q).enumerate() {
                summary.total_xgrams += 1;
                if f <= 0.0 {
                    summary.shadowed += 1;
                    continue;
                }
                if protected.contains(&state.hist, state.preds[j].0) {
                    summary.protected += 1;
                    continue;
                }
                let arriving = f + gamma * qj;
                let new_gamma = gamma + f;
                // the removed entry's own loss, the gain of the off-support
                // back-off mass, and a first-order estimate of the gain of
                // the surviving entries
                let own = arriving * (new_gamma * qj / arriving).ln();
                let off_support = if gamma > 0.0 {
                    gamma * (1.0 - support_q).max(0.0) * (new_gamma / gamma).ln()
                } else {
                    0.0
                };
                let cross = f * (support_q - qj);
                let delta = own + off_support + cross;
                if delta.abs() < threshold {
                    summary.like_change += delta;
                    summary.pruned += 1;
                    removals.entry((o, i)).or_default().push(j);
                }
            }
        }
    }
    for ((o, i), pred_indices) in removals {
        let state = &mut model.states_mut(o)[i];
        for &j in pred_indices.iter().rev() {
            let (_, f) = state.preds.remove(j);
            state.backoff += f;
        }
    }
    summary.num_ngrams = model.num_ngrams();
    summary
}

/// Knobs of the pruning driver.
#[derive(Clone, Debug)]
pub struct PruneOptions {
    /// Sweep out dead history states after each pruning pass. Results are
    /// identical either way; disabling is for debugging.
    pub remove_zeros: bool,
    /// Measure the exact divergence by running a dry E-M evaluation of the
    /// initial model.
    pub check_exact_divergence: bool,
    /// Sorting budget for the protected-set recomputation.
    pub sort: SortConfig,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            remove_zeros: true,
            check_exact_divergence: true,
            sort: SortConfig::in_memory(),
        }
    }
}

/// Size-target search knobs.
#[derive(Clone, Debug)]
pub struct TargetOptions {
    /// Threshold of the first pruning iteration.
    pub initial_threshold: f64,
    /// Half-width of the acceptance window around the target, as a
    /// fraction of it.
    pub tolerance: f64,
    /// Pruning iterations allowed before giving up.
    pub max_iterations: usize,
    /// How often to retry with a quartered initial threshold after an
    /// overshoot on the very first iteration.
    pub max_retries: usize,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            initial_threshold: 0.25,
            tolerance: 0.05,
            max_iterations: 20,
            max_retries: 3,
        }
    }
}

/// Outcome of a schedule run or a target search.
#[derive(Clone, Debug)]
pub struct PruneReport {
    /// N-grams excluding unigrams before any pruning.
    pub initial_num_xgrams: u64,
    /// Explicit n-grams per order at the end.
    pub final_num_ngrams: Vec<u64>,
    /// Expected per-word log-probability change of every step run, in
    /// order, with steps dropped by backtracking excluded.
    pub logprob_changes: Vec<f64>,
    /// Divergence estimate from the per-step changes.
    pub approximate_kl_divergence: f64,
    /// Initial minus final log-probability per word, when the exact check
    /// ran and the last step was an E-M iteration.
    pub exact_kl_divergence: Option<f64>,
    /// The final threshold (the searched one in target mode).
    pub threshold: f64,
    /// Pruning iterations used by the target search.
    pub iterations: usize,
}

struct Snapshot {
    model: Model,
    stats: Stats,
    protected: ProtectedSet,
    changes_len: usize,
    last_em_logprob: Option<f64>,
}

/// Drives pruning over a model: owns the float counts, the statistics, and
/// the protected set, and keeps them consistent across steps.
pub struct Pruner {
    model: Model,
    stats: Stats,
    protected: ProtectedSet,
    options: PruneOptions,
    logprob_changes: Vec<f64>,
    initial_logprob: Option<f64>,
    last_em_logprob: Option<f64>,
    initial_num_xgrams: u64,
    last_threshold: f64,
    iterations: usize,
}

impl Pruner {
    /// Sets up pruning state for `model`: builds the statistics and the
    /// protected set, and measures the initial log-probability when the
    /// exact-divergence check is on.
    ///
    /// # Errors
    ///
    /// Fails if the protected-set sorter cannot spill, or the dry E-M
    /// evaluation fails.
    pub fn new(model: Model, options: PruneOptions) -> Result<Self> {
        let stats = build_stats(&model);
        let protected = ProtectedSet::from_model(&model, &options.sort)?;
        let initial_logprob = if options.check_exact_divergence {
            let (_, report) = em_step(&model, &stats)?;
            debug_assert!(report.like_change().abs() < 1e-4 * report.total_count.max(1.0));
            Some(report.log_prob_per_word())
        } else {
            None
        };
        let initial_num_xgrams = model.num_xgrams();
        Ok(Self {
            model,
            stats,
            protected,
            options,
            logprob_changes: Vec::new(),
            initial_logprob,
            last_em_logprob: None,
            initial_num_xgrams,
            last_threshold: 0.0,
            iterations: 0,
        })
    }

    /// The model in its current state.
    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Consumes the driver, yielding the pruned model.
    #[must_use]
    pub fn into_model(self) -> Model {
        self.model
    }

    /// Runs one step. Returns the expected per-word log-probability change
    /// (negative for pruning, nonnegative for E-M).
    ///
    /// # Errors
    ///
    /// Fails on internal inconsistencies between model and statistics.
    pub fn run_step(&mut self, step: Step, final_threshold: f64) -> Result<f64> {
        let change = match step {
            Step::Prune(factor) => {
                let threshold = final_threshold * factor;
                let summary = prune_pass(&mut self.model, &self.protected, threshold);
                log::info!(
                    "prune at threshold {threshold}: {} of {} xgrams removed \
                     ({} protected, {} shadowed)",
                    summary.pruned,
                    summary.total_xgrams,
                    summary.protected,
                    summary.shadowed
                );
                if self.options.remove_zeros {
                    remove_zeros(&mut self.model, &mut self.stats)?;
                }
                self.protected = ProtectedSet::from_model(&self.model, &self.options.sort)?;
                summary.like_change / summary.weighted_count
            }
            Step::Em => {
                let (new_model, report) = em_step(&self.model, &self.stats)?;
                self.model = new_model;
                self.last_em_logprob = Some(report.log_prob_per_word());
                log::info!(
                    "E-M step: log-prob per word {:.6}, improvement {:.3e}",
                    report.log_prob_per_word(),
                    report.like_change() / report.total_count
                );
                report.like_change() / report.total_count
            }
        };
        self.logprob_changes.push(change);
        Ok(change)
    }

    /// Runs a whole schedule at the given final threshold.
    ///
    /// # Errors
    ///
    /// As [`Pruner::run_step`].
    pub fn run_schedule(&mut self, steps: &[Step], final_threshold: f64) -> Result<()> {
        self.last_threshold = final_threshold;
        for &step in steps {
            self.run_step(step, final_threshold)?;
        }
        Ok(())
    }

    /// Searches for the threshold that brings the n-gram count (excluding
    /// unigrams) within `tolerance` of `target`, pruning as it goes. Each
    /// iteration runs `prune*1.0 EM EM EM`. Overshooting on the very first
    /// iteration restarts the search with a quartered threshold.
    ///
    /// # Errors
    ///
    /// [`Error::IterationBudgetExceeded`] past the iteration cap, or
    /// [`Error::NumericalFailure`] when the target is unreachable or every
    /// retry overshot.
    pub fn prune_to_target(&mut self, target: u64, options: &TargetOptions) -> Result<()> {
        #[allow(clippy::cast_precision_loss)]
        let target_f = target as f64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let lower = (target_f * (1.0 - options.tolerance)).ceil() as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let upper = (target_f * (1.0 + options.tolerance)).floor() as u64;
        let initial = self.model.num_xgrams();
        if (lower..=upper).contains(&initial) {
            log::info!("the model already has {initial} xgrams, nothing to prune");
            return Ok(());
        }
        if target > initial {
            return Err(Error::NumericalFailure {
                component: "prune",
                message: format!(
                    "the model has {initial} xgrams, fewer than the target {target}; \
                     pruning cannot grow a model"
                ),
            });
        }
        let baseline = self.snapshot();
        let mut threshold = options.initial_threshold;
        for retry in 0..=options.max_retries {
            match self.search_threshold(target, lower, upper, threshold, options)? {
                Some(found) => {
                    self.last_threshold = found;
                    return Ok(());
                }
                None => {
                    if retry == options.max_retries {
                        break;
                    }
                    log::warn!(
                        "initial threshold {threshold} overshot the target, \
                         retrying with {}",
                        threshold / 4.0
                    );
                    threshold /= 4.0;
                    self.restore(&baseline);
                }
            }
        }
        Err(Error::NumericalFailure {
            component: "prune",
            message: format!(
                "still overshooting the target after {} initial-threshold reductions; \
                 rerun with a smaller initial threshold",
                options.max_retries
            ),
        })
    }

    /// One full threshold search. `Ok(None)` means the initial threshold
    /// overshot and the caller should retry lower.
    fn search_threshold(
        &mut self,
        target: u64,
        lower: u64,
        upper: u64,
        initial_threshold: f64,
        options: &TargetOptions,
    ) -> Result<Option<f64>> {
        let mut size_model = SizeModel::new(target, lower, upper);
        size_model.set_initial_threshold(initial_threshold, self.model.num_xgrams());
        let mut checkpoints: FxHashMap<usize, Snapshot> = FxHashMap::default();
        checkpoints.insert(0, self.snapshot());
        let mut threshold = initial_threshold;
        loop {
            for step in [Step::Prune(1.0), Step::Em, Step::Em, Step::Em] {
                self.run_step(step, threshold)?;
            }
            checkpoints.insert(size_model.iterations() + 1, self.snapshot());
            match size_model.next_action(self.model.num_xgrams()) {
                Action::Success => {
                    self.iterations = size_model.iterations();
                    return Ok(Some(threshold));
                }
                Action::Overshoot => return Ok(None),
                Action::Backtrack { threshold: next, step } => {
                    let checkpoint = checkpoints
                        .get(&step)
                        .ok_or_else(|| Error::NumericalFailure {
                            component: "prune",
                            message: format!("no checkpoint for backtrack step {step}"),
                        })?;
                    self.restore(checkpoint);
                    threshold = next;
                }
                Action::Continue { threshold: next } => threshold = next,
            }
            if size_model.iterations() >= options.max_iterations {
                return Err(Error::IterationBudgetExceeded {
                    max_iterations: options.max_iterations,
                });
            }
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            model: self.model.clone(),
            stats: self.stats.clone(),
            protected: self.protected.clone(),
            changes_len: self.logprob_changes.len(),
            last_em_logprob: self.last_em_logprob,
        }
    }

    fn restore(&mut self, snapshot: &Snapshot) {
        self.model = snapshot.model.clone();
        self.stats = snapshot.stats.clone();
        self.protected = snapshot.protected.clone();
        self.logprob_changes.truncate(snapshot.changes_len);
        self.last_em_logprob = snapshot.last_em_logprob;
    }

    /// Summarizes everything run so far.
    #[must_use]
    pub fn report(&self, last_step_was_em: bool) -> PruneReport {
        let exact = match (self.initial_logprob, self.last_em_logprob) {
            (Some(initial), Some(last)) if last_step_was_em => Some(initial - last),
            _ => None,
        };
        PruneReport {
            initial_num_xgrams: self.initial_num_xgrams,
            final_num_ngrams: self.model.num_ngrams(),
            logprob_changes: self.logprob_changes.clone(),
            approximate_kl_divergence: -self.logprob_changes.iter().sum::<f64>(),
            exact_kl_divergence: exact,
            threshold: self.last_threshold,
            iterations: self.iterations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HistoryState;
    use float_cmp::assert_approx_eq;

    #[test]
    fn schedule_parsing() {
        let steps = parse_steps("prune*0.25 EM EM prune*1.0").unwrap();
        assert_eq!(
            steps,
            vec![Step::Prune(0.25), Step::Em, Step::Em, Step::Prune(1.0)]
        );
        assert_eq!(Step::default_schedule().len(), 16);
        assert!(parse_steps("prune*0").is_err());
        assert!(parse_steps("em").is_err());
        assert!(parse_steps("").is_err());
    }

    /// A trigram model in estimation shape: nested supports, every state
    /// carrying back-off mass.
    fn trigram_model() -> Model {
        Model::from_orders(
            5,
            vec![
                vec![HistoryState::new(
                    vec![],
                    vec![(2, 3.0), (4, 2.0), (5, 1.0)],
                    5.0,
                )],
                vec![
                    HistoryState::new(vec![2], vec![(4, 1.0), (5, 0.25)], 0.75),
                    HistoryState::new(vec![4], vec![(2, 1.5), (5, 0.5)], 1.0),
                ],
                vec![
                    HistoryState::new(vec![4, 2], vec![(2, 0.5)], 0.5),
                    HistoryState::new(vec![5, 4], vec![(2, 0.25), (5, 0.25)], 0.5),
                ],
            ],
        )
    }

    #[test]
    fn zero_threshold_prunes_nothing_and_em_is_a_fixpoint() {
        let model = trigram_model();
        let num_ngrams = model.num_ngrams();
        let mut pruner = Pruner::new(model, PruneOptions::default()).unwrap();
        pruner.run_schedule(&parse_steps("prune*1.0 EM").unwrap(), 0.0).unwrap();
        let report = pruner.report(true);
        assert_eq!(pruner.model().num_ngrams(), num_ngrams);
        let per_word: f64 = report.logprob_changes.iter().sum();
        assert!(
            per_word.abs() < 1e-10,
            "log-likelihood moved by {per_word} per word without pruning"
        );
        assert!(report.exact_kl_divergence.unwrap().abs() < 1e-10);
    }

    #[test]
    fn protected_ngrams_survive_an_aggressive_prune() {
        let mut model = trigram_model();
        let protected = ProtectedSet::from_model(&model, &SortConfig::in_memory()).unwrap();
        let summary = prune_pass(&mut model, &protected, f64::INFINITY);
        // the bigram states [2] and [4] protect (h=[], w=2) and (h=[], w=4),
        // but unigrams are never candidates anyway; the trigram states
        // [4, 2] and [5, 4] protect the bigrams ([2], 4) and ([4], 5)
        assert!(summary.pruned > 0);
        assert_eq!(summary.protected, 2);
        let kept: Vec<_> = model
            .states(2)
            .iter()
            .flat_map(|s| s.preds.iter().map(move |&(w, _)| (s.hist[0], w)))
            .collect();
        assert_eq!(kept, vec![(2, 4), (4, 5)]);
        // every trigram goes, nothing protects them
        assert_eq!(model.num_ngrams()[2], 0);
    }

    #[test]
    fn pruning_keeps_mass_and_probabilities_normalized() {
        let mut model = trigram_model();
        let totals: Vec<f64> = model.states(2).iter().map(|s| s.total).collect();
        let protected = ProtectedSet::from_model(&model, &SortConfig::in_memory()).unwrap();
        prune_pass(&mut model, &protected, 0.2);
        for (state, &before) in model.states(2).iter().zip(&totals) {
            let mass: f64 =
                state.preds.iter().map(|&(_, f)| f).sum::<f64>() + state.backoff;
            assert_approx_eq!(f64, mass, before, epsilon = 1e-12);
            assert_approx_eq!(f64, state.total, before, epsilon = 1e-12);
        }
        for o in 1..=model.order() {
            for state in model.states(o) {
                let total: f64 =
                    (1..=model.num_words()).map(|w| model.prob(&state.hist, w)).sum();
                assert_approx_eq!(f64, total, 1.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn schedule_prunes_and_reestimates() {
        let model = trigram_model();
        let before = model.num_xgrams();
        let mut pruner = Pruner::new(model, PruneOptions::default()).unwrap();
        pruner
            .run_schedule(&parse_steps("prune*0.5 EM EM prune*1.0 EM").unwrap(), 0.3)
            .unwrap();
        let report = pruner.report(true);
        assert!(pruner.model().num_xgrams() < before);
        assert_eq!(report.initial_num_xgrams, before);
        // pruning loses likelihood, E-M claws some back
        assert!(report.approximate_kl_divergence >= 0.0);
        assert_eq!(report.logprob_changes.len(), 5);
    }
}
