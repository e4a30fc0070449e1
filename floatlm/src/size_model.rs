//! The size-targeting controller: models how the n-gram count (excluding
//! unigrams, which cannot be pruned) responds to the pruning threshold,
//! and steers an iterative threshold search toward a target size, with
//! backtracking when it overshoots.

/// What the caller should do after reporting a pruning iteration's result.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Action {
    /// The size landed inside the target window.
    Success,
    /// The very first threshold already overshot; retry the whole search
    /// with a smaller initial threshold.
    Overshoot,
    /// Discard recent iterations: restore the checkpoint taken after
    /// iteration `step` and prune with `threshold` from there.
    Backtrack {
        /// Threshold for the next pruning iteration.
        threshold: f64,
        /// Iteration index whose checkpoint to restart from.
        step: usize,
    },
    /// Prune once more with `threshold` from the current state.
    Continue {
        /// Threshold for the next pruning iteration.
        threshold: f64,
    },
}

/// One controller iteration on record.
#[derive(Clone, Copy, Debug)]
struct Row {
    threshold: f64,
    num_xgrams: f64,
    modeled_num_xgrams: f64,
    target_num_xgrams: f64,
    starting_iter: usize,
}

/// The size-versus-threshold model. Heuristic and adjusted on the fly:
/// repeating a threshold shrinks the count by `(cur / prev) ^ p_prev`, and
/// raising the threshold applies a further `(next / cur) ^ p_thr` factor.
/// Overshoots grow both exponents by 1.2, capping `p_prev` at 1.
pub struct SizeModel {
    target_num_xgrams: f64,
    lower: f64,
    upper: f64,
    initial_threshold: Option<f64>,
    iter: usize,
    history: Vec<Row>,
    xgrams_change_power: f64,
    prev_change_power: f64,
    max_threshold_change_factor: f64,
}

impl SizeModel {
    /// Controller for a target of `target_num_xgrams` n-grams excluding
    /// unigrams, succeeding anywhere in `[lower, upper]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(target_num_xgrams: u64, lower: u64, upper: u64) -> Self {
        Self {
            target_num_xgrams: target_num_xgrams as f64,
            lower: lower as f64,
            upper: upper as f64,
            initial_threshold: None,
            iter: 0,
            history: Vec::new(),
            xgrams_change_power: -1.0,
            prev_change_power: 0.5,
            max_threshold_change_factor: 4.0,
        }
    }

    /// Number of pruning iterations reported so far.
    #[must_use]
    pub const fn iterations(&self) -> usize {
        self.iter
    }

    /// Records the threshold of the first pruning iteration and the
    /// unpruned size.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_initial_threshold(&mut self, threshold: f64, initial_num_xgrams: u64) {
        assert!(self.initial_threshold.is_none(), "initial threshold set twice");
        self.initial_threshold = Some(threshold);
        self.history.push(Row {
            threshold: 0.0,
            num_xgrams: initial_num_xgrams as f64,
            modeled_num_xgrams: 0.0,
            target_num_xgrams: 0.0,
            starting_iter: 0,
        });
        self.history.push(Row {
            threshold,
            num_xgrams: 0.0,
            modeled_num_xgrams: 0.0,
            target_num_xgrams: 0.0,
            starting_iter: 0,
        });
    }

    fn matches_target(&self, num_xgrams: f64) -> bool {
        num_xgrams >= self.lower && num_xgrams <= self.upper
    }

    /// Reports the size after pruning with the threshold this controller
    /// last handed out, and returns what to do next.
    #[allow(clippy::cast_precision_loss)]
    pub fn next_action(&mut self, cur_num_xgrams: u64) -> Action {
        let cur_num_xgrams = cur_num_xgrams as f64;
        let mut prev_threshold = self.prev().threshold;
        let mut cur_threshold = self.cur().threshold;
        self.cur_mut().num_xgrams = cur_num_xgrams;
        self.iter += 1;
        log::debug!(
            "size model iteration {}: threshold {cur_threshold:.3}, {cur_num_xgrams} xgrams \
             (modeled {:.0}, intermediate target {:.0})",
            self.iter,
            self.cur().modeled_num_xgrams,
            self.cur().target_num_xgrams
        );
        if self.matches_target(cur_num_xgrams) {
            return Action::Success;
        }
        let mut backtrack_iter = None;
        if cur_num_xgrams < self.lower {
            // we overshot
            if Some(cur_threshold) == self.initial_threshold {
                log::debug!("overshot with the initial threshold {cur_threshold}");
                return Action::Overshoot;
            }
            let popped = self.history.pop().expect("history is never empty here");
            backtrack_iter = Some(popped.starting_iter);
            while prev_threshold == cur_threshold {
                prev_threshold = self.prev().threshold;
                let popped = self.history.pop().expect("pops stop at the initial row");
                backtrack_iter = Some(popped.starting_iter);
            }
            prev_threshold = self.prev().threshold;
            cur_threshold = self.cur().threshold;
            if prev_threshold == cur_threshold {
                self.adjust_for_overshoot();
                log::debug!(
                    "backtracking to iteration {} with adjusted exponents {} and {}",
                    backtrack_iter.expect("set above"),
                    self.xgrams_change_power,
                    self.prev_change_power
                );
            } else {
                log::debug!(
                    "backtracking to iteration {} without adjusting the model",
                    backtrack_iter.expect("set above")
                );
            }
        }
        // a popped starting iteration of 0 points at the rows recorded
        // before any pruning ran; there is no checkpoint behind them, so
        // the search continues forward instead of backtracking
        let backtrack_step = backtrack_iter.filter(|&step| step > 0);
        let (next_threshold, modeled, target) =
            if backtrack_step.is_some() && prev_threshold != cur_threshold {
                // repeat the same threshold to expose its full effect; some
                // n-grams become prunable only after their dependents went
                (cur_threshold, self.cur().modeled_num_xgrams, self.cur().target_num_xgrams)
            } else {
                let target = self.intermediate_target();
                let (next, modeled) = self.next_threshold(target);
                (next, modeled, target)
            };
        let starting_iter = backtrack_step.unwrap_or(self.iter);
        self.history.push(Row {
            threshold: next_threshold,
            num_xgrams: 0.0,
            modeled_num_xgrams: modeled,
            target_num_xgrams: target,
            starting_iter,
        });
        match backtrack_step {
            Some(step) => Action::Backtrack { threshold: next_threshold, step },
            None => Action::Continue { threshold: next_threshold },
        }
    }

    /// The size to aim for next: straight at the target when close, only
    /// part of the way in log space when far.
    fn intermediate_target(&self) -> f64 {
        let cur = self.cur().num_xgrams;
        if cur > 1.5 * self.target_num_xgrams {
            let change_factor = (self.target_num_xgrams / cur).sqrt().max(0.25);
            cur * change_factor
        } else if cur > 1.15 * self.target_num_xgrams {
            cur * (self.target_num_xgrams / cur).powf(0.666)
        } else {
            self.target_num_xgrams
        }
    }

    /// Binary search for the threshold whose modeled size comes closest to
    /// `target` from above. The threshold never decreases and never grows
    /// by more than the change-factor cap.
    fn next_threshold(&self, target: f64) -> (f64, f64) {
        let cur_threshold = self.cur().threshold;
        let tolerance = 1.0e-4 * cur_threshold;
        let mut left = cur_threshold;
        let mut right = self.max_threshold_change_factor * cur_threshold;
        let mut next_threshold = left;
        let mut next_larger_num_xgrams = target;
        while left <= right - tolerance {
            next_threshold = (left + right) / 2.0;
            let modeled = self.modeled_num_xgrams(next_threshold);
            if modeled < target {
                right = next_threshold;
            } else if modeled > target {
                next_larger_num_xgrams = modeled;
                left = next_threshold;
            } else {
                next_larger_num_xgrams = modeled;
                return (next_threshold, next_larger_num_xgrams);
            }
        }
        if left > right - tolerance {
            // keep the modeled size at or above the target
            next_threshold = left;
        }
        (next_threshold, next_larger_num_xgrams)
    }

    /// The modeled size after pruning once more with `next_threshold`.
    fn modeled_num_xgrams(&self, next_threshold: f64) -> f64 {
        let prev_num_xgrams = self.prev().num_xgrams;
        let cur_threshold = self.cur().threshold;
        let cur_num_xgrams = self.cur().num_xgrams;
        debug_assert!(prev_num_xgrams >= cur_num_xgrams);
        debug_assert!(next_threshold >= cur_threshold);
        let repeat_factor = (cur_num_xgrams / prev_num_xgrams).powf(self.prev_change_power);
        let extra_factor = (next_threshold / cur_threshold).powf(self.xgrams_change_power);
        repeat_factor * cur_num_xgrams * extra_factor
    }

    fn adjust_for_overshoot(&mut self) {
        self.xgrams_change_power *= 1.2;
        self.prev_change_power = (self.prev_change_power * 1.2).min(1.0);
    }

    fn prev(&self) -> &Row {
        &self.history[self.history.len() - 2]
    }

    fn cur(&self) -> &Row {
        self.history.last().expect("nonempty")
    }

    fn cur_mut(&mut self) -> &mut Row {
        self.history.last_mut().expect("nonempty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    /// A quasi-pruner that is log-log linear in the threshold, with noisy
    /// shrinkage on threshold repeats.
    struct SimulatedPruner {
        initial_num_xgrams: f64,
        prev_threshold: f64,
        prev_num_xgrams: f64,
        rng: Pcg64,
    }

    impl SimulatedPruner {
        fn new(initial_num_xgrams: f64, seed: u64) -> Self {
            Self {
                initial_num_xgrams,
                prev_threshold: 0.0,
                prev_num_xgrams: initial_num_xgrams,
                rng: Pcg64::seed_from_u64(seed),
            }
        }

        fn prune(&mut self, threshold: f64) -> u64 {
            let num_xgrams = if (self.prev_threshold - threshold).abs() < f64::EPSILON {
                self.prev_num_xgrams / self.rng.gen_range(1.0..1.5)
            } else {
                (self.initial_num_xgrams.ln() - 2.0 * (threshold + 1.0).ln()).exp()
            };
            self.prev_threshold = threshold;
            self.prev_num_xgrams = num_xgrams;
            num_xgrams as u64
        }
    }

    #[test]
    fn reaches_the_target_window_within_the_budget() {
        for seed in 0..10 {
            let target = 150_000;
            let mut model = SizeModel::new(target, 142_500, 157_500);
            let mut pruner = SimulatedPruner::new(1_200_000.0, seed);
            let mut threshold = 0.25;
            model.set_initial_threshold(threshold, 1_200_000);
            let mut iterations = 0;
            loop {
                let num_xgrams = pruner.prune(threshold);
                iterations += 1;
                assert!(iterations <= 20, "seed {seed} took too many iterations");
                match model.next_action(num_xgrams) {
                    Action::Success => break,
                    Action::Overshoot => panic!("seed {seed}: overshot the initial threshold"),
                    Action::Continue { threshold: t } => {
                        // within one forward run the threshold never decreases
                        assert!(t >= threshold * 0.999);
                        threshold = t;
                    }
                    Action::Backtrack { threshold: t, .. } => threshold = t,
                }
            }
        }
    }

    #[test]
    fn initial_overshoot_is_signaled() {
        let mut model = SizeModel::new(150_000, 142_500, 157_500);
        model.set_initial_threshold(0.25, 1_200_000);
        // the first prune already went below the window
        assert_eq!(model.next_action(90_000), Action::Overshoot);
    }

    #[test]
    fn overshoot_after_a_raise_backtracks_and_repeats_the_threshold() {
        let mut model = SizeModel::new(150_000, 142_500, 157_500);
        model.set_initial_threshold(0.25, 1_000_000);
        let next = match model.next_action(800_000) {
            Action::Continue { threshold } => threshold,
            other => panic!("expected Continue, got {other:?}"),
        };
        assert!(next > 0.25 && next <= 1.0);
        // the raised threshold overshot; the controller re-runs the prior
        // threshold from the checkpoint after iteration 1 to expose its
        // full effect before adjusting anything
        match model.next_action(100_000) {
            Action::Backtrack { threshold, step } => {
                assert_eq!(step, 1);
                assert!((threshold - 0.25).abs() < 1e-12);
            }
            other => panic!("expected Backtrack, got {other:?}"),
        }
    }

    #[test]
    fn immediate_success_inside_the_window() {
        let mut model = SizeModel::new(150_000, 142_500, 157_500);
        model.set_initial_threshold(0.25, 1_200_000);
        assert_eq!(model.next_action(149_000), Action::Success);
    }
}
