//! Piecewise discounting of merged counts at one order: splits each count
//! into retained float mass and mass pushed toward the back-off target,
//! plus the order-1 closed-vocabulary smoothing and both backward forms.

use crate::count::{FloatCount, Word};
use crate::error::{Error, Result};
use crate::metaparams::Discounts;
use crate::model::{HistoryState, StateDerivs};
use std::collections::BTreeMap;
use std::path::Path;

/// The subtracted amount for a raw count `c`. Continuous in `c`, piecewise
/// linear with slopes D1 through D4 over the four bands.
fn amount(c: f64, d: &Discounts) -> f64 {
    if c <= 1.0 {
        d.d1 * c
    } else if c <= 2.0 {
        d.d1 + d.d2 * (c - 1.0)
    } else if c <= 3.0 {
        d.d1 + d.d2 + d.d3 * (c - 2.0)
    } else {
        d.d1 + d.d2 + d.d3 + d.d4 * (c - 3.0)
    }
}

/// d(amount)/dc. At a band boundary the slope is taken from the left, the
/// convention the derivative checks are calibrated against.
fn slope(c: f64, d: &Discounts) -> f64 {
    if c <= 1.0 {
        d.d1
    } else if c <= 2.0 {
        d.d2
    } else if c <= 3.0 {
        d.d3
    } else {
        d.d4
    }
}

/// d(amount)/d(D1..D4), the per-band contribution of each constant.
fn d_coeffs(c: f64) -> [f64; 4] {
    if c <= 1.0 {
        [c, 0.0, 0.0, 0.0]
    } else if c <= 2.0 {
        [1.0, c - 1.0, 0.0, 0.0]
    } else if c <= 3.0 {
        [1.0, 1.0, c - 2.0, 0.0]
    } else {
        [1.0, 1.0, 1.0, c - 3.0]
    }
}

/// Output of one order's discounting.
pub struct DiscountedOrder {
    /// The float-count states of this order, canonically ordered. Each
    /// state's back-off weight is the mass discounted out of it.
    pub states: Vec<HistoryState>,
    /// The discount stream for the next-lower order: the same mass,
    /// aggregated by (suffix history, predicted) and canonically ordered.
    pub discount: Vec<FloatCount>,
}

/// Discounts the merged counts of one order `o >= 2`.
///
/// # Errors
///
/// Fails if the merged stream is not canonically ordered or has an empty
/// history.
pub fn discount_counts(merged: &[FloatCount], d: &Discounts) -> Result<DiscountedOrder> {
    let mut states: Vec<HistoryState> = Vec::new();
    let mut discount: Vec<FloatCount> = Vec::new();
    // discounted mass aggregates per (suffix history, predicted); all
    // histories sharing a suffix are consecutive, so one block buffer is
    // enough
    let mut block: BTreeMap<Word, f64> = BTreeMap::new();
    let mut block_parent: Option<Vec<Word>> = None;
    for (i, record) in merged.iter().enumerate() {
        if record.hist.is_empty() {
            return Err(Error::malformed(
                Path::new("<merged counts>"),
                "cannot discount order-1 records",
            ));
        }
        if i > 0 {
            let prev = &merged[i - 1];
            if crate::count::key_cmp(&prev.hist, prev.word, &record.hist, record.word)
                != std::cmp::Ordering::Less
            {
                return Err(Error::malformed(
                    Path::new("<merged counts>"),
                    format!("merged stream is out of order at record {i}"),
                ));
            }
        }
        let parent = &record.hist[..record.hist.len() - 1];
        if block_parent.as_deref() != Some(parent) {
            flush_block(&mut block, &mut block_parent, &mut discount);
            block_parent = Some(parent.to_vec());
        }
        let subtract = amount(record.value, d);
        if states.last().map(|s: &HistoryState| s.hist.as_slice())
            != Some(record.hist.as_slice())
        {
            states.push(HistoryState::new(record.hist.clone(), Vec::new(), 0.0));
        }
        let state = states.last_mut().expect("just pushed");
        state.preds.push((record.word, record.value - subtract));
        state.backoff += subtract;
        *block.entry(record.word).or_insert(0.0) += subtract;
    }
    flush_block(&mut block, &mut block_parent, &mut discount);
    for state in &mut states {
        state.recompute_total();
    }
    Ok(DiscountedOrder { states, discount })
}

fn flush_block(
    block: &mut BTreeMap<Word, f64>,
    parent: &mut Option<Vec<Word>>,
    discount: &mut Vec<FloatCount>,
) {
    if let Some(hist) = parent.take() {
        for (word, value) in std::mem::take(block) {
            discount.push(FloatCount { hist: hist.clone(), word, value });
        }
    }
}

/// Derivatives produced by [`discount_counts_backward`].
pub struct DiscountBackward {
    /// Derivative w.r.t. each merged count, aligned with the merged stream.
    pub merged_derivs: Vec<f64>,
    /// Derivatives w.r.t. D1 through D4 of this order.
    pub d_derivs: [f64; 4],
}

/// Backward form of [`discount_counts`]. Takes the derivatives w.r.t. this
/// order's float counts (`state_derivs`, aligned with the forward states)
/// and w.r.t. the emitted discount stream (`discount_derivs`), and returns
/// derivatives w.r.t. the merged counts and the four discount constants.
///
/// # Errors
///
/// Fails if the derivative streams do not align with a re-walk of the
/// forward pass.
pub fn discount_counts_backward(
    merged: &[FloatCount],
    d: &Discounts,
    state_derivs: &[StateDerivs],
    discount_derivs: &[f64],
) -> Result<DiscountBackward> {
    let mut merged_derivs = Vec::with_capacity(merged.len());
    let mut d_derivs = [0.0; 4];
    let mut state_idx = 0_usize;
    let mut pred_idx = 0_usize;
    let mut cur_hist: Option<&[Word]> = None;
    // rebuild the discount-stream indices block by block
    let mut block_words: BTreeMap<Word, usize> = BTreeMap::new();
    let mut emitted = 0_usize;
    let mut record_idx = 0;
    while record_idx < merged.len() {
        let parent = parent_of(&merged[record_idx]);
        // find the extent of this suffix block and index its words
        let mut end = record_idx;
        block_words.clear();
        while end < merged.len() && parent_of(&merged[end]) == parent {
            block_words.entry(merged[end].word).or_insert(0);
            end += 1;
        }
        for (i, (_, slot)) in block_words.iter_mut().enumerate() {
            *slot = emitted + i;
        }
        for record in &merged[record_idx..end] {
            if cur_hist != Some(record.hist.as_slice()) {
                if cur_hist.is_some() {
                    state_idx += 1;
                }
                cur_hist = Some(record.hist.as_slice());
                pred_idx = 0;
            }
            let state = state_derivs.get(state_idx).ok_or_else(misaligned)?;
            let g_float = *state.preds.get(pred_idx).ok_or_else(misaligned)?;
            let g_backoff = state.backoff;
            let g_discount = discount_derivs[block_words[&record.word]];
            let s = slope(record.value, d);
            merged_derivs.push(g_float * (1.0 - s) + (g_discount + g_backoff) * s);
            let g_amount = -g_float + g_discount + g_backoff;
            for (acc, coeff) in d_derivs.iter_mut().zip(d_coeffs(record.value)) {
                *acc += g_amount * coeff;
            }
            pred_idx += 1;
        }
        emitted += block_words.len();
        record_idx = end;
    }
    if emitted != discount_derivs.len() {
        return Err(misaligned());
    }
    Ok(DiscountBackward { merged_derivs, d_derivs })
}

fn parent_of(record: &FloatCount) -> &[Word] {
    &record.hist[..record.hist.len() - 1]
}

fn misaligned() -> Error {
    Error::malformed(
        Path::new("<float derivatives>"),
        "derivative stream does not align with the discounted counts",
    )
}

/// Order-1 discounting: the arriving discount counts become the unigram
/// float counts unchanged, and the state smooths against the uniform
/// distribution with one pseudo-count per vocabulary word, so
/// P(w) = (c(w) + 1) / (total + num_words) over the closed vocabulary.
///
/// # Errors
///
/// Fails if the stream contains non-empty histories or is out of order.
pub fn discount_counts_1gram(discount1: &[FloatCount], num_words: Word) -> Result<HistoryState> {
    let mut preds = Vec::with_capacity(discount1.len());
    for record in discount1 {
        if !record.hist.is_empty() {
            return Err(Error::malformed(
                Path::new("<order-1 discount stream>"),
                format!("unexpected history {:?} in order-1 counts", record.hist),
            ));
        }
        if let Some(&(prev, _)) = preds.last() {
            if prev >= record.word {
                return Err(Error::malformed(
                    Path::new("<order-1 discount stream>"),
                    format!("word {} is not strictly after {prev}", record.word),
                ));
            }
        }
        preds.push((record.word, record.value));
    }
    Ok(HistoryState::new(Vec::new(), preds, f64::from(num_words)))
}

/// Backward form of [`discount_counts_1gram`]: float-count derivatives pass
/// through to the order-1 discount stream unchanged (the pseudo-count mass
/// does not depend on the counts).
#[must_use]
pub fn discount_counts_1gram_backward(unigram_derivs: &StateDerivs) -> Vec<f64> {
    unigram_derivs.preds.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn fc(hist: &[Word], word: Word, value: f64) -> FloatCount {
        FloatCount { hist: hist.to_vec(), word, value }
    }

    fn d_test() -> Discounts {
        Discounts { d1: 0.8, d2: 0.4, d3: 0.2, d4: 0.1 }
    }

    #[test]
    fn band_amounts() {
        let d = d_test();
        assert_approx_eq!(f64, amount(0.5, &d), 0.4);
        assert_approx_eq!(f64, amount(1.0, &d), 0.8);
        assert_approx_eq!(f64, amount(1.5, &d), 1.0);
        assert_approx_eq!(f64, amount(2.5, &d), 1.3);
        assert_approx_eq!(f64, amount(5.0, &d), 1.6);
        // continuity at the band edges
        for c in [1.0, 2.0, 3.0] {
            assert_approx_eq!(f64, amount(c, &d), amount(c + 1e-12, &d), epsilon = 1e-9);
        }
        // slope at a boundary is the left band's constant
        assert_approx_eq!(f64, slope(1.0, &d), 0.8);
        assert_approx_eq!(f64, slope(2.0, &d), 0.4);
    }

    #[test]
    fn split_between_float_and_discount() {
        let d = d_test();
        let merged = [fc(&[7, 5], 9, 2.5)];
        let out = discount_counts(&merged, &d).unwrap();
        // subtracted mass is 0.8 + 0.4 + 0.2 * 0.5
        assert_eq!(out.states.len(), 1);
        assert_approx_eq!(f64, out.states[0].preds[0].1, 1.2);
        assert_approx_eq!(f64, out.states[0].backoff, 1.3);
        assert_approx_eq!(f64, out.states[0].total, 2.5);
        assert_eq!(out.discount.len(), 1);
        assert_eq!(out.discount[0].hist, vec![7]);
        assert_eq!(out.discount[0].word, 9);
        assert_approx_eq!(f64, out.discount[0].value, 1.3);
    }

    #[test]
    fn discount_aggregates_per_suffix() {
        let d = d_test();
        // two trigram histories [7, 5] and [8, 5]... suffixes [7] and [8];
        // [7, 5] and [7, 6] share the suffix [7]
        let merged = [
            fc(&[7, 5], 9, 1.0),
            fc(&[7, 6], 4, 1.0),
            fc(&[7, 6], 9, 1.0),
            fc(&[8, 5], 9, 1.0),
        ];
        let out = discount_counts(&merged, &d).unwrap();
        assert_eq!(out.states.len(), 3);
        assert_eq!(
            out.discount,
            vec![fc(&[7], 4, 0.8), fc(&[7], 9, 1.6), fc(&[8], 9, 0.8)]
        );
    }

    #[test]
    fn backward_matches_finite_differences() {
        let d = d_test();
        let merged = [
            fc(&[7, 5], 9, 0.7),
            fc(&[7, 6], 4, 1.5),
            fc(&[7, 6], 9, 2.5),
            fc(&[8, 5], 9, 4.0),
        ];
        // an arbitrary smooth loss over the outputs
        let loss = |out: &DiscountedOrder| -> f64 {
            let mut acc = 0.0;
            for (i, s) in out.states.iter().enumerate() {
                for (j, &(_, f)) in s.preds.iter().enumerate() {
                    acc += f * (1.0 + 0.3 * i as f64 + 0.1 * j as f64);
                }
                acc += s.backoff * (0.5 + 0.2 * i as f64);
            }
            for (k, r) in out.discount.iter().enumerate() {
                acc += r.value * (2.0 + 0.7 * k as f64);
            }
            acc
        };
        let out = discount_counts(&merged, &d).unwrap();
        // assemble the upstream derivatives of that loss
        let state_derivs: Vec<StateDerivs> = out
            .states
            .iter()
            .enumerate()
            .map(|(i, s)| StateDerivs {
                preds: (0..s.preds.len())
                    .map(|j| 1.0 + 0.3 * i as f64 + 0.1 * j as f64)
                    .collect(),
                backoff: 0.5 + 0.2 * i as f64,
            })
            .collect();
        let discount_derivs: Vec<f64> =
            (0..out.discount.len()).map(|k| 2.0 + 0.7 * k as f64).collect();
        let back =
            discount_counts_backward(&merged, &d, &state_derivs, &discount_derivs).unwrap();
        let h = 1e-6;
        for i in 0..merged.len() {
            let mut plus = merged.to_vec();
            plus[i].value += h;
            let mut minus = merged.to_vec();
            minus[i].value -= h;
            let numeric = (loss(&discount_counts(&plus, &d).unwrap())
                - loss(&discount_counts(&minus, &d).unwrap()))
                / (2.0 * h);
            assert_approx_eq!(f64, back.merged_derivs[i], numeric, epsilon = 1e-5);
        }
        // and w.r.t. the four constants
        fn d_slot(d: &mut Discounts, k: usize) -> &mut f64 {
            match k {
                0 => &mut d.d1,
                1 => &mut d.d2,
                2 => &mut d.d3,
                _ => &mut d.d4,
            }
        }
        for k in 0..4 {
            let mut dp = d_test();
            let mut dm = d_test();
            *d_slot(&mut dp, k) += h;
            *d_slot(&mut dm, k) -= h;
            let numeric = (loss(&discount_counts(&merged, &dp).unwrap())
                - loss(&discount_counts(&merged, &dm).unwrap()))
                / (2.0 * h);
            assert_approx_eq!(f64, back.d_derivs[k], numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn unigram_smooths_against_uniform() {
        let stream = [fc(&[], 2, 3.0), fc(&[], 4, 1.0)];
        let state = discount_counts_1gram(&stream, 4).unwrap();
        assert_approx_eq!(f64, state.total, 8.0);
        assert_approx_eq!(f64, state.backoff, 4.0);
        // P(w) = (c + 1) / (total + num_words)
        let p2 = (3.0 + 4.0 * 0.25) / 8.0;
        assert_approx_eq!(f64, p2, 0.5);
    }
}
