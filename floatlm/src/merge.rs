//! Streaming merge of per-source integer counts into one float-count
//! stream, and the backward pass that routes derivatives to the sources,
//! their scales, and the higher-order discount stream.

use crate::count::{key_cmp, FloatCount, IntCount, Word};
use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::path::Path;

/// Merges `sources[n]` scaled by `scales[n]` with the optional `discount`
/// stream from the next-higher order (weight 1). All inputs must be sorted
/// by (history, predicted); the output is as well, with counts summed per
/// key in source order, discount stream last.
///
/// # Errors
///
/// A sort-order violation in any input is fatal, as is a negative
/// effective count.
pub fn merge_counts(
    sources: &[&[IntCount]],
    scales: &[f64],
    discount: Option<&[FloatCount]>,
) -> Result<Vec<FloatCount>> {
    assert_eq!(sources.len(), scales.len());
    let merged_len_hint = sources.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut merged: Vec<FloatCount> = Vec::with_capacity(merged_len_hint);
    let mut cursor = MergeCursor::new(sources, discount);
    while let Some(key) = cursor.min_key()? {
        let (hist, word) = (key.0.to_vec(), key.1);
        let mut value = 0.0;
        for (n, head) in cursor.take_matching(&hist, word) {
            value += match head {
                Head::Source(count) => scales[n] * count,
                Head::Discount(v) => v,
            };
        }
        if value < 0.0 {
            return Err(Error::malformed(
                Path::new("<merged counts>"),
                format!("negative effective count {value} at history {hist:?} word {word}"),
            ));
        }
        merged.push(FloatCount { hist, word, value });
    }
    Ok(merged)
}

/// Derivatives produced by [`merge_counts_backward`].
pub struct MergeBackward {
    /// Derivative of the objective w.r.t. each source scale.
    pub scale_derivs: Vec<f64>,
    /// Derivative w.r.t. each record of the higher-order discount stream,
    /// aligned with that stream.
    pub discount_derivs: Vec<f64>,
}

/// Backward form of [`merge_counts`]: distributes `merged_derivs` (aligned
/// with the forward output) back over the inputs. The derivative w.r.t.
/// `scales[n]` accumulates the upstream derivative times the source's
/// integer count; the discount stream receives the upstream derivative
/// unchanged.
///
/// # Errors
///
/// Fails if the derivative stream does not align with a re-merge of the
/// inputs.
pub fn merge_counts_backward(
    sources: &[&[IntCount]],
    discount: Option<&[FloatCount]>,
    merged_derivs: &[f64],
) -> Result<MergeBackward> {
    let mut scale_derivs = vec![0.0; sources.len()];
    let mut discount_derivs = vec![0.0; discount.map_or(0, <[FloatCount]>::len)];
    let mut cursor = MergeCursor::new(sources, discount);
    let mut j = 0;
    while let Some(key) = cursor.min_key()? {
        let (hist, word) = (key.0.to_vec(), key.1);
        let upstream = *merged_derivs.get(j).ok_or_else(misaligned)?;
        for (n, head) in cursor.take_matching(&hist, word) {
            match head {
                Head::Source(count) => scale_derivs[n] += upstream * count,
                Head::Discount(_) => {
                    // one discount record consumed per key at most
                    discount_derivs[cursor.discount_pos - 1] = upstream;
                }
            }
        }
        j += 1;
    }
    if j != merged_derivs.len() {
        return Err(misaligned());
    }
    Ok(MergeBackward { scale_derivs, discount_derivs })
}

fn misaligned() -> Error {
    Error::malformed(
        Path::new("<merged derivatives>"),
        "derivative stream does not align with the merged counts",
    )
}

enum Head {
    Source(f64),
    Discount(f64),
}

/// Walks K sorted integer-count streams plus the discount stream in step.
struct MergeCursor<'a> {
    sources: &'a [&'a [IntCount]],
    positions: Vec<usize>,
    discount: &'a [FloatCount],
    discount_pos: usize,
}

impl<'a> MergeCursor<'a> {
    fn new(sources: &'a [&'a [IntCount]], discount: Option<&'a [FloatCount]>) -> Self {
        Self {
            sources,
            positions: vec![0; sources.len()],
            discount: discount.unwrap_or(&[]),
            discount_pos: 0,
        }
    }

    /// The smallest key among the stream heads, or `None` when exhausted.
    /// Verifies as it goes that every stream advances strictly.
    fn min_key(&self) -> Result<Option<(&'a [Word], Word)>> {
        let mut min: Option<(&[Word], Word)> = None;
        for (n, &pos) in self.positions.iter().enumerate() {
            if let Some(record) = self.sources[n].get(pos) {
                if pos > 0 {
                    let prev = &self.sources[n][pos - 1];
                    if key_cmp(&prev.hist, prev.word, &record.hist, record.word)
                        != Ordering::Less
                    {
                        return Err(Error::malformed(
                            Path::new("<count source>"),
                            format!("source {} is out of order at record {pos}", n + 1),
                        ));
                    }
                }
                min = Some(min_by_key(min, (record.hist.as_slice(), record.word)));
            }
        }
        if let Some(record) = self.discount.get(self.discount_pos) {
            if self.discount_pos > 0 {
                let prev = &self.discount[self.discount_pos - 1];
                if key_cmp(&prev.hist, prev.word, &record.hist, record.word) != Ordering::Less {
                    return Err(Error::malformed(
                        Path::new("<discount stream>"),
                        format!("discount stream is out of order at record {}", self.discount_pos),
                    ));
                }
            }
            min = Some(min_by_key(min, (record.hist.as_slice(), record.word)));
        }
        Ok(min)
    }

    /// Pops every stream head equal to `key`, yielding (stream index, head)
    /// pairs in source order with the discount stream last.
    fn take_matching(&mut self, hist: &[Word], word: Word) -> Vec<(usize, Head)> {
        let mut heads = Vec::new();
        for (n, pos) in self.positions.iter_mut().enumerate() {
            if let Some(record) = self.sources[n].get(*pos) {
                if record.hist == hist && record.word == word {
                    #[allow(clippy::cast_precision_loss)]
                    heads.push((n, Head::Source(record.count as f64)));
                    *pos += 1;
                }
            }
        }
        if let Some(record) = self.discount.get(self.discount_pos) {
            if record.hist == hist && record.word == word {
                heads.push((self.sources.len(), Head::Discount(record.value)));
                self.discount_pos += 1;
            }
        }
        heads
    }
}

fn min_by_key<'a>(
    current: Option<(&'a [Word], Word)>,
    candidate: (&'a [Word], Word),
) -> (&'a [Word], Word) {
    match current {
        None => candidate,
        Some(cur) => {
            if key_cmp(candidate.0, candidate.1, cur.0, cur.1) == Ordering::Less {
                candidate
            } else {
                cur
            }
        }
    }
}
