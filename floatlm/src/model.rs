//! The float-count model: history states of all orders, their canonical
//! ordering, the on-disk format, and the protected set used by pruning.

use crate::count::{read_varint, write_varint, Word};
use crate::error::{Error, Result};
use crate::sort::{ExternalSorter, SortConfig};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// One history state: the explicit float counts of the words observed after
/// `hist`, the back-off weight, and the state total.
///
/// The invariant `total == sum(float counts) + backoff` is maintained by
/// every operation that touches a state; the mass a state loses to
/// discounting or pruning reappears in `backoff`, never in thin air.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryState {
    /// History words, most recent first. Empty for the unigram state.
    pub hist: Vec<Word>,
    /// Explicit (word, float count) pairs, sorted by word.
    pub preds: Vec<(Word, f64)>,
    /// The back-off weight, i.e. the mass this state defers to its
    /// back-off target (the uniform distribution for the unigram state).
    pub backoff: f64,
    /// Total mass of the state.
    pub total: f64,
}

impl HistoryState {
    /// Constructor; computes the state total from its parts.
    #[must_use]
    pub fn new(hist: Vec<Word>, preds: Vec<(Word, f64)>, backoff: f64) -> Self {
        let mut state = Self { hist, preds, backoff, total: 0.0 };
        state.recompute_total();
        state
    }

    /// The back-off target history: this history minus its oldest word.
    #[must_use]
    pub fn backoff_target(&self) -> &[Word] {
        if self.hist.is_empty() {
            &[]
        } else {
            &self.hist[..self.hist.len() - 1]
        }
    }

    /// The explicit float count of `word`, zero if absent.
    #[must_use]
    pub fn float_count(&self, word: Word) -> f64 {
        match self.preds.binary_search_by_key(&word, |&(w, _)| w) {
            Ok(i) => self.preds[i].1,
            Err(_) => 0.0,
        }
    }

    /// True if no word retains explicit mass.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.preds.iter().all(|&(_, f)| f == 0.0)
    }

    pub(crate) fn recompute_total(&mut self) {
        // left fold in word order keeps results reproducible
        self.total = self.preds.iter().fold(0.0, |acc, &(_, f)| acc + f) + self.backoff;
    }
}

/// Derivatives of an objective w.r.t. one state's float counts: one value
/// per predicted word (aligned with [`HistoryState::preds`]) plus one for
/// the back-off weight.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateDerivs {
    /// d objective / d float count, aligned with the state's `preds`.
    pub preds: Vec<f64>,
    /// d objective / d back-off weight.
    pub backoff: f64,
}

/// Per-order float-count derivatives, aligned state by state with a
/// [`Model`].
#[derive(Clone, Debug)]
pub struct ModelDerivs {
    /// `by_order[o - 1][i]` mirrors the model state `(o, i)`.
    pub by_order: Vec<Vec<StateDerivs>>,
}

impl ModelDerivs {
    /// A zero derivative for every count of `model`.
    #[must_use]
    pub fn zeros(model: &Model) -> Self {
        Self {
            by_order: (1..=model.order())
                .map(|o| {
                    model
                        .states(o)
                        .iter()
                        .map(|s| StateDerivs { preds: vec![0.0; s.preds.len()], backoff: 0.0 })
                        .collect()
                })
                .collect(),
        }
    }

    /// The derivatives for the states of order `o`.
    #[must_use]
    pub fn order(&self, o: usize) -> &[StateDerivs] {
        &self.by_order[o - 1]
    }
}

/// Address of a state inside a [`Model`]: (order, index within the order).
pub type StateId = (usize, usize);

/// A complete float-count model over all orders 1..=N.
#[derive(Clone, Debug)]
pub struct Model {
    order: usize,
    num_words: Word,
    /// `by_order[o - 1]` holds the states of order `o` in canonical
    /// (history lex) order.
    by_order: Vec<Vec<HistoryState>>,
    index: FxHashMap<Vec<Word>, StateId>,
}

impl Model {
    /// Assembles a model from per-order state lists. States must be in
    /// canonical order within each order; the state histories must be
    /// unique.
    #[must_use]
    pub fn from_orders(num_words: Word, by_order: Vec<Vec<HistoryState>>) -> Self {
        let order = by_order.len();
        let mut index = FxHashMap::default();
        for (o, states) in by_order.iter().enumerate() {
            for (i, state) in states.iter().enumerate() {
                index.insert(state.hist.clone(), (o + 1, i));
            }
        }
        Self { order, num_words, by_order, index }
    }

    /// The n-gram order N.
    #[must_use]
    pub const fn order(&self) -> usize {
        self.order
    }

    /// The largest word id in use.
    #[must_use]
    pub const fn num_words(&self) -> Word {
        self.num_words
    }

    /// The states of order `o`, canonically ordered.
    #[must_use]
    pub fn states(&self, o: usize) -> &[HistoryState] {
        &self.by_order[o - 1]
    }

    pub(crate) fn states_mut(&mut self, o: usize) -> &mut Vec<HistoryState> {
        &mut self.by_order[o - 1]
    }

    /// Looks up the state with exactly this history.
    #[must_use]
    pub fn state(&self, hist: &[Word]) -> Option<&HistoryState> {
        self.index.get(hist).map(|&(o, i)| &self.by_order[o - 1][i])
    }

    /// The id of the state with exactly this history.
    #[must_use]
    pub fn state_id(&self, hist: &[Word]) -> Option<StateId> {
        self.index.get(hist).copied()
    }

    /// The state addressed by `id`.
    #[must_use]
    pub fn state_by_id(&self, id: StateId) -> &HistoryState {
        &self.by_order[id.0 - 1][id.1]
    }

    /// Number of explicit n-grams per order.
    #[must_use]
    pub fn num_ngrams(&self) -> Vec<u64> {
        self.by_order
            .iter()
            .map(|states| states.iter().map(|s| s.preds.len() as u64).sum())
            .collect()
    }

    /// Number of explicit n-grams excluding unigrams, the quantity the
    /// size-targeting controller steers against.
    #[must_use]
    pub fn num_xgrams(&self) -> u64 {
        self.num_ngrams().iter().skip(1).sum()
    }

    /// The probability of `word` after history `hist`, resolved down the
    /// back-off chain. `hist` may be longer than any existing state; absent
    /// states along the chain are skipped, which is exact because a state
    /// is only ever removed once it has become a pure pass-through.
    #[must_use]
    pub fn prob(&self, hist: &[Word], word: Word) -> f64 {
        // bottom up over the prefixes of hist that exist as states
        let mut p = self.unigram_prob(word);
        for len in 1..=hist.len().min(self.order - 1) {
            if let Some(state) = self.state(&hist[..len]) {
                p = (state.float_count(word) + state.backoff * p) / state.total;
            }
        }
        p
    }

    fn unigram_prob(&self, word: Word) -> f64 {
        let unigram = &self.by_order[0][0];
        let uniform = 1.0 / f64::from(self.num_words);
        (unigram.float_count(word) + unigram.backoff * uniform) / unigram.total
    }

    /// Rebuilds the history index. Must be called after any operation that
    /// adds or removes states.
    pub(crate) fn rebuild_index(&mut self) {
        self.index.clear();
        for (o, states) in self.by_order.iter().enumerate() {
            for (i, state) in states.iter().enumerate() {
                self.index.insert(state.hist.clone(), (o + 1, i));
            }
        }
    }

    /// Serializes the model: states in canonical order (order ascending,
    /// then history lex ascending). Each state is written as history
    /// length, history words, number of predicted tuples, the (word, count)
    /// tuples, then back-off target length, target words, and the back-off
    /// weight.
    ///
    /// # Errors
    ///
    /// Fails on I/O trouble.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        write_varint(&mut writer, u64::from(self.num_words))?;
        write_varint(&mut writer, self.order as u64)?;
        for states in &self.by_order {
            for state in states {
                write_state(&mut writer, state)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// Deserializes a model written by [`Model::write`], checking canonical
    /// ordering and the per-state mass invariant.
    ///
    /// # Errors
    ///
    /// Fails on I/O trouble, ordering violations, or a state whose float
    /// counts and back-off weight do not add up to its total.
    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let num_words = read_varint(&mut reader)?
            .ok_or_else(|| Error::malformed(path, "empty model file"))? as Word;
        let order = read_varint(&mut reader)?
            .ok_or_else(|| Error::malformed(path, "truncated header"))? as usize;
        let mut by_order: Vec<Vec<HistoryState>> = vec![Vec::new(); order];
        while let Some(state) = read_state(&mut reader, path)? {
            let o = state.hist.len() + 1;
            if o > order {
                return Err(Error::malformed(
                    path,
                    format!("state of order {o} in a model of order {order}"),
                ));
            }
            let states = &mut by_order[o - 1];
            if let Some(prev) = states.last() {
                if prev.hist.cmp(&state.hist) != Ordering::Less {
                    return Err(Error::malformed(
                        path,
                        format!("state {:?} is not strictly after its predecessor", state.hist),
                    ));
                }
            }
            let mass: f64 = state.preds.iter().fold(0.0, |acc, &(_, f)| acc + f) + state.backoff;
            if (mass - state.total).abs() > 1e-6 * state.total.max(1.0) {
                return Err(Error::malformed(
                    path,
                    format!(
                        "state {:?} sums to {mass} but records total {}",
                        state.hist, state.total
                    ),
                ));
            }
            states.push(state);
        }
        Ok(Self::from_orders(num_words, by_order))
    }
}

pub(crate) fn write_state(writer: &mut impl Write, state: &HistoryState) -> Result<()> {
    write_varint(writer, state.hist.len() as u64)?;
    for &w in &state.hist {
        write_varint(writer, u64::from(w))?;
    }
    write_varint(writer, state.preds.len() as u64)?;
    for &(word, count) in &state.preds {
        write_varint(writer, u64::from(word))?;
        writer.write_f64::<LittleEndian>(count)?;
    }
    let target = state.backoff_target();
    write_varint(writer, target.len() as u64)?;
    for &w in target {
        write_varint(writer, u64::from(w))?;
    }
    writer.write_f64::<LittleEndian>(state.backoff)?;
    Ok(())
}

pub(crate) fn read_state(reader: &mut impl Read, path: &Path) -> Result<Option<HistoryState>> {
    let hist_len = match read_varint(reader)? {
        Some(v) => v as usize,
        None => return Ok(None),
    };
    let mut hist = Vec::with_capacity(hist_len);
    for _ in 0..hist_len {
        hist.push(read_word(reader, path)?);
    }
    let num_preds = read_varint(reader)?
        .ok_or_else(|| Error::malformed(path, "truncated state"))? as usize;
    let mut preds = Vec::with_capacity(num_preds);
    for _ in 0..num_preds {
        let word = read_word(reader, path)?;
        let count = reader.read_f64::<LittleEndian>()?;
        if let Some(&(prev, _)) = preds.last() {
            if prev >= word {
                return Err(Error::malformed(
                    path,
                    format!("predicted words of state {hist:?} are not strictly sorted"),
                ));
            }
        }
        preds.push((word, count));
    }
    let target_len = read_varint(reader)?
        .ok_or_else(|| Error::malformed(path, "truncated state"))? as usize;
    if hist_len > 0 && target_len != hist_len - 1 || hist_len == 0 && target_len != 0 {
        return Err(Error::malformed(
            path,
            format!("state {hist:?} has a back-off target of length {target_len}"),
        ));
    }
    let mut target = Vec::with_capacity(target_len);
    for _ in 0..target_len {
        target.push(read_word(reader, path)?);
    }
    if target != hist[..target_len] {
        return Err(Error::malformed(
            path,
            format!("state {hist:?} has back-off target {target:?}, expected its prefix"),
        ));
    }
    let backoff = reader.read_f64::<LittleEndian>()?;
    Ok(Some(HistoryState::new(hist, preds, backoff)))
}

fn read_word(reader: &mut impl Read, path: &Path) -> Result<Word> {
    let value = read_varint(reader)?
        .ok_or_else(|| Error::malformed(path, "truncated state"))?;
    Word::try_from(value)
        .map_err(|_| Error::malformed(path, format!("word id {value} does not fit into 32 bits")))
}

/// The set of n-grams that may not be pruned: (history, predicted) pairs
/// such that prepending `predicted` to `history` is an existing state.
/// Removing such an n-gram would orphan that state's back-off weight.
#[derive(Clone, Debug)]
pub struct ProtectedSet {
    entries: Vec<(Vec<Word>, Word)>,
}

impl ProtectedSet {
    /// Collects the protected pairs of `model`. The pairs come out of the
    /// states in an order unrelated to their own key order, so they go
    /// through the configured sorter before the set is queryable.
    ///
    /// # Errors
    ///
    /// Fails if the sorter cannot spill to its temporary directory.
    pub fn from_model(model: &Model, sort: &SortConfig) -> Result<Self> {
        let mut sorter = ExternalSorter::new(sort.clone());
        for o in 2..=model.order() {
            for state in model.states(o) {
                // the state with history [w, h...] protects the n-gram (h..., w)
                sorter.push((state.hist[1..].to_vec(), state.hist[0]))?;
            }
        }
        let mut entries = sorter.finish()?;
        entries.dedup();
        Ok(Self { entries })
    }

    /// Whether the n-gram (`hist`, `word`) is protected.
    #[must_use]
    pub fn contains(&self, hist: &[Word], word: Word) -> bool {
        self.entries
            .binary_search_by(|(h, w)| {
                h.as_slice().cmp(hist).then(w.cmp(&word))
            })
            .is_ok()
    }

    /// Number of protected n-grams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is protected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
