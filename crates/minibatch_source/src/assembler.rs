//! Minibatch assembly: grouping raw elements into sequences, padding to
//! the per-stream batch maximum, and materializing values plus alignment
//! masks.
//!
//! This is the hot path of the engine. One `assemble` call performs:
//! 1. Pull raw elements from the readers up to the sample budget (or
//!    source exhaustion — a short window, never an error).
//! 2. Group elements by sequence id per stream, preserving arrival
//!    order. A sequence absent from some stream contributes nothing
//!    there; optional stream coverage is legal.
//! 3. Per stream, pad every sequence to the stream's batch maximum
//!    length; padding takes mask 0, valid steps mask 1, and the first
//!    valid step of each sequence mask 2.
//! 4. Batch rows follow the order sequence ids were first observed in
//!    the window (stable, never sorted by id), permuted only by the
//!    randomization policy.
//! 5. Dense streams materialize into a zero-initialized block; sparse
//!    streams stay as coordinate/value entries.

use crate::element::Element;
use crate::error::{DataError, Result};
use crate::minibatch::{
    Minibatch, SparseEntry, StreamBatch, StreamValues, MASK_PAD, MASK_START, MASK_VALID,
};
use crate::randomizer::SequenceRandomizer;
use crate::readers::SequenceReader;
use crate::stream::StreamSchema;
use ndarray::{s, Array2, Array3, ArrayView1};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Elements of one sequence within one stream's window, keyed by the
/// window-wide slot the sequence was assigned on first observation.
struct SequenceRun {
    slot: usize,
    elements: Vec<Element>,
}

pub(crate) struct MinibatchAssembler {
    schema: Arc<StreamSchema>,
    readers: Vec<Box<dyn SequenceReader>>,
    randomizer: Box<dyn SequenceRandomizer>,
}

impl MinibatchAssembler {
    pub(crate) fn new(
        schema: Arc<StreamSchema>,
        readers: Vec<Box<dyn SequenceReader>>,
        randomizer: Box<dyn SequenceRandomizer>,
    ) -> Self {
        Self {
            schema,
            readers,
            randomizer,
        }
    }

    /// Builds the next minibatch from at most `requested` samples.
    /// Returns the batch plus the number of source records consumed
    /// (the epoch-size accounting unit).
    pub(crate) fn assemble(&mut self, requested: usize) -> Result<(Minibatch, usize)> {
        // Step 1: pull. The budget is spent across readers in order;
        // each reader stops at a sequence boundary. A window may consume
        // records yet carry no elements (lines covering only unregistered
        // aliases); those windows are re-pulled, because an empty
        // minibatch is reserved for true exhaustion.
        let mut window = Vec::new();
        let mut records = 0usize;
        loop {
            let mut pulled = 0usize;
            let mut remaining = requested;
            for (reader_index, reader) in self.readers.iter_mut().enumerate() {
                if remaining == 0 {
                    break;
                }
                let pull = reader.read_next(remaining)?;
                pulled += pull.records;
                remaining = remaining.saturating_sub(pull.records);
                window.extend(pull.elements.into_iter().map(|e| (reader_index, e)));
            }
            records += pulled;
            if !window.is_empty() || pulled == 0 {
                break;
            }
        }

        if window.is_empty() {
            // Epoch exhausted (or zero budget): the empty minibatch is
            // the epoch-end signal, not an error.
            return Ok((Minibatch::empty(&self.schema), records));
        }

        // Step 2: group by sequence id per stream, in arrival order.
        // Slots number sequences by first observation across the whole
        // window; reader index disambiguates ids from different sources.
        let mut slot_of: HashMap<(usize, u64), usize> = HashMap::new();
        let mut num_slots = 0usize;
        let mut per_stream: Vec<Vec<SequenceRun>> = (0..self.schema.len())
            .map(|_| Vec::new())
            .collect();

        for (reader_index, raw) in window {
            let slot = *slot_of
                .entry((reader_index, raw.sequence))
                .or_insert_with(|| {
                    let slot = num_slots;
                    num_slots += 1;
                    slot
                });

            let runs = &mut per_stream[raw.stream];
            match runs.iter_mut().rev().find(|r| r.slot == slot) {
                Some(run) => run.elements.push(raw.element),
                None => runs.push(SequenceRun {
                    slot,
                    elements: vec![raw.element],
                }),
            }
        }

        // Step 4 (ordering before materialization): rank slots by the
        // randomization policy; identity when randomization is off.
        let order = self.randomizer.order(num_slots);
        let mut rank = vec![0usize; num_slots];
        for (position, slot) in order.into_iter().enumerate() {
            rank[slot] = position;
        }
        for runs in &mut per_stream {
            runs.sort_by_key(|r| rank[r.slot]);
        }

        // Steps 3 + 5: pad, mask, materialize.
        let mut streams = Vec::with_capacity(self.schema.len());
        for (stream_index, runs) in per_stream.into_iter().enumerate() {
            let descriptor = self.schema.descriptor(stream_index);
            let batch = materialize_stream(descriptor.name(), descriptor.dimension(), descriptor.is_sparse(), runs)?;
            streams.push((descriptor.name().to_string(), batch));
        }

        debug!(
            records,
            sequences = num_slots,
            "assembled minibatch window"
        );
        Ok((Minibatch::new(streams), records))
    }

    /// Restarts every reader for a new epoch.
    pub(crate) fn restart(&mut self) -> Result<()> {
        for reader in &mut self.readers {
            reader.restart()?;
        }
        Ok(())
    }

    /// Closes every reader's underlying source.
    pub(crate) fn shutdown(&mut self) {
        for reader in &mut self.readers {
            reader.close();
        }
    }
}

/// Pads and materializes one stream's sequences.
fn materialize_stream(
    name: &str,
    dimension: usize,
    sparse: bool,
    runs: Vec<SequenceRun>,
) -> Result<StreamBatch> {
    let num_sequences = runs.len();
    let max_len = runs.iter().map(|r| r.elements.len()).max().unwrap_or(0);

    let mut mask = Array2::from_elem((num_sequences, max_len), MASK_PAD);
    let mut lengths = Vec::with_capacity(num_sequences);
    for (row, run) in runs.iter().enumerate() {
        lengths.push(run.elements.len());
        for step in 0..run.elements.len() {
            mask[[row, step]] = if step == 0 { MASK_START } else { MASK_VALID };
        }
    }

    let values = if sparse {
        let mut entries = Vec::new();
        for (row, run) in runs.iter().enumerate() {
            for (step, element) in run.elements.iter().enumerate() {
                match element {
                    Element::Sparse(pairs) => {
                        for &(index, value) in pairs {
                            entries.push(SparseEntry {
                                sequence: row,
                                step,
                                index,
                                value,
                            });
                        }
                    }
                    Element::Dense(_) => {
                        return Err(DataError::Configuration(format!(
                            "Stream '{}' is declared sparse but received dense elements",
                            name
                        )))
                    }
                }
            }
        }
        StreamValues::Sparse {
            shape: (num_sequences, max_len, dimension),
            entries,
        }
    } else {
        let mut block = Array3::zeros((num_sequences, max_len, dimension));
        for (row, run) in runs.iter().enumerate() {
            for (step, element) in run.elements.iter().enumerate() {
                match element {
                    Element::Dense(vector) => {
                        if vector.len() != dimension {
                            return Err(DataError::DimensionMismatch {
                                stream: name.to_string(),
                                expected: dimension,
                                actual: vector.len(),
                            });
                        }
                        block
                            .slice_mut(s![row, step, ..])
                            .assign(&ArrayView1::from(vector.as_slice()));
                    }
                    Element::Sparse(_) => {
                        return Err(DataError::Configuration(format!(
                            "Stream '{}' is declared dense but received sparse elements",
                            name
                        )))
                    }
                }
            }
        }
        StreamValues::Dense(block)
    };

    Ok(StreamBatch::new(values, mask, lengths))
}
