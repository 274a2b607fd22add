//! Padded, masked per-stream batch containers.

use crate::error::{DataError, Result};
use crate::stream::StreamSchema;
use ndarray::{Array2, Array3};

/// Mask value for padding slots past a sequence's end.
pub const MASK_PAD: u8 = 0;
/// Mask value for a valid continuation time-step.
pub const MASK_VALID: u8 = 1;
/// Mask value for the first valid time-step of a sequence. Consumers use
/// this to detect sequence boundaries without a separate index array.
pub const MASK_START: u8 = 2;

/// One non-zero coordinate of a sparse stream batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparseEntry {
    pub sequence: usize,
    pub step: usize,
    pub index: u32,
    pub value: f32,
}

/// Materialized values of one stream across the batch.
///
/// Dense streams are a zero-initialized block with element vectors
/// assigned at valid `(sequence, step)` slots. Sparse streams stay as
/// coordinate/value entries; the core never densifies them on its own.
#[derive(Debug)]
pub enum StreamValues {
    /// Shape `(num_sequences, max_len, dimension)`.
    Dense(Array3<f32>),
    Sparse {
        /// `(num_sequences, max_len, dimension)`.
        shape: (usize, usize, usize),
        entries: Vec<SparseEntry>,
    },
}

/// The padded tensor and alignment mask of one stream.
#[derive(Debug)]
pub struct StreamBatch {
    values: StreamValues,
    /// Shape `(num_sequences, max_len)`, values in
    /// {[`MASK_PAD`], [`MASK_VALID`], [`MASK_START`]}.
    mask: Array2<u8>,
    lengths: Vec<usize>,
}

impl StreamBatch {
    pub(crate) fn new(values: StreamValues, mask: Array2<u8>, lengths: Vec<usize>) -> Self {
        Self {
            values,
            mask,
            lengths,
        }
    }

    pub(crate) fn empty(dimension: usize, sparse: bool) -> Self {
        let values = if sparse {
            StreamValues::Sparse {
                shape: (0, 0, dimension),
                entries: Vec::new(),
            }
        } else {
            StreamValues::Dense(Array3::zeros((0, 0, dimension)))
        };
        Self {
            values,
            mask: Array2::zeros((0, 0)),
            lengths: Vec::new(),
        }
    }

    /// Number of sequences present in this stream's batch.
    pub fn num_sequences(&self) -> usize {
        self.lengths.len()
    }

    /// Longest sequence length in this stream's batch.
    pub fn max_len(&self) -> usize {
        self.mask.ncols()
    }

    /// Valid (unpadded) length of each sequence, in batch order.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        match &self.values {
            StreamValues::Dense(block) => {
                let d = block.dim();
                (d.0, d.1, d.2)
            }
            StreamValues::Sparse { shape, .. } => *shape,
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.values, StreamValues::Sparse { .. })
    }

    pub fn mask(&self) -> &Array2<u8> {
        &self.mask
    }

    pub fn values(&self) -> &StreamValues {
        &self.values
    }

    /// The dense block, or `None` for sparse streams.
    pub fn dense(&self) -> Option<&Array3<f32>> {
        match &self.values {
            StreamValues::Dense(block) => Some(block),
            StreamValues::Sparse { .. } => None,
        }
    }

    /// The sparse coordinate entries, or `None` for dense streams.
    pub fn sparse_entries(&self) -> Option<&[SparseEntry]> {
        match &self.values {
            StreamValues::Sparse { entries, .. } => Some(entries),
            StreamValues::Dense(_) => None,
        }
    }

    /// Explicit densification, on caller request only.
    pub fn to_dense(&self) -> Array3<f32> {
        match &self.values {
            StreamValues::Dense(block) => block.clone(),
            StreamValues::Sparse { shape, entries } => {
                let mut block = Array3::zeros(*shape);
                for e in entries {
                    block[[e.sequence, e.step, e.index as usize]] = e.value;
                }
                block
            }
        }
    }
}

/// One minibatch: a padded, masked [`StreamBatch`] per configured stream,
/// in schema declaration order.
///
/// An empty minibatch (zero sequences in every stream) is the epoch-end
/// signal, not an error.
#[derive(Debug)]
pub struct Minibatch {
    streams: Vec<(String, StreamBatch)>,
}

impl Minibatch {
    pub(crate) fn new(streams: Vec<(String, StreamBatch)>) -> Self {
        Self { streams }
    }

    /// A minibatch with zero sequences for every stream of the schema.
    pub(crate) fn empty(schema: &StreamSchema) -> Self {
        Self {
            streams: schema
                .descriptors()
                .iter()
                .map(|d| {
                    (
                        d.name().to_string(),
                        StreamBatch::empty(d.dimension(), d.is_sparse()),
                    )
                })
                .collect(),
        }
    }

    /// Looks up one stream's batch by logical name.
    pub fn get(&self, name: &str) -> Result<&StreamBatch> {
        self.streams
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
            .ok_or_else(|| DataError::UnknownStream(name.to_string()))
    }

    /// Number of distinct sequences in the pulled window (the maximum
    /// across streams; streams may cover fewer).
    pub fn num_sequences(&self) -> usize {
        self.streams
            .iter()
            .map(|(_, b)| b.num_sequences())
            .max()
            .unwrap_or(0)
    }

    /// True when the window was empty: the epoch-end signal.
    pub fn is_empty(&self) -> bool {
        self.num_sequences() == 0
    }

    /// Stream names in schema order.
    pub fn stream_names(&self) -> impl Iterator<Item = &str> {
        self.streams.iter().map(|(n, _)| n.as_str())
    }
}
