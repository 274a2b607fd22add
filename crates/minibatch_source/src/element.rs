//! Raw per-time-step values as emitted by sequence readers, before any
//! batching or padding.

/// A single time-step's value for one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    /// Fixed-length numeric vector; length equals the stream's declared
    /// dimension.
    Dense(Vec<f32>),
    /// `(index, value)` pairs within the declared dimension.
    Sparse(Vec<(u32, f32)>),
}

impl Element {
    /// One-hot dense vector of the given dimension. Callers validate
    /// `index < dimension` before constructing.
    pub(crate) fn one_hot(dimension: usize, index: usize) -> Self {
        debug_assert!(index < dimension);
        let mut v = vec![0.0; dimension];
        v[index] = 1.0;
        Element::Dense(v)
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Element::Sparse(_))
    }
}

/// One element tagged with the sequence it belongs to and the stream it
/// feeds, as produced by [`crate::readers::SequenceReader::read_next`].
///
/// `sequence` ids are reader-internal: readers remap source-side sequence
/// ids to unique monotonically increasing ids, so a source id reappearing
/// after a different one starts a new logical sequence. `stream` indexes
/// into the [`crate::stream::StreamSchema`].
#[derive(Debug, Clone)]
pub struct RawElement {
    pub sequence: u64,
    pub stream: usize,
    pub element: Element,
}

/// The result of one reader pull: the raw elements plus the number of
/// source records consumed to produce them. Record counts drive the
/// sample budget of a minibatch request and the epoch-size accounting.
#[derive(Debug, Default)]
pub struct Pull {
    pub elements: Vec<RawElement>,
    pub records: usize,
}

impl Pull {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}
