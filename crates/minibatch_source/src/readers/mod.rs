//! Sequence readers: polymorphic parsing of raw records into per-stream,
//! per-sequence element lists.
//!
//! A reader is selected once, at [`crate::source::MinibatchSource`]
//! construction, based on the deserializer kind in the configuration.
//! All readers share the same pull contract so the assembler never cares
//! which kind feeds it.

pub mod image;
pub mod text;
pub(crate) mod transforms;

pub use image::ImageReader;
pub use text::TextFormatReader;

use crate::element::Pull;
use crate::error::Result;

/// A lazy, finite, restartable producer of raw elements.
///
/// # Contract
/// - [`read_next`](Self::read_next) pulls whole sequences only: it stops
///   at the first sequence boundary at or past `max_samples` consumed
///   source records. A short (or empty) pull signals epoch exhaustion and
///   is never an error.
/// - [`restart`](Self::restart) re-opens/reseeks the source at an epoch
///   boundary.
/// - After [`close`](Self::close), any further call fails with
///   [`crate::error::DataError::SourceClosed`].
///
/// Readers are `Send` so they can be driven from a bounded worker pool;
/// serialization of concurrent pulls is the owner's responsibility (the
/// minibatch source wraps its readers in a mutex).
pub trait SequenceReader: Send {
    /// Pulls the next window of raw elements from the source.
    fn read_next(&mut self, max_samples: usize) -> Result<Pull>;

    /// Restarts the source for a new epoch.
    fn restart(&mut self) -> Result<()>;

    /// Closes the underlying source. Idempotent.
    fn close(&mut self);
}
