pub mod config;
pub mod element;
pub mod error;
pub mod minibatch;
pub mod prefetch;
pub mod randomizer;
pub mod readers;
pub mod source;
pub mod stream;

mod assembler;

pub use config::{
    CropType, DeserializerConfig, EpochSize, ImageDeserializerConfig, ImageTransform,
    InputConfig, Interpolation, JitterType, ReaderConfig, TextFormatDeserializerConfig,
};
pub use error::{DataError, Result};
pub use minibatch::{
    Minibatch, SparseEntry, StreamBatch, StreamValues, MASK_PAD, MASK_START, MASK_VALID,
};
pub use prefetch::PrefetchingSource;
pub use randomizer::{NoRandomizer, SequenceRandomizer, WindowRandomizer};
pub use source::{text_format_minibatch_source, MinibatchSource};
pub use stream::{StorageKind, StreamDescriptor, StreamSchema};
