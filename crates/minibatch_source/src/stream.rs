//! Static stream schema: descriptors mapping logical stream names to
//! source-side aliases, dimensionality and storage kind.

use crate::error::{DataError, Result};
use serde::{Deserialize, Serialize};

/// How a stream's elements are stored.
///
/// - `Dense`: every element is a fixed-length numeric vector of the
///   stream's declared dimension.
/// - `Sparse`: every element is a set of `(index, value)` pairs within
///   the declared dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    Dense,
    Sparse,
}

impl StorageKind {
    pub fn is_sparse(&self) -> bool {
        matches!(self, StorageKind::Sparse)
    }
}

/// Static schema for one input/output channel.
///
/// Maps a logical stream name (e.g., `"features"`) to the field alias used
/// in the source (e.g., `"x"`), together with the element dimensionality
/// and storage kind. Read-only after [`crate::source::MinibatchSource`]
/// construction.
///
/// # Example
/// ```ignore
/// let features = StreamDescriptor::new("features", 1000, StorageKind::Sparse, "x")?;
/// let labels = StreamDescriptor::new("labels", 5, StorageKind::Dense, "y")?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    name: String,
    source_alias: String,
    dimension: usize,
    storage: StorageKind,
}

impl StreamDescriptor {
    /// Creates a validated descriptor.
    ///
    /// # Errors
    /// Returns [`DataError::Configuration`] when `dimension` is zero or
    /// either the name or the alias is empty.
    pub fn new(
        name: impl Into<String>,
        dimension: usize,
        storage: StorageKind,
        source_alias: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let source_alias = source_alias.into();

        if name.is_empty() {
            return Err(DataError::Configuration(
                "Stream name must be non-empty".into(),
            ));
        }
        if source_alias.is_empty() {
            return Err(DataError::Configuration(format!(
                "Source alias for stream '{}' must be non-empty",
                name
            )));
        }
        if dimension == 0 {
            return Err(DataError::Configuration(format!(
                "Stream '{}' must have a positive dimension",
                name
            )));
        }

        Ok(Self {
            name,
            source_alias,
            dimension,
            storage,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_alias(&self) -> &str {
        &self.source_alias
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn storage(&self) -> StorageKind {
        self.storage
    }

    pub fn is_sparse(&self) -> bool {
        self.storage.is_sparse()
    }
}

/// Ordered, immutable collection of [`StreamDescriptor`]s.
///
/// Stream order is the declaration order and is preserved everywhere
/// downstream (minibatch layout, introspection). Duplicate stream names
/// or source aliases are rejected at construction.
#[derive(Debug)]
pub struct StreamSchema {
    streams: Vec<StreamDescriptor>,
}

impl StreamSchema {
    /// Builds a schema, validating name/alias uniqueness.
    pub fn new(streams: Vec<StreamDescriptor>) -> Result<Self> {
        if streams.is_empty() {
            return Err(DataError::Configuration(
                "Schema must declare at least one stream".into(),
            ));
        }
        for (i, stream) in streams.iter().enumerate() {
            for earlier in &streams[..i] {
                if earlier.name() == stream.name() {
                    return Err(DataError::Configuration(format!(
                        "Duplicate stream name '{}'",
                        stream.name()
                    )));
                }
                if earlier.source_alias() == stream.source_alias() {
                    return Err(DataError::Configuration(format!(
                        "Duplicate source alias '{}' (streams '{}' and '{}')",
                        stream.source_alias(),
                        earlier.name(),
                        stream.name()
                    )));
                }
            }
        }
        Ok(Self { streams })
    }

    /// All descriptors, in declaration order.
    pub fn descriptors(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Resolves a logical stream name to its schema index.
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.streams
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| DataError::UnknownStream(name.to_string()))
    }

    /// Resolves a source-side alias to its schema index. Unknown aliases
    /// return `None`; readers skip fields they do not recognize.
    pub fn index_of_alias(&self, alias: &str) -> Option<usize> {
        self.streams.iter().position(|s| s.source_alias() == alias)
    }

    pub fn descriptor(&self, index: usize) -> &StreamDescriptor {
        &self.streams[index]
    }
}
