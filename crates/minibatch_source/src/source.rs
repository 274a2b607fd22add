//! Minibatch source: reader + assembler orchestration, stream
//! introspection and the `next_minibatch` contract.
//!
//! # Epoch policy
//! One logical epoch cursor per source. The epoch ends either at source
//! exhaustion or once `epochSize` samples (source records) have been
//! served this epoch, whichever comes first; [`MinibatchSource::restart_epoch`]
//! resets both. `next_minibatch` calls are serialized with respect to
//! cursor advancement by an internal mutex around pull + grouping, so
//! concurrent callers never interleave partial pulls.
//!
//! Consumption is at-most-once per epoch: a failure during tensor
//! materialization does not rewind the cursor over already-pulled raw
//! elements. Callers should treat such failures as epoch-fatal and
//! restart the epoch.

use crate::assembler::MinibatchAssembler;
use crate::config::{
    chain_output_shape, DeserializerConfig, EpochSize, InputConfig, ReaderConfig,
    TextFormatDeserializerConfig,
};
use crate::error::Result;
use crate::minibatch::Minibatch;
use crate::randomizer::{NoRandomizer, SequenceRandomizer, WindowRandomizer};
use crate::readers::{ImageReader, SequenceReader, TextFormatReader};
use crate::stream::{StorageKind, StreamDescriptor, StreamSchema};
use rand::Rng;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

struct EpochState {
    assembler: MinibatchAssembler,
    served: u64,
}

/// Orchestrates one or more sequence readers behind the
/// `next_minibatch(size)` contract.
pub struct MinibatchSource {
    schema: Arc<StreamSchema>,
    epoch_size: EpochSize,
    state: Mutex<EpochState>,
}

impl MinibatchSource {
    /// Builds a source from a validated [`ReaderConfig`], selecting one
    /// reader implementation per deserializer kind.
    ///
    /// The randomization seed is drawn freshly; use
    /// [`from_config_seeded`](Self::from_config_seeded) for reproducible
    /// randomized runs.
    pub fn from_config(config: &ReaderConfig) -> Result<Self> {
        Self::from_config_seeded(config, rand::rng().random())
    }

    pub fn from_config_seeded(config: &ReaderConfig, seed: u64) -> Result<Self> {
        let schema = Arc::new(StreamSchema::new(derive_descriptors(config)?)?);

        let mut readers: Vec<Box<dyn SequenceReader>> =
            Vec::with_capacity(config.deserializers().len());
        for deserializer in config.deserializers() {
            readers.push(match deserializer {
                DeserializerConfig::TextFormat(c) => {
                    Box::new(TextFormatReader::new(c.file(), schema.clone()))
                }
                DeserializerConfig::Image(c) => {
                    Box::new(ImageReader::new(c, schema.clone(), seed)?)
                }
            });
        }

        let randomizer: Box<dyn SequenceRandomizer> = if config.randomize() {
            Box::new(WindowRandomizer::new(seed))
        } else {
            Box::new(NoRandomizer)
        };

        Ok(Self {
            schema: schema.clone(),
            epoch_size: config.epoch_size(),
            state: Mutex::new(EpochState {
                assembler: MinibatchAssembler::new(schema, readers, randomizer),
                served: 0,
            }),
        })
    }

    /// The descriptor registered under `name`.
    pub fn stream_info(&self, name: &str) -> Result<&StreamDescriptor> {
        let index = self.schema.index_of(name)?;
        Ok(self.schema.descriptor(index))
    }

    /// All registered descriptors, in declaration order.
    pub fn stream_infos(&self) -> &[StreamDescriptor] {
        self.schema.descriptors()
    }

    /// Pulls up to `size` samples and assembles them into padded,
    /// masked per-stream tensors.
    ///
    /// `size == 0`, an exhausted epoch, or an exhausted epoch budget all
    /// yield an empty minibatch (zero sequences) without raising; a
    /// request larger than the remaining epoch data yields a short
    /// batch.
    pub fn next_minibatch(&self, size: usize) -> Result<Minibatch> {
        let mut state = self.lock_state();

        let budget = match self.epoch_size {
            EpochSize::Unbounded => size as u64,
            EpochSize::Samples(limit) => (size as u64).min(limit.saturating_sub(state.served)),
        };
        if budget == 0 {
            return Ok(Minibatch::empty(&self.schema));
        }

        let (minibatch, records) = state.assembler.assemble(budget as usize)?;
        state.served += records as u64;
        debug!(
            requested = size,
            records,
            served = state.served,
            "served minibatch"
        );
        Ok(minibatch)
    }

    /// Restarts all readers and resets the epoch sample budget.
    pub fn restart_epoch(&self) -> Result<()> {
        let mut state = self.lock_state();
        state.assembler.restart()?;
        state.served = 0;
        debug!("epoch restarted");
        Ok(())
    }

    /// Closes the underlying sources; subsequent `next_minibatch` calls
    /// fail with [`crate::error::DataError::SourceClosed`].
    pub fn close(&self) {
        self.lock_state().assembler.shutdown();
    }

    pub(crate) fn schema_handle(&self) -> Arc<StreamSchema> {
        self.schema.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EpochState> {
        // A poisoned lock means a panic mid-assembly; the cursor is
        // documented at-most-once, so continuing with the state as-is
        // matches the contract.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Derives the full stream schema across all deserializers. Image
/// feature inputs take their dimension from the chain's `Scale` target
/// (CHW); image label inputs are dense one-hot of `labelDim`.
fn derive_descriptors(config: &ReaderConfig) -> Result<Vec<StreamDescriptor>> {
    let mut descriptors = Vec::new();
    for deserializer in config.deserializers() {
        match deserializer {
            DeserializerConfig::TextFormat(c) => descriptors.extend(c.streams().to_vec()),
            DeserializerConfig::Image(c) => {
                for (name, input) in c.inputs() {
                    descriptors.push(match input {
                        InputConfig::Labels { label_dim } => StreamDescriptor::new(
                            name.clone(),
                            *label_dim,
                            StorageKind::Dense,
                            name.clone(),
                        )?,
                        InputConfig::Features { transforms } => {
                            let (channels, height, width) = chain_output_shape(transforms);
                            StreamDescriptor::new(
                                name.clone(),
                                (channels as usize) * (height as usize) * (width as usize),
                                StorageKind::Dense,
                                name.clone(),
                            )?
                        }
                    });
                }
            }
        }
    }
    Ok(descriptors)
}

/// Convenience constructor for a text-format source over one file.
///
/// # Example
/// ```ignore
/// let source = text_format_minibatch_source(
///     "tf_data.txt",
///     vec![
///         StreamDescriptor::new("features", 1000, StorageKind::Sparse, "x")?,
///         StreamDescriptor::new("labels", 5, StorageKind::Dense, "y")?,
///     ],
///     false,
///     EpochSize::Unbounded,
/// )?;
/// let mb = source.next_minibatch(7)?;
/// ```
pub fn text_format_minibatch_source(
    path: impl AsRef<Path>,
    streams: Vec<StreamDescriptor>,
    randomize: bool,
    epoch_size: EpochSize,
) -> Result<MinibatchSource> {
    let mut deserializer = TextFormatDeserializerConfig::new(path.as_ref());
    for stream in streams {
        deserializer = deserializer.map_stream(stream);
    }
    let config = ReaderConfig::new(vec![deserializer.into()], randomize, epoch_size)?;
    MinibatchSource::from_config(&config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;
    use anyhow::Result;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn two_stream_source(epoch_size: EpochSize) -> Result<(NamedTempFile, MinibatchSource)> {
        let mut file = NamedTempFile::new()?;
        write!(
            file,
            "0\t|S0 0\t|S1 0\n0\t|S0 1\t|S1 1\n1\t|S0 4\n1\t|S0 5\t|S1 1\n2\t|S0 7\n"
        )?;
        let source = text_format_minibatch_source(
            file.path(),
            vec![
                StreamDescriptor::new("features", 1, StorageKind::Dense, "S0")?,
                StreamDescriptor::new("labels", 1, StorageKind::Dense, "S1")?,
            ],
            false,
            epoch_size,
        )?;
        Ok((file, source))
    }

    #[test]
    fn test_stream_introspection() -> Result<()> {
        let (_file, source) = two_stream_source(EpochSize::Unbounded)?;
        let info = source.stream_info("features")?;
        assert_eq!(info.source_alias(), "S0");
        assert_eq!(info.dimension(), 1);
        assert!(matches!(
            source.stream_info("bogus"),
            Err(DataError::UnknownStream(_))
        ));

        let names: Vec<_> = source.stream_infos().iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["features", "labels"]);
        Ok(())
    }

    #[test]
    fn test_zero_size_request_yields_empty() -> Result<()> {
        let (_file, source) = two_stream_source(EpochSize::Unbounded)?;
        let mb = source.next_minibatch(0)?;
        assert!(mb.is_empty());
        // The cursor did not move: the full data is still available.
        assert_eq!(source.next_minibatch(1000)?.num_sequences(), 3);
        Ok(())
    }

    #[test]
    fn test_epoch_end_signalled_by_empty_minibatch() -> Result<()> {
        let (_file, source) = two_stream_source(EpochSize::Unbounded)?;
        assert!(!source.next_minibatch(1000)?.is_empty());
        assert!(source.next_minibatch(1000)?.is_empty());
        assert!(source.next_minibatch(1000)?.is_empty());

        source.restart_epoch()?;
        assert_eq!(source.next_minibatch(1000)?.num_sequences(), 3);
        Ok(())
    }

    #[test]
    fn test_epoch_size_caps_served_samples() -> Result<()> {
        // epochSize 2: the first pull serves sequence 0 (2 records) and
        // then the epoch budget is spent.
        let (_file, source) = two_stream_source(EpochSize::Samples(2))?;
        let mb = source.next_minibatch(1000)?;
        assert_eq!(mb.num_sequences(), 1);
        assert!(source.next_minibatch(1000)?.is_empty());

        source.restart_epoch()?;
        assert_eq!(source.next_minibatch(1000)?.num_sequences(), 1);
        Ok(())
    }

    #[test]
    fn test_close_makes_next_minibatch_fail() -> Result<()> {
        let (_file, source) = two_stream_source(EpochSize::Unbounded)?;
        source.close();
        assert!(matches!(
            source.next_minibatch(10),
            Err(DataError::SourceClosed)
        ));
        Ok(())
    }

    #[test]
    fn test_serialized_concurrent_pulls_partition_the_epoch() -> Result<()> {
        let (_file, source) = two_stream_source(EpochSize::Unbounded)?;
        let source = std::sync::Arc::new(source);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let source = source.clone();
                std::thread::spawn(move || -> usize {
                    let mut sequences = 0;
                    loop {
                        let mb = source.next_minibatch(1).expect("pull");
                        if mb.is_empty() {
                            return sequences;
                        }
                        sequences += mb.num_sequences();
                    }
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // Every sequence is served exactly once across all callers.
        assert_eq!(total, 3);
        Ok(())
    }

    #[test]
    fn test_randomized_source_serves_same_sequences() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        for i in 0..8 {
            writeln!(file, "{}\t|S0 {}", i, i)?;
        }
        let deserializer = TextFormatDeserializerConfig::new(file.path()).map_stream(
            StreamDescriptor::new("features", 1, StorageKind::Dense, "S0")?,
        );
        let config = ReaderConfig::new(vec![deserializer.into()], true, EpochSize::Unbounded)?;
        let source = MinibatchSource::from_config_seeded(&config, 3)?;

        let mb = source.next_minibatch(1000)?;
        assert_eq!(mb.num_sequences(), 8);

        // All eight values are present, each exactly once.
        let block = mb.get("features")?.dense().unwrap().clone();
        let mut values: Vec<f32> = (0..8).map(|i| block[[i, 0, 0]]).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, (0..8).map(|v| v as f32).collect::<Vec<_>>());
        Ok(())
    }
}
