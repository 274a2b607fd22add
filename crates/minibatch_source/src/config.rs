//! Deserializer configuration model.
//!
//! A [`ReaderConfig`] describes one or more deserializers (text format,
//! image) together with the epoch size and randomization switch. Each
//! deserializer carries its per-input configuration: a label dimension
//! for label inputs, or an ordered transform chain for feature inputs.
//!
//! Transform kinds and deserializer kinds are closed tagged variants,
//! validated once at construction rather than at consumption time. The
//! normalized document produced by [`ReaderConfig::to_document`] has the
//! shape:
//!
//! ```text
//! { epochSize: int|"unbounded", randomize: bool,
//!   deserializers: [ { type, file, input: { name: {labelDim} | {transforms: [...]} } } ] }
//! ```
//!
//! # Example
//! ```ignore
//! let image = ImageDeserializerConfig::new("train_map.txt")
//!     .map_features("f", vec![
//!         ImageTransform::crop(CropType::Random, 0.8, JitterType::UniRatio),
//!         ImageTransform::scale(100, 200, 3, Interpolation::Linear),
//!         ImageTransform::mean("mean.txt"),
//!     ])
//!     .map_labels("l", 7);
//! let rc = ReaderConfig::new(vec![image.into()], false, EpochSize::Samples(150))?;
//! ```

use crate::error::{DataError, Result};
use crate::stream::StreamDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

// ================================================================================================
// 1. Transform descriptions
// ================================================================================================

/// Cropping window placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CropType {
    Center,
    Random,
}

/// Jitter applied to the crop ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JitterType {
    None,
    UniRatio,
}

/// Resampling filter used by the scale transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Nearest,
    Linear,
    Cubic,
}

/// One step in an image transform chain. Order within the chain is
/// preserved and defines the application order at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ImageTransform {
    Crop {
        #[serde(rename = "cropType")]
        crop_type: CropType,
        #[serde(rename = "cropRatio")]
        crop_ratio: f64,
        #[serde(rename = "jitterType")]
        jitter_type: JitterType,
    },
    Scale {
        width: u32,
        height: u32,
        channels: u32,
        interpolations: Interpolation,
    },
    Mean {
        #[serde(rename = "meanFile")]
        mean_file: PathBuf,
    },
}

impl ImageTransform {
    pub fn crop(crop_type: CropType, crop_ratio: f64, jitter_type: JitterType) -> Self {
        Self::Crop {
            crop_type,
            crop_ratio,
            jitter_type,
        }
    }

    pub fn scale(width: u32, height: u32, channels: u32, interpolations: Interpolation) -> Self {
        Self::Scale {
            width,
            height,
            channels,
            interpolations,
        }
    }

    pub fn mean(mean_file: impl Into<PathBuf>) -> Self {
        Self::Mean {
            mean_file: mean_file.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            ImageTransform::Crop { crop_ratio, .. } => {
                if !(*crop_ratio > 0.0 && *crop_ratio <= 1.0) {
                    return Err(DataError::Configuration(format!(
                        "Crop ratio must be in (0, 1], got {}",
                        crop_ratio
                    )));
                }
            }
            ImageTransform::Scale {
                width,
                height,
                channels,
                ..
            } => {
                if *width == 0 || *height == 0 {
                    return Err(DataError::Configuration(format!(
                        "Scale target must be positive, got {}x{}",
                        width, height
                    )));
                }
                if *channels != 1 && *channels != 3 {
                    return Err(DataError::Configuration(format!(
                        "Scale channels must be 1 (grayscale) or 3 (RGB), got {}",
                        channels
                    )));
                }
            }
            ImageTransform::Mean { mean_file } => {
                if mean_file.as_os_str().is_empty() {
                    return Err(DataError::Configuration(
                        "Mean transform requires a mean file".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Validates a whole chain: each step individually, plus the structural
/// constraints that exactly one `Scale` step exists (it fixes the output
/// dimensionality of the feature stream) and that no geometric step
/// follows a `Mean` (the mean subtraction leaves image space).
pub(crate) fn validate_chain(input: &str, chain: &[ImageTransform]) -> Result<()> {
    let mut scales = 0usize;
    let mut seen_mean = false;
    for transform in chain {
        transform.validate()?;
        match transform {
            ImageTransform::Mean { .. } => seen_mean = true,
            ImageTransform::Scale { .. } => {
                scales += 1;
                if seen_mean {
                    return Err(DataError::Configuration(format!(
                        "Input '{}': Scale cannot follow Mean in a transform chain",
                        input
                    )));
                }
            }
            ImageTransform::Crop { .. } => {
                if seen_mean {
                    return Err(DataError::Configuration(format!(
                        "Input '{}': Crop cannot follow Mean in a transform chain",
                        input
                    )));
                }
            }
        }
    }
    if scales != 1 {
        return Err(DataError::Configuration(format!(
            "Input '{}': transform chain must contain exactly one Scale step \
             (it determines the stream dimension), found {}",
            input, scales
        )));
    }
    Ok(())
}

/// The `(channels, height, width)` produced by a validated chain.
pub(crate) fn chain_output_shape(chain: &[ImageTransform]) -> (u32, u32, u32) {
    for transform in chain {
        if let ImageTransform::Scale {
            width,
            height,
            channels,
            ..
        } = transform
        {
            return (*channels, *height, *width);
        }
    }
    // validate_chain guarantees a Scale step
    unreachable!("validated chain has a Scale step")
}

// ================================================================================================
// 2. Per-input configuration
// ================================================================================================

/// Configuration of one named input inside a deserializer.
#[derive(Debug, Clone, PartialEq)]
pub enum InputConfig {
    /// Label input: one-hot encoded into `label_dim` classes.
    Labels { label_dim: usize },
    /// Feature input: image pushed through the transform chain.
    Features { transforms: Vec<ImageTransform> },
}

// ================================================================================================
// 3. Deserializer configurations
// ================================================================================================

/// Fluent builder for the image deserializer: a map file (one
/// `<path><TAB><label>` record per line) plus per-input transform chains
/// and label dimensions.
#[derive(Debug, Clone)]
pub struct ImageDeserializerConfig {
    file: PathBuf,
    inputs: Vec<(String, InputConfig)>,
}

impl ImageDeserializerConfig {
    pub fn new(map_file: impl Into<PathBuf>) -> Self {
        Self {
            file: map_file.into(),
            inputs: Vec::new(),
        }
    }

    /// Registers a feature input with its transform chain.
    pub fn map_features(mut self, name: impl Into<String>, transforms: Vec<ImageTransform>) -> Self {
        self.inputs
            .push((name.into(), InputConfig::Features { transforms }));
        self
    }

    /// Registers a label input with the number of classes.
    pub fn map_labels(mut self, name: impl Into<String>, label_dim: usize) -> Self {
        self.inputs
            .push((name.into(), InputConfig::Labels { label_dim }));
        self
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn inputs(&self) -> &[(String, InputConfig)] {
        &self.inputs
    }

    fn validate(&self) -> Result<()> {
        if self.file.as_os_str().is_empty() {
            return Err(DataError::Configuration(
                "ImageDeserializer requires a map file".into(),
            ));
        }
        if self.inputs.is_empty() {
            return Err(DataError::Configuration(
                "ImageDeserializer declares no inputs".into(),
            ));
        }
        for (i, (name, input)) in self.inputs.iter().enumerate() {
            if name.is_empty() {
                return Err(DataError::Configuration(
                    "Input name must be non-empty".into(),
                ));
            }
            if self.inputs[..i].iter().any(|(n, _)| n == name) {
                return Err(DataError::Configuration(format!(
                    "Input '{}' mapped twice within one deserializer",
                    name
                )));
            }
            match input {
                InputConfig::Labels { label_dim } => {
                    if *label_dim == 0 {
                        return Err(DataError::Configuration(format!(
                            "Input '{}': labelDim must be positive",
                            name
                        )));
                    }
                }
                InputConfig::Features { transforms } => validate_chain(name, transforms)?,
            }
        }
        Ok(())
    }

    fn to_document(&self) -> Value {
        let mut input = serde_json::Map::new();
        for (name, cfg) in &self.inputs {
            let value = match cfg {
                InputConfig::Labels { label_dim } => json!({ "labelDim": label_dim }),
                InputConfig::Features { transforms } => json!({ "transforms": transforms }),
            };
            input.insert(name.clone(), value);
        }
        json!({
            "type": "ImageDeserializer",
            "file": self.file.display().to_string(),
            "input": Value::Object(input),
        })
    }
}

/// Configuration for the text format deserializer: a source file plus the
/// declared stream descriptors (name, alias, dimension, storage kind).
#[derive(Debug, Clone)]
pub struct TextFormatDeserializerConfig {
    file: PathBuf,
    streams: Vec<StreamDescriptor>,
}

impl TextFormatDeserializerConfig {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            streams: Vec::new(),
        }
    }

    /// Registers one stream of the text source.
    pub fn map_stream(mut self, descriptor: StreamDescriptor) -> Self {
        self.streams.push(descriptor);
        self
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn validate(&self) -> Result<()> {
        if self.file.as_os_str().is_empty() {
            return Err(DataError::Configuration(
                "TextFormatDeserializer requires a source file".into(),
            ));
        }
        if self.streams.is_empty() {
            return Err(DataError::Configuration(
                "TextFormatDeserializer declares no streams".into(),
            ));
        }
        Ok(())
    }

    fn to_document(&self) -> Value {
        let mut input = serde_json::Map::new();
        for stream in &self.streams {
            input.insert(
                stream.name().to_string(),
                json!({
                    "alias": stream.source_alias(),
                    "dim": stream.dimension(),
                    "format": if stream.is_sparse() { "sparse" } else { "dense" },
                }),
            );
        }
        json!({
            "type": "TextFormatDeserializer",
            "file": self.file.display().to_string(),
            "input": Value::Object(input),
        })
    }
}

/// A deserializer of either kind, dispatched once at
/// [`crate::source::MinibatchSource`] construction.
#[derive(Debug, Clone)]
pub enum DeserializerConfig {
    Image(ImageDeserializerConfig),
    TextFormat(TextFormatDeserializerConfig),
}

impl DeserializerConfig {
    /// Logical input names declared by this deserializer, in order.
    pub fn input_names(&self) -> Vec<&str> {
        match self {
            DeserializerConfig::Image(c) => c.inputs.iter().map(|(n, _)| n.as_str()).collect(),
            DeserializerConfig::TextFormat(c) => {
                c.streams.iter().map(|s| s.name()).collect()
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            DeserializerConfig::Image(c) => c.validate(),
            DeserializerConfig::TextFormat(c) => c.validate(),
        }
    }

    fn to_document(&self) -> Value {
        match self {
            DeserializerConfig::Image(c) => c.to_document(),
            DeserializerConfig::TextFormat(c) => c.to_document(),
        }
    }
}

impl From<ImageDeserializerConfig> for DeserializerConfig {
    fn from(c: ImageDeserializerConfig) -> Self {
        DeserializerConfig::Image(c)
    }
}

impl From<TextFormatDeserializerConfig> for DeserializerConfig {
    fn from(c: TextFormatDeserializerConfig) -> Self {
        DeserializerConfig::TextFormat(c)
    }
}

// ================================================================================================
// 4. Top-level reader configuration
// ================================================================================================

/// Number of samples served per epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochSize {
    /// Serve at most this many samples (source records) per epoch.
    Samples(u64),
    /// The epoch ends only at source exhaustion.
    Unbounded,
}

impl EpochSize {
    fn to_document(self) -> Value {
        match self {
            EpochSize::Samples(n) => json!(n),
            EpochSize::Unbounded => json!("unbounded"),
        }
    }
}

/// Top-level, validated reader configuration.
///
/// Built once, consumed by reader construction. Validation covers every
/// nested deserializer plus the cross-deserializer constraint that no
/// input name is declared twice.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    epoch_size: EpochSize,
    randomize: bool,
    deserializers: Vec<DeserializerConfig>,
}

impl ReaderConfig {
    pub fn new(
        deserializers: Vec<DeserializerConfig>,
        randomize: bool,
        epoch_size: EpochSize,
    ) -> Result<Self> {
        if deserializers.is_empty() {
            return Err(DataError::Configuration(
                "ReaderConfig requires at least one deserializer".into(),
            ));
        }
        if let EpochSize::Samples(0) = epoch_size {
            return Err(DataError::Configuration(
                "epochSize must be positive or unbounded".into(),
            ));
        }
        let mut seen: Vec<&str> = Vec::new();
        for deserializer in &deserializers {
            deserializer.validate()?;
            for name in deserializer.input_names() {
                if seen.contains(&name) {
                    return Err(DataError::Configuration(format!(
                        "Input '{}' declared by more than one deserializer",
                        name
                    )));
                }
                seen.push(name);
            }
        }
        Ok(Self {
            epoch_size,
            randomize,
            deserializers,
        })
    }

    pub fn epoch_size(&self) -> EpochSize {
        self.epoch_size
    }

    pub fn randomize(&self) -> bool {
        self.randomize
    }

    pub fn deserializers(&self) -> &[DeserializerConfig] {
        &self.deserializers
    }

    /// The normalized nested key-value document.
    pub fn to_document(&self) -> Value {
        json!({
            "epochSize": self.epoch_size.to_document(),
            "randomize": self.randomize,
            "deserializers": self
                .deserializers
                .iter()
                .map(|d| d.to_document())
                .collect::<Vec<_>>(),
        })
    }
}
