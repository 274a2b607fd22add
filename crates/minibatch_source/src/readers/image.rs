//! Image deserializer reader.
//!
//! Consumes a map file with one record per line, `<path><TAB><label>`.
//! Every record is a length-1 sequence: for each configured feature
//! input the image is decoded and pushed through its transform chain in
//! declared order, producing one dense element in CHW layout; the label
//! input yields a one-hot element (or a single-index sparse element when
//! the label stream is declared sparse).
//!
//! Relative image paths are resolved against the map file's directory.

use crate::config::ImageDeserializerConfig;
use crate::config::InputConfig;
use crate::element::{Element, Pull, RawElement};
use crate::error::{DataError, Result};
use crate::readers::transforms::PreparedChain;
use crate::readers::SequenceReader;
use crate::stream::StreamSchema;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

enum PreparedInput {
    Features { stream: usize, chain: PreparedChain },
    Labels { stream: usize, label_dim: usize },
}

pub struct ImageReader {
    map_file: PathBuf,
    base_dir: PathBuf,
    inputs: Vec<PreparedInput>,
    lines: Option<Lines<BufReader<File>>>,
    line_no: usize,
    next_internal_id: u64,
    rng: StdRng,
    closed: bool,
}

impl ImageReader {
    /// Prepares a reader from a validated deserializer configuration.
    /// Transform chains are resolved here (mean files loaded once);
    /// input names must already be registered in the schema.
    pub fn new(
        config: &ImageDeserializerConfig,
        schema: Arc<StreamSchema>,
        seed: u64,
    ) -> Result<Self> {
        let mut inputs = Vec::with_capacity(config.inputs().len());
        for (name, input) in config.inputs() {
            let stream = schema.index_of(name)?;
            inputs.push(match input {
                InputConfig::Features { transforms } => PreparedInput::Features {
                    stream,
                    chain: PreparedChain::prepare(transforms)?,
                },
                InputConfig::Labels { label_dim } => PreparedInput::Labels {
                    stream,
                    label_dim: *label_dim,
                },
            });
        }

        let map_file = config.file().to_path_buf();
        let base_dir = map_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(Self {
            map_file,
            base_dir,
            inputs,
            lines: None,
            line_no: 0,
            next_internal_id: 0,
            rng: StdRng::seed_from_u64(seed),
            closed: false,
        })
    }

    fn open(&mut self) -> Result<()> {
        let file = File::open(&self.map_file)?;
        self.lines = Some(BufReader::new(file).lines());
        self.line_no = 0;
        Ok(())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Emits the elements of one map record.
    fn read_record(&mut self, line_no: usize, line: &str, out: &mut Pull) -> Result<()> {
        let (path, label) = line
            .split_once('\t')
            .ok_or_else(|| DataError::parse(line_no, "expected '<path><TAB><label>'"))?;
        let label: usize = label.trim().parse().map_err(|_| {
            DataError::parse(line_no, format!("malformed label '{}'", label.trim()))
        })?;

        let sequence = self.next_internal_id;
        self.next_internal_id += 1;

        let image_path = self.resolve(path.trim());
        // Decode once per record, clone per feature input.
        let decoded = image::open(&image_path)?;

        for input in &self.inputs {
            match input {
                PreparedInput::Features { stream, chain } => {
                    let values = chain.apply(decoded.clone(), &mut self.rng)?;
                    out.elements.push(RawElement {
                        sequence,
                        stream: *stream,
                        element: Element::Dense(values),
                    });
                }
                PreparedInput::Labels { stream, label_dim } => {
                    if label >= *label_dim {
                        return Err(DataError::parse(
                            line_no,
                            format!("label {} out of range for labelDim {}", label, label_dim),
                        ));
                    }
                    out.elements.push(RawElement {
                        sequence,
                        stream: *stream,
                        element: Element::one_hot(*label_dim, label),
                    });
                }
            }
        }
        out.records += 1;
        Ok(())
    }
}

impl SequenceReader for ImageReader {
    fn read_next(&mut self, max_samples: usize) -> Result<Pull> {
        if self.closed {
            return Err(DataError::SourceClosed);
        }
        if self.lines.is_none() {
            self.open()?;
        }

        let mut pull = Pull::default();
        while pull.records < max_samples {
            let line = {
                let lines = match self.lines.as_mut() {
                    Some(lines) => lines,
                    None => break,
                };
                match lines.next() {
                    Some(line) => line?,
                    None => break, // end of epoch
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let line_no = self.line_no;
            self.read_record(line_no, &line, &mut pull)?;
        }

        debug!(
            records = pull.records,
            elements = pull.elements.len(),
            "image reader pulled window"
        );
        Ok(pull)
    }

    fn restart(&mut self) -> Result<()> {
        if self.closed {
            return Err(DataError::SourceClosed);
        }
        self.open()
    }

    fn close(&mut self) {
        self.closed = true;
        self.lines = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CropType, ImageTransform, Interpolation, JitterType};
    use crate::stream::{StorageKind, StreamDescriptor};
    use anyhow::Result;
    use image::{Rgb, RgbImage};
    use std::io::Write;
    use tempfile::tempdir;

    fn write_image(dir: &Path, name: &str, color: [u8; 3]) -> Result<()> {
        let img = RgbImage::from_pixel(16, 12, Rgb(color));
        img.save(dir.join(name))?;
        Ok(())
    }

    fn schema_fl(feature_dim: usize, label_dim: usize) -> Arc<StreamSchema> {
        Arc::new(
            StreamSchema::new(vec![
                StreamDescriptor::new("f", feature_dim, StorageKind::Dense, "f").unwrap(),
                StreamDescriptor::new("l", label_dim, StorageKind::Dense, "l").unwrap(),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn test_reads_records_as_singleton_sequences() -> Result<()> {
        let dir = tempdir()?;
        write_image(dir.path(), "a.png", [255, 0, 0])?;
        write_image(dir.path(), "b.png", [0, 255, 0])?;

        let map_path = dir.path().join("map.txt");
        let mut map = std::fs::File::create(&map_path)?;
        writeln!(map, "a.png\t0")?;
        writeln!(map, "b.png\t2")?;

        let config = ImageDeserializerConfig::new(&map_path)
            .map_features(
                "f",
                vec![ImageTransform::scale(4, 4, 3, Interpolation::Nearest)],
            )
            .map_labels("l", 3);
        let mut reader = ImageReader::new(&config, schema_fl(48, 3), 0)?;

        let pull = reader.read_next(10)?;
        assert_eq!(pull.records, 2);
        assert_eq!(pull.elements.len(), 4); // feature + label per record

        // Distinct records carry distinct sequence ids.
        assert_ne!(pull.elements[0].sequence, pull.elements[2].sequence);

        // First image is solid red: red plane 255, others 0.
        match &pull.elements[0].element {
            Element::Dense(v) => {
                assert_eq!(v.len(), 48);
                assert!(v[..16].iter().all(|&x| x == 255.0));
                assert!(v[16..].iter().all(|&x| x == 0.0));
            }
            other => panic!("expected dense feature element, got {other:?}"),
        }

        // Second record's label one-hot at index 2.
        match &pull.elements[3].element {
            Element::Dense(v) => assert_eq!(v, &vec![0.0, 0.0, 1.0]),
            other => panic!("expected dense label element, got {other:?}"),
        }

        assert!(reader.read_next(10)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_label_out_of_range() -> Result<()> {
        let dir = tempdir()?;
        write_image(dir.path(), "a.png", [1, 2, 3])?;
        let map_path = dir.path().join("map.txt");
        writeln!(std::fs::File::create(&map_path)?, "a.png\t7")?;

        let config = ImageDeserializerConfig::new(&map_path)
            .map_features(
                "f",
                vec![ImageTransform::scale(2, 2, 3, Interpolation::Nearest)],
            )
            .map_labels("l", 3);
        let mut reader = ImageReader::new(&config, schema_fl(12, 3), 0)?;
        assert!(matches!(
            reader.read_next(10),
            Err(DataError::Parse { line: 1, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_malformed_map_line() -> Result<()> {
        let dir = tempdir()?;
        let map_path = dir.path().join("map.txt");
        writeln!(std::fs::File::create(&map_path)?, "no_tab_here")?;

        let config = ImageDeserializerConfig::new(&map_path)
            .map_features(
                "f",
                vec![ImageTransform::scale(2, 2, 3, Interpolation::Nearest)],
            )
            .map_labels("l", 3);
        let mut reader = ImageReader::new(&config, schema_fl(12, 3), 0)?;
        assert!(matches!(
            reader.read_next(10),
            Err(DataError::Parse { line: 1, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_crop_scale_chain_runs_in_order() -> Result<()> {
        let dir = tempdir()?;
        write_image(dir.path(), "a.png", [9, 9, 9])?;
        let map_path = dir.path().join("map.txt");
        writeln!(std::fs::File::create(&map_path)?, "a.png\t0")?;

        let config = ImageDeserializerConfig::new(&map_path)
            .map_features(
                "f",
                vec![
                    ImageTransform::crop(CropType::Random, 0.8, JitterType::UniRatio),
                    ImageTransform::scale(5, 6, 3, Interpolation::Linear),
                ],
            )
            .map_labels("l", 1);
        let mut reader = ImageReader::new(&config, schema_fl(90, 1), 42)?;
        let pull = reader.read_next(1)?;
        match &pull.elements[0].element {
            Element::Dense(v) => assert_eq!(v.len(), 3 * 6 * 5),
            other => panic!("expected dense element, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_restart_and_close() -> Result<()> {
        let dir = tempdir()?;
        write_image(dir.path(), "a.png", [1, 1, 1])?;
        let map_path = dir.path().join("map.txt");
        writeln!(std::fs::File::create(&map_path)?, "a.png\t0")?;

        let config = ImageDeserializerConfig::new(&map_path)
            .map_features(
                "f",
                vec![ImageTransform::scale(2, 2, 3, Interpolation::Nearest)],
            )
            .map_labels("l", 2);
        let mut reader = ImageReader::new(&config, schema_fl(12, 2), 0)?;

        assert_eq!(reader.read_next(10)?.records, 1);
        assert!(reader.read_next(10)?.is_empty());
        reader.restart()?;
        assert_eq!(reader.read_next(10)?.records, 1);

        reader.close();
        assert!(matches!(
            reader.read_next(10),
            Err(DataError::SourceClosed)
        ));
        Ok(())
    }
}
