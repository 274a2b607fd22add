//! Text format reader.
//!
//! Parses one logical line per record:
//!
//! ```text
//! <sequenceId><TAB>|<alias><SP><value>[<SP><value>...][<TAB>|<alias>...]
//! ```
//!
//! Fields are introduced by `|`; whitespace between fields is free-form.
//! Unknown aliases are skipped. For streams declared sparse, each token
//! after the alias is a category index (implied value 1.0); for dense
//! streams, tokens fill the vector positionally and the token count must
//! equal the declared stream dimension exactly.
//!
//! Sequences are contiguous runs of lines sharing a source sequence id.
//! Source ids are remapped to unique internal ids, so an id reappearing
//! later in the file starts a new logical sequence.

use crate::element::{Element, Pull, RawElement};
use crate::error::{DataError, Result};
use crate::readers::SequenceReader;
use crate::stream::StreamSchema;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// One parsed source line: the source-side sequence id plus the elements
/// it contributes, keyed by schema index.
struct ParsedLine {
    source_id: u64,
    elements: Vec<(usize, Element)>,
}

/// Reads CTF-style text sources against a fixed [`StreamSchema`].
///
/// # Example
/// ```ignore
/// let schema = Arc::new(StreamSchema::new(vec![
///     StreamDescriptor::new("features", 1000, StorageKind::Sparse, "x")?,
///     StreamDescriptor::new("labels", 5, StorageKind::Dense, "y")?,
/// ])?);
/// let mut reader = TextFormatReader::new("tf_data.txt", schema);
/// let pull = reader.read_next(7)?;
/// ```
pub struct TextFormatReader {
    path: PathBuf,
    schema: Arc<StreamSchema>,
    lines: Option<Lines<BufReader<File>>>,
    line_no: usize,
    /// A line parsed but not yet consumed because it would start a new
    /// sequence past the sample budget.
    pending: Option<ParsedLine>,
    /// Source id of the run currently in progress and its internal id.
    current: Option<(u64, u64)>,
    next_internal_id: u64,
    closed: bool,
}

impl TextFormatReader {
    pub fn new(path: impl Into<PathBuf>, schema: Arc<StreamSchema>) -> Self {
        Self {
            path: path.into(),
            schema,
            lines: None,
            line_no: 0,
            pending: None,
            current: None,
            next_internal_id: 0,
            closed: false,
        }
    }

    fn open(&mut self) -> Result<()> {
        let file = File::open(&self.path)?;
        self.lines = Some(BufReader::new(file).lines());
        self.line_no = 0;
        self.pending = None;
        self.current = None;
        Ok(())
    }

    /// Reads the next non-blank line, parsed. `None` at end of source.
    fn next_parsed(&mut self) -> Result<Option<ParsedLine>> {
        if let Some(parsed) = self.pending.take() {
            return Ok(Some(parsed));
        }
        loop {
            let line = match self.lines.as_mut().and_then(Iterator::next) {
                Some(line) => line?,
                None => return Ok(None),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return parse_line(self.line_no, &line, &self.schema).map(Some);
        }
    }
}

impl SequenceReader for TextFormatReader {
    fn read_next(&mut self, max_samples: usize) -> Result<Pull> {
        if self.closed {
            return Err(DataError::SourceClosed);
        }
        if self.lines.is_none() && self.pending.is_none() {
            self.open()?;
        }

        let mut pull = Pull::default();
        loop {
            let parsed = match self.next_parsed()? {
                Some(parsed) => parsed,
                None => break, // end of epoch: short pull, not an error
            };

            let internal = match self.current {
                Some((source_id, internal)) if source_id == parsed.source_id => internal,
                _ => {
                    // Sequence boundary: stop here once the budget is met.
                    if pull.records >= max_samples {
                        self.pending = Some(parsed);
                        break;
                    }
                    let internal = self.next_internal_id;
                    self.next_internal_id += 1;
                    self.current = Some((parsed.source_id, internal));
                    internal
                }
            };

            for (stream, element) in parsed.elements {
                pull.elements.push(RawElement {
                    sequence: internal,
                    stream,
                    element,
                });
            }
            pull.records += 1;
        }

        debug!(
            records = pull.records,
            elements = pull.elements.len(),
            "text reader pulled window"
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
        self.pending = None;
    }
}

/// Parses one source line against the schema.
fn parse_line(line_no: usize, line: &str, schema: &StreamSchema) -> Result<ParsedLine> {
    let bar = match line.find('|') {
        Some(pos) => pos,
        None => {
            return Err(DataError::parse(
                line_no,
                "expected at least one '|'-prefixed field",
            ))
        }
    };

    let head = &line[..bar];
    let mut head_tokens = head.split_whitespace();
    let id_token = head_tokens
        .next()
        .ok_or_else(|| DataError::parse(line_no, "missing sequence id"))?;
    if head_tokens.next().is_some() {
        return Err(DataError::parse(
            line_no,
            "malformed field prefix: junk between sequence id and first '|'",
        ));
    }
    let source_id: u64 = id_token
        .parse()
        .map_err(|_| DataError::parse(line_no, format!("malformed sequence id '{}'", id_token)))?;

    let mut elements = Vec::new();
    for field in line[bar + 1..].split('|') {
        let mut tokens = field.split_whitespace();
        let alias = tokens
            .next()
            .ok_or_else(|| DataError::parse(line_no, "malformed field prefix: empty alias"))?;

        let stream = match schema.index_of_alias(alias) {
            Some(index) => index,
            None => continue, // unknown aliases are ignored
        };
        let descriptor = schema.descriptor(stream);

        let element = if descriptor.is_sparse() {
            let mut pairs = Vec::new();
            for token in tokens {
                let index: u32 = token.parse().map_err(|_| {
                    DataError::parse(
                        line_no,
                        format!("field '|{}': malformed sparse index '{}'", alias, token),
                    )
                })?;
                if index as usize >= descriptor.dimension() {
                    return Err(DataError::parse(
                        line_no,
                        format!(
                            "field '|{}': sparse index {} out of range for dimension {}",
                            alias,
                            index,
                            descriptor.dimension()
                        ),
                    ));
                }
                pairs.push((index, 1.0));
            }
            if pairs.is_empty() {
                return Err(DataError::parse(
                    line_no,
                    format!("field '|{}' carries no values", alias),
                ));
            }
            Element::Sparse(pairs)
        } else {
            let mut values = Vec::with_capacity(descriptor.dimension());
            for token in tokens {
                let value: f32 = token.parse().map_err(|_| {
                    DataError::parse(
                        line_no,
                        format!("field '|{}': malformed value '{}'", alias, token),
                    )
                })?;
                values.push(value);
            }
            if values.len() != descriptor.dimension() {
                return Err(DataError::DimensionMismatch {
                    stream: descriptor.name().to_string(),
                    expected: descriptor.dimension(),
                    actual: values.len(),
                });
            }
            Element::Dense(values)
        };
        elements.push((stream, element));
    }

    Ok(ParsedLine {
        source_id,
        elements,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StorageKind, StreamDescriptor};
    use anyhow::Result;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn schema_s0_s1() -> Arc<StreamSchema> {
        Arc::new(
            StreamSchema::new(vec![
                StreamDescriptor::new("features", 1, StorageKind::Dense, "S0").unwrap(),
                StreamDescriptor::new("labels", 1, StorageKind::Dense, "S1").unwrap(),
            ])
            .unwrap(),
        )
    }

    fn write_fixture(data: &str) -> Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        write!(file, "{}", data)?;
        Ok(file)
    }

    #[test]
    fn test_reads_whole_sequences_in_order() -> Result<()> {
        let file = write_fixture(
            "0\t|S0 0\t|S1 0\n0\t|S0 1\t|S1 1\n0\t|S0 2\n0\t|S0 3\t|S1 3\n\
             1\t|S0 4\n1\t|S0 5\t|S1 1\n1\t|S0 6\t|S1 2\n",
        )?;
        let mut reader = TextFormatReader::new(file.path(), schema_s0_s1());

        let pull = reader.read_next(1000)?;
        assert_eq!(pull.records, 7);

        // S0: sequence 0 has 4 elements in source order, sequence 1 has 3
        let s0: Vec<_> = pull.elements.iter().filter(|e| e.stream == 0).collect();
        assert_eq!(s0.len(), 7);
        assert_eq!(s0.iter().filter(|e| e.sequence == 0).count(), 4);
        assert_eq!(s0.iter().filter(|e| e.sequence == 1).count(), 3);
        let first_vals: Vec<f32> = s0
            .iter()
            .filter(|e| e.sequence == 0)
            .map(|e| match &e.element {
                Element::Dense(v) => v[0],
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(first_vals, vec![0.0, 1.0, 2.0, 3.0]);

        // S1: missing from some lines is legal coverage, not an error
        let s1: Vec<_> = pull.elements.iter().filter(|e| e.stream == 1).collect();
        assert_eq!(s1.iter().filter(|e| e.sequence == 0).count(), 3);
        assert_eq!(s1.iter().filter(|e| e.sequence == 1).count(), 2);

        // Source exhausted: next pull is empty, not an error
        let empty = reader.read_next(1000)?;
        assert!(empty.is_empty());
        Ok(())
    }

    #[test]
    fn test_budget_stops_at_sequence_boundary() -> Result<()> {
        let file = write_fixture("0\t|S0 0\n0\t|S0 1\n1\t|S0 2\n1\t|S0 3\n2\t|S0 4\n")?;
        let mut reader = TextFormatReader::new(file.path(), schema_s0_s1());

        // Budget 3: sequence 0 (2 records) is under budget, so sequence 1
        // is pulled whole; sequence 2 stays pending.
        let pull = reader.read_next(3)?;
        assert_eq!(pull.records, 4);

        let pull = reader.read_next(1000)?;
        assert_eq!(pull.records, 1);
        assert_eq!(pull.elements[0].sequence, 2);
        Ok(())
    }

    #[test]
    fn test_zero_budget_pull_is_empty() -> Result<()> {
        let file = write_fixture("0\t|S0 0\n")?;
        let mut reader = TextFormatReader::new(file.path(), schema_s0_s1());
        let pull = reader.read_next(0)?;
        assert!(pull.is_empty());
        assert_eq!(pull.records, 0);

        // The stashed line is served on the next pull.
        let pull = reader.read_next(1)?;
        assert_eq!(pull.records, 1);
        Ok(())
    }

    #[test]
    fn test_reappearing_id_starts_new_sequence() -> Result<()> {
        let file = write_fixture("0\t|S0 0\n1\t|S0 1\n0\t|S0 2\n")?;
        let mut reader = TextFormatReader::new(file.path(), schema_s0_s1());
        let pull = reader.read_next(1000)?;
        let ids: Vec<u64> = pull.elements.iter().map(|e| e.sequence).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_unknown_alias_is_skipped() -> Result<()> {
        let file = write_fixture("0\t|S0 1\t|UNKNOWN 9 9 9\n")?;
        let mut reader = TextFormatReader::new(file.path(), schema_s0_s1());
        let pull = reader.read_next(1000)?;
        assert_eq!(pull.elements.len(), 1);
        assert_eq!(pull.elements[0].stream, 0);
        Ok(())
    }

    #[test]
    fn test_malformed_lines_fail_with_line_number() -> Result<()> {
        let file = write_fixture("0\t|S0 0\nnot_an_id\t|S0 1\n")?;
        let mut reader = TextFormatReader::new(file.path(), schema_s0_s1());
        let err = reader.read_next(1000).unwrap_err();
        match err {
            DataError::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("expected ParseError, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_dense_dimension_mismatch() -> Result<()> {
        let schema = Arc::new(
            StreamSchema::new(vec![StreamDescriptor::new(
                "features",
                1000,
                StorageKind::Dense,
                "x",
            )?])
            .unwrap(),
        );
        let file = write_fixture("0\t|x 1 2\n")?;
        let mut reader = TextFormatReader::new(file.path(), schema);
        let err = reader.read_next(1000).unwrap_err();
        match err {
            DataError::DimensionMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, 1000);
                assert_eq!(actual, 2);
            }
            other => panic!("expected DimensionMismatchError, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_sparse_index_parsing_and_range() -> Result<()> {
        let schema = Arc::new(
            StreamSchema::new(vec![StreamDescriptor::new(
                "features",
                1000,
                StorageKind::Sparse,
                "x",
            )?])
            .unwrap(),
        );
        let file = write_fixture("0\t|x 560\n0\t|x 0\n")?;
        let mut reader = TextFormatReader::new(file.path(), schema.clone());
        let pull = reader.read_next(1000)?;
        assert_eq!(
            pull.elements[0].element,
            Element::Sparse(vec![(560, 1.0)])
        );

        let file = write_fixture("0\t|x 1000\n")?;
        let mut reader = TextFormatReader::new(file.path(), schema);
        assert!(matches!(
            reader.read_next(1000),
            Err(DataError::Parse { line: 1, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_restart_reopens_source() -> Result<()> {
        let file = write_fixture("0\t|S0 0\n1\t|S0 1\n")?;
        let mut reader = TextFormatReader::new(file.path(), schema_s0_s1());

        let first = reader.read_next(1000)?;
        assert_eq!(first.records, 2);
        assert!(reader.read_next(1000)?.is_empty());

        reader.restart()?;
        let again = reader.read_next(1000)?;
        assert_eq!(again.records, 2);
        // Internal ids keep increasing across epochs
        assert!(again.elements[0].sequence > first.elements[1].sequence);
        Ok(())
    }

    #[test]
    fn test_closed_reader_fails() -> Result<()> {
        let file = write_fixture("0\t|S0 0\n")?;
        let mut reader = TextFormatReader::new(file.path(), schema_s0_s1());
        reader.close();
        assert!(matches!(
            reader.read_next(10),
            Err(DataError::SourceClosed)
        ));
        assert!(matches!(reader.restart(), Err(DataError::SourceClosed)));
        Ok(())
    }

    #[test]
    fn test_space_separated_fields() -> Result<()> {
        // The original tooling emits fields separated by runs of spaces as
        // well as tabs; both must parse.
        let file = write_fixture("0\t|S0 0   |S1 0\n")?;
        let mut reader = TextFormatReader::new(file.path(), schema_s0_s1());
        let pull = reader.read_next(1000)?;
        assert_eq!(pull.elements.len(), 2);
        Ok(())
    }
}
