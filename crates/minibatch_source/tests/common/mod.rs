//! Shared fixtures for integration tests.

use anyhow::Result;
use std::io::Write;
use tempfile::NamedTempFile;

/// Writes a text-format source file and keeps it alive for the test.
pub fn write_text_source(data: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    write!(file, "{}", data)?;
    Ok(file)
}

/// The canonical two-sequence fixture: sequence 0 covers S0 on four
/// records and S1 on three of them; sequence 1 covers S0 on three
/// records and S1 on two.
pub const TWO_SEQUENCES: &str = "0\t|S0 0\t|S1 0\n\
                                 0\t|S0 1\t|S1 1\n\
                                 0\t|S0 2\n\
                                 0\t|S0 3\t|S1 3\n\
                                 1\t|S0 4\n\
                                 1\t|S0 5\t|S1 1\n\
                                 1\t|S0 6\t|S1 2\n";
