//! # ProteinNet Reader
//!
//! Pull parser for ProteinNet text records, used by the batch harness to
//! draw real experiment inputs. A record is a `[ID]` section naming
//! `<structure>_<model>_<chain>`, followed by `[PRIMARY]` and `[MASK]`
//! sections, terminated by a blank line. Two-part ASTRAL ids are skipped;
//! sections this parser does not care about are ignored.

use std::io::BufRead;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProteinNetError {
    #[error("read: {0}")]
    Io(#[from] std::io::Error),

    #[error("expected {0}")]
    UnexpectedEof(&'static str),

    #[error("failed to parse model ID '{0}'")]
    InvalidModelId(String),

    #[error("malformed ID format '{0}'")]
    MalformedId(String),

    #[error("mask length (got {got}, expected {expected})")]
    MaskLength { got: usize, expected: usize },
}

/// One ProteinNet record, carrying everything `/run` needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProteinNetRecord {
    pub structure_id: String,
    pub model_id: i64,
    pub chain_id: String,
    pub primary: String,
    pub mask: String,
}

/// Streaming reader over ProteinNet text.
pub struct ProteinNetReader<R> {
    lines: std::io::Lines<R>,
}

impl<R: BufRead> ProteinNetReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    fn next_line(&mut self, expecting: &'static str) -> Result<String, ProteinNetError> {
        match self.lines.next() {
            Some(line) => Ok(line?),
            None => Err(ProteinNetError::UnexpectedEof(expecting)),
        }
    }

    /// Read the next complete record, or `None` at end of input.
    pub fn next_record(&mut self) -> Result<Option<ProteinNetRecord>, ProteinNetError> {
        let mut current: Option<ProteinNetRecord> = None;
        while let Some(line) = self.lines.next() {
            match line?.as_str() {
                "[ID]" => {
                    let id = self.next_line("ID")?;
                    let parts: Vec<&str> = id.split('_').collect();
                    match parts.as_slice() {
                        [structure_id, model_id, chain_id] => {
                            let model_id = model_id
                                .parse()
                                .map_err(|_| ProteinNetError::InvalidModelId(model_id.to_string()))?;
                            current = Some(ProteinNetRecord {
                                structure_id: structure_id.to_string(),
                                model_id,
                                chain_id: chain_id.to_string(),
                                primary: String::new(),
                                mask: String::new(),
                            });
                        }
                        // ASTRAL entries carry no chain; skip them.
                        [_, _] => current = None,
                        _ => return Err(ProteinNetError::MalformedId(id)),
                    }
                }
                "[PRIMARY]" => {
                    let primary = self.next_line("primary sequence")?;
                    if let Some(record) = current.as_mut() {
                        record.primary = primary;
                    }
                }
                "[MASK]" => {
                    let mask = self.next_line("mask")?;
                    if let Some(record) = current.as_mut() {
                        record.mask = mask;
                    }
                }
                "" => {
                    if let Some(record) = current.take() {
                        if record.mask.len() != record.primary.len() {
                            return Err(ProteinNetError::MaskLength {
                                got: record.mask.len(),
                                expected: record.primary.len(),
                            });
                        }
                        return Ok(Some(record));
                    }
                }
                // Coordinate and evolutionary sections are not needed here.
                _ => {}
            }
        }
        Ok(None)
    }
}

impl<R: BufRead> Iterator for ProteinNetReader<R> {
    type Item = Result<ProteinNetRecord, ProteinNetError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Read every record from `reader` into memory.
pub fn read_records<R: BufRead>(reader: R) -> Result<Vec<ProteinNetRecord>, ProteinNetError> {
    ProteinNetReader::new(reader).collect()
}
