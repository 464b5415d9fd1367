//! Row encodings for partition files.
//!
//! Two interchangeable encodings sit behind the same partition contract: a
//! compact tagged binary format and JSON Lines for when spill files need to
//! be greppable. In the binary format every cell starts with a type tag byte
//! that doubles as the presence flag (`Null` = absent), fixed-width scalars
//! are little-endian, and text is length-prefixed.

use crate::error::{EngineError, Result};
use crate::value::{Datum, Row};
use std::io::{BufRead, Read, Write};
use std::time::Duration;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_DURATION: u8 = 5;

/// Which encoding a partition uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Binary,
    JsonLines,
}

impl CodecKind {
    pub fn write_row<W: Write>(&self, writer: &mut W, row: &Row) -> Result<()> {
        match self {
            CodecKind::Binary => {
                for cell in row {
                    write_cell(writer, cell)?;
                }
                Ok(())
            }
            CodecKind::JsonLines => {
                serde_json::to_writer(&mut *writer, row)
                    .map_err(|e| EngineError::Codec(e.to_string()))?;
                writer.write_all(b"\n")?;
                Ok(())
            }
        }
    }

    /// Read one row of `columns` cells. `Ok(None)` at a clean end of stream;
    /// an end of stream mid-row is a corruption error.
    pub fn read_row<R: BufRead>(&self, reader: &mut R, columns: usize) -> Result<Option<Row>> {
        match self {
            CodecKind::Binary => {
                let mut row = Vec::with_capacity(columns);
                for col in 0..columns {
                    match read_cell(reader)? {
                        Some(cell) => row.push(cell),
                        None if col == 0 => return Ok(None),
                        None => {
                            return Err(EngineError::Codec(format!(
                                "row truncated at column {col}"
                            )))
                        }
                    }
                }
                Ok(Some(row))
            }
            CodecKind::JsonLines => {
                let mut line = String::new();
                if reader.read_line(&mut line)? == 0 {
                    return Ok(None);
                }
                let row: Row = serde_json::from_str(line.trim_end())
                    .map_err(|e| EngineError::Codec(e.to_string()))?;
                if row.len() != columns {
                    return Err(EngineError::Codec(format!(
                        "expected {columns} columns, found {}",
                        row.len()
                    )));
                }
                Ok(Some(row))
            }
        }
    }
}

fn write_cell<W: Write>(writer: &mut W, cell: &Datum) -> Result<()> {
    match cell {
        Datum::Null => writer.write_all(&[TAG_NULL])?,
        Datum::Bool(b) => writer.write_all(&[TAG_BOOL, *b as u8])?,
        Datum::Int(i) => {
            writer.write_all(&[TAG_INT])?;
            writer.write_all(&i.to_le_bytes())?;
        }
        Datum::Float(f) => {
            writer.write_all(&[TAG_FLOAT])?;
            writer.write_all(&f.to_bits().to_le_bytes())?;
        }
        Datum::Text(s) => {
            writer.write_all(&[TAG_TEXT])?;
            writer.write_all(&(s.len() as u32).to_le_bytes())?;
            writer.write_all(s.as_bytes())?;
        }
        Datum::Duration(d) => {
            writer.write_all(&[TAG_DURATION])?;
            writer.write_all(&d.as_secs().to_le_bytes())?;
            writer.write_all(&d.subsec_nanos().to_le_bytes())?;
        }
    }
    Ok(())
}

/// `Ok(None)` only when the stream ends exactly on a cell boundary.
fn read_cell<R: Read>(reader: &mut R) -> Result<Option<Datum>> {
    let mut tag = [0u8; 1];
    match reader.read(&mut tag)? {
        0 => return Ok(None),
        _ => {}
    }
    let cell = match tag[0] {
        TAG_NULL => Datum::Null,
        TAG_BOOL => {
            let mut b = [0u8; 1];
            read_exact(reader, &mut b)?;
            Datum::Bool(b[0] != 0)
        }
        TAG_INT => {
            let mut b = [0u8; 8];
            read_exact(reader, &mut b)?;
            Datum::Int(i64::from_le_bytes(b))
        }
        TAG_FLOAT => {
            let mut b = [0u8; 8];
            read_exact(reader, &mut b)?;
            Datum::Float(f64::from_bits(u64::from_le_bytes(b)))
        }
        TAG_TEXT => {
            let mut len = [0u8; 4];
            read_exact(reader, &mut len)?;
            let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
            read_exact(reader, &mut bytes)?;
            Datum::Text(
                String::from_utf8(bytes).map_err(|e| EngineError::Codec(e.to_string()))?,
            )
        }
        TAG_DURATION => {
            let mut secs = [0u8; 8];
            read_exact(reader, &mut secs)?;
            let mut nanos = [0u8; 4];
            read_exact(reader, &mut nanos)?;
            Datum::Duration(Duration::new(
                u64::from_le_bytes(secs),
                u32::from_le_bytes(nanos),
            ))
        }
        other => return Err(EngineError::Codec(format!("unknown cell tag {other}"))),
    };
    Ok(Some(cell))
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader
        .read_exact(buf)
        .map_err(|e| EngineError::Codec(format!("truncated cell: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_row() -> Row {
        vec![
            Datum::Int(42),
            Datum::Null,
            Datum::Text("north".into()),
            Datum::Float(2.5),
            Datum::Bool(true),
            Datum::Duration(Duration::new(90, 250)),
        ]
    }

    #[test]
    fn test_binary_round_trip() {
        let row = sample_row();
        let mut buf = Vec::new();
        CodecKind::Binary.write_row(&mut buf, &row).unwrap();
        CodecKind::Binary.write_row(&mut buf, &row).unwrap();

        let mut reader = Cursor::new(buf);
        let first = CodecKind::Binary.read_row(&mut reader, row.len()).unwrap();
        assert_eq!(first, Some(row.clone()));
        let second = CodecKind::Binary.read_row(&mut reader, row.len()).unwrap();
        assert_eq!(second, Some(row.clone()));
        assert_eq!(
            CodecKind::Binary.read_row(&mut reader, row.len()).unwrap(),
            None
        );
    }

    #[test]
    fn test_json_lines_round_trip() {
        let row = sample_row();
        let mut buf = Vec::new();
        CodecKind::JsonLines.write_row(&mut buf, &row).unwrap();

        let mut reader = Cursor::new(buf);
        let back = CodecKind::JsonLines
            .read_row(&mut reader, row.len())
            .unwrap();
        assert_eq!(back, Some(row));
    }

    #[test]
    fn test_truncated_row_is_fatal() {
        let row = sample_row();
        let mut buf = Vec::new();
        CodecKind::Binary.write_row(&mut buf, &row).unwrap();
        buf.truncate(buf.len() - 3);

        let mut reader = Cursor::new(buf);
        assert!(CodecKind::Binary.read_row(&mut reader, row.len()).is_err());
    }
}
