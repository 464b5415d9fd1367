//! On-disk partitions: immutable snapshots of one flush.
//!
//! A partition is a directory holding one row file per table, written once
//! behind a temp-dir rename so readers never observe a half-written
//! snapshot. Partitions are read many times and removed only after a merge
//! has fully consumed them.

use crate::error::{EngineError, Result};
use crate::stream::codec::CodecKind;
use crate::table::builder::Table;
use crate::value::Row;
use log::{debug, warn};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const MAGIC: [u8; 4] = *b"SMT1";

/// Cumulative spill accounting, shared across workers when they must jointly
/// respect one disk limit. The single atomic add per flush is the only
/// cross-worker mutable state during the parallel phase.
#[derive(Debug)]
pub struct DiskBudget {
    used: AtomicU64,
    max: Option<u64>,
}

impl DiskBudget {
    pub fn new(max: Option<u64>) -> Self {
        DiskBudget {
            used: AtomicU64::new(0),
            max,
        }
    }

    pub fn add(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn exceeded(&self) -> bool {
        self.max.is_some_and(|max| self.used() > max)
    }
}

/// One immutable on-disk snapshot.
#[derive(Debug)]
pub struct Partition {
    dir: PathBuf,
}

impl Partition {
    fn row_file(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.rows"))
    }

    /// Open a cursor over one table's rows. Validates the file header.
    pub fn open_cursor(&self, table: &str, codec: CodecKind) -> Result<RowCursor> {
        let path = self.row_file(table);
        let mut reader = BufReader::new(File::open(&path)?);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| EngineError::Codec(format!("{}: {e}", path.display())))?;
        if magic != MAGIC {
            return Err(EngineError::Codec(format!(
                "{}: bad partition header",
                path.display()
            )));
        }
        let mut cols = [0u8; 4];
        reader
            .read_exact(&mut cols)
            .map_err(|e| EngineError::Codec(format!("{}: {e}", path.display())))?;

        Ok(RowCursor {
            reader,
            codec,
            columns: u32::from_le_bytes(cols) as usize,
            done: false,
        })
    }

    pub fn remove(&self) -> std::io::Result<()> {
        fs::remove_dir_all(&self.dir)
    }
}

/// Streaming reader over one partition file. Fuses after the first error.
pub struct RowCursor {
    reader: BufReader<File>,
    codec: CodecKind,
    columns: usize,
    done: bool,
}

impl Iterator for RowCursor {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.codec.read_row(&mut self.reader, self.columns) {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Persists flushes as numbered partitions under one directory and tracks
/// their cumulative size against the budget.
pub struct BatchWriter {
    dir: PathBuf,
    codec: CodecKind,
    budget: Arc<DiskBudget>,
    partitions: Vec<Partition>,
    seq: u32,
}

impl BatchWriter {
    pub fn new(dir: impl Into<PathBuf>, codec: CodecKind, budget: Arc<DiskBudget>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(BatchWriter {
            dir,
            codec,
            budget,
            partitions: Vec::new(),
            seq: 0,
        })
    }

    /// Write one flush as a new partition. Internally atomic: rows land in a
    /// temp directory that is renamed into place only once fully written.
    pub fn write_batch(&mut self, tables: &[Table]) -> Result<()> {
        let tmp = self.dir.join(format!("partition-{:05}.tmp", self.seq));
        fs::create_dir_all(&tmp)?;

        let mut bytes = 0u64;
        for table in tables {
            bytes += self.write_table(&tmp, table)?;
        }

        let final_dir = self.dir.join(format!("partition-{:05}", self.seq));
        fs::rename(&tmp, &final_dir)?;
        self.seq += 1;
        self.budget.add(bytes);
        debug!(
            "partition {} written: {} tables, {} bytes ({} total)",
            final_dir.display(),
            tables.len(),
            bytes,
            self.budget.used()
        );
        self.partitions.push(Partition { dir: final_dir });
        Ok(())
    }

    fn write_table(&self, dir: &Path, table: &Table) -> Result<u64> {
        let path = dir.join(format!("{}.rows", table.schema().name()));
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(&MAGIC)?;
        writer.write_all(&(table.schema().len() as u32).to_le_bytes())?;
        for row in table.rows() {
            self.codec.write_row(&mut writer, row)?;
        }
        writer.flush()?;
        Ok(writer.get_ref().metadata()?.len())
    }

    /// True once cumulative persisted bytes exceed the configured maximum.
    pub fn end(&self) -> bool {
        self.budget.exceeded()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn take_partitions(&mut self) -> Vec<Partition> {
        std::mem::take(&mut self.partitions)
    }
}

/// Owns spilled partitions until every consumer of the merged output is
/// done with them, then removes the directories.
#[derive(Debug, Default)]
pub struct PartitionSet {
    partitions: Vec<Partition>,
}

impl PartitionSet {
    pub fn new(partitions: Vec<Partition>) -> Self {
        PartitionSet { partitions }
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }
}

impl Drop for PartitionSet {
    fn drop(&mut self) {
        for partition in &self.partitions {
            if let Err(e) = partition.remove() {
                warn!("failed to remove partition {}: {e}", partition.dir.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldRole, Schema};
    use crate::value::Datum;

    fn table(rows: Vec<Row>) -> Table {
        let schema = Schema::new(
            "visits",
            vec![
                Field::new("id", FieldRole::Key),
                Field::new("spent", FieldRole::Fact),
            ],
        )
        .unwrap();
        Table::new(Arc::new(schema), rows)
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(DiskBudget::new(None));
        let mut writer = BatchWriter::new(dir.path(), CodecKind::Binary, budget).unwrap();

        let rows = vec![
            vec![Datum::Int(1), Datum::Int(10)],
            vec![Datum::Int(2), Datum::Int(20)],
        ];
        writer.write_batch(&[table(rows.clone())]).unwrap();

        let partitions = writer.take_partitions();
        assert_eq!(partitions.len(), 1);
        let got: Vec<Row> = partitions[0]
            .open_cursor("visits", CodecKind::Binary)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(got, rows);
    }

    #[test]
    fn test_no_temp_dirs_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(DiskBudget::new(None));
        let mut writer = BatchWriter::new(dir.path(), CodecKind::Binary, budget).unwrap();
        writer.write_batch(&[table(vec![])]).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["partition-00000"]);
    }

    #[test]
    fn test_budget_flag() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(DiskBudget::new(Some(8)));
        let mut writer =
            BatchWriter::new(dir.path(), CodecKind::Binary, Arc::clone(&budget)).unwrap();
        assert!(!writer.end());

        let rows = vec![vec![Datum::Int(1), Datum::Int(10)]];
        writer.write_batch(&[table(rows)]).unwrap();
        // Header alone is past eight bytes.
        assert!(writer.end());
        assert!(budget.exceeded());
    }

    #[test]
    fn test_missing_partition_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(DiskBudget::new(None));
        let mut writer = BatchWriter::new(dir.path(), CodecKind::Binary, budget).unwrap();
        writer.write_batch(&[table(vec![])]).unwrap();

        let partitions = writer.take_partitions();
        assert!(partitions[0]
            .open_cursor("absent", CodecKind::Binary)
            .is_err());
    }
}
