//! Export formatters for pools and selection cycles.
//!
//! Formatters consume `(id, sequence, bounds)` tuples; the writers walk
//! the pool (unique aptamers) or a cycle (each aptamer repeated by its
//! cardinality). Output paths ending in `.gz` are gzip-compressed.

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

use crate::pool::{AptamerPool, SelectionCycle};

/// Maximum characters per FASTA sequence line, per the NCBI guideline.
const FASTA_LINE_WIDTH: usize = 80;

/// Renders one aptamer record as text.
pub trait ExportFormat {
    fn format_record(&self, id: u32, sequence: &[u8], bounds: Option<(u32, u32)>) -> String;
}

/// FASTA formatter. With `with_primers` unset, only the randomized
/// region between the recorded bounds is written.
pub struct FastaExport {
    name: String,
    with_primers: bool,
}

impl FastaExport {
    pub fn new(name: &str, with_primers: bool) -> Self {
        Self {
            name: name.to_string(),
            with_primers,
        }
    }
}

impl ExportFormat for FastaExport {
    fn format_record(&self, id: u32, sequence: &[u8], bounds: Option<(u32, u32)>) -> String {
        let (start, end) = match (self.with_primers, bounds) {
            (false, Some((start, end))) => (start as usize, end as usize),
            _ => (0, sequence.len()),
        };
        let region = &sequence[start..end.min(sequence.len())];

        let mut out = format!(
            ">AptaForge_{id}|{}|length={}\n",
            self.name,
            region.len()
        );
        for chunk in region.chunks(FASTA_LINE_WIDTH) {
            out.push_str(&String::from_utf8_lossy(chunk));
            out.push('\n');
        }
        out
    }
}

/// Open an output file, gzip-compressing when the name ends in `.gz`.
pub fn create_output<P: AsRef<Path>>(path: P) -> Result<Box<dyn Write>> {
    let path = path.as_ref();
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let writer: Box<dyn Write> = if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("gz"))
    {
        Box::new(BufWriter::new(GzEncoder::new(file, Compression::default())))
    } else {
        Box::new(BufWriter::new(file))
    };
    Ok(writer)
}

/// Write every unique aptamer of the pool. Returns the record count.
pub fn export_pool<W: Write + ?Sized>(
    pool: &AptamerPool,
    format: &dyn ExportFormat,
    writer: &mut W,
) -> Result<u64> {
    let mut written = 0u64;
    pool.for_each(|id, sequence| {
        let bounds = pool.bounds_of(id)?;
        writer.write_all(format.format_record(id, sequence, bounds).as_bytes())?;
        written += 1;
        Ok(())
    })?;
    info!("exported {written} aptamers from the pool");
    Ok(written)
}

/// Write a selection cycle's multiset: each aptamer appears as many
/// times as it was sequenced in that cycle.
pub fn export_cycle<W: Write + ?Sized>(
    cycle: &SelectionCycle,
    pool: &AptamerPool,
    format: &dyn ExportFormat,
    writer: &mut W,
) -> Result<u64> {
    let mut written = 0u64;
    cycle.for_each(|id, count| {
        let sequence = pool
            .sequence_of(id)?
            .with_context(|| format!("cycle references unknown aptamer id {id}"))?;
        let bounds = pool.bounds_of(id)?;
        let record = format.format_record(id, &sequence, bounds);
        for _ in 0..count {
            writer.write_all(record.as_bytes())?;
            written += 1;
        }
        Ok(())
    })?;
    info!("exported {written} reads from cycle {}", cycle.name());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fasta_record_with_and_without_primers() {
        let format = FastaExport::new("pool", true);
        let record = format.format_record(7, b"AAACGTCGTTT", Some((3, 8)));
        assert_eq!(record, ">AptaForge_7|pool|length=11\nAAACGTCGTTT\n");

        let format = FastaExport::new("pool", false);
        let record = format.format_record(7, b"AAACGTCGTTT", Some((3, 8)));
        assert_eq!(record, ">AptaForge_7|pool|length=5\nCGTCG\n");
    }

    #[test]
    fn test_long_sequences_wrap_at_80() {
        let format = FastaExport::new("pool", true);
        let sequence = vec![b'A'; 200];
        let record = format.format_record(0, &sequence, None);
        let lines: Vec<&str> = record.lines().collect();
        assert_eq!(lines.len(), 4); // header + 80 + 80 + 40
        assert_eq!(lines[1].len(), 80);
        assert_eq!(lines[3].len(), 40);
    }

    #[test]
    fn test_cycle_export_repeats_by_cardinality() {
        let dir = TempDir::new().unwrap();
        let pool = AptamerPool::open(dir.path(), 10_000, 0.001).unwrap();
        let cycle = SelectionCycle::open(
            dir.path(),
            "R1",
            1,
            None,
            None,
            false,
            false,
            10_000,
            0.001,
        )
        .unwrap();
        cycle.add(&pool, b"AAAA").unwrap();
        cycle.add(&pool, b"AAAA").unwrap();
        cycle.add(&pool, b"CCCC").unwrap();

        let format = FastaExport::new("R1", true);
        let mut out = Vec::new();
        let written = export_cycle(&cycle, &pool, &format, &mut out).unwrap();

        assert_eq!(written, 3);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("AAAA").count(), 2);
        assert_eq!(text.matches("CCCC").count(), 1);
    }

    #[test]
    fn test_pool_export_is_unique_and_ordered() {
        let dir = TempDir::new().unwrap();
        let pool = AptamerPool::open(dir.path(), 10_000, 0.001).unwrap();
        pool.register(b"TTTT", 0, 0).unwrap();
        pool.register(b"AAAA", 0, 0).unwrap();
        pool.register(b"TTTT", 0, 0).unwrap();

        let format = FastaExport::new("pool", true);
        let mut out = Vec::new();
        let written = export_pool(&pool, &format, &mut out).unwrap();

        assert_eq!(written, 2);
        let text = String::from_utf8(out).unwrap();
        let first = text.find("AptaForge_0").unwrap();
        let second = text.find("AptaForge_1").unwrap();
        assert!(first < second);
    }
}
