//! Core data structures shared across the parsing and prediction pipelines.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// ASCII offset of Sanger/Illumina 1.8+ phred quality encoding.
pub const PHRED_OFFSET: u8 = 33;

/// One raw sequencing read in flight between the producer and the
/// consumers. Forward and reverse are as they appear in the input files;
/// reverse is absent for single-end runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencingRead {
    /// Forward read bases
    pub forward: Vec<u8>,
    /// Forward phred qualities (ASCII encoded, same length as `forward`)
    pub forward_quality: Vec<u8>,
    /// Reverse read bases, if paired-end
    pub reverse: Option<Vec<u8>>,
    /// Reverse phred qualities, if paired-end
    pub reverse_quality: Option<Vec<u8>>,
    /// Index (in the experiment's cycle list) of the cycle this read was
    /// assigned to before demultiplexing (per-file mode)
    pub selection_cycle: Option<usize>,
    /// Set by downstream stages when the read matches a known contaminant
    pub contaminated: bool,
}

impl SequencingRead {
    pub fn single_end(forward: Vec<u8>, forward_quality: Vec<u8>) -> Self {
        Self {
            forward,
            forward_quality,
            reverse: None,
            reverse_quality: None,
            selection_cycle: None,
            contaminated: false,
        }
    }

    pub fn paired_end(
        forward: Vec<u8>,
        forward_quality: Vec<u8>,
        reverse: Vec<u8>,
        reverse_quality: Vec<u8>,
    ) -> Self {
        Self {
            forward,
            forward_quality,
            reverse: Some(reverse),
            reverse_quality: Some(reverse_quality),
            selection_cycle: None,
            contaminated: false,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.reverse.is_some()
    }
}

/// Input file formats the reader factory can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileFormat {
    Fastq,
    Fasta,
    Unknown,
}

impl FileFormat {
    /// Detect the format from the file extension, looking through a
    /// trailing `.gz`. Compression itself is detected from magic bytes at
    /// open time, not from the name.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let effective = if extension.eq_ignore_ascii_case("gz") {
            path.file_stem()
                .map(Path::new)
                .and_then(|stem| stem.extension())
                .and_then(|e| e.to_str())
                .unwrap_or("")
        } else {
            extension
        };

        match effective.to_ascii_lowercase().as_str() {
            "fastq" | "fq" => FileFormat::Fastq,
            "fasta" | "fa" | "fas" => FileFormat::Fasta,
            _ => FileFormat::Unknown,
        }
    }
}

/// Why a read was dropped by the pipeline. Per-read failures are data,
/// not errors: the driver aggregates them into a histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionReason {
    /// Record could not be parsed into a read
    Malformed,
    /// No mate-pair overlap satisfied the stitching constraints
    NoOverlap,
    /// 5' or 3' primer not found within tolerance
    PrimerUnmatched,
    /// No cycle's barcodes matched the flanking regions
    BarcodeUnmatched,
    /// More than one cycle's barcodes matched
    BarcodeCollision,
    /// Mean phred of the randomized region below threshold
    QualityTooLow,
    /// Randomized region shorter than the configured minimum
    TooShort,
    /// Randomized region longer than the configured maximum
    TooLong,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RejectionReason::Malformed => "malformed record",
            RejectionReason::NoOverlap => "no mate overlap",
            RejectionReason::PrimerUnmatched => "primer unmatched",
            RejectionReason::BarcodeUnmatched => "barcode unmatched",
            RejectionReason::BarcodeCollision => "barcode collision",
            RejectionReason::QualityTooLow => "quality too low",
            RejectionReason::TooShort => "randomized region too short",
            RejectionReason::TooLong => "randomized region too long",
        };
        f.write_str(label)
    }
}

pub fn complement(base: u8) -> u8 {
    match base {
        b'A' | b'a' => b'T',
        b'C' | b'c' => b'G',
        b'G' | b'g' => b'C',
        b'T' | b't' => b'A',
        b'U' | b'u' => b'A',
        other => other,
    }
}

pub fn reverse_complement(sequence: &[u8]) -> Vec<u8> {
    sequence.iter().rev().map(|&b| complement(b)).collect()
}

/// Mean phred score of an ASCII-encoded quality string.
pub fn mean_phred(quality: &[u8]) -> f64 {
    if quality.is_empty() {
        return 0.0;
    }
    let total: u64 = quality
        .iter()
        .map(|&q| q.saturating_sub(PHRED_OFFSET) as u64)
        .sum();
    total as f64 / quality.len() as f64
}

pub fn is_valid_nucleotides(sequence: &[u8]) -> bool {
    sequence
        .iter()
        .all(|&b| matches!(b, b'A' | b'C' | b'G' | b'T'))
}
