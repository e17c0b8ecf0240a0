//! Primer anchoring and barcode demultiplexing
//!
//! Anchors the configured 5' and 3' primers in a (stitched) read with a
//! bounded number of mismatches, validates the randomized region between
//! them, and, when the experiment's cycles carry barcodes, identifies
//! the cycle whose barcodes flank the primers. Per-read failures are
//! returned as `RejectionReason`s, never as errors.

use crate::core::data_structures::{mean_phred, RejectionReason};

/// Matching thresholds, taken from the parser configuration.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// 5' primer bases (may be empty when the library carries none)
    pub primer5: Vec<u8>,
    /// 3' primer bases (may be empty)
    pub primer3: Vec<u8>,
    /// Mismatches tolerated when anchoring a primer
    pub tolerance: usize,
    /// Mismatches tolerated when matching one barcode
    pub barcode_tolerance: usize,
    /// The 5' primer must start within this many leading bases
    pub max_leading: usize,
    /// The 3' primer must start within this many trailing bases
    pub max_trailing: usize,
    /// Admissible randomized-region length range
    pub min_randomized: usize,
    pub max_randomized: usize,
    /// Minimum mean phred over the randomized region
    pub min_mean_quality: f64,
}

/// Barcodes of one configured cycle, referenced by its index in the
/// experiment's cycle list.
#[derive(Debug, Clone)]
pub struct CycleBarcodes {
    pub cycle_index: usize,
    pub barcode5: Option<Vec<u8>>,
    pub barcode3: Option<Vec<u8>>,
}

impl CycleBarcodes {
    fn has_barcodes(&self) -> bool {
        self.barcode5.is_some() || self.barcode3.is_some()
    }
}

/// A demultiplexed read ready for registration: the sequence trimmed to
/// the primer span (barcodes removed), with the primer lengths recorded
/// so the pool can derive the randomized-region bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct DemuxResult {
    pub sequence: Vec<u8>,
    pub quality: Vec<u8>,
    pub primer5_trim: u32,
    pub primer3_trim: u32,
    /// Index of the matched cycle, when barcode demultiplexing applied
    pub cycle_index: Option<usize>,
}

pub struct PrimerMatcher {
    config: MatcherConfig,
    cycles: Vec<CycleBarcodes>,
    any_barcodes: bool,
}

impl PrimerMatcher {
    pub fn new(config: MatcherConfig, cycles: Vec<CycleBarcodes>) -> Self {
        let any_barcodes = cycles.iter().any(CycleBarcodes::has_barcodes);
        Self {
            config,
            cycles,
            any_barcodes,
        }
    }

    /// Anchor primers, check the randomized region, and resolve the
    /// cycle by barcodes when any are configured.
    pub fn demultiplex(
        &self,
        sequence: &[u8],
        quality: &[u8],
    ) -> Result<DemuxResult, RejectionReason> {
        let len = sequence.len();
        let p5 = &self.config.primer5;
        let p3 = &self.config.primer3;

        // 5' primer: best match among the leading positions, leftmost on ties.
        let (p5_pos, p5_end) = if p5.is_empty() {
            (0, 0)
        } else {
            if len < p5.len() {
                return Err(RejectionReason::PrimerUnmatched);
            }
            let last_start = self.config.max_leading.min(len - p5.len());
            let pos = best_match(sequence, p5, (0..=last_start).collect(), self.config.tolerance)
                .ok_or(RejectionReason::PrimerUnmatched)?;
            (pos, pos + p5.len())
        };

        // 3' primer: best match among the trailing positions after the 5'
        // primer, rightmost on ties.
        let p3_pos = if p3.is_empty() {
            len
        } else {
            if len < p3.len() || len - p3.len() < p5_end {
                return Err(RejectionReason::PrimerUnmatched);
            }
            let first_start = p5_end.max(len.saturating_sub(self.config.max_trailing));
            let last_start = len - p3.len();
            if first_start > last_start {
                return Err(RejectionReason::PrimerUnmatched);
            }
            best_match(
                sequence,
                p3,
                (first_start..=last_start).rev().collect(),
                self.config.tolerance,
            )
            .ok_or(RejectionReason::PrimerUnmatched)?
        };

        let randomized_len = p3_pos - p5_end;
        if randomized_len < self.config.min_randomized {
            return Err(RejectionReason::TooShort);
        }
        if randomized_len > self.config.max_randomized {
            return Err(RejectionReason::TooLong);
        }

        let cycle_index = if self.any_barcodes {
            Some(self.match_barcodes(sequence, p5_pos, p3_pos + p3.len())?)
        } else {
            None
        };

        if mean_phred(&quality[p5_end..p3_pos]) < self.config.min_mean_quality {
            return Err(RejectionReason::QualityTooLow);
        }

        let span = p5_pos..p3_pos + p3.len();
        Ok(DemuxResult {
            sequence: sequence[span.clone()].to_vec(),
            quality: quality[span].to_vec(),
            primer5_trim: p5.len() as u32,
            primer3_trim: p3.len() as u32,
            cycle_index,
        })
    }

    /// Identify the unique cycle whose configured barcodes flank the
    /// primer span `[p5_pos, p3_end)`.
    fn match_barcodes(
        &self,
        sequence: &[u8],
        p5_pos: usize,
        p3_end: usize,
    ) -> Result<usize, RejectionReason> {
        let mut matched: Option<usize> = None;

        for cycle in self.cycles.iter().filter(|c| c.has_barcodes()) {
            if !self.barcode5_matches(sequence, p5_pos, cycle.barcode5.as_deref()) {
                continue;
            }
            if !self.barcode3_matches(sequence, p3_end, cycle.barcode3.as_deref()) {
                continue;
            }
            if matched.is_some() {
                return Err(RejectionReason::BarcodeCollision);
            }
            matched = Some(cycle.cycle_index);
        }

        matched.ok_or(RejectionReason::BarcodeUnmatched)
    }

    fn barcode5_matches(&self, sequence: &[u8], p5_pos: usize, barcode: Option<&[u8]>) -> bool {
        match barcode {
            None => true,
            Some(bc) => {
                p5_pos >= bc.len()
                    && hamming_within(
                        &sequence[p5_pos - bc.len()..p5_pos],
                        bc,
                        self.config.barcode_tolerance,
                    )
            }
        }
    }

    fn barcode3_matches(&self, sequence: &[u8], p3_end: usize, barcode: Option<&[u8]>) -> bool {
        match barcode {
            None => true,
            Some(bc) => {
                p3_end + bc.len() <= sequence.len()
                    && hamming_within(
                        &sequence[p3_end..p3_end + bc.len()],
                        bc,
                        self.config.barcode_tolerance,
                    )
            }
        }
    }
}

/// Position with the fewest mismatches among the candidates, honoring
/// the candidate order on ties. `None` when nothing is within tolerance.
fn best_match(
    sequence: &[u8],
    pattern: &[u8],
    candidates: Vec<usize>,
    tolerance: usize,
) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None; // (mismatches, position)
    for pos in candidates {
        if pos + pattern.len() > sequence.len() {
            continue;
        }
        let mismatches = sequence[pos..pos + pattern.len()]
            .iter()
            .zip(pattern)
            .filter(|(a, b)| a != b)
            .count();
        if mismatches > tolerance {
            continue;
        }
        match best {
            Some((best_mismatches, _)) if mismatches >= best_mismatches => {}
            _ => best = Some((mismatches, pos)),
        }
        if mismatches == 0 {
            break;
        }
    }
    best.map(|(_, pos)| pos)
}

fn hamming_within(a: &[u8], b: &[u8], tolerance: usize) -> bool {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).filter(|(x, y)| x != y).count() <= tolerance
}
