//! Paired-end stitching
//!
//! Merges a forward read with the reverse complement of its mate by the
//! best overlap between the 3' end of the forward read and the 5' end of
//! the reverse-complemented mate. Candidate overlaps are scanned from
//! longest to shortest and scored by mismatch count, so the longest
//! overlap wins among equals.

use crate::core::data_structures::reverse_complement;

/// Stitching constraints.
#[derive(Debug, Clone)]
pub struct StitchConfig {
    /// Shortest admissible overlap
    pub min_overlap: usize,
    /// Highest admissible mismatch fraction within the overlap
    pub max_mismatch_rate: f64,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            min_overlap: 10,
            max_mismatch_rate: 0.1,
        }
    }
}

/// A successfully stitched read pair.
#[derive(Debug, Clone)]
pub struct StitchedRead {
    pub sequence: Vec<u8>,
    pub quality: Vec<u8>,
    pub overlap: usize,
    pub mismatches: usize,
}

/// Stitch a mate pair, or return `None` when no overlap satisfies the
/// constraints. Within the overlap, each column takes the base of higher
/// phred quality, keeping the forward base on ties.
pub fn stitch(
    forward: &[u8],
    forward_quality: &[u8],
    reverse: &[u8],
    reverse_quality: &[u8],
    config: &StitchConfig,
) -> Option<StitchedRead> {
    if forward.is_empty() || reverse.is_empty() {
        return None;
    }
    debug_assert_eq!(forward.len(), forward_quality.len());
    debug_assert_eq!(reverse.len(), reverse_quality.len());

    let mate = reverse_complement(reverse);
    let mate_quality: Vec<u8> = reverse_quality.iter().rev().copied().collect();

    let longest = forward.len().min(mate.len());
    if longest < config.min_overlap {
        return None;
    }

    let mut best: Option<(usize, usize)> = None; // (mismatches, overlap)
    for overlap in (config.min_overlap..=longest).rev() {
        let forward_start = forward.len() - overlap;
        let mismatches = forward[forward_start..]
            .iter()
            .zip(&mate[..overlap])
            .filter(|(a, b)| a != b)
            .count();

        if mismatches as f64 <= config.max_mismatch_rate * overlap as f64 {
            match best {
                Some((best_mismatches, _)) if mismatches >= best_mismatches => {}
                _ => best = Some((mismatches, overlap)),
            }
        }
    }

    let (mismatches, overlap) = best?;
    let forward_start = forward.len() - overlap;

    let mut sequence = forward[..forward_start].to_vec();
    let mut quality = forward_quality[..forward_start].to_vec();

    for column in 0..overlap {
        let forward_base = forward[forward_start + column];
        let forward_phred = forward_quality[forward_start + column];
        let mate_base = mate[column];
        let mate_phred = mate_quality[column];

        if forward_base == mate_base || forward_phred >= mate_phred {
            sequence.push(forward_base);
        } else {
            sequence.push(mate_base);
        }
        quality.push(forward_phred.max(mate_phred));
    }

    sequence.extend_from_slice(&mate[overlap..]);
    quality.extend_from_slice(&mate_quality[overlap..]);

    Some(StitchedRead {
        sequence,
        quality,
        overlap,
        mismatches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quals(len: usize) -> Vec<u8> {
        vec![b'I'; len]
    }

    #[test]
    fn test_fully_overlapping_pair() {
        // Mate is the exact reverse complement of the forward read.
        let forward = b"ACGTACGTAA";
        let reverse = b"TTACGTACGT";
        let config = StitchConfig {
            min_overlap: 6,
            max_mismatch_rate: 0.0,
        };

        let result = stitch(forward, &quals(10), reverse, &quals(10), &config).unwrap();
        assert_eq!(result.sequence, b"ACGTACGTAA");
        assert_eq!(result.overlap, 10);
        assert_eq!(result.mismatches, 0);
    }

    #[test]
    fn test_partial_overlap_extends_the_read() {
        // forward:      ACGTACGTCC
        // rc(reverse):      ACGTCCGGTT  (overlap of 6: "ACGTCC")
        let forward = b"ACGTACGTCC";
        let mate = b"ACGTCCGGTT";
        let reverse = reverse_complement(mate);
        let config = StitchConfig {
            min_overlap: 4,
            max_mismatch_rate: 0.0,
        };

        let result = stitch(forward, &quals(10), &reverse, &quals(10), &config).unwrap();
        assert_eq!(result.sequence, b"ACGTACGTCCGGTT");
        assert_eq!(result.overlap, 6);
    }

    #[test]
    fn test_no_overlap_is_rejected() {
        let forward = b"AAAAAAAAAA";
        let reverse = b"CCCCCCCCCC"; // rc = GGGGGGGGGG, no agreement
        let config = StitchConfig {
            min_overlap: 4,
            max_mismatch_rate: 0.0,
        };

        assert!(stitch(forward, &quals(10), reverse, &quals(10), &config).is_none());
    }

    #[test]
    fn test_min_overlap_is_enforced() {
        let forward = b"ACGTACGTAA";
        let reverse = b"TTACGTACGT";
        let config = StitchConfig {
            min_overlap: 11, // longer than both reads
            max_mismatch_rate: 0.0,
        };

        assert!(stitch(forward, &quals(10), reverse, &quals(10), &config).is_none());
    }

    #[test]
    fn test_consensus_takes_higher_quality_base() {
        // One mismatch inside the overlap; the mate base carries the
        // higher phred and must win its column.
        let forward = b"ACGTACGTAA";
        let mut mate = b"ACGTACGTAA".to_vec();
        mate[4] = b'G'; // disagree at column 4
        let reverse = reverse_complement(&mate);

        let forward_quality = vec![b'#'; 10]; // Q2
        let reverse_quality = vec![b'I'; 10]; // Q40

        let config = StitchConfig {
            min_overlap: 6,
            max_mismatch_rate: 0.2,
        };
        let result = stitch(forward, &forward_quality, &reverse, &reverse_quality, &config).unwrap();
        assert_eq!(result.sequence[4], b'G');
        assert_eq!(result.mismatches, 1);
    }

    #[test]
    fn test_tie_keeps_forward_base() {
        let forward = b"ACGTACGTAA";
        let mut mate = b"ACGTACGTAA".to_vec();
        mate[4] = b'G';
        let reverse = reverse_complement(&mate);

        let config = StitchConfig {
            min_overlap: 6,
            max_mismatch_rate: 0.2,
        };
        // Equal qualities on both sides: forward wins.
        let result = stitch(forward, &quals(10), &reverse, &quals(10), &config).unwrap();
        assert_eq!(result.sequence[4], b'A');
    }

    #[test]
    fn test_reverse_complement_roundtrip_property() {
        // Stitching F with rc(F) must reconstruct F exactly.
        for seq in [b"ACGTACGTACGTACGT".as_ref(), b"GGGGAAAATTTTCCCC"] {
            let reverse = reverse_complement(seq);
            let config = StitchConfig {
                min_overlap: 8,
                max_mismatch_rate: 0.0,
            };
            let result =
                stitch(seq, &quals(seq.len()), &reverse, &quals(seq.len()), &config).unwrap();
            assert_eq!(result.sequence, seq);
        }
    }
}
