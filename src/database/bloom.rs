//! Counting Bloom filter used as a fast-reject gate in front of store lookups.
//!
//! Cells are atomic counters, so concurrent `add`/`maybe_contains` calls
//! need no external locking. Hashing is double hashing over two ahash
//! states with fixed seeds, keeping cell indices stable across runs and
//! across serialization.

use ahash::RandomState;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::hash::{BuildHasher, Hash};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use tracing::debug;

// Fixed seeds: cell indices must be identical when a snapshot is reloaded.
const SEED_A: (u64, u64, u64, u64) = (0x5143_a1c3, 0x9e37_79b9, 0x85eb_ca6b, 0xc2b2_ae35);
const SEED_B: (u64, u64, u64, u64) = (0x27d4_eb2f, 0x1656_67b1, 0xff51_afd7, 0xc4ce_b9fe);

/// Counting Bloom filter sized from an expected capacity and a target
/// false-positive rate. Guarantees zero false negatives; the
/// false-positive rate holds while the live count stays within capacity.
pub struct CountingBloomFilter {
    capacity: usize,
    fp_rate: f64,
    num_cells: usize,
    num_hashes: u32,
    cells: Vec<AtomicU16>,
    items: AtomicU64,
    state_a: RandomState,
    state_b: RandomState,
}

/// Plain-data snapshot written to `.bloom` files via bincode.
#[derive(Serialize, Deserialize)]
struct BloomSnapshot {
    capacity: usize,
    fp_rate: f64,
    num_cells: usize,
    num_hashes: u32,
    items: u64,
    counts: Vec<u16>,
}

impl CountingBloomFilter {
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let fp_rate = fp_rate.clamp(1e-12, 0.5);

        let ln2 = std::f64::consts::LN_2;
        let num_cells = ((-(capacity as f64) * fp_rate.ln()) / (ln2 * ln2)).ceil() as usize;
        let num_cells = num_cells.max(8);
        let num_hashes = (((num_cells as f64 / capacity as f64) * ln2).round() as u32).clamp(1, 16);

        debug!(
            "bloom filter: capacity={capacity} fp_rate={fp_rate} cells={num_cells} hashes={num_hashes}"
        );

        let cells = (0..num_cells).map(|_| AtomicU16::new(0)).collect();

        Self {
            capacity,
            fp_rate,
            num_cells,
            num_hashes,
            cells,
            items: AtomicU64::new(0),
            state_a: RandomState::with_seeds(SEED_A.0, SEED_A.1, SEED_A.2, SEED_A.3),
            state_b: RandomState::with_seeds(SEED_B.0, SEED_B.1, SEED_B.2, SEED_B.3),
        }
    }

    pub fn add<T: Hash>(&self, item: &T) {
        let (h1, h2) = self.hash_pair(item);
        for i in 0..self.num_hashes as u64 {
            let idx = self.cell_index(h1, h2, i);
            // Saturating: cells pin at u16::MAX and never wrap.
            let _ = self.cells[idx].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                if c == u16::MAX {
                    None
                } else {
                    Some(c + 1)
                }
            });
        }
        self.items.fetch_add(1, Ordering::Relaxed);
    }

    pub fn maybe_contains<T: Hash>(&self, item: &T) -> bool {
        let (h1, h2) = self.hash_pair(item);
        (0..self.num_hashes as u64)
            .all(|i| self.cells[self.cell_index(h1, h2, i)].load(Ordering::Relaxed) > 0)
    }

    /// Number of `add` calls so far (not distinct items).
    pub fn items(&self) -> u64 {
        self.items.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn target_fp_rate(&self) -> f64 {
        self.fp_rate
    }

    fn hash_pair<T: Hash>(&self, item: &T) -> (u64, u64) {
        (self.state_a.hash_one(item), self.state_b.hash_one(item))
    }

    fn cell_index(&self, h1: u64, h2: u64, i: u64) -> usize {
        (h1.wrapping_add(i.wrapping_mul(h2)) % self.num_cells as u64) as usize
    }

    /// Write a snapshot of the filter state.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let snapshot = BloomSnapshot {
            capacity: self.capacity,
            fp_rate: self.fp_rate,
            num_cells: self.num_cells,
            num_hashes: self.num_hashes,
            items: self.items.load(Ordering::Relaxed),
            counts: self.cells.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
        };
        let file = File::create(path)
            .with_context(|| format!("failed to create bloom file {}", path.display()))?;
        bincode::serialize_into(BufWriter::new(file), &snapshot)
            .with_context(|| format!("failed to serialize bloom file {}", path.display()))
    }

    /// Restore a filter from a snapshot written by [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open bloom file {}", path.display()))?;
        let snapshot: BloomSnapshot = bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("failed to deserialize bloom file {}", path.display()))?;

        let cells = snapshot.counts.into_iter().map(AtomicU16::new).collect();
        Ok(Self {
            capacity: snapshot.capacity,
            fp_rate: snapshot.fp_rate,
            num_cells: snapshot.num_cells,
            num_hashes: snapshot.num_hashes,
            cells,
            items: AtomicU64::new(snapshot.items),
            state_a: RandomState::with_seeds(SEED_A.0, SEED_A.1, SEED_A.2, SEED_A.3),
            state_b: RandomState::with_seeds(SEED_B.0, SEED_B.1, SEED_B.2, SEED_B.3),
        })
    }
}
