//! Selection cycle: the multiset of aptamers sequenced in one SELEX round.
//!
//! Backed by a persistent `id -> count` store under `cycledata/` with a
//! Bloom-filter fast path for the common "first time seen" case. Cached
//! totals (`size`, `unique_size`) are rebuilt from the store on reopen.

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::database::bloom::CountingBloomFilter;
use crate::database::store::{MappedStore, U32Key, U32Value};
use crate::pool::aptamer_pool::AptamerPool;

/// One selection cycle. Counts only ever increase; there are no deletions.
pub struct SelectionCycle {
    name: String,
    round: usize,
    barcode5: Option<Vec<u8>>,
    barcode3: Option<Vec<u8>>,
    is_control: bool,
    is_counter: bool,
    counts: RwLock<MappedStore<U32Key, U32Value>>,
    bloom: CountingBloomFilter,
    bloom_path: PathBuf,
    size: AtomicU64,
    unique_size: AtomicU64,
    write_lock: Mutex<()>,
}

impl SelectionCycle {
    /// Open (or create) the cycle's store and Bloom filter under
    /// `<project>/cycledata/{round}_{name}.store|.bloom`.
    #[allow(clippy::too_many_arguments)]
    pub fn open<P: AsRef<Path>>(
        project_path: P,
        name: &str,
        round: usize,
        barcode5: Option<Vec<u8>>,
        barcode3: Option<Vec<u8>>,
        is_control: bool,
        is_counter: bool,
        bloom_capacity: usize,
        bloom_fp_rate: f64,
    ) -> Result<Self> {
        let dir = project_path.as_ref().join("cycledata");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let store_path = dir.join(format!("{round}_{name}.store"));
        let bloom_path = dir.join(format!("{round}_{name}.bloom"));
        let existing = store_path.exists();

        let counts: MappedStore<U32Key, U32Value> = MappedStore::open(&store_path)?;

        // Rebuild the cached totals from the persisted map; load the
        // Bloom snapshot when present, else repopulate it from the keys.
        let bloom_from_snapshot = bloom_path.exists();
        let bloom = if bloom_from_snapshot {
            CountingBloomFilter::load(&bloom_path)?
        } else {
            CountingBloomFilter::new(bloom_capacity, bloom_fp_rate)
        };

        let mut size = 0u64;
        for entry in counts.range_iter() {
            let (id, count) = entry?;
            if !bloom_from_snapshot {
                bloom.add(&id);
            }
            size += count as u64;
        }
        let unique_size = counts.len() as u64;

        if existing {
            info!("found selection cycle {name} (round {round}) on disk, {unique_size} unique aptamers");
        } else {
            info!("created new selection cycle {name} (round {round}) at {}", store_path.display());
        }

        Ok(Self {
            name: name.to_string(),
            round,
            barcode5,
            barcode3,
            is_control,
            is_counter,
            counts: RwLock::new(counts),
            bloom,
            bloom_path,
            size: AtomicU64::new(size),
            unique_size: AtomicU64::new(unique_size),
            write_lock: Mutex::new(()),
        })
    }

    /// Register a sequence with the pool (full-length randomized region)
    /// and count it in this cycle.
    pub fn add(&self, pool: &AptamerPool, sequence: &[u8]) -> Result<u32> {
        self.add_with_bounds(pool, sequence, 0, 0)
    }

    /// Register a sequence with explicit primer trims and count it here.
    pub fn add_with_bounds(
        &self,
        pool: &AptamerPool,
        sequence: &[u8],
        primer5_trim: u32,
        primer3_trim: u32,
    ) -> Result<u32> {
        let id = pool.register(sequence, primer5_trim, primer3_trim)?;
        self.add_id(id)?;
        Ok(id)
    }

    /// Count one occurrence of an already-registered id.
    pub fn add_id(&self, id: u32) -> Result<()> {
        let _guard = self.write_lock.lock();

        self.size.fetch_add(1, Ordering::Relaxed);

        if !self.bloom.maybe_contains(&id) {
            // No false negatives: the id is definitely new to this cycle.
            self.unique_size.fetch_add(1, Ordering::Relaxed);
            self.counts.write().put(id, 1);
            self.bloom.add(&id);
            return Ok(());
        }

        // Bloom hit: verify against the store to tolerate false positives.
        let current = self.counts.read().get(&id)?.unwrap_or(0);
        if current == 0 {
            self.unique_size.fetch_add(1, Ordering::Relaxed);
        }
        self.counts.write().put(id, current + 1);
        Ok(())
    }

    /// Whether the given sequence was counted in this cycle.
    pub fn contains(&self, pool: &AptamerPool, sequence: &[u8]) -> Result<bool> {
        match pool.identifier_of(sequence)? {
            Some(id) => Ok(self.count_of_id(id)? > 0),
            None => Ok(false),
        }
    }

    /// Cardinality of a sequence in this cycle (0 when absent).
    pub fn count_of(&self, pool: &AptamerPool, sequence: &[u8]) -> Result<u32> {
        match pool.identifier_of(sequence)? {
            Some(id) => self.count_of_id(id),
            None => Ok(0),
        }
    }

    pub fn count_of_id(&self, id: u32) -> Result<u32> {
        if !self.bloom.maybe_contains(&id) {
            return Ok(0);
        }
        Ok(self.counts.read().get(&id)?.unwrap_or(0))
    }

    /// Visit `(id, count)` pairs in ascending id order.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(u32, u32) -> Result<()>,
    {
        let store = self.counts.read();
        for entry in store.range_iter() {
            let (id, count) = entry?;
            f(id, count)?;
        }
        Ok(())
    }

    /// Total number of aptamer molecules counted in this cycle.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of distinct aptamers counted in this cycle.
    pub fn unique_size(&self) -> u64 {
        self.unique_size.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn round(&self) -> usize {
        self.round
    }

    pub fn barcode5(&self) -> Option<&[u8]> {
        self.barcode5.as_deref()
    }

    pub fn barcode3(&self) -> Option<&[u8]> {
        self.barcode3.as_deref()
    }

    pub fn is_control(&self) -> bool {
        self.is_control
    }

    pub fn is_counter(&self) -> bool {
        self.is_counter
    }

    pub fn flush(&self) -> Result<()> {
        self.counts.write().flush()?;
        self.bloom.save(&self.bloom_path)?;
        Ok(())
    }
}

impl std::fmt::Display for SelectionCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_cycle(dir: &TempDir, name: &str, round: usize) -> SelectionCycle {
        SelectionCycle::open(dir.path(), name, round, None, None, false, false, 10_000, 0.001)
            .unwrap()
    }

    #[test]
    fn test_counts_and_totals() {
        let dir = TempDir::new().unwrap();
        let pool = AptamerPool::open(dir.path(), 10_000, 0.001).unwrap();
        let cycle = open_cycle(&dir, "R1", 1);

        cycle.add(&pool, b"AAA").unwrap();
        cycle.add(&pool, b"AAA").unwrap();
        cycle.add(&pool, b"CCC").unwrap();

        assert_eq!(cycle.size(), 3);
        assert_eq!(cycle.unique_size(), 2);
        assert_eq!(cycle.count_of(&pool, b"AAA").unwrap(), 2);
        assert_eq!(cycle.count_of(&pool, b"CCC").unwrap(), 1);
        assert_eq!(cycle.count_of(&pool, b"GGG").unwrap(), 0);
        assert!(cycle.contains(&pool, b"AAA").unwrap());
        assert!(!cycle.contains(&pool, b"GGG").unwrap());
    }

    #[test]
    fn test_totals_match_store_contents() {
        let dir = TempDir::new().unwrap();
        let pool = AptamerPool::open(dir.path(), 10_000, 0.001).unwrap();
        let cycle = open_cycle(&dir, "R2", 2);

        for seq in [b"AAAA".as_ref(), b"CCCC", b"AAAA", b"GGGG", b"AAAA"] {
            cycle.add(&pool, seq).unwrap();
        }

        let mut total = 0u64;
        let mut unique = 0u64;
        cycle
            .for_each(|_, count| {
                total += count as u64;
                unique += 1;
                Ok(())
            })
            .unwrap();

        assert_eq!(cycle.size(), total);
        assert_eq!(cycle.unique_size(), unique);
    }

    #[test]
    fn test_reopen_rebuilds_totals() {
        let dir = TempDir::new().unwrap();
        let pool = AptamerPool::open(dir.path(), 10_000, 0.001).unwrap();
        {
            let cycle = open_cycle(&dir, "R1", 1);
            cycle.add(&pool, b"AAA").unwrap();
            cycle.add(&pool, b"AAA").unwrap();
            cycle.add(&pool, b"CCC").unwrap();
            cycle.flush().unwrap();
        }

        let cycle = open_cycle(&dir, "R1", 1);
        assert_eq!(cycle.size(), 3);
        assert_eq!(cycle.unique_size(), 2);
        assert_eq!(cycle.count_of(&pool, b"AAA").unwrap(), 2);
    }

    #[test]
    fn test_display_matches_name_and_size() {
        let dir = TempDir::new().unwrap();
        let pool = AptamerPool::open(dir.path(), 10_000, 0.001).unwrap();
        let cycle = open_cycle(&dir, "R3", 3);
        cycle.add(&pool, b"ACGT").unwrap();

        assert_eq!(format!("{cycle}"), "R3 (1)");
    }
}
