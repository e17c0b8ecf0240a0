//! Persistent aptamer pool
//!
//! Content-addressed bijection between nucleotide sequences and dense
//! `u32` identifiers, plus the randomized-region bounds recorded at
//! registration. Three mapped stores live under `pooldata/`:
//! `seq_to_id.store`, `id_to_seq.store` (the inverse view, keeping
//! id-order iteration cheap) and `id_to_bounds.store`, fronted by Bloom
//! filters over sequences and ids.

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

use crate::core::data_structures::is_valid_nucleotides;
use crate::database::bloom::CountingBloomFilter;
use crate::database::store::{BoundsValue, BytesKey, MappedStore, RawBytesValue, U32Key, U32Value};

const SEQ_TO_ID_FILE: &str = "seq_to_id.store";
const ID_TO_SEQ_FILE: &str = "id_to_seq.store";
const ID_TO_BOUNDS_FILE: &str = "id_to_bounds.store";
const POOL_BLOOM_FILE: &str = "pool_bloom.bin";
const ID_BLOOM_FILE: &str = "id_bloom.bin";

/// The experiment-wide aptamer pool. Writable only during the parsing
/// phase; the single logical writer is enforced by the internal write
/// lock, while readers go through the store read locks concurrently.
pub struct AptamerPool {
    dir: PathBuf,
    seq_to_id: RwLock<MappedStore<BytesKey, U32Value>>,
    id_to_seq: RwLock<MappedStore<U32Key, RawBytesValue>>,
    id_to_bounds: RwLock<MappedStore<U32Key, BoundsValue>>,
    seq_bloom: CountingBloomFilter,
    id_bloom: CountingBloomFilter,
    next_id: AtomicU32,
    write_lock: Mutex<()>,
}

impl AptamerPool {
    /// Open the pool under `<project>/pooldata/`, creating it when absent.
    /// Bloom filters are restored from their snapshots, or rebuilt from
    /// the stores when the snapshots are missing.
    pub fn open<P: AsRef<Path>>(
        project_path: P,
        bloom_capacity: usize,
        bloom_fp_rate: f64,
    ) -> Result<Self> {
        let dir = project_path.as_ref().join("pooldata");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let seq_to_id: MappedStore<BytesKey, U32Value> =
            MappedStore::open(dir.join(SEQ_TO_ID_FILE))?;
        let id_to_seq: MappedStore<U32Key, RawBytesValue> =
            MappedStore::open(dir.join(ID_TO_SEQ_FILE))?;
        let id_to_bounds: MappedStore<U32Key, BoundsValue> =
            MappedStore::open(dir.join(ID_TO_BOUNDS_FILE))?;

        let count = id_to_seq.len();
        if seq_to_id.len() != count || id_to_bounds.len() != count {
            bail!(
                "pool stores in {} disagree on size ({}/{}/{})",
                dir.display(),
                seq_to_id.len(),
                count,
                id_to_bounds.len()
            );
        }

        let seq_bloom_path = dir.join(POOL_BLOOM_FILE);
        let id_bloom_path = dir.join(ID_BLOOM_FILE);
        let (seq_bloom, id_bloom) = if seq_bloom_path.exists() && id_bloom_path.exists() {
            (
                CountingBloomFilter::load(&seq_bloom_path)?,
                CountingBloomFilter::load(&id_bloom_path)?,
            )
        } else {
            debug!("bloom snapshots missing, rebuilding from stores");
            let seq_bloom = CountingBloomFilter::new(bloom_capacity, bloom_fp_rate);
            let id_bloom = CountingBloomFilter::new(bloom_capacity, bloom_fp_rate);
            for entry in id_to_seq.range_iter() {
                let (id, seq) = entry?;
                seq_bloom.add(&seq);
                id_bloom.add(&id);
            }
            (seq_bloom, id_bloom)
        };

        if count > 0 {
            info!("opened aptamer pool in {} ({count} aptamers)", dir.display());
        } else {
            info!("created new aptamer pool in {}", dir.display());
        }

        Ok(Self {
            dir,
            seq_to_id: RwLock::new(seq_to_id),
            id_to_seq: RwLock::new(id_to_seq),
            id_to_bounds: RwLock::new(id_to_bounds),
            seq_bloom,
            id_bloom,
            next_id: AtomicU32::new(count as u32),
            write_lock: Mutex::new(()),
        })
    }

    /// Register a sequence, returning its identifier. Re-registering a
    /// known sequence returns the existing id and leaves its bounds
    /// untouched. `primer5_trim` and `primer3_trim` are the lengths of
    /// the matched primer regions; the randomized region becomes
    /// `[primer5_trim, len - primer3_trim)`.
    pub fn register(&self, sequence: &[u8], primer5_trim: u32, primer3_trim: u32) -> Result<u32> {
        if sequence.is_empty() {
            bail!("cannot register an empty sequence");
        }
        if !is_valid_nucleotides(sequence) {
            bail!(
                "sequence contains bases outside A/C/G/T: {}",
                String::from_utf8_lossy(sequence)
            );
        }
        let len = sequence.len() as u32;
        if primer5_trim + primer3_trim > len {
            bail!("primer trims ({primer5_trim}+{primer3_trim}) exceed sequence length {len}");
        }

        let _guard = self.write_lock.lock();

        // Bloom miss means definitely new; a hit still has to be
        // confirmed against the store.
        if self.seq_bloom.maybe_contains(&sequence) {
            if let Some(id) = self.seq_to_id.read().get(&sequence.to_vec())? {
                return Ok(id);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let bounds = (primer5_trim, len - primer3_trim);

        self.seq_to_id.write().put(sequence.to_vec(), id);
        self.id_to_seq.write().put(id, sequence.to_vec());
        self.id_to_bounds.write().put(id, bounds);
        self.seq_bloom.add(&sequence);
        self.id_bloom.add(&id);

        Ok(id)
    }

    /// Identifier of a sequence, or `None` when it was never registered.
    pub fn identifier_of(&self, sequence: &[u8]) -> Result<Option<u32>> {
        if !self.seq_bloom.maybe_contains(&sequence) {
            return Ok(None);
        }
        self.seq_to_id.read().get(&sequence.to_vec())
    }

    /// Randomized-region bounds of a registered id.
    pub fn bounds_of(&self, id: u32) -> Result<Option<(u32, u32)>> {
        self.id_to_bounds.read().get(&id)
    }

    /// Sequence bytes of a registered id.
    pub fn sequence_of(&self, id: u32) -> Result<Option<Vec<u8>>> {
        self.id_to_seq.read().get(&id)
    }

    /// Fast membership check for an id. May report false positives.
    pub fn maybe_contains_id(&self, id: u32) -> bool {
        self.id_bloom.maybe_contains(&id)
    }

    /// Visit `(id, sequence)` pairs in ascending id order. The pool's
    /// read lock is held for the duration of the walk.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(u32, &[u8]) -> Result<()>,
    {
        let store = self.id_to_seq.read();
        for entry in store.range_iter() {
            let (id, seq) = entry?;
            f(id, &seq)?;
        }
        Ok(())
    }

    /// Number of distinct aptamers (equals the next id to be assigned).
    pub fn len(&self) -> usize {
        self.next_id.load(Ordering::SeqCst) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist stores and Bloom snapshots.
    pub fn flush(&self) -> Result<()> {
        self.seq_to_id.write().flush()?;
        self.id_to_seq.write().flush()?;
        self.id_to_bounds.write().flush()?;
        self.seq_bloom.save(self.dir.join(POOL_BLOOM_FILE))?;
        self.id_bloom.save(self.dir.join(ID_BLOOM_FILE))?;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.flush()?;
        info!("closed aptamer pool in {} ({} aptamers)", self.dir.display(), self.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_pool(dir: &TempDir) -> AptamerPool {
        AptamerPool::open(dir.path(), 10_000, 0.001).unwrap()
    }

    #[test]
    fn test_register_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir);

        let a = pool.register(b"ACGT", 0, 0).unwrap();
        let b = pool.register(b"ACGT", 0, 0).unwrap();
        let c = pool.register(b"TGCA", 0, 0).unwrap();

        assert_eq!(a, 0);
        assert_eq!(b, 0);
        assert_eq!(c, 1);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.bounds_of(0).unwrap(), Some((0, 4)));
    }

    #[test]
    fn test_bounds_from_primer_trims() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir);

        let id = pool.register(b"AAACGTCGTTT", 3, 3).unwrap();
        assert_eq!(pool.bounds_of(id).unwrap(), Some((3, 8)));

        // Re-registration never mutates bounds.
        pool.register(b"AAACGTCGTTT", 0, 0).unwrap();
        assert_eq!(pool.bounds_of(id).unwrap(), Some((3, 8)));
    }

    #[test]
    fn test_identifier_of_unknown_is_none() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir);
        pool.register(b"ACGT", 0, 0).unwrap();

        assert_eq!(pool.identifier_of(b"ACGT").unwrap(), Some(0));
        assert_eq!(pool.identifier_of(b"GGGG").unwrap(), None);
    }

    #[test]
    fn test_rejects_invalid_sequences() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir);

        assert!(pool.register(b"", 0, 0).is_err());
        assert!(pool.register(b"ACGN", 0, 0).is_err());
        assert!(pool.register(b"ACGT", 3, 2).is_err());
    }

    #[test]
    fn test_iteration_in_id_order() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir);

        for seq in [b"TTTT".as_ref(), b"AAAA".as_ref(), b"CCCC".as_ref()] {
            pool.register(seq, 0, 0).unwrap();
        }

        let mut seen = Vec::new();
        pool.for_each(|id, seq| {
            seen.push((id, seq.to_vec()));
            Ok(())
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![
                (0, b"TTTT".to_vec()),
                (1, b"AAAA".to_vec()),
                (2, b"CCCC".to_vec()),
            ]
        );
    }

    #[test]
    fn test_reopen_restores_bijection() {
        let dir = TempDir::new().unwrap();
        let first_id;
        {
            let pool = open_pool(&dir);
            first_id = pool.register(b"ACGTACGT", 2, 2).unwrap();
            pool.register(b"TTTTACGT", 0, 0).unwrap();
            pool.close().unwrap();
        }

        let pool = open_pool(&dir);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.identifier_of(b"ACGTACGT").unwrap(), Some(first_id));
        assert_eq!(pool.bounds_of(first_id).unwrap(), Some((2, 6)));

        // New registrations continue the dense id sequence.
        let next = pool.register(b"GGGGACGT", 0, 0).unwrap();
        assert_eq!(next, 2);
    }
}
