//! Memory-mapped ordered key-value store
//!
//! Single-writer, many-reader map from encoded keys to encoded values,
//! backed by an immutable sorted segment on disk plus an in-memory write
//! overlay. Commits are coarse: `flush()` merges the overlay into a new
//! segment file and remaps it; `close()` flushes and releases the mapping.
//! All on-disk integers are little-endian regardless of host order.

use anyhow::{anyhow, bail, Context, Result};
use memmap2::{Mmap, MmapOptions};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Segment file magic. Bumped together with `SEGMENT_VERSION` on layout changes.
const SEGMENT_MAGIC: &[u8; 8] = b"APTSTOR1";
const SEGMENT_VERSION: u32 = 1;

/// Fixed header: magic(8) + version(4) + flags(4) + count(8) + index_offset(8)
const HEADER_LEN: usize = 32;

/// Encodes and decodes store keys. Decoded keys must order the same way
/// the store iterates, so the segment can be binary searched.
pub trait KeyCodec {
    type Key: Ord + Clone + Send + Sync;

    fn encode(key: &Self::Key, out: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> Result<Self::Key>;
}

/// Encodes and decodes store values.
pub trait ValueCodec {
    type Value: Clone + Send + Sync;

    fn encode(value: &Self::Value, out: &mut Vec<u8>) -> Result<()>;
    fn decode(bytes: &[u8]) -> Result<Self::Value>;
}

/// Little-endian `u32` keys (aptamer identifiers).
pub struct U32Key;

impl KeyCodec for U32Key {
    type Key = u32;

    fn encode(key: &u32, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<u32> {
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| anyhow!("key length {} != 4", bytes.len()))?;
        Ok(u32::from_le_bytes(arr))
    }
}

/// Raw byte-string keys (nucleotide sequences).
pub struct BytesKey;

impl KeyCodec for BytesKey {
    type Key = Vec<u8>;

    fn encode(key: &Vec<u8>, out: &mut Vec<u8>) {
        out.extend_from_slice(key);
    }

    fn decode(bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Little-endian `u32` values.
pub struct U32Value;

impl ValueCodec for U32Value {
    type Value = u32;

    fn encode(value: &u32, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<u32> {
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| anyhow!("value length {} != 4", bytes.len()))?;
        Ok(u32::from_le_bytes(arr))
    }
}

/// `(start, end)` randomized-region bounds, two little-endian `u32`s.
pub struct BoundsValue;

impl ValueCodec for BoundsValue {
    type Value = (u32, u32);

    fn encode(value: &(u32, u32), out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&value.0.to_le_bytes());
        out.extend_from_slice(&value.1.to_le_bytes());
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<(u32, u32)> {
        if bytes.len() != 8 {
            bail!("bounds value length {} != 8", bytes.len());
        }
        let start = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let end = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        Ok((start, end))
    }
}

/// Uncompressed byte-array values.
pub struct RawBytesValue;

impl ValueCodec for RawBytesValue {
    type Value = Vec<u8>;

    fn encode(value: &Vec<u8>, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(value);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Byte-array values stored lz4-compressed with a length prefix.
pub struct Lz4BytesValue;

impl ValueCodec for Lz4BytesValue {
    type Value = Vec<u8>;

    fn encode(value: &Vec<u8>, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&lz4_flex::compress_prepend_size(value));
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| anyhow!("lz4 decompression failed: {e}"))
    }
}

/// File-backed ordered map with an in-memory write overlay.
///
/// Readers see the union of the mapped segment and the overlay (overlay
/// wins on duplicate keys). The caller is responsible for serializing
/// writers; concurrent readers are safe through a shared reference.
pub struct MappedStore<K: KeyCodec, V: ValueCodec> {
    path: PathBuf,
    mmap: Option<Mmap>,
    segment_count: usize,
    index_offset: usize,
    overlay: BTreeMap<K::Key, V::Value>,
    _codecs: PhantomData<(K, V)>,
}

impl<K: KeyCodec, V: ValueCodec> MappedStore<K, V> {
    /// Open a store file, creating an empty store if the file does not
    /// exist yet. A present file with a bad magic or truncated header is
    /// a fatal error; no recovery is attempted.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            debug!("creating new store at {}", path.display());
            return Ok(Self {
                path,
                mmap: None,
                segment_count: 0,
                index_offset: 0,
                overlay: BTreeMap::new(),
                _codecs: PhantomData,
            });
        }

        let file = File::open(&path)
            .with_context(|| format!("failed to open store file {}", path.display()))?;
        // Safety: the segment file is only replaced via flush(), which writes
        // a fresh file and atomically renames it over this one.
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .with_context(|| format!("failed to map store file {}", path.display()))?;

        let (segment_count, index_offset) = Self::validate_header(&mmap, &path)?;
        debug!(
            "opened store {} ({} records)",
            path.display(),
            segment_count
        );

        Ok(Self {
            path,
            mmap: Some(mmap),
            segment_count,
            index_offset,
            overlay: BTreeMap::new(),
            _codecs: PhantomData,
        })
    }

    fn validate_header(mmap: &Mmap, path: &Path) -> Result<(usize, usize)> {
        if mmap.len() < HEADER_LEN {
            bail!("store file {} is truncated (corrupt header)", path.display());
        }
        if &mmap[0..8] != SEGMENT_MAGIC {
            bail!("store file {} has invalid magic (corrupt header)", path.display());
        }
        let version = u32::from_le_bytes(mmap[8..12].try_into().unwrap());
        if version != SEGMENT_VERSION {
            bail!(
                "store file {} has unsupported version {}",
                path.display(),
                version
            );
        }
        let count = u64::from_le_bytes(mmap[16..24].try_into().unwrap()) as usize;
        let index_offset = u64::from_le_bytes(mmap[24..32].try_into().unwrap()) as usize;

        let index_len = count
            .checked_mul(8)
            .ok_or_else(|| anyhow!("index size overflow in {}", path.display()))?;
        if index_offset < HEADER_LEN || index_offset + index_len > mmap.len() {
            bail!("store file {} has out-of-range index (corrupt header)", path.display());
        }
        Ok((count, index_offset))
    }

    /// Number of distinct keys across segment and overlay.
    pub fn len(&self) -> usize {
        let novel = self
            .overlay
            .keys()
            .filter(|k| self.segment_find(k).is_none())
            .count();
        self.segment_count + novel
    }

    pub fn is_empty(&self) -> bool {
        self.segment_count == 0 && self.overlay.is_empty()
    }

    /// Insert or replace. Visible to readers immediately, durable at `flush`.
    pub fn put(&mut self, key: K::Key, value: V::Value) {
        self.overlay.insert(key, value);
    }

    pub fn get(&self, key: &K::Key) -> Result<Option<V::Value>> {
        if let Some(v) = self.overlay.get(key) {
            return Ok(Some(v.clone()));
        }
        match self.segment_find(key) {
            Some(idx) => {
                let (_, val) = self.record_at(idx)?;
                Ok(Some(V::decode(val)?))
            }
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &K::Key) -> bool {
        self.overlay.contains_key(key) || self.segment_find(key).is_some()
    }

    /// Iterate `(key, value)` pairs in ascending key order over the union
    /// of the mapped segment and the overlay.
    pub fn range_iter(&self) -> StoreIter<'_, K, V> {
        StoreIter {
            store: self,
            segment_pos: 0,
            overlay_iter: self.overlay.iter().peekable(),
        }
    }

    /// Merge the overlay into a freshly written segment and remap it.
    pub fn flush(&mut self) -> Result<()> {
        if self.overlay.is_empty() && self.mmap.is_some() {
            return Ok(());
        }

        let tmp_path = self.path.with_extension("store.tmp");
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            let mut writer = BufWriter::new(file);
            self.write_merged(&mut writer)?;
            writer
                .into_inner()
                .map_err(|e| anyhow!("failed to flush segment writer: {e}"))?
                .sync_all()
                .context("failed to sync store segment")?;
        }

        // Drop the old mapping before replacing the file underneath it.
        self.mmap = None;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        let file = File::open(&self.path)?;
        // Safety: freshly written file, replaced only by future flushes.
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .with_context(|| format!("failed to map {}", self.path.display()))?;
        let (count, index_offset) = Self::validate_header(&mmap, &self.path)?;

        self.mmap = Some(mmap);
        self.segment_count = count;
        self.index_offset = index_offset;
        self.overlay.clear();

        info!("flushed store {} ({} records)", self.path.display(), count);
        Ok(())
    }

    /// Flush and release the mapping.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    fn write_merged<W: Write>(&self, writer: &mut W) -> Result<()> {
        // Merge the sorted segment with the sorted overlay into
        // (encoded key, encoded value) records, overlay winning ties.
        let mut records: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(self.len());

        let mut overlay = self.overlay.iter().peekable();
        let mut seg_pos = 0usize;

        loop {
            let seg_key = if seg_pos < self.segment_count {
                let (kb, _) = self.record_at(seg_pos)?;
                Some(K::decode(kb)?)
            } else {
                None
            };

            let take_overlay = match (overlay.peek(), &seg_key) {
                (Some((ok, _)), Some(sk)) => (*ok).cmp(sk) != std::cmp::Ordering::Greater,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };

            if take_overlay {
                let (ok, ov) = overlay.next().unwrap();
                if let Some(sk) = &seg_key {
                    if ok == sk {
                        seg_pos += 1; // superseded segment record
                    }
                }
                let mut kbuf = Vec::new();
                K::encode(ok, &mut kbuf);
                let mut vbuf = Vec::new();
                V::encode(ov, &mut vbuf)?;
                records.push((kbuf, vbuf));
            } else {
                let (kb, vb) = self.record_at(seg_pos)?;
                records.push((kb.to_vec(), vb.to_vec()));
                seg_pos += 1;
            }
        }

        let mut offsets = Vec::with_capacity(records.len());
        let mut data_len = 0u64;
        for (kb, vb) in &records {
            offsets.push(HEADER_LEN as u64 + data_len);
            data_len += 8 + kb.len() as u64 + vb.len() as u64;
        }
        let index_offset = HEADER_LEN as u64 + data_len;

        writer.write_all(SEGMENT_MAGIC)?;
        writer.write_all(&SEGMENT_VERSION.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&(records.len() as u64).to_le_bytes())?;
        writer.write_all(&index_offset.to_le_bytes())?;

        for (kb, vb) in &records {
            writer.write_all(&(kb.len() as u32).to_le_bytes())?;
            writer.write_all(&(vb.len() as u32).to_le_bytes())?;
            writer.write_all(kb)?;
            writer.write_all(vb)?;
        }
        for off in offsets {
            writer.write_all(&off.to_le_bytes())?;
        }
        Ok(())
    }

    /// Key and value slices of the `idx`-th segment record.
    fn record_at(&self, idx: usize) -> Result<(&[u8], &[u8])> {
        let mmap = self
            .mmap
            .as_ref()
            .ok_or_else(|| anyhow!("record access on unmapped store"))?;
        let entry = self.index_offset + idx * 8;
        let off = u64::from_le_bytes(mmap[entry..entry + 8].try_into().unwrap()) as usize;
        if off + 8 > self.index_offset {
            bail!("record offset out of range in {}", self.path.display());
        }
        let key_len = u32::from_le_bytes(mmap[off..off + 4].try_into().unwrap()) as usize;
        let val_len = u32::from_le_bytes(mmap[off + 4..off + 8].try_into().unwrap()) as usize;
        let key_start = off + 8;
        let val_start = key_start + key_len;
        let val_end = val_start + val_len;
        if val_end > self.index_offset {
            bail!("record body out of range in {}", self.path.display());
        }
        Ok((&mmap[key_start..val_start], &mmap[val_start..val_end]))
    }

    /// Binary search for `key` in the sorted segment.
    fn segment_find(&self, key: &K::Key) -> Option<usize> {
        if self.segment_count == 0 {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = self.segment_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (kb, _) = self.record_at(mid).ok()?;
            let mid_key = K::decode(kb).ok()?;
            match mid_key.cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }
}

/// Ascending merged iterator over segment and overlay.
pub struct StoreIter<'a, K: KeyCodec, V: ValueCodec> {
    store: &'a MappedStore<K, V>,
    segment_pos: usize,
    overlay_iter: std::iter::Peekable<std::collections::btree_map::Iter<'a, K::Key, V::Value>>,
}

impl<K: KeyCodec, V: ValueCodec> Iterator for StoreIter<'_, K, V> {
    type Item = Result<(K::Key, V::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        let seg_key = if self.segment_pos < self.store.segment_count {
            match self
                .store
                .record_at(self.segment_pos)
                .and_then(|(kb, _)| K::decode(kb))
            {
                Ok(k) => Some(k),
                Err(e) => return Some(Err(e)),
            }
        } else {
            None
        };

        let take_overlay = match (self.overlay_iter.peek(), &seg_key) {
            (Some((ok, _)), Some(sk)) => (*ok).cmp(sk) != std::cmp::Ordering::Greater,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
        };

        if take_overlay {
            let (ok, ov) = self.overlay_iter.next().unwrap();
            if let Some(sk) = &seg_key {
                if ok == sk {
                    self.segment_pos += 1;
                }
            }
            Some(Ok((ok.clone(), ov.clone())))
        } else {
            let item = self
                .store
                .record_at(self.segment_pos)
                .and_then(|(kb, vb)| Ok((K::decode(kb)?, V::decode(vb)?)));
            self.segment_pos += 1;
            Some(item)
        }
    }
}
