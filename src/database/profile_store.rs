//! Optional persistence for structural profiles, keyed by aptamer id.
//!
//! Each value is the packed 6-per-base probability matrix of one aptamer,
//! little-endian `f64`, lz4-compressed by the store codec.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::database::store::{Lz4BytesValue, MappedStore, U32Key};
use crate::structure::StructuralProfile;

const PROFILE_STORE_FILE: &str = "id_to_profile.store";

/// `structuredata/id_to_profile.store` wrapper. Interior mutex makes it
/// usable as a shared sink for the prediction workers.
pub struct ProfileStore {
    store: Mutex<MappedStore<U32Key, Lz4BytesValue>>,
    dir: PathBuf,
}

impl ProfileStore {
    /// Open (or create) the profile store under `structuredata/` in the
    /// given project directory.
    pub fn open<P: AsRef<Path>>(project_path: P) -> Result<Self> {
        let dir = project_path.as_ref().join("structuredata");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let store = MappedStore::open(dir.join(PROFILE_STORE_FILE))?;
        Ok(Self {
            store: Mutex::new(store),
            dir,
        })
    }

    pub fn put(&self, id: u32, profile: &StructuralProfile) -> Result<()> {
        let packed = pack_profile(profile);
        self.store.lock().put(id, packed);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Result<Option<StructuralProfile>> {
        match self.store.lock().get(&id)? {
            Some(bytes) => Ok(Some(unpack_profile(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.store.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        self.store.lock().flush()
    }

    pub fn close(self) -> Result<()> {
        let count = {
            let mut store = self.store.lock();
            store.flush()?;
            store.len()
        };
        info!("closed profile store in {} ({count} profiles)", self.dir.display());
        Ok(())
    }
}

fn pack_profile(profile: &StructuralProfile) -> Vec<u8> {
    let len = profile.len();
    let mut out = Vec::with_capacity(4 + len * 6 * 8);
    out.extend_from_slice(&(len as u32).to_le_bytes());
    for k in 0..len {
        for &p in profile.column(k) {
            out.extend_from_slice(&p.to_le_bytes());
        }
    }
    out
}

fn unpack_profile(bytes: &[u8]) -> Result<StructuralProfile> {
    if bytes.len() < 4 {
        bail!("profile record is truncated");
    }
    let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if bytes.len() != 4 + len * 48 {
        bail!("profile record has inconsistent length");
    }
    let mut columns = Vec::with_capacity(len);
    let mut off = 4;
    for _ in 0..len {
        let mut col = [0f64; 6];
        for slot in col.iter_mut() {
            *slot = f64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
            off += 8;
        }
        columns.push(col);
    }
    Ok(StructuralProfile::from_columns(columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn uniform_profile(len: usize) -> StructuralProfile {
        StructuralProfile::from_columns(vec![[1.0 / 6.0; 6]; len])
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::open(dir.path()).unwrap();

        let profile = uniform_profile(40);
        store.put(3, &profile).unwrap();

        let loaded = store.get(3).unwrap().unwrap();
        assert_eq!(loaded.len(), 40);
        for k in 0..40 {
            assert_eq!(loaded.column(k), profile.column(k));
        }
        assert!(store.get(4).unwrap().is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = ProfileStore::open(dir.path()).unwrap();
            store.put(0, &uniform_profile(10)).unwrap();
            store.close().unwrap();
        }
        let store = ProfileStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.contains(0));
    }
}
