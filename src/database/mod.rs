//! Persistence primitives
//!
//! A memory-mapped ordered key-value store with pluggable codecs, the
//! counting Bloom filters that gate it, and the optional structural
//! profile store built on top of both.

pub mod bloom;
pub mod profile_store;
pub mod store;

pub use bloom::CountingBloomFilter;
pub use profile_store::ProfileStore;
pub use store::{
    BoundsValue, BytesKey, KeyCodec, Lz4BytesValue, MappedStore, RawBytesValue, U32Key, U32Value,
    ValueCodec,
};
