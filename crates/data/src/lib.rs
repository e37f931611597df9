//! Versioned candle storage.
//!
//! This crate provides:
//! - `KeyRouter` mapping logical series to tier-qualified physical keys
//! - `VersionedCandleStore`, the single write path for live and backfilled candles
//! - Series backends: in-memory and `PostgreSQL`

pub mod backend;
pub mod error;
pub mod router;
pub mod store;

pub use backend::{MemoryBackend, PostgresBackend, SeriesBackend, WritePolicy};
pub use error::StoreError;
pub use router::{KeyRouter, SeriesKey};
pub use store::{ReadQuery, VersionedCandleStore};
