//! Warehouse access for the songplay star schema.
//!
//! The loader talks to the store only through [`Warehouse`] and the
//! per-file [`LoadTransaction`] it hands out. Duplicate handling is part of
//! the contract: songs, artists and time rows are insert-or-ignore, users are
//! upserted on `user_id` (level is last-write-wins), songplays are appended.

use async_trait::async_trait;
use spk_core::{Artist, ResolvedRefs, Song, SongLookup, Songplay, TimeBucket, User};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::{MemoryTables, MemoryWarehouse};
pub use postgres::PgWarehouse;

pub const CRATE_NAME: &str = "spk-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("transaction already committed")]
    TransactionClosed,
}

/// Row counts per table, used for run summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub songs: u64,
    pub artists: u64,
    pub users: u64,
    pub time: u64,
    pub songplays: u64,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Open a transaction. Work is discarded unless
    /// [`LoadTransaction::commit`] is called before the value is dropped.
    async fn begin(&self) -> Result<Box<dyn LoadTransaction>, StoreError>;

    async fn row_counts(&self) -> Result<RowCounts, StoreError>;
}

#[async_trait]
pub trait LoadTransaction: Send {
    async fn insert_song(&mut self, song: &Song) -> Result<(), StoreError>;

    async fn insert_artist(&mut self, artist: &Artist) -> Result<(), StoreError>;

    async fn upsert_user(&mut self, user: &User) -> Result<(), StoreError>;

    async fn insert_time(&mut self, bucket: &TimeBucket) -> Result<(), StoreError>;

    /// Exact match on title, artist name and duration across the song/artist
    /// join. With several matches the first row the store returns wins.
    async fn find_song(&mut self, lookup: SongLookup<'_>)
        -> Result<Option<ResolvedRefs>, StoreError>;

    async fn insert_songplay(&mut self, play: &Songplay) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}
