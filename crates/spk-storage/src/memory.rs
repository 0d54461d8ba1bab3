use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spk_core::{Artist, ResolvedRefs, Song, SongLookup, Songplay, TimeBucket, User};
use tokio::sync::Mutex;

use crate::{LoadTransaction, RowCounts, StoreError, Warehouse};

/// Committed contents of a [`MemoryWarehouse`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTables {
    pub songs: BTreeMap<String, Song>,
    pub artists: BTreeMap<String, Artist>,
    pub users: BTreeMap<i64, User>,
    pub time: BTreeMap<DateTime<Utc>, TimeBucket>,
    pub songplays: Vec<Songplay>,
}

impl MemoryTables {
    pub fn row_counts(&self) -> RowCounts {
        RowCounts {
            songs: self.songs.len() as u64,
            artists: self.artists.len() as u64,
            users: self.users.len() as u64,
            time: self.time.len() as u64,
            songplays: self.songplays.len() as u64,
        }
    }
}

/// In-process warehouse with the same duplicate handling as the PostgreSQL
/// schema. Each transaction works on a private copy that replaces the shared
/// tables on commit; dropping it uncommitted discards the copy.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    tables: Arc<Mutex<MemoryTables>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn begin(&self) -> Result<Box<dyn LoadTransaction>, StoreError> {
        let working = self.tables.lock().await.clone();
        Ok(Box::new(MemoryLoadTransaction {
            shared: Arc::clone(&self.tables),
            working: Some(working),
        }))
    }

    async fn row_counts(&self) -> Result<RowCounts, StoreError> {
        Ok(self.tables.lock().await.row_counts())
    }
}

struct MemoryLoadTransaction {
    shared: Arc<Mutex<MemoryTables>>,
    working: Option<MemoryTables>,
}

impl MemoryLoadTransaction {
    fn tables(&mut self) -> Result<&mut MemoryTables, StoreError> {
        self.working.as_mut().ok_or(StoreError::TransactionClosed)
    }
}

#[async_trait]
impl LoadTransaction for MemoryLoadTransaction {
    async fn insert_song(&mut self, song: &Song) -> Result<(), StoreError> {
        self.tables()?
            .songs
            .entry(song.song_id.clone())
            .or_insert_with(|| song.clone());
        Ok(())
    }

    async fn insert_artist(&mut self, artist: &Artist) -> Result<(), StoreError> {
        self.tables()?
            .artists
            .entry(artist.artist_id.clone())
            .or_insert_with(|| artist.clone());
        Ok(())
    }

    async fn upsert_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.tables()?
            .users
            .entry(user.user_id)
            .and_modify(|existing| existing.level = user.level.clone())
            .or_insert_with(|| user.clone());
        Ok(())
    }

    async fn insert_time(&mut self, bucket: &TimeBucket) -> Result<(), StoreError> {
        self.tables()?
            .time
            .entry(bucket.start_time)
            .or_insert(*bucket);
        Ok(())
    }

    async fn find_song(
        &mut self,
        lookup: SongLookup<'_>,
    ) -> Result<Option<ResolvedRefs>, StoreError> {
        let tables = &*self.tables()?;
        let found = tables
            .songs
            .values()
            .filter(|song| song.title == lookup.title && song.duration == lookup.duration)
            .find_map(|song| {
                let artist = tables.artists.get(&song.artist_id)?;
                (artist.name.as_deref() == Some(lookup.artist_name)).then(|| ResolvedRefs {
                    song_id: song.song_id.clone(),
                    artist_id: artist.artist_id.clone(),
                })
            });
        Ok(found)
    }

    async fn insert_songplay(&mut self, play: &Songplay) -> Result<(), StoreError> {
        self.tables()?.songplays.push(play.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let working = self.working.take().ok_or(StoreError::TransactionClosed)?;
        *self.shared.lock().await = working;
        Ok(())
    }
}
