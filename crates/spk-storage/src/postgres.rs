use async_trait::async_trait;
use spk_core::{Artist, ResolvedRefs, Song, SongLookup, Songplay, TimeBucket, User};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::info;

use crate::{LoadTransaction, RowCounts, StoreError, Warehouse};

const CREATE_TABLES_SQL: &str = include_str!("../sql/create_tables.sql");
const DROP_TABLES_SQL: &str = include_str!("../sql/drop_tables.sql");

const SONG_INSERT: &str = r#"
    INSERT INTO songs (song_id, title, artist_id, year, duration)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (song_id) DO NOTHING
"#;

const ARTIST_INSERT: &str = r#"
    INSERT INTO artists (artist_id, name, location, latitude, longitude)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (artist_id) DO NOTHING
"#;

const USER_UPSERT: &str = r#"
    INSERT INTO users (user_id, first_name, last_name, gender, level)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (user_id) DO UPDATE SET level = EXCLUDED.level
"#;

const TIME_INSERT: &str = r#"
    INSERT INTO time (start_time, hour, day, week, month, year, weekday)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (start_time) DO NOTHING
"#;

const SONG_SELECT: &str = r#"
    SELECT songs.song_id, artists.artist_id
      FROM songs
      JOIN artists ON songs.artist_id = artists.artist_id
     WHERE songs.title = $1
       AND artists.name = $2
       AND songs.duration = $3
     LIMIT 1
"#;

const SONGPLAY_INSERT: &str = r#"
    INSERT INTO songplays (start_time, user_id, level, song_id, artist_id, session_id, location, user_agent)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
"#;

const ROW_COUNTS: &str = r#"
    SELECT (SELECT COUNT(*) FROM songs),
           (SELECT COUNT(*) FROM artists),
           (SELECT COUNT(*) FROM users),
           (SELECT COUNT(*) FROM time),
           (SELECT COUNT(*) FROM songplays)
"#;

/// PostgreSQL warehouse over a single-connection pool, so at most one
/// transaction is ever open.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Create the five star-schema tables if they do not exist.
    pub async fn create_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(CREATE_TABLES_SQL).execute(&self.pool).await?;
        info!("star schema created");
        Ok(())
    }

    pub async fn drop_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(DROP_TABLES_SQL).execute(&self.pool).await?;
        info!("star schema dropped");
        Ok(())
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn begin(&self) -> Result<Box<dyn LoadTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLoadTransaction { tx: Some(tx) }))
    }

    async fn row_counts(&self) -> Result<RowCounts, StoreError> {
        let (songs, artists, users, time, songplays): (i64, i64, i64, i64, i64) =
            sqlx::query_as(ROW_COUNTS).fetch_one(&self.pool).await?;
        Ok(RowCounts {
            songs: songs as u64,
            artists: artists as u64,
            users: users as u64,
            time: time as u64,
            songplays: songplays as u64,
        })
    }
}

struct PgLoadTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgLoadTransaction {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.tx.as_deref_mut().ok_or(StoreError::TransactionClosed)
    }
}

#[async_trait]
impl LoadTransaction for PgLoadTransaction {
    async fn insert_song(&mut self, song: &Song) -> Result<(), StoreError> {
        sqlx::query(SONG_INSERT)
            .bind(&song.song_id)
            .bind(&song.title)
            .bind(&song.artist_id)
            .bind(song.year)
            .bind(song.duration)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn insert_artist(&mut self, artist: &Artist) -> Result<(), StoreError> {
        sqlx::query(ARTIST_INSERT)
            .bind(&artist.artist_id)
            .bind(&artist.name)
            .bind(&artist.location)
            .bind(artist.latitude)
            .bind(artist.longitude)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn upsert_user(&mut self, user: &User) -> Result<(), StoreError> {
        sqlx::query(USER_UPSERT)
            .bind(user.user_id)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.gender)
            .bind(&user.level)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn insert_time(&mut self, bucket: &TimeBucket) -> Result<(), StoreError> {
        sqlx::query(TIME_INSERT)
            .bind(bucket.start_time)
            .bind(bucket.hour)
            .bind(bucket.day)
            .bind(bucket.week)
            .bind(bucket.month)
            .bind(bucket.year)
            .bind(bucket.weekday)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn find_song(
        &mut self,
        lookup: SongLookup<'_>,
    ) -> Result<Option<ResolvedRefs>, StoreError> {
        let row: Option<(String, String)> = sqlx::query_as(SONG_SELECT)
            .bind(lookup.title)
            .bind(lookup.artist_name)
            .bind(lookup.duration)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(row.map(|(song_id, artist_id)| ResolvedRefs { song_id, artist_id }))
    }

    async fn insert_songplay(&mut self, play: &Songplay) -> Result<(), StoreError> {
        sqlx::query(SONGPLAY_INSERT)
            .bind(play.start_time)
            .bind(play.user_id)
            .bind(&play.level)
            .bind(&play.song_id)
            .bind(&play.artist_id)
            .bind(play.session_id)
            .bind(&play.location)
            .bind(&play.user_agent)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.commit().await?;
        Ok(())
    }
}
