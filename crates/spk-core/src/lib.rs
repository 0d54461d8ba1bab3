//! Star-schema domain model for the Sparkify songplay warehouse.
//!
//! Dimension rows ([`Song`], [`Artist`], [`User`], [`TimeBucket`]) and the
//! fact row ([`Songplay`]) mirror the tables the loader writes. A
//! [`SongplayCandidate`] is the pre-resolution handoff from the log extractor
//! into the loader: it still carries the denormalized song attributes used to
//! look up dimension keys.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "spk-core";

/// `page` value that marks a log record as a song play.
pub const PLAY_PAGE: &str = "NextSong";

/// Song (catalog item) dimension row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub song_id: String,
    pub title: String,
    pub artist_id: String,
    pub year: Option<i32>,
    pub duration: f64,
}

/// Artist (owner) dimension row, co-extracted with its [`Song`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub artist_id: String,
    pub name: Option<String>,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// User dimension row. `level` is last-write-wins in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<String>,
    pub level: Option<String>,
}

/// Time dimension row keyed by the play's start instant (UTC).
///
/// `week` is the ISO-8601 week number and `weekday` counts from Monday = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeBucket {
    pub start_time: DateTime<Utc>,
    pub hour: i32,
    pub day: i32,
    pub week: i32,
    pub month: i32,
    pub year: i32,
    pub weekday: i32,
}

impl TimeBucket {
    /// Derive a bucket from milliseconds since the Unix epoch.
    ///
    /// Returns `None` when the value is outside the representable range.
    pub fn from_epoch_millis(millis: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(Self::from_start_time)
    }

    pub fn from_start_time(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            hour: start_time.hour() as i32,
            day: start_time.day() as i32,
            week: start_time.iso_week().week() as i32,
            month: start_time.month() as i32,
            year: start_time.year(),
            weekday: start_time.weekday().num_days_from_monday() as i32,
        }
    }
}

/// Attributes used to resolve a play against the song/artist dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SongLookup<'a> {
    pub title: &'a str,
    pub artist_name: &'a str,
    pub duration: f64,
}

/// Dimension keys found for a [`SongLookup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRefs {
    pub song_id: String,
    pub artist_id: String,
}

/// A play record as extracted from a log line, before key resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongplayCandidate {
    pub start_time: DateTime<Utc>,
    pub user_id: i64,
    pub level: Option<String>,
    pub song_title: Option<String>,
    pub artist_name: Option<String>,
    pub duration: Option<f64>,
    pub session_id: Option<i64>,
    pub location: Option<String>,
    pub user_agent: Option<String>,
}

impl SongplayCandidate {
    /// Lookup key for the resolver, or `None` if any attribute is missing
    /// (such a play can never match a catalog row).
    pub fn lookup(&self) -> Option<SongLookup<'_>> {
        Some(SongLookup {
            title: self.song_title.as_deref()?,
            artist_name: self.artist_name.as_deref()?,
            duration: self.duration?,
        })
    }

    pub fn into_songplay(self, refs: Option<ResolvedRefs>) -> Songplay {
        let (song_id, artist_id) = match refs {
            Some(refs) => (Some(refs.song_id), Some(refs.artist_id)),
            None => (None, None),
        };
        Songplay {
            start_time: self.start_time,
            user_id: self.user_id,
            level: self.level,
            song_id,
            artist_id,
            session_id: self.session_id,
            location: self.location,
            user_agent: self.user_agent,
        }
    }
}

/// Songplay fact row. `song_id`/`artist_id` are `None` when resolution failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Songplay {
    pub start_time: DateTime<Utc>,
    pub user_id: i64,
    pub level: Option<String>,
    pub song_id: Option<String>,
    pub artist_id: Option<String>,
    pub session_id: Option<i64>,
    pub location: Option<String>,
    pub user_agent: Option<String>,
}
