//! Data-file discovery and record extraction for song and log files.
//!
//! Both file kinds hold one JSON object per line. Song files describe a single
//! song and its artist; log files hold user activity, of which only
//! `NextSong` page views are kept.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use spk_core::{Artist, Song, SongplayCandidate, TimeBucket, User, PLAY_PAGE};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const CRATE_NAME: &str = "spk-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("walking {}: {source}", .root.display())]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("malformed record in {} line {line}: {reason}", .path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

impl ExtractError {
    fn malformed(path: &Path, line: usize, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.to_path_buf(),
            line,
            reason: reason.into(),
        }
    }
}

/// Recursively collect every regular file under `root` whose extension is
/// `extension` (with or without a leading dot). Hidden files are skipped.
///
/// Symlinks are followed. Paths are absolute and returned in traversal order,
/// which is filesystem-dependent. A missing root yields an empty list.
pub fn locate_files(root: &Path, extension: &str) -> Result<Vec<PathBuf>, ExtractError> {
    if !root.exists() {
        warn!(root = %root.display(), "data directory does not exist");
        return Ok(Vec::new());
    }
    let root = fs::canonicalize(root).map_err(|source| ExtractError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    let extension = extension.trim_start_matches('.');

    let mut files = Vec::new();
    for entry in WalkDir::new(&root).follow_links(true) {
        let entry = entry.map_err(|source| ExtractError::Walk {
            root: root.clone(),
            source,
        })?;
        if entry.file_type().is_file() && matches_extension(entry.path(), extension) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn matches_extension(path: &Path, extension: &str) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    !hidden && path.extension().and_then(|e| e.to_str()) == Some(extension)
}

fn read_text(path: &Path) -> Result<String, ExtractError> {
    fs::read_to_string(path).map_err(|source| match source.kind() {
        ErrorKind::InvalidData => ExtractError::malformed(path, 0, "file is not valid UTF-8"),
        _ => ExtractError::Io {
            path: path.to_path_buf(),
            source,
        },
    })
}

/// Non-blank lines paired with their 1-based line number.
fn record_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty())
}

#[derive(Debug, Deserialize)]
struct RawSongRecord {
    song_id: Option<String>,
    title: Option<String>,
    artist_id: Option<String>,
    artist_name: Option<String>,
    artist_location: Option<String>,
    artist_latitude: Option<f64>,
    artist_longitude: Option<f64>,
    year: Option<i32>,
    duration: Option<f64>,
}

/// The song and artist rows projected from one song file.
#[derive(Debug, Clone, PartialEq)]
pub struct SongRecord {
    pub song: Song,
    pub artist: Artist,
}

pub fn read_song_file(path: &Path) -> Result<SongRecord, ExtractError> {
    let text = read_text(path)?;
    parse_song_record(path, &text)
}

/// Parse the first record of a song file. Further lines are ignored.
pub fn parse_song_record(path: &Path, text: &str) -> Result<SongRecord, ExtractError> {
    let mut lines = record_lines(text);
    let (line_no, line) = lines
        .next()
        .ok_or_else(|| ExtractError::malformed(path, 0, "file contains no records"))?;
    let extra = lines.count();
    if extra > 0 {
        debug!(path = %path.display(), extra, "ignoring trailing song records");
    }

    let raw: RawSongRecord = serde_json::from_str(line)
        .map_err(|e| ExtractError::malformed(path, line_no, e.to_string()))?;
    let missing = |field: &str| ExtractError::malformed(path, line_no, format!("missing {field}"));

    let artist_id = raw.artist_id.ok_or_else(|| missing("artist_id"))?;
    let song = Song {
        song_id: raw.song_id.ok_or_else(|| missing("song_id"))?,
        title: raw.title.ok_or_else(|| missing("title"))?,
        artist_id: artist_id.clone(),
        year: raw.year,
        duration: raw.duration.ok_or_else(|| missing("duration"))?,
    };
    let artist = Artist {
        artist_id,
        name: raw.artist_name,
        location: raw.artist_location,
        latitude: raw.artist_latitude,
        longitude: raw.artist_longitude,
    };
    Ok(SongRecord { song, artist })
}

/// Log files encode `userId` as a string; accept plain numbers too.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawUserId {
    Number(i64),
    Text(String),
}

/// Just enough of a log record to apply the play filter.
#[derive(Debug, Deserialize)]
struct RawPage {
    page: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLogRecord {
    ts: Option<i64>,
    user_id: Option<RawUserId>,
    first_name: Option<String>,
    last_name: Option<String>,
    gender: Option<String>,
    level: Option<String>,
    song: Option<String>,
    artist: Option<String>,
    length: Option<f64>,
    session_id: Option<i64>,
    location: Option<String>,
    user_agent: Option<String>,
}

/// Rows derived from the play records of one log file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogBatch {
    /// One bucket per distinct start time, in first-seen order.
    pub time_buckets: Vec<TimeBucket>,
    /// One user row per play record, not deduplicated.
    pub users: Vec<User>,
    pub songplays: Vec<SongplayCandidate>,
    /// Records dropped because their page is absent or not a play.
    pub skipped: usize,
}

pub fn read_log_file(path: &Path) -> Result<LogBatch, ExtractError> {
    let text = read_text(path)?;
    parse_log_records(path, &text)
}

pub fn parse_log_records(path: &Path, text: &str) -> Result<LogBatch, ExtractError> {
    let mut batch = LogBatch::default();
    let mut seen_times = HashSet::new();

    for (line_no, line) in record_lines(text) {
        let malformed =
            |e: serde_json::Error| ExtractError::malformed(path, line_no, e.to_string());
        let RawPage { page } = serde_json::from_str(line).map_err(malformed)?;
        if page.as_deref() != Some(PLAY_PAGE) {
            batch.skipped += 1;
            continue;
        }
        let raw: RawLogRecord = serde_json::from_str(line).map_err(malformed)?;

        let ts = raw
            .ts
            .ok_or_else(|| ExtractError::malformed(path, line_no, "missing ts"))?;
        let bucket = TimeBucket::from_epoch_millis(ts).ok_or_else(|| {
            ExtractError::malformed(path, line_no, format!("ts {ts} out of range"))
        })?;
        let user_id = match raw.user_id {
            Some(RawUserId::Number(id)) => id,
            Some(RawUserId::Text(text)) => text.trim().parse().map_err(|_| {
                ExtractError::malformed(path, line_no, format!("invalid userId {text:?}"))
            })?,
            None => return Err(ExtractError::malformed(path, line_no, "missing userId")),
        };

        if seen_times.insert(bucket.start_time) {
            batch.time_buckets.push(bucket);
        }
        batch.users.push(User {
            user_id,
            first_name: raw.first_name,
            last_name: raw.last_name,
            gender: raw.gender,
            level: raw.level.clone(),
        });
        batch.songplays.push(SongplayCandidate {
            start_time: bucket.start_time,
            user_id,
            level: raw.level,
            song_title: raw.song,
            artist_name: raw.artist,
            duration: raw.length,
            session_id: raw.session_id,
            location: raw.location,
            user_agent: raw.user_agent,
        });
    }

    Ok(batch)
}
