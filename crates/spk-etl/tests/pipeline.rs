use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use spk_core::{Artist, ResolvedRefs, Song, SongLookup, Songplay, TimeBucket, User};
use spk_etl::{EtlPipeline, PassConfig, PassKind, PipelineSpec, RunSummary};
use spk_storage::{LoadTransaction, MemoryTables, MemoryWarehouse, RowCounts, StoreError, Warehouse};
use tempfile::tempdir;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/data")
}

fn spec(passes: Vec<(PassKind, PathBuf)>) -> PipelineSpec {
    PipelineSpec {
        file_extension: "json".into(),
        passes: passes
            .into_iter()
            .map(|(kind, directory)| PassConfig { kind, directory })
            .collect(),
    }
}

fn fixture_spec() -> PipelineSpec {
    spec(vec![
        (PassKind::Songs, fixtures().join("song_data")),
        (PassKind::Logs, fixtures().join("log_data")),
    ])
}

fn plays_for(tables: &MemoryTables, user_id: i64) -> Vec<&Songplay> {
    tables
        .songplays
        .iter()
        .filter(|p| p.user_id == user_id)
        .collect()
}

async fn run(warehouse: &dyn Warehouse, spec: PipelineSpec) -> (anyhow::Result<RunSummary>, String) {
    let mut out = Vec::new();
    let result = EtlPipeline::new(warehouse, spec).run(&mut out).await;
    (result, String::from_utf8(out).expect("utf8 progress"))
}

#[tokio::test]
async fn full_run_loads_star_schema() {
    let warehouse = MemoryWarehouse::new();
    let (result, progress) = run(&warehouse, fixture_spec()).await;
    let summary = result.expect("run succeeds");

    assert_eq!(
        warehouse.row_counts().await.unwrap(),
        RowCounts {
            songs: 3,
            artists: 3,
            users: 3,
            time: 3,
            songplays: 4,
        }
    );

    let totals = summary.totals();
    assert_eq!(totals.songplays, 4);
    assert_eq!(totals.resolved, 2);
    assert_eq!(totals.skipped_records, 3);
    assert_eq!(summary.passes[0].files_processed, 3);
    assert_eq!(summary.passes[1].files_processed, 2);

    assert!(progress.contains("3 files found in"));
    assert!(progress.contains("3/3 files processed."));
    assert!(progress.contains("2 files found in"));
    assert!(progress.contains("2/2 files processed."));
}

#[tokio::test]
async fn catalog_rows_match_source_record() {
    let warehouse = MemoryWarehouse::new();
    let (result, _) = run(
        &warehouse,
        spec(vec![(PassKind::Songs, fixtures().join("song_data"))]),
    )
    .await;
    result.expect("run succeeds");

    let tables = warehouse.snapshot().await;
    assert_eq!(
        tables.songs["SOCIWDW12A8C13D406"],
        Song {
            song_id: "SOCIWDW12A8C13D406".into(),
            title: "Soul Deep".into(),
            artist_id: "ARMJAGH1187FB546F3".into(),
            year: Some(1969),
            duration: 148.03546,
        }
    );
    assert_eq!(
        tables.artists["ARMJAGH1187FB546F3"],
        Artist {
            artist_id: "ARMJAGH1187FB546F3".into(),
            name: Some("The Box Tops".into()),
            location: Some("Memphis, TN".into()),
            latitude: Some(35.14968),
            longitude: Some(-90.04892),
        }
    );
}

#[tokio::test]
async fn plays_resolve_only_on_exact_catalog_match() {
    let warehouse = MemoryWarehouse::new();
    let (result, _) = run(&warehouse, fixture_spec()).await;
    result.expect("run succeeds");

    let tables = warehouse.snapshot().await;
    let by_user = |user_id: i64| plays_for(&tables, user_id);

    let lily = by_user(15);
    assert_eq!(lily.len(), 1);
    assert_eq!(lily[0].song_id.as_deref(), Some("SOZCTXZ12AB0182364"));
    assert_eq!(lily[0].artist_id.as_deref(), Some("AR5KOSW1187FB35FF4"));
    assert_eq!(lily[0].session_id, Some(818));

    let ryan = by_user(26);
    assert_eq!(ryan.len(), 1);
    assert!(ryan[0].song_id.is_none());
    assert!(ryan[0].artist_id.is_none());

    let kaylee = by_user(8);
    assert_eq!(kaylee.len(), 2);
    assert_eq!(kaylee.iter().filter(|p| p.song_id.is_some()).count(), 1);
}

#[tokio::test]
async fn shared_timestamp_yields_one_time_row_and_latest_level_wins() {
    let warehouse = MemoryWarehouse::new();
    let (result, _) = run(&warehouse, fixture_spec()).await;
    result.expect("run succeeds");

    let tables = warehouse.snapshot().await;
    let shared = TimeBucket::from_epoch_millis(1542837407796).unwrap();
    assert_eq!(tables.time.get(&shared.start_time), Some(&shared));
    assert_eq!(
        tables
            .songplays
            .iter()
            .filter(|p| p.start_time == shared.start_time)
            .count(),
        2
    );

    let kaylee = &tables.users[&8];
    assert_eq!(kaylee.level.as_deref(), Some("paid"));
    assert_eq!(kaylee.first_name.as_deref(), Some("Kaylee"));
}

#[tokio::test]
async fn reprocessing_logs_duplicates_only_facts() {
    let warehouse = MemoryWarehouse::new();
    let (result, _) = run(&warehouse, fixture_spec()).await;
    result.expect("first run");
    let (result, _) = run(
        &warehouse,
        spec(vec![(PassKind::Logs, fixtures().join("log_data"))]),
    )
    .await;
    result.expect("second run");

    assert_eq!(
        warehouse.row_counts().await.unwrap(),
        RowCounts {
            songs: 3,
            artists: 3,
            users: 3,
            time: 3,
            songplays: 8,
        }
    );
}

#[tokio::test]
async fn empty_directory_reports_zero_processed() {
    let dir = tempdir().unwrap();
    let warehouse = MemoryWarehouse::new();
    let (result, progress) = run(
        &warehouse,
        spec(vec![(PassKind::Songs, dir.path().to_path_buf())]),
    )
    .await;

    let summary = result.expect("empty pass is not an error");
    assert_eq!(summary.passes[0].files_found, 0);
    assert!(progress.contains("0 files found in"));
    assert!(progress.contains("0/0 files processed."));
    assert_eq!(warehouse.row_counts().await.unwrap(), RowCounts::default());
}

#[tokio::test]
async fn malformed_file_aborts_run_after_committed_files() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("broken.json"),
        r#"{"page":"NextSong","userId":"8","song":"Mercy"}"#,
    )
    .unwrap();

    let warehouse = MemoryWarehouse::new();
    let (result, progress) = run(
        &warehouse,
        spec(vec![
            (PassKind::Songs, fixtures().join("song_data")),
            (PassKind::Logs, dir.path().to_path_buf()),
        ]),
    )
    .await;

    let err = result.expect_err("malformed record is fatal");
    assert!(format!("{err:#}").contains("missing ts"));
    assert!(progress.contains("3/3 files processed."));
    assert!(progress.contains("1 files found in"));
    assert!(!progress.contains("1/1 files processed."));

    let counts = warehouse.row_counts().await.unwrap();
    assert_eq!((counts.songs, counts.artists), (3, 3));
    assert_eq!(counts.songplays, 0);
}

/// Delegates to a [`MemoryWarehouse`] but fails every songplay insert.
struct FactFailingWarehouse {
    inner: MemoryWarehouse,
}

struct FactFailingTransaction {
    inner: Box<dyn LoadTransaction>,
}

#[async_trait]
impl Warehouse for FactFailingWarehouse {
    async fn begin(&self) -> Result<Box<dyn LoadTransaction>, StoreError> {
        let inner = self.inner.begin().await?;
        Ok(Box::new(FactFailingTransaction { inner }))
    }

    async fn row_counts(&self) -> Result<RowCounts, StoreError> {
        self.inner.row_counts().await
    }
}

#[async_trait]
impl LoadTransaction for FactFailingTransaction {
    async fn insert_song(&mut self, song: &Song) -> Result<(), StoreError> {
        self.inner.insert_song(song).await
    }

    async fn insert_artist(&mut self, artist: &Artist) -> Result<(), StoreError> {
        self.inner.insert_artist(artist).await
    }

    async fn upsert_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.inner.upsert_user(user).await
    }

    async fn insert_time(&mut self, bucket: &TimeBucket) -> Result<(), StoreError> {
        self.inner.insert_time(bucket).await
    }

    async fn find_song(
        &mut self,
        lookup: SongLookup<'_>,
    ) -> Result<Option<ResolvedRefs>, StoreError> {
        self.inner.find_song(lookup).await
    }

    async fn insert_songplay(&mut self, _play: &Songplay) -> Result<(), StoreError> {
        Err(StoreError::TransactionClosed)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.inner.commit().await
    }
}

#[tokio::test]
async fn store_failure_rolls_back_the_failing_file_only() {
    let memory = MemoryWarehouse::new();
    let (result, _) = run(
        &memory,
        spec(vec![(PassKind::Songs, fixtures().join("song_data"))]),
    )
    .await;
    result.expect("songs load");

    let failing = FactFailingWarehouse {
        inner: memory.clone(),
    };
    let (result, progress) = run(
        &failing,
        spec(vec![(PassKind::Logs, fixtures().join("log_data"))]),
    )
    .await;

    assert!(result.is_err());
    assert!(!progress.contains("1/2 files processed."));
    let counts = memory.row_counts().await.unwrap();
    assert_eq!((counts.songs, counts.artists), (3, 3));
    assert_eq!((counts.users, counts.time, counts.songplays), (0, 0, 0));
}
