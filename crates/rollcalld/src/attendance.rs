//! SQLite-backed attendance log, one row per identity per calendar day.

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::params;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_rusqlite::Connection;

use crate::engine::Sighting;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS attendance (
        id     INTEGER PRIMARY KEY AUTOINCREMENT,
        name   TEXT NOT NULL,
        date   TEXT NOT NULL,
        time   TEXT NOT NULL,
        source TEXT NOT NULL,
        UNIQUE(name, date)
    );
    CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cannot create database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
}

/// Where an attendance mark came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkSource {
    /// Recognized in the live camera stream.
    Stream,
    /// Recognized in an image submitted over HTTP.
    Upload,
}

impl MarkSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Upload => "upload",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Recorded,
    /// The identity already has a record for that date.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub date: String,
    pub time: String,
}

#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub date: Option<NaiveDate>,
    pub name: Option<String>,
}

/// Clone-safe handle to the attendance database.
#[derive(Clone)]
pub struct AttendanceStore {
    conn: Connection,
}

impl AttendanceStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Record `name` as present at `at`, at most once per date.
    ///
    /// The uniqueness check and the insert are one statement, so concurrent
    /// marks for the same identity cannot both record.
    pub async fn mark(
        &self,
        name: &str,
        at: NaiveDateTime,
        source: MarkSource,
    ) -> Result<MarkOutcome, StoreError> {
        let date = at.format(DATE_FORMAT).to_string();
        let time = at.format(TIME_FORMAT).to_string();
        let owned = name.to_string();

        let inserted = self
            .conn
            .call(move |c| {
                let n = c.execute(
                    "INSERT OR IGNORE INTO attendance (name, date, time, source)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![owned, date, time, source.as_str()],
                )?;
                Ok(n)
            })
            .await?;

        if inserted == 1 {
            tracing::info!(name, date = %at.date(), source = source.as_str(), "attendance saved");
            Ok(MarkOutcome::Recorded)
        } else {
            tracing::info!(name, date = %at.date(), "attendance already marked today");
            Ok(MarkOutcome::Duplicate)
        }
    }

    /// Records matching `filter`, oldest first.
    pub async fn list(&self, filter: RecordFilter) -> Result<Vec<AttendanceRecord>, StoreError> {
        let date = filter.date.map(|d| d.format(DATE_FORMAT).to_string());
        let records = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT name, date, time FROM attendance
                     WHERE (?1 IS NULL OR date = ?1) AND (?2 IS NULL OR name = ?2)
                     ORDER BY date, time, id",
                )?;
                let rows = stmt
                    .query_map(params![date, filter.name], |row| {
                        Ok(AttendanceRecord {
                            name: row.get(0)?,
                            date: row.get(1)?,
                            time: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(records)
    }

    pub async fn count_for_date(&self, date: NaiveDate) -> Result<u64, StoreError> {
        let date = date.format(DATE_FORMAT).to_string();
        let count = self
            .conn
            .call(move |c| {
                let n: i64 = c.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE date = ?1",
                    params![date],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(count.max(0) as u64)
    }
}

/// Persist live-stream sightings until the channel closes.
pub fn spawn_recorder(
    store: AttendanceStore,
    mut sightings: mpsc::Receiver<Sighting>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(sighting) = sightings.recv().await {
            if let Err(e) = store.mark(&sighting.identity, sighting.at, MarkSource::Stream).await {
                tracing::error!(identity = %sighting.identity, error = %e, "failed to record attendance");
            }
        }
        tracing::debug!("attendance recorder stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[tokio::test]
    async fn test_mark_once_per_day() {
        let store = AttendanceStore::open_in_memory().await.unwrap();

        let first = store.mark("alice", at("2024-05-01 08:59:10"), MarkSource::Stream).await.unwrap();
        assert_eq!(first, MarkOutcome::Recorded);

        let again = store.mark("alice", at("2024-05-01 13:00:00"), MarkSource::Upload).await.unwrap();
        assert_eq!(again, MarkOutcome::Duplicate);

        let next_day = store.mark("alice", at("2024-05-02 09:00:00"), MarkSource::Stream).await.unwrap();
        assert_eq!(next_day, MarkOutcome::Recorded);

        let records = store.list(RecordFilter::default()).await.unwrap();
        assert_eq!(
            records,
            vec![
                AttendanceRecord { name: "alice".into(), date: "2024-05-01".into(), time: "08:59:10".into() },
                AttendanceRecord { name: "alice".into(), date: "2024-05-02".into(), time: "09:00:00".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_marks_record_once() {
        let store = AttendanceStore::open_in_memory().await.unwrap();
        let now = at("2024-05-01 10:00:00");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.mark("bob", now, MarkSource::Upload).await.unwrap() })
            })
            .collect();

        let mut recorded = 0;
        for task in tasks {
            if task.await.unwrap() == MarkOutcome::Recorded {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 1);
        assert_eq!(store.count_for_date(now.date()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_and_order() {
        let store = AttendanceStore::open_in_memory().await.unwrap();
        store.mark("carol", at("2024-05-01 11:00:00"), MarkSource::Stream).await.unwrap();
        store.mark("alice", at("2024-05-01 09:00:00"), MarkSource::Stream).await.unwrap();
        store.mark("alice", at("2024-05-03 09:30:00"), MarkSource::Stream).await.unwrap();

        let day = store
            .list(RecordFilter { date: NaiveDate::from_ymd_opt(2024, 5, 1), name: None })
            .await
            .unwrap();
        let names: Vec<_> = day.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "carol"]);

        let alice = store
            .list(RecordFilter { date: None, name: Some("alice".into()) })
            .await
            .unwrap();
        assert_eq!(alice.len(), 2);

        let none = store
            .list(RecordFilter { date: NaiveDate::from_ymd_opt(2024, 5, 2), name: None })
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/rollcall/attendance.db");
        let store = AttendanceStore::open(&path).await.unwrap();
        store.mark("dave", at("2024-05-01 10:00:00"), MarkSource::Upload).await.unwrap();
        drop(store);

        let reopened = AttendanceStore::open(&path).await.unwrap();
        assert_eq!(reopened.list(RecordFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recorder_persists_sightings() {
        let store = AttendanceStore::open_in_memory().await.unwrap();
        let (tx, rx) = mpsc::channel(4);
        let recorder = spawn_recorder(store.clone(), rx);

        let now = at("2024-05-01 10:00:00");
        tx.send(Sighting { identity: "erin".into(), at: now }).await.unwrap();
        tx.send(Sighting { identity: "erin".into(), at: now }).await.unwrap();
        drop(tx);
        recorder.await.unwrap();

        assert_eq!(store.count_for_date(now.date()).await.unwrap(), 1);
    }
}
