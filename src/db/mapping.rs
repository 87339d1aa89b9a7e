//! Mapping overrides and download queue persistence

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Database;

/// Status of a persisted queue item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    NotStarted,
    Downloading,
    Errored,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStatus::NotStarted => write!(f, "not_started"),
            QueueStatus::Downloading => write!(f, "downloading"),
            QueueStatus::Errored => write!(f, "errored"),
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(QueueStatus::NotStarted),
            "downloading" => Ok(QueueStatus::Downloading),
            "errored" => Ok(QueueStatus::Errored),
            _ => Err(format!("Unknown queue status: {}", s)),
        }
    }
}

/// A queued chapter as stored on disk; `page_data` holds the serialized pages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueRecord {
    pub provider: String,
    pub media_id: i32,
    pub chapter_id: String,
    pub chapter_number: String,
    #[serde(skip)]
    pub page_data: String,
    pub status: QueueStatus,
}

/// Persistence collaborator for mapping overrides and the download queue
pub trait MappingStore: Send + Sync {
    fn manga_mapping(&self, provider: &str, media_id: i32) -> Result<Option<String>>;
    fn set_manga_mapping(&self, provider: &str, media_id: i32, manga_id: &str) -> Result<()>;
    fn delete_manga_mapping(&self, provider: &str, media_id: i32) -> Result<()>;

    fn onlinestream_mapping(&self, provider: &str, media_id: i32) -> Result<Option<String>>;
    fn set_onlinestream_mapping(&self, provider: &str, media_id: i32, anime_id: &str)
        -> Result<()>;
    fn delete_onlinestream_mapping(&self, provider: &str, media_id: i32) -> Result<()>;

    /// Insert a `not_started` item, replacing any item with the same chapter key
    fn insert_queue_item(&self, record: &QueueRecord) -> Result<()>;
    fn update_queue_item_status(
        &self,
        provider: &str,
        media_id: i32,
        chapter_id: &str,
        status: QueueStatus,
    ) -> Result<()>;
    /// Oldest `not_started` item
    fn next_queue_item(&self) -> Result<Option<QueueRecord>>;
    fn delete_queue_item(&self, provider: &str, media_id: i32, chapter_id: &str) -> Result<()>;
    fn queue_items(&self) -> Result<Vec<QueueRecord>>;
    fn queued_chapters(&self, media_id: i32) -> Result<Vec<QueueRecord>>;
    /// Put interrupted downloads back into the `not_started` state
    fn reset_downloading_queue_items(&self) -> Result<usize>;
    /// Remove every item that is not currently downloading
    fn clear_queue(&self) -> Result<usize>;
    fn clear_errored(&self) -> Result<usize>;
}

const QUEUE_COLUMNS: &str = "provider, media_id, chapter_id, chapter_number, page_data, status";

fn queue_record_from_row(row: &Row<'_>) -> rusqlite::Result<QueueRecord> {
    let status: String = row.get(5)?;
    Ok(QueueRecord {
        provider: row.get(0)?,
        media_id: row.get(1)?,
        chapter_id: row.get(2)?,
        chapter_number: row.get(3)?,
        page_data: row.get(4)?,
        status: status.parse().unwrap_or(QueueStatus::NotStarted),
    })
}

impl MappingStore for Database {
    fn manga_mapping(&self, provider: &str, media_id: i32) -> Result<Option<String>> {
        let id = self
            .conn()
            .query_row(
                "SELECT manga_id FROM manga_mappings WHERE provider = ? AND media_id = ?",
                params![provider, media_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read manga mapping")?;
        Ok(id)
    }

    fn set_manga_mapping(&self, provider: &str, media_id: i32, manga_id: &str) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO manga_mappings (provider, media_id, manga_id) VALUES (?, ?, ?)
                 ON CONFLICT(provider, media_id) DO UPDATE SET
                    manga_id = excluded.manga_id,
                    updated_at = CURRENT_TIMESTAMP",
                params![provider, media_id, manga_id],
            )
            .context("Failed to save manga mapping")?;
        Ok(())
    }

    fn delete_manga_mapping(&self, provider: &str, media_id: i32) -> Result<()> {
        self.conn().execute(
            "DELETE FROM manga_mappings WHERE provider = ? AND media_id = ?",
            params![provider, media_id],
        )?;
        Ok(())
    }

    fn onlinestream_mapping(&self, provider: &str, media_id: i32) -> Result<Option<String>> {
        let id = self
            .conn()
            .query_row(
                "SELECT anime_id FROM onlinestream_mappings WHERE provider = ? AND media_id = ?",
                params![provider, media_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read onlinestream mapping")?;
        Ok(id)
    }

    fn set_onlinestream_mapping(
        &self,
        provider: &str,
        media_id: i32,
        anime_id: &str,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO onlinestream_mappings (provider, media_id, anime_id) VALUES (?, ?, ?)
                 ON CONFLICT(provider, media_id) DO UPDATE SET
                    anime_id = excluded.anime_id,
                    updated_at = CURRENT_TIMESTAMP",
                params![provider, media_id, anime_id],
            )
            .context("Failed to save onlinestream mapping")?;
        Ok(())
    }

    fn delete_onlinestream_mapping(&self, provider: &str, media_id: i32) -> Result<()> {
        self.conn().execute(
            "DELETE FROM onlinestream_mappings WHERE provider = ? AND media_id = ?",
            params![provider, media_id],
        )?;
        Ok(())
    }

    fn insert_queue_item(&self, record: &QueueRecord) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO chapter_download_queue
                    (provider, media_id, chapter_id, chapter_number, page_data, status)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    record.provider,
                    record.media_id,
                    record.chapter_id,
                    record.chapter_number,
                    record.page_data,
                    QueueStatus::NotStarted.to_string(),
                ],
            )
            .context("Failed to insert queue item")?;
        Ok(())
    }

    fn update_queue_item_status(
        &self,
        provider: &str,
        media_id: i32,
        chapter_id: &str,
        status: QueueStatus,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE chapter_download_queue SET status = ?
             WHERE provider = ? AND media_id = ? AND chapter_id = ?",
            params![status.to_string(), provider, media_id, chapter_id],
        )?;
        Ok(())
    }

    fn next_queue_item(&self) -> Result<Option<QueueRecord>> {
        let sql = format!(
            "SELECT {} FROM chapter_download_queue WHERE status = 'not_started' ORDER BY id ASC LIMIT 1",
            QUEUE_COLUMNS
        );
        let record = self
            .conn()
            .query_row(&sql, [], queue_record_from_row)
            .optional()?;
        Ok(record)
    }

    fn delete_queue_item(&self, provider: &str, media_id: i32, chapter_id: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM chapter_download_queue
             WHERE provider = ? AND media_id = ? AND chapter_id = ?",
            params![provider, media_id, chapter_id],
        )?;
        Ok(())
    }

    fn queue_items(&self) -> Result<Vec<QueueRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM chapter_download_queue ORDER BY id ASC",
            QUEUE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map([], queue_record_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn queued_chapters(&self, media_id: i32) -> Result<Vec<QueueRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM chapter_download_queue WHERE media_id = ? ORDER BY id ASC",
            QUEUE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![media_id], queue_record_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn reset_downloading_queue_items(&self) -> Result<usize> {
        let count = self.conn().execute(
            "UPDATE chapter_download_queue SET status = 'not_started' WHERE status = 'downloading'",
            [],
        )?;
        Ok(count)
    }

    fn clear_queue(&self) -> Result<usize> {
        let count = self.conn().execute(
            "DELETE FROM chapter_download_queue WHERE status != 'downloading'",
            [],
        )?;
        Ok(count)
    }

    fn clear_errored(&self) -> Result<usize> {
        let count = self.conn().execute(
            "DELETE FROM chapter_download_queue WHERE status = 'errored'",
            [],
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chapter_id: &str) -> QueueRecord {
        QueueRecord {
            provider: "comick".to_string(),
            media_id: 1,
            chapter_id: chapter_id.to_string(),
            chapter_number: "1".to_string(),
            page_data: "[]".to_string(),
            status: QueueStatus::NotStarted,
        }
    }

    #[test]
    fn test_manga_mapping() {
        let db = Database::in_memory().unwrap();

        assert_eq!(db.manga_mapping("comick", 1).unwrap(), None);
        db.set_manga_mapping("comick", 1, "abc").unwrap();
        db.set_manga_mapping("comick", 1, "def").unwrap();
        assert_eq!(db.manga_mapping("comick", 1).unwrap().as_deref(), Some("def"));
        assert_eq!(db.manga_mapping("mangadex", 1).unwrap(), None);

        db.delete_manga_mapping("comick", 1).unwrap();
        assert_eq!(db.manga_mapping("comick", 1).unwrap(), None);
    }

    #[test]
    fn test_onlinestream_mapping() {
        let db = Database::in_memory().unwrap();

        db.set_onlinestream_mapping("gogoanime", 21, "one-piece").unwrap();
        assert_eq!(
            db.onlinestream_mapping("gogoanime", 21).unwrap().as_deref(),
            Some("one-piece")
        );
        db.delete_onlinestream_mapping("gogoanime", 21).unwrap();
        assert_eq!(db.onlinestream_mapping("gogoanime", 21).unwrap(), None);
    }

    #[test]
    fn test_queue_is_fifo() {
        let db = Database::in_memory().unwrap();

        db.insert_queue_item(&record("a")).unwrap();
        db.insert_queue_item(&record("b")).unwrap();

        let next = db.next_queue_item().unwrap().unwrap();
        assert_eq!(next.chapter_id, "a");

        db.update_queue_item_status("comick", 1, "a", QueueStatus::Downloading)
            .unwrap();
        let next = db.next_queue_item().unwrap().unwrap();
        assert_eq!(next.chapter_id, "b");

        db.delete_queue_item("comick", 1, "a").unwrap();
        assert_eq!(db.queue_items().unwrap().len(), 1);
    }

    #[test]
    fn test_reinsert_replaces_item() {
        let db = Database::in_memory().unwrap();

        db.insert_queue_item(&record("a")).unwrap();
        db.update_queue_item_status("comick", 1, "a", QueueStatus::Errored)
            .unwrap();
        db.insert_queue_item(&record("a")).unwrap();

        let items = db.queue_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::NotStarted);
    }

    #[test]
    fn test_reset_and_clear() {
        let db = Database::in_memory().unwrap();

        db.insert_queue_item(&record("a")).unwrap();
        db.insert_queue_item(&record("b")).unwrap();
        db.insert_queue_item(&record("c")).unwrap();
        db.update_queue_item_status("comick", 1, "a", QueueStatus::Downloading)
            .unwrap();
        db.update_queue_item_status("comick", 1, "b", QueueStatus::Errored)
            .unwrap();

        assert_eq!(db.clear_errored().unwrap(), 1);
        assert_eq!(db.clear_queue().unwrap(), 1);

        let items = db.queue_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::Downloading);

        assert_eq!(db.reset_downloading_queue_items().unwrap(), 1);
        assert_eq!(db.queued_chapters(1).unwrap()[0].status, QueueStatus::NotStarted);
        assert!(db.queued_chapters(2).unwrap().is_empty());
    }
}
