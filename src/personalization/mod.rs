//! Name-keyed participant profiles: free-text context lines with
//! most-recent-N retention, backed by SQLite.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub name_key: String,
    pub display_name: String,
    pub context_lines: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Lowercased, trimmed lookup key for a display name.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

pub struct PersonalizationStore {
    conn: Mutex<Connection>,
    max_context_lines: usize,
}

impl PersonalizationStore {
    pub fn open(path: &Path, max_context_lines: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening personalization db {}", path.display()))?;
        Self::init(conn, max_context_lines)
    }

    pub fn open_in_memory(max_context_lines: usize) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, max_context_lines)
    }

    fn init(conn: Connection, max_context_lines: usize) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS profiles (
                name_key TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS context_lines (
                name_key TEXT NOT NULL,
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                line TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_context_lines_name
                ON context_lines(name_key, seq);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_context_lines,
        })
    }

    pub async fn get_profile(&self, name: &str) -> Result<Profile> {
        let key = name_key(name);
        let conn = self.conn.lock().await;
        Self::load(&conn, &key, name)
    }

    fn load(conn: &Connection, key: &str, fallback_display: &str) -> Result<Profile> {
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT display_name, updated_at FROM profiles WHERE name_key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let mut stmt = conn.prepare(
            "SELECT line FROM context_lines WHERE name_key = ?1 ORDER BY seq ASC",
        )?;
        let context_lines: Vec<String> = stmt
            .query_map([key], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let (display_name, updated_at) = match row {
            Some((display, at)) => (
                display,
                at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
            ),
            None => (fallback_display.trim().to_string(), Utc::now()),
        };

        Ok(Profile {
            name_key: key.to_string(),
            display_name,
            context_lines,
            updated_at,
        })
    }

    /// Append one context line, keeping only the most recent N.
    pub async fn append_context(&self, name: &str, text: &str) -> Result<Profile> {
        let key = name_key(name);
        let trimmed = text.trim();
        anyhow::ensure!(!trimmed.is_empty(), "context text is required");

        let now = Utc::now();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO profiles (name_key, display_name, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(name_key) DO UPDATE SET
                display_name = excluded.display_name,
                updated_at = excluded.updated_at",
            rusqlite::params![key, name.trim(), now.to_rfc3339()],
        )?;
        conn.execute(
            "INSERT INTO context_lines (name_key, line, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, trimmed, now.to_rfc3339()],
        )?;
        conn.execute(
            "DELETE FROM context_lines WHERE name_key = ?1 AND seq NOT IN (
                SELECT seq FROM context_lines WHERE name_key = ?1
                ORDER BY seq DESC LIMIT ?2
            )",
            rusqlite::params![key, self.max_context_lines as i64],
        )?;

        Self::load(&conn, &key, name)
    }

    /// Up to `max` most recent context lines for prompt injection.
    pub async fn prompt_lines(&self, name: &str, max: usize) -> Result<Vec<String>> {
        let profile = self.get_profile(name).await?;
        let skip = profile.context_lines.len().saturating_sub(max);
        Ok(profile.context_lines.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn profile_defaults_for_unknown_name() {
        let store = PersonalizationStore::open_in_memory(10).unwrap();
        let profile = store.get_profile("  Casey ").await.unwrap();
        assert_eq!(profile.name_key, "casey");
        assert_eq!(profile.display_name, "Casey");
        assert!(profile.context_lines.is_empty());
    }

    #[tokio::test]
    async fn append_keeps_most_recent_n() {
        let store = PersonalizationStore::open_in_memory(3).unwrap();
        for i in 0..5 {
            store
                .append_context("casey", &format!("line {i}"))
                .await
                .unwrap();
        }
        let profile = store.get_profile("Casey").await.unwrap();
        assert_eq!(profile.context_lines, vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn key_lookup_is_case_insensitive() {
        let store = PersonalizationStore::open_in_memory(10).unwrap();
        store.append_context("Casey", "prefers bullets").await.unwrap();
        let profile = store.get_profile("CASEY").await.unwrap();
        assert_eq!(profile.context_lines.len(), 1);
    }

    #[tokio::test]
    async fn prompt_lines_caps_output() {
        let store = PersonalizationStore::open_in_memory(10).unwrap();
        for i in 0..6 {
            store
                .append_context("casey", &format!("line {i}"))
                .await
                .unwrap();
        }
        let lines = store.prompt_lines("casey", 2).await.unwrap();
        assert_eq!(lines, vec!["line 4", "line 5"]);
    }

    #[tokio::test]
    async fn blank_context_is_rejected() {
        let store = PersonalizationStore::open_in_memory(10).unwrap();
        assert!(store.append_context("casey", "   ").await.is_err());
    }

    #[tokio::test]
    async fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.sqlite");
        {
            let store = PersonalizationStore::open(&path, 10).unwrap();
            store.append_context("casey", "remember me").await.unwrap();
        }
        let store = PersonalizationStore::open(&path, 10).unwrap();
        let profile = store.get_profile("casey").await.unwrap();
        assert_eq!(profile.context_lines, vec!["remember me"]);
    }
}
