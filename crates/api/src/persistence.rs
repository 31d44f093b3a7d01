//! File-backed schema and history stores, plus the on-disk request outputs.
//!
//! One pretty-printed JSON file per owner key or session. Writes go to a
//! temporary sibling first and are renamed into place.

use anyhow::{Context, Result};
use async_trait::async_trait;
use cite::CitationList;
use dashmap::DashMap;
use extract::{ExtractionRecord, HistoryStore, SchemaSpec, SchemaStore, Turn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

fn file_stem_is_safe(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

fn json_path(dir: &Path, key: &str) -> Result<PathBuf> {
    if !file_stem_is_safe(key) {
        anyhow::bail!("'{}' cannot be used as a file name", key);
    }
    Ok(dir.join(format!("{}.json", key)))
}

async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4()));
    fs::write(&tmp, json)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

async fn read_json_opt<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(raw) => {
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to deserialize {}", path.display()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

async fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create directory {}", dir.display()))
}

/// `<dir>/<owner_key>.json`
pub struct FileSchemaStore {
    dir: PathBuf,
}

impl FileSchemaStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure_dir(&dir).await?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl SchemaStore for FileSchemaStore {
    async fn get_schema(&self, owner_key: &str) -> Result<Option<SchemaSpec>> {
        read_json_opt(&json_path(&self.dir, owner_key)?).await
    }

    async fn put_schema(&self, owner_key: &str, spec: &SchemaSpec) -> Result<()> {
        let path = json_path(&self.dir, owner_key)?;
        write_json_atomic(&path, spec).await?;
        debug!(owner = owner_key, version = spec.version, path = %path.display(), "Schema written");
        Ok(())
    }

    async fn delete_schema(&self, owner_key: &str) -> Result<bool> {
        let path = json_path(&self.dir, owner_key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

/// `<dir>/<session_id>.json` holding the session's turns, oldest first.
pub struct FileHistoryStore {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileHistoryStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure_dir(&dir).await?;
        Ok(Self { dir, locks: DashMap::new() })
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<()> {
        let path = json_path(&self.dir, session_id)?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut turns: Vec<Turn> = read_json_opt(&path).await?.unwrap_or_default();
        turns.push(turn);
        write_json_atomic(&path, &turns).await
    }

    async fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>> {
        let path = json_path(&self.dir, session_id)?;
        let turns: Vec<Turn> = read_json_opt(&path).await?.unwrap_or_default();
        let start = turns.len().saturating_sub(limit);
        Ok(turns[start..].to_vec())
    }
}

/// Write `<dir>/<request_id>/structured.json` and `citations.json`.
pub async fn write_outputs(
    dir: &Path,
    request_id: &str,
    records: &[ExtractionRecord],
    citations: &CitationList,
) -> Result<PathBuf> {
    let out = dir.join(request_id);
    ensure_dir(&out).await?;
    write_json_atomic(&out.join("structured.json"), records).await?;
    write_json_atomic(&out.join("citations.json"), citations).await?;
    debug!(request_id, path = %out.display(), "Outputs written");
    Ok(out)
}
