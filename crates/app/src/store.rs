use std::{collections::HashMap, fs, sync::Arc};

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Outcome of one scenario build, one record kept per bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub bot: String,
    pub ok: bool,
    pub summary: String,
    pub completed_at: String,
}

impl BuildRecord {
    pub fn new(bot: impl Into<String>, ok: bool, summary: impl Into<String>) -> Self {
        Self {
            bot: bot.into(),
            ok,
            summary: summary.into(),
            completed_at: Utc::now().to_rfc3339(),
        }
    }

    /// Plain-text rendering served by the last-build-result endpoint.
    pub fn as_text(&self) -> String {
        let status = if self.ok { "OK" } else { "NG" };
        format!("{}\t{}\t{}", self.completed_at, status, self.summary)
    }
}

pub trait BuildResultStore: Send + Sync {
    fn record(&self, record: BuildRecord) -> Result<()>;
    fn last(&self, bot: &str) -> Result<Option<BuildRecord>>;
    fn clear(&self, bot: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryBuildResultStore {
    inner: Mutex<HashMap<String, BuildRecord>>,
}

impl InMemoryBuildResultStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
        })
    }
}

impl BuildResultStore for InMemoryBuildResultStore {
    fn record(&self, record: BuildRecord) -> Result<()> {
        self.inner.lock().insert(record.bot.clone(), record);
        Ok(())
    }

    fn last(&self, bot: &str) -> Result<Option<BuildRecord>> {
        Ok(self.inner.lock().get(bot).cloned())
    }

    fn clear(&self, bot: &str) -> Result<()> {
        self.inner.lock().remove(bot);
        Ok(())
    }
}

pub struct FileBuildResultStore {
    path: Utf8PathBuf,
    inner: Mutex<HashMap<String, BuildRecord>>,
}

impl FileBuildResultStore {
    pub fn new(path: Utf8PathBuf) -> Result<Arc<Self>> {
        let data = Self::load_from_disk(&path).unwrap_or_default();
        Ok(Arc::new(Self {
            path,
            inner: Mutex::new(data),
        }))
    }

    fn load_from_disk(path: &Utf8PathBuf) -> Result<HashMap<String, BuildRecord>> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, "[]")?;
            return Ok(HashMap::new());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read build result store {path}"))?;
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<BuildRecord> =
            serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {path}"))?;
        Ok(rows.into_iter().map(|row| (row.bot.clone(), row)).collect())
    }

    fn persist(&self, guard: &HashMap<String, BuildRecord>) -> Result<()> {
        let rows: Vec<_> = guard.values().cloned().collect();
        let json = serde_json::to_string_pretty(&rows)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, json)
            .with_context(|| format!("failed to write build result store {}", self.path))?;
        Ok(())
    }
}

impl BuildResultStore for FileBuildResultStore {
    fn record(&self, record: BuildRecord) -> Result<()> {
        let mut guard = self.inner.lock();
        guard.insert(record.bot.clone(), record);
        self.persist(&guard)
    }

    fn last(&self, bot: &str) -> Result<Option<BuildRecord>> {
        Ok(self.inner.lock().get(bot).cloned())
    }

    fn clear(&self, bot: &str) -> Result<()> {
        let mut guard = self.inner.lock();
        if guard.remove(bot).is_some() {
            self.persist(&guard)?;
        }
        Ok(())
    }
}
