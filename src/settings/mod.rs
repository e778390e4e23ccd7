//! Operator-assigned session settings (SPEC_FULL §3 — `Session`'s
//! `title`/`starred`/`archived` attributes, none of which the transcript
//! file itself carries).
//!
//! Persisted at `{dataDir}/settings.json` via the same atomic
//! write-then-rename idiom [`crate::auth::AuthState`] uses, one
//! `tokio::sync::Mutex` serializing writers (SPEC_FULL §10).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Operator overrides for one session, keyed by session id in the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<RwLock<HashMap<String, SessionSettings>>>,
    path: PathBuf,
}

impl SettingsStore {
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("settings.json");
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).context("parsing settings.json")?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e).context("reading settings.json"),
        };
        Ok(Self {
            inner: Arc::new(RwLock::new(entries)),
            path,
        })
    }

    pub async fn get(&self, session_id: &str) -> SessionSettings {
        self.inner
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Apply a partial update (`None` fields left unchanged) and persist.
    pub async fn update(
        &self,
        session_id: &str,
        title: Option<Option<String>>,
        starred: Option<bool>,
        archived: Option<bool>,
    ) -> Result<SessionSettings> {
        let mut guard = self.inner.write().await;
        let entry = guard.entry(session_id.to_string()).or_default();
        if let Some(title) = title {
            entry.title = title;
        }
        if let Some(starred) = starred {
            entry.starred = starred;
        }
        if let Some(archived) = archived {
            entry.archived = archived;
        }
        let updated = entry.clone();
        let snapshot = guard.clone();
        drop(guard);
        self.persist(&snapshot).await?;
        Ok(updated)
    }

    async fn persist(&self, snapshot: &HashMap<String, SessionSettings>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_persists_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path()).await.unwrap();

        store
            .update("s1", Some(Some("My title".to_string())), Some(true), None)
            .await
            .unwrap();

        let reloaded = SettingsStore::load(dir.path()).await.unwrap();
        let settings = reloaded.get("s1").await;
        assert_eq!(settings.title.as_deref(), Some("My title"));
        assert!(settings.starred);
        assert!(!settings.archived);
    }

    #[tokio::test]
    async fn unknown_session_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path()).await.unwrap();
        let settings = store.get("unknown").await;
        assert!(settings.title.is_none());
        assert!(!settings.starred);
    }
}
