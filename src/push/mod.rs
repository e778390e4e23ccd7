//! Push Subscription store (spec.md §3 — "optional external" data model;
//! delivery to the third-party push service itself is explicitly out of
//! scope per spec.md §1, so this module only owns the subscription records,
//! not their delivery).
//!
//! One file per browser profile under `{dataDir}/push/{browserProfileId}.json`,
//! matching the persisted state layout in spec.md §6.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscription {
    pub browser_profile_id: String,
    pub endpoint: String,
    pub keys: serde_json::Value,
    pub device_name: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct PushStore {
    dir: PathBuf,
    /// Serializes writers per the ambient persistence rule (SPEC_FULL §10);
    /// one mutex for the whole directory is simpler than one per file and
    /// push subscription churn is low-frequency.
    write_lock: Arc<Mutex<()>>,
}

impl PushStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("push"),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn path_for(&self, browser_profile_id: &str) -> PathBuf {
        self.dir.join(format!("{browser_profile_id}.json"))
    }

    pub async fn subscribe(&self, subscription: PushSubscription) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&subscription.browser_profile_id);
        let bytes = serde_json::to_vec_pretty(&subscription)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, browser_profile_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(browser_profile_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("removing push subscription"),
        }
    }

    pub async fn list(&self) -> Result<Vec<PushSubscription>> {
        let _guard = self.write_lock.lock().await;
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e).context("reading push subscription directory"),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            if let Ok(sub) = serde_json::from_slice(&bytes) {
                out.push(sub);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PushStore::new(dir.path());
        store
            .subscribe(PushSubscription {
                browser_profile_id: "profile-1".into(),
                endpoint: "https://push.example/ep".into(),
                keys: serde_json::json!({"p256dh": "abc", "auth": "def"}),
                device_name: Some("laptop".into()),
                created_at: chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                    .unwrap()
                    .with_timezone(&chrono::Utc),
            })
            .await
            .unwrap();

        let subs = store.list().await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].browser_profile_id, "profile-1");
    }

    #[tokio::test]
    async fn unsubscribe_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = PushStore::new(dir.path());
        store
            .subscribe(PushSubscription {
                browser_profile_id: "profile-2".into(),
                endpoint: "https://push.example/ep2".into(),
                keys: serde_json::json!({}),
                device_name: None,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        store.unsubscribe("profile-2").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
