//! JSON state file holding the whole store, replaced atomically on save.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::{sha256_hex, Store, StoreState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedState {
    pub content_hash: String,
    pub byte_size: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the store. A missing file is an empty store.
    pub async fn load(&self) -> anyhow::Result<Store> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no state file yet, starting empty");
                return Ok(Store::new());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading state file {}", self.path.display()))
            }
        };
        let state: StoreState = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing state file {}", self.path.display()))?;
        Ok(Store::from_state(state))
    }

    /// Write the store through a temp file in the same directory and rename
    /// it over the previous state.
    pub async fn save(&self, store: &Store) -> anyhow::Result<SavedState> {
        let bytes = serde_json::to_vec_pretty(store.state()).context("serializing store state")?;
        let content_hash = sha256_hex(&bytes);

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating state directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp state {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        Ok(SavedState {
            content_hash,
            byte_size: bytes.len(),
            path: self.path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lobbysync_core::{NaturalKey, Representative, RepresentativeProfile, Status};
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_loads_an_empty_store() {
        let dir = tempdir().expect("tempdir");
        let file = StateFile::new(dir.path().join("state.json"));
        let store = file.load().await.expect("load");
        assert!(store.state().audit.is_empty());
    }

    #[tokio::test]
    async fn saved_state_round_trips_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let file = StateFile::new(dir.path().join("nested/state.json"));

        let mut store = Store::new();
        let mut uow = store.begin();
        uow.create(Representative {
            identification_code: "123456789-01".into(),
            profile: RepresentativeProfile {
                name: "Foo".into(),
                ..Default::default()
            },
            status: Status::Active,
        })
        .expect("create");
        store.commit(uow).expect("commit");

        let first = file.save(&store).await.expect("save");
        let second = file.save(&store).await.expect("save again");
        assert_eq!(first.content_hash, second.content_hash);

        let loaded = file.load().await.expect("load");
        assert!(loaded
            .find_live::<Representative>(&NaturalKey::registration("123456789-01"))
            .is_some());
        assert_eq!(loaded.state().audit.len(), 1);

        let entries = std::fs::read_dir(dir.path().join("nested"))
            .expect("read dir")
            .count();
        assert_eq!(entries, 1);
    }
}
