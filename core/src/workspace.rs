//! Workspace: the on-disk layout backing the engine's persistence.
//!
//! Each stage `S` gets three direct siblings under the working directory:
//! `S_result.json` (the result artifact), `S_config.json` (the sidecar --
//! named for parity with the source's sidecar file, which really is the
//! stage's config+identity snapshot, not its cache), and `S_cache/` (the
//! stage's own scratch directory). Grounded on the source's
//! `%s_config.yml`/`%s_result.p`/cache-dir sibling-file convention; no
//! separate metadata directory. Async file IO via `tokio::fs` matches the
//! teacher's async-first style.

use std::path::{Path, PathBuf};

use crate::error::ExecutorError;
use crate::sidecar::Sidecar;
use crate::stage::StageValue;

pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open (creating if necessary) the workspace rooted at `root`. `root`
    /// must either not exist yet (it will be created) or already be a
    /// directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ExecutorError> {
        let root = root.into();

        if root.exists() && !root.is_dir() {
            return Err(ExecutorError::WorkspaceNotDirectory { path: root });
        }

        tokio::fs::create_dir_all(&root).await.map_err(|source| ExecutorError::Io {
            operation: "create working directory".to_string(),
            path: root.clone(),
            source,
        })?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory a stage's `execute` hook may use for arbitrary side
    /// files.
    pub fn cache_dir(&self, stage: &str) -> PathBuf {
        self.root.join(format!("{stage}_cache"))
    }

    /// Remove and recreate `stage`'s cache directory so every `execute`
    /// starts from an empty scratch space, matching the source's
    /// `shutil.rmtree` + `os.mkdir` before each run.
    pub async fn ensure_cache_dir(&self, stage: &str) -> Result<PathBuf, ExecutorError> {
        let path = self.cache_dir(stage);

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ExecutorError::Io {
                    operation: "clear stage cache directory".to_string(),
                    path: path.clone(),
                    source,
                })
            }
        }

        tokio::fs::create_dir_all(&path).await.map_err(|source| ExecutorError::Io {
            operation: "create stage cache directory".to_string(),
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    fn sidecar_path(&self, stage: &str) -> PathBuf {
        self.root.join(format!("{stage}_config.json"))
    }

    fn result_path(&self, stage: &str) -> PathBuf {
        self.root.join(format!("{stage}_result.json"))
    }

    /// Read back a stage's sidecar. A missing file and a present-but-
    /// unparseable file (corrupt JSON, a field added/removed by a newer
    /// engine version) are both treated as "no valid sidecar" rather than
    /// a fatal error -- either one just means this stage is stale.
    pub async fn read_sidecar(&self, stage: &str) -> Result<Option<Sidecar>, ExecutorError> {
        let path = self.sidecar_path(stage);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ExecutorError::Io { operation: "read sidecar".to_string(), path, source }),
        }
    }

    pub async fn write_sidecar(&self, stage: &str, sidecar: &Sidecar) -> Result<(), ExecutorError> {
        let path = self.sidecar_path(stage);
        let bytes = serde_json::to_vec_pretty(sidecar).map_err(|source| ExecutorError::Codec {
            stage: stage.to_string(),
            what: "sidecar",
            source,
        })?;
        tokio::fs::write(&path, bytes).await.map_err(|source| ExecutorError::Io {
            operation: "write sidecar".to_string(),
            path,
            source,
        })
    }

    pub async fn read_result(&self, stage: &str) -> Result<Option<StageValue>, ExecutorError> {
        let path = self.result_path(stage);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|source| ExecutorError::Codec {
                    stage: stage.to_string(),
                    what: "cached result",
                    source,
                })?;
                Ok(Some(value))
            }
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ExecutorError::Io { operation: "read result".to_string(), path, source }),
        }
    }

    pub async fn write_result(&self, stage: &str, value: &StageValue) -> Result<(), ExecutorError> {
        let path = self.result_path(stage);
        let bytes = serde_json::to_vec(value).map_err(|source| ExecutorError::Codec {
            stage: stage.to_string(),
            what: "result",
            source,
        })?;
        tokio::fs::write(&path, bytes).await.map_err(|source| ExecutorError::Io {
            operation: "write result".to_string(),
            path,
            source,
        })
    }
}
