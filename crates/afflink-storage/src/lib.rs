//! JSON hand-off artifacts + HTTP client construction for afflink.

use std::path::{Path, PathBuf};
use std::time::Duration;

use afflink_core::ItemRecord;
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("{} not found", .path.display())]
    NotFound { path: PathBuf },
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} contains invalid JSON: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Write(#[from] anyhow::Error),
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let bytes = fs::read(path).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ArtifactError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ArtifactError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Write pretty-printed JSON through a sibling temp file and an atomic rename,
/// replacing any previous artifact at `path`.
pub async fn save_json<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<StoredArtifact, ArtifactError> {
    let bytes = serde_json::to_vec_pretty(value).context("serializing artifact")?;
    write_atomic(path, &bytes).await?;
    let stored = StoredArtifact {
        path: path.to_path_buf(),
        content_hash: sha256_hex(&bytes),
        byte_size: bytes.len(),
    };
    debug!(path = %stored.path.display(), bytes = stored.byte_size, hash = %stored.content_hash, "artifact written");
    Ok(stored)
}

pub async fn load_items(path: &Path) -> Result<Vec<ItemRecord>, ArtifactError> {
    load_json(path).await
}

pub async fn save_items(path: &Path, items: &[ItemRecord]) -> Result<StoredArtifact, ArtifactError> {
    save_json(path, items).await
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating artifact directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp artifact {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Client shared by every call of a stage. Per-request timeouts set on the
/// request builder override `timeout`.
pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn save_replaces_previous_artifact_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("links_converted.json");
        let first: Vec<ItemRecord> =
            serde_json::from_str(r#"[{"link":"a.com"}]"#).expect("items");
        let second: Vec<ItemRecord> =
            serde_json::from_str(r#"[{"link":"b.com"},{"name":"Ü"}]"#).expect("items");

        let a = save_items(&path, &first).await.expect("first save");
        let b = save_items(&path, &second).await.expect("second save");

        assert_ne!(a.content_hash, b.content_hash);
        let reloaded = load_items(&path).await.expect("reload");
        assert_eq!(reloaded, second);

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"Ü\""));
        assert!(text.contains("\n  {"));

        let leftovers = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn missing_file_is_reported_as_not_found() {
        let dir = tempdir().expect("tempdir");
        let err = load_items(&dir.path().join("links.json"))
            .await
            .expect_err("missing");
        assert!(matches!(err, ArtifactError::NotFound { .. }));
        assert!(err.to_string().ends_with("links.json not found"));
    }

    #[tokio::test]
    async fn malformed_json_and_non_arrays_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "[{\"link\": ").expect("write");
        let object = dir.path().join("object.json");
        std::fs::write(&object, "{\"link\": \"a.com\"}").expect("write");

        assert!(matches!(
            load_items(&broken).await,
            Err(ArtifactError::Malformed { .. })
        ));
        assert!(matches!(
            load_items(&object).await,
            Err(ArtifactError::Malformed { .. })
        ));
    }
}
