use std::path::{Component, Path, PathBuf};

use huddle_shared::{ChatError, ChatResult};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

/// Keep a resolved path inside `base`.
fn ensure_within(base: &Path, target: &Path) -> ChatResult<PathBuf> {
    let relative = target.strip_prefix(base).unwrap_or(target);
    let mut resolved = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::ParentDir => {
                return Err(ChatError::InvalidRequest("path traversal detected".into()));
            }
            _ => {}
        }
    }
    Ok(resolved)
}

/// Uploaded media blobs on local disk, one file per blob named by UUID.
/// Messages carry the UUID string as their `media` reference.
#[derive(Debug, Clone)]
pub struct MediaStore {
    base_path: PathBuf,
    max_size: usize,
}

impl MediaStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> ChatResult<Self> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ChatError::Internal(format!(
                "failed to create media directory '{}': {e}",
                base_path.display()
            ))
        })?;

        info!(path = %base_path.display(), max_size, "Media store initialized");
        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub async fn store(&self, data: &[u8]) -> ChatResult<Uuid> {
        if data.is_empty() {
            return Err(ChatError::InvalidRequest("empty media upload".into()));
        }
        if data.len() > self.max_size {
            return Err(ChatError::MediaTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let id = Uuid::new_v4();
        let path = self.blob_path(&id)?;
        fs::write(&path, data)
            .await
            .map_err(|e| ChatError::Internal(format!("failed to write media {id}: {e}")))?;

        debug!(id = %id, size = data.len(), "Stored media");
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> ChatResult<Vec<u8>> {
        let path = self.blob_path(&id)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ChatError::MediaNotFound),
            Err(e) => Err(ChatError::Internal(format!("failed to read media {id}: {e}"))),
        }
    }

    /// Whether `reference` names a stored blob.
    pub async fn contains(&self, reference: &str) -> bool {
        let Ok(id) = Uuid::parse_str(reference) else {
            return false;
        };
        match self.blob_path(&id) {
            Ok(path) => fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    fn blob_path(&self, id: &Uuid) -> ChatResult<PathBuf> {
        ensure_within(&self.base_path, &self.base_path.join(id.to_string()))
    }
}
