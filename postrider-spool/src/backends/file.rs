use std::path::{Path, PathBuf};

use async_trait::async_trait;
use postrider_common::QueueId;
use tokio::{
    fs,
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::{debug, warn};

use crate::{
    MessageMeta, SpoolError,
    store::{BlobStore, BodyReader},
};

const BODY_EXT: &str = "eml";
const META_EXT: &str = "meta";

/// File-backed blob store
///
/// One `<id>.eml` body file plus a `<id>.meta` bincode sidecar per
/// message. Ids are validated hex, so the filename cannot escape the
/// spool directory.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Open a spool directory, creating it when absent
    pub async fn open(root: impl Into<PathBuf>) -> crate::Result<Self> {
        let root = root.into();

        if !fs::try_exists(&root).await? {
            fs::create_dir_all(&root).await?;
        }
        let metadata = fs::metadata(&root).await.map_err(|e| SpoolError::BadSpoolDir {
            path: root.display().to_string(),
            problem: e.to_string(),
        })?;
        if !metadata.is_dir() {
            return Err(SpoolError::BadSpoolDir {
                path: root.display().to_string(),
                problem: "not a directory".to_string(),
            });
        }

        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn body_path(&self, id: &QueueId) -> PathBuf {
        self.root.join(format!("{id}.{BODY_EXT}"))
    }

    fn meta_path(&self, id: &QueueId) -> PathBuf {
        self.root.join(format!("{id}.{META_EXT}"))
    }

    async fn scan_before(&self, cutoff_ms: u64) -> crate::Result<Vec<QueueId>> {
        let mut ids = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(&format!(".{BODY_EXT}")) else {
                continue;
            };
            if let Some(id) = QueueId::parse(stem)
                && id.timestamp_ms() <= cutoff_ms
            {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn store(
        &self,
        id: &QueueId,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> crate::Result<u64> {
        let path = self.body_path(id);
        let mut file = fs::File::create(&path).await?;

        match tokio::io::copy(body, &mut file).await {
            Ok(size) => {
                file.flush().await?;
                debug!(id = %id, size, "Stored message body");
                Ok(size)
            }
            Err(e) => {
                // Finalize the partial file so the writer shuts down
                // cleanly, then take it back out; the caller gets the
                // upstream error.
                let _ = file.shutdown().await;
                drop(file);
                if let Err(cleanup) = fs::remove_file(&path).await {
                    warn!(id = %id, error = %cleanup, "Failed to remove partial body");
                }
                Err(SpoolError::Io(e))
            }
        }
    }

    async fn retrieve(&self, id: &QueueId) -> crate::Result<BodyReader> {
        match fs::File::open(self.body_path(id)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SpoolError::NotFound(id.clone()))
            }
            Err(e) => Err(SpoolError::Io(e)),
        }
    }

    async fn set_meta(&self, id: &QueueId, meta: &MessageMeta) -> crate::Result<()> {
        if !fs::try_exists(self.body_path(id)).await? {
            return Err(SpoolError::NotFound(id.clone()));
        }

        let encoded = bincode::serde::encode_to_vec(meta, bincode::config::legacy())?;
        fs::write(self.meta_path(id), encoded).await?;
        Ok(())
    }

    async fn get_meta(&self, id: &QueueId) -> crate::Result<MessageMeta> {
        let bytes = match fs::read(self.meta_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SpoolError::NotFound(id.clone()));
            }
            Err(e) => return Err(SpoolError::Io(e)),
        };

        let (meta, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())?;
        Ok(meta)
    }

    async fn remove_message(&self, id: &QueueId) -> crate::Result<()> {
        for path in [self.body_path(id), self.meta_path(id)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(SpoolError::Io(e)),
            }
        }
        Ok(())
    }

    async fn exists(&self, id: &QueueId) -> crate::Result<bool> {
        Ok(fs::try_exists(self.body_path(id)).await?)
    }

    async fn delete_before(&self, cutoff_ms: u64) -> crate::Result<u64> {
        let ids = self.scan_before(cutoff_ms).await?;
        let mut removed = 0;
        for id in ids {
            self.remove_message(&id).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn list_uploaded_before(&self, cutoff_ms: u64) -> crate::Result<Vec<QueueId>> {
        self.scan_before(cutoff_ms).await
    }
}
