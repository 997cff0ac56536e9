//! Local file storage.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::{self, File};
use tokio::io::{self, AsyncRead, AsyncWriteExt};

use super::{AccessUrl, ObjectStream, StorageBackend};
use crate::error::{ServerError, ServerResult};
use stash::rid::random_string;

#[derive(Debug)]
pub struct LocalBackend {
    config: LocalStorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// The directory to store all files under.
    path: PathBuf,

    /// Human-readable label.
    pub label: Option<String>,

    /// Region tag used to pick boost copies close to clients.
    pub region: Option<String>,

    /// Whether the destination accepts boost copies.
    #[serde(rename = "is-boost")]
    #[serde(default)]
    pub is_boost: bool,

    /// Public URL prefix the directory is served under.
    ///
    /// If set, clients are redirected to `{access-base-url}/{name}`
    /// instead of being handed the file path.
    #[serde(rename = "access-base-url")]
    pub access_base_url: Option<String>,
}

impl LocalBackend {
    pub async fn new(config: LocalStorageConfig) -> ServerResult<Self> {
        fs::create_dir_all(&config.path)
            .await
            .map_err(ServerError::storage_error)?;

        Ok(Self { config })
    }

    fn get_path(&self, p: &str) -> PathBuf {
        self.config.path.join(p)
    }

    /// Writes the stream to a uniquely-named partial file next to `name`.
    async fn write_partial(
        &self,
        name: &str,
        mut stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<PathBuf> {
        let partial = self.get_path(&format!("{}.{}.partial", name, random_string(8)));

        let write = async {
            let mut file = File::create(&partial).await?;
            io::copy(&mut stream, &mut file).await?;
            file.flush().await?;
            file.sync_all().await
        };

        if let Err(e) = write.await {
            let _ = fs::remove_file(&partial).await;
            return Err(ServerError::storage_error(e));
        }

        Ok(partial)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn upload_file(
        &self,
        name: String,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<()> {
        let partial = self.write_partial(&name, stream).await?;

        if let Err(e) = fs::rename(&partial, self.get_path(&name)).await {
            let _ = fs::remove_file(&partial).await;
            return Err(ServerError::storage_error(e));
        }

        Ok(())
    }

    async fn upload_file_exclusive(
        &self,
        name: String,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<bool> {
        let partial = self.write_partial(&name, stream).await?;

        // Unlike rename, linking fails if the target exists
        let linked = fs::hard_link(&partial, self.get_path(&name)).await;
        let _ = fs::remove_file(&partial).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }

    async fn delete_file(&self, name: String) -> ServerResult<()> {
        match fs::remove_file(self.get_path(&name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }

    async fn download_file(&self, name: String) -> ServerResult<ObjectStream> {
        let file = File::open(self.get_path(&name))
            .await
            .map_err(ServerError::storage_error)?;

        Ok(Box::new(file))
    }

    async fn file_exists(&self, name: String) -> ServerResult<bool> {
        match fs::metadata(self.get_path(&name)).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }

    async fn access_url(&self, name: String) -> ServerResult<AccessUrl> {
        if let Some(base) = &self.config.access_base_url {
            return Ok(AccessUrl::Redirect(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                name
            )));
        }

        Ok(AccessUrl::Path(self.get_path(&name)))
    }

    fn local_path(&self, name: &str) -> Option<PathBuf> {
        Some(self.get_path(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;
    use tokio_test::block_on;

    async fn backend(path: PathBuf, access_base_url: Option<&str>) -> LocalBackend {
        LocalBackend::new(LocalStorageConfig {
            path,
            label: None,
            region: None,
            is_boost: false,
            access_base_url: access_base_url.map(str::to_owned),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_upload_download_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path().join("objects"), None).await;

        let mut data: &[u8] = b"some attachment";
        backend
            .upload_file("object".to_string(), &mut data)
            .await
            .unwrap();

        assert!(backend.file_exists("object".to_string()).await.unwrap());

        // No leftover partial files
        let mut entries = std::fs::read_dir(dir.path().join("objects")).unwrap();
        assert_eq!("object", entries.next().unwrap().unwrap().file_name());
        assert!(entries.next().is_none());

        let mut stream = backend.download_file("object".to_string()).await.unwrap();
        let mut contents = Vec::new();
        stream.read_to_end(&mut contents).await.unwrap();
        assert_eq!(b"some attachment".as_slice(), contents.as_slice());

        backend.delete_file("object".to_string()).await.unwrap();
        assert!(!backend.file_exists("object".to_string()).await.unwrap());

        // Idempotent
        backend.delete_file("object".to_string()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_upload() {
        let dir = tempfile::tempdir().unwrap();
        let backend = std::sync::Arc::new(backend(dir.path().join("objects"), None).await);

        let uploads = (0..8u8).map(|i| {
            let backend = backend.clone();
            tokio::spawn(async move {
                let data = vec![i; 64];
                let mut stream = data.as_slice();
                backend
                    .upload_file_exclusive("chunk".to_string(), &mut stream)
                    .await
                    .unwrap()
            })
        });

        let mut written = 0;
        for upload in futures::future::join_all(uploads).await {
            if upload.unwrap() {
                written += 1;
            }
        }
        assert_eq!(1, written);

        // The winner's bytes are intact
        let mut stream = backend.download_file("chunk".to_string()).await.unwrap();
        let mut contents = Vec::new();
        stream.read_to_end(&mut contents).await.unwrap();
        assert_eq!(64, contents.len());
        assert!(contents.iter().all(|b| *b == contents[0]));

        // Losers leave nothing behind
        let entries = std::fs::read_dir(dir.path().join("objects")).unwrap().count();
        assert_eq!(1, entries);

        let mut data: &[u8] = b"again";
        assert!(!backend
            .upload_file_exclusive("chunk".to_string(), &mut data)
            .await
            .unwrap());
    }

    #[test]
    fn test_access_url() {
        let dir = tempfile::tempdir().unwrap();

        block_on(async {
            let plain = backend(dir.path().to_owned(), None).await;
            assert_eq!(
                AccessUrl::Path(dir.path().join("abc")),
                plain.access_url("abc".to_string()).await.unwrap()
            );

            let served =
                backend(dir.path().to_owned(), Some("https://cdn.example.com/files/")).await;
            assert_eq!(
                AccessUrl::Redirect("https://cdn.example.com/files/abc".to_string()),
                served.access_url("abc".to_string()).await.unwrap()
            );
        });
    }
}
