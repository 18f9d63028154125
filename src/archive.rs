//! Bulk zip download
//!
//! Streams a provider folder as a ZIP archive. The archive is written in
//! streaming mode: every entry is followed by a data descriptor, so entry
//! sizes never need to be known up front and unsized provider streams can be
//! archived as they arrive. Output is produced by a background task into a
//! bounded channel, which keeps memory flat and stops the walk as soon as the
//! consumer goes away.

use bytes::Bytes;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::path::GatewayPath;
use crate::providers::retry::{read_with_retry, ReadRetryConfig};
use crate::providers::{BoundProvider, ProviderError};
use crate::stream::{ByteStream, StreamSize};

/// Entries at or above this size are written with zip64 headers
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// 0 stores entries uncompressed, 1-9 deflates them
    pub compression_level: i64,
    /// Archive chunks buffered ahead of the client
    pub channel_capacity: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: 6,
            channel_capacity: 8,
        }
    }
}

impl ArchiveConfig {
    pub fn validate(&mut self) {
        self.compression_level = self.compression_level.clamp(0, 9);
        self.channel_capacity = self.channel_capacity.clamp(1, 256);
    }

    fn options(&self) -> SimpleFileOptions {
        let method = if self.compression_level == 0 {
            zip::CompressionMethod::Stored
        } else {
            zip::CompressionMethod::Deflated
        };
        let level = (self.compression_level > 0).then_some(self.compression_level);
        SimpleFileOptions::default()
            .compression_method(method)
            .compression_level(level)
    }
}

/// Sink handed to the zip writer; the assembling task drains it after every
/// write and forwards the bytes to the channel
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn take(&self) -> Option<Bytes> {
        let mut buf = self.0.lock().ok()?;
        if buf.is_empty() {
            None
        } else {
            Some(Bytes::from(std::mem::take(&mut *buf)))
        }
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut buf = self
            .0
            .lock()
            .map_err(|_| std::io::Error::other("archive buffer poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn zip_error(e: zip::result::ZipError) -> ProviderError {
    ProviderError::Backend(format!("archive assembly failed: {}", e))
}

/// File name offered for an archive of `folder`
pub fn archive_name(folder: &GatewayPath) -> String {
    if folder.is_root() {
        "archive.zip".to_string()
    } else {
        format!("{}.zip", folder.name())
    }
}

pub struct Archiver {
    config: ArchiveConfig,
    read_retry: ReadRetryConfig,
}

impl Archiver {
    pub fn new(config: ArchiveConfig, read_retry: ReadRetryConfig) -> Self {
        Self { config, read_retry }
    }

    /// Stream `folder` (and everything below it) as a ZIP archive.
    ///
    /// The returned stream is always unsized. Failures while walking the
    /// folder end the stream with that error.
    pub fn zip_folder(
        &self,
        provider: BoundProvider,
        folder: GatewayPath,
        cancel: CancellationToken,
    ) -> Result<ByteStream, ProviderError> {
        if folder.is_file() {
            return Err(ProviderError::BadRequest(format!("{} is not a folder", folder)));
        }
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let name = archive_name(&folder);
        let assembly = Assembly {
            provider,
            root: folder,
            options: self.config.options(),
            read_retry: self.read_retry.clone(),
            cancel,
            tx,
        };
        tokio::spawn(assembly.run());

        let chunks = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(ByteStream::new(chunks, StreamSize::Unsized)
            .with_name(name)
            .with_content_type(Some("application/zip".to_string())))
    }
}

/// Consumer went away; not an error worth reporting
struct Closed;

struct Assembly {
    provider: BoundProvider,
    root: GatewayPath,
    options: SimpleFileOptions,
    read_retry: ReadRetryConfig,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<Bytes, ProviderError>>,
}

impl Assembly {
    async fn run(self) {
        let buffer = SharedBuffer::default();
        let mut zip = ZipWriter::new_stream(buffer.clone());
        let written = self.write_entries(&mut zip, &buffer).await;
        match written {
            Ok(Ok(entries)) => {
                let finished = zip.finish().map_err(zip_error);
                let outcome = match finished {
                    Ok(_) => self.flush(&buffer).await,
                    Err(e) => self.tx.send(Err(e)).await.map_err(|_| Closed),
                };
                if outcome.is_ok() {
                    tracing::info!(
                        "[Archive] Streamed {} entries of {}:{}",
                        entries,
                        self.provider.name(),
                        self.root
                    );
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("[Archive] Aborting archive of {}: {}", self.root, e);
                let _ = self.tx.send(Err(e)).await;
            }
            Err(Closed) => {
                tracing::debug!("[Archive] Client went away while archiving {}", self.root);
            }
        }
    }

    async fn flush(&self, buffer: &SharedBuffer) -> Result<(), Closed> {
        if let Some(chunk) = buffer.take() {
            self.tx.send(Ok(chunk)).await.map_err(|_| Closed)?;
        }
        Ok(())
    }

    /// Depth-first walk writing one entry per child; returns the entry count
    async fn write_entries<W: Write + std::io::Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        buffer: &SharedBuffer,
    ) -> Result<Result<usize, ProviderError>, Closed> {
        let mut pending = vec![self.root.clone()];
        let mut entries = 0;

        while let Some(folder) = pending.pop() {
            if self.cancel.is_cancelled() {
                return Ok(Err(ProviderError::ConnectionAborted("archive cancelled".to_string())));
            }
            let children = match read_with_retry("list", &self.read_retry, || {
                self.provider.list(&folder)
            })
            .await
            {
                Ok(children) => children,
                Err(e) => return Ok(Err(e)),
            };

            for child in children {
                let Some(entry_name) = child.path().relative_to(&self.root) else {
                    continue;
                };
                if child.is_folder() {
                    if let Err(e) = zip.add_directory(entry_name, self.options) {
                        return Ok(Err(zip_error(e)));
                    }
                    pending.push(child.path().clone());
                } else {
                    let large = child.size().map_or(true, |s| s >= ZIP64_THRESHOLD);
                    if let Err(e) = zip.start_file(entry_name, self.options.large_file(large)) {
                        return Ok(Err(zip_error(e)));
                    }
                    if let Err(e) = self.copy_file(zip, buffer, child.path()).await? {
                        return Ok(Err(e));
                    }
                }
                entries += 1;
                self.flush(buffer).await?;
            }
        }
        Ok(Ok(entries))
    }

    async fn copy_file<W: Write + std::io::Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        buffer: &SharedBuffer,
        path: &GatewayPath,
    ) -> Result<Result<(), ProviderError>, Closed> {
        let download = read_with_retry("download", &self.read_retry, || {
            self.provider.download(path, None, None)
        })
        .await;
        let mut body = match download {
            Ok(body) => body.cancel_on(self.cancel.clone()),
            Err(e) => return Ok(Err(e)),
        };

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return Ok(Err(e)),
            };
            if let Err(e) = zip.write_all(&chunk) {
                return Ok(Err(ProviderError::from(e)));
            }
            self.flush(buffer).await?;
        }
        Ok(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        ErrorKind, MemoryFactory, MemoryOptions, MemoryStore, ProviderCredentials, ProviderFactory,
    };
    use std::io::{Cursor, Read};

    fn bind(store: &Arc<MemoryStore>, options: MemoryOptions) -> BoundProvider {
        let factory = MemoryFactory::new(store.clone(), options);
        let capabilities = factory.capabilities();
        BoundProvider::new(factory.bind(&ProviderCredentials::default()).unwrap(), capabilities)
    }

    fn read_entry(archive: &mut zip::ZipArchive<Cursor<Vec<u8>>>, name: &str) -> Vec<u8> {
        let mut entry = archive.by_name(name).unwrap();
        let mut out = Vec::new();
        entry.read_to_end(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_zip_of_unsized_streams() {
        let store = Arc::new(MemoryStore::new());
        store.put("/docs/a.txt", &b"alpha"[..]);
        store.put("/docs/sub/b.txt", vec![b'b'; 100_000]);
        store.put("/other.txt", &b"not included"[..]);
        let provider = bind(
            &store,
            MemoryOptions {
                report_size: false,
                chunk_size: 1024,
                ..MemoryOptions::named("opaque")
            },
        );

        let archiver = Archiver::new(ArchiveConfig::default(), ReadRetryConfig::default());
        let folder = GatewayPath::parse("/docs/", None).unwrap();
        let stream = archiver
            .zip_folder(provider, folder, CancellationToken::new())
            .unwrap();
        assert!(!stream.is_sizable());
        assert_eq!(stream.name(), Some("docs.zip"));

        let bytes = stream.read_to_end().await.unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
        assert_eq!(archive.len(), 3);
        assert_eq!(read_entry(&mut archive, "a.txt"), b"alpha");
        assert_eq!(read_entry(&mut archive, "sub/b.txt").len(), 100_000);
        assert!(archive.by_name("sub/").unwrap().is_dir());
        assert!(archive.by_name("other.txt").is_err());
    }

    #[tokio::test]
    async fn test_zip_of_empty_folder() {
        let store = Arc::new(MemoryStore::new());
        let provider = bind(&store, MemoryOptions::named("memory"));
        let archiver = Archiver::new(
            ArchiveConfig {
                compression_level: 0,
                ..ArchiveConfig::default()
            },
            ReadRetryConfig::default(),
        );
        let stream = archiver
            .zip_folder(provider, GatewayPath::root(), CancellationToken::new())
            .unwrap();
        assert_eq!(stream.name(), Some("archive.zip"));
        let bytes = stream.read_to_end().await.unwrap();
        let archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
        assert_eq!(archive.len(), 0);
    }

    #[tokio::test]
    async fn test_missing_folder_ends_stream_with_error() {
        let store = Arc::new(MemoryStore::new());
        let provider = bind(&store, MemoryOptions::named("memory"));
        let archiver = Archiver::new(ArchiveConfig::default(), ReadRetryConfig::default());
        let folder = GatewayPath::parse("/nope/", None).unwrap();
        let err = archiver
            .zip_folder(provider, folder, CancellationToken::new())
            .unwrap()
            .read_to_end()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathNotFound);
    }

    #[test]
    fn test_config_clamps() {
        let mut config = ArchiveConfig {
            compression_level: 42,
            channel_capacity: 0,
        };
        config.validate();
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.channel_capacity, 1);
    }
}
