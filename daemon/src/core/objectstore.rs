// Object Store Adapter (C2): a uniform blob API over either a local
// filesystem (development) or a remote S3-compatible store (production),
// selected by configuration (spec §4.2).
//
// Streamed rather than buffered end to end: `put`/`get` move an
// `AsyncRead`/boxed byte stream so the prepare worker never has to hold a
// whole data item (up to `max_data_item_byte_count`, hundreds of MiB) in
// memory at once, matching spec §5's "release ownership of in-memory
// buffers across suspension points".

use std::ops::Range;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream as S3ByteStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::core::error::{BundlerError, BundlerResult};

pub type ByteStream = Pin<Box<dyn AsyncRead + Send + Sync + Unpin>>;

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub etag: String,
    pub content_length: u64,
    pub content_type: Option<String>,
}

/// Blob storage contract (spec §4.2). Key namespaces are the caller's
/// concern (`raw-data-item/{id}`, `bundle/{bundle_id}`,
/// `bundle-payload/{plan_id}`, `data/{id}`); this trait only knows opaque
/// keys.
#[async_trait]
pub trait ObjectStoreAdapter: Send + Sync {
    /// Streams `body` to `key`. On an upstream read error the partially
    /// written object is removed so no partial object is left behind.
    async fn put(&self, key: &str, body: ByteStream) -> BundlerResult<()>;

    /// Streaming, random-access read. `range` is an inclusive-start,
    /// exclusive-end byte range; `None` reads the whole object.
    async fn get(&self, key: &str, range: Option<Range<u64>>) -> BundlerResult<(ByteStream, String)>;

    async fn head(&self, key: &str) -> BundlerResult<ObjectMeta>;

    async fn byte_count(&self, key: &str) -> BundlerResult<u64> {
        Ok(self.head(key).await?.content_length)
    }

    async fn remove(&self, key: &str) -> BundlerResult<()>;
}

/// Multipart upload contract (spec §4.2), implemented only by the remote
/// (S3) store: local filesystem writes are already cheap single calls.
#[async_trait]
pub trait MultipartObjectStore: Send + Sync {
    async fn create_multipart(&self, key: &str) -> BundlerResult<String>;
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_no: i32,
        body: ByteStream,
    ) -> BundlerResult<String>;
    async fn get_parts(&self, key: &str, upload_id: &str) -> BundlerResult<Vec<(i32, String)>>;
    async fn complete(&self, key: &str, upload_id: &str) -> BundlerResult<String>;
    async fn copy_range(&self, src: &str, dst: &str, start: u64, end: u64) -> BundlerResult<()>;
}

pub type SharedObjectStore = Arc<dyn ObjectStoreAdapter>;

// ---------------------------------------------------------------------
// Local filesystem implementation (development default)
// ---------------------------------------------------------------------

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> BundlerResult<PathBuf> {
        if key.contains("..") {
            return Err(BundlerError::BadInput(format!("unsafe object key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStoreAdapter for FsObjectStore {
    async fn put(&self, key: &str, mut body: ByteStream) -> BundlerResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
        }

        let tmp_path = path.with_extension("tmp-upload");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match body.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(BundlerError::ObjectStore(format!(
                        "upstream read failed, aborting upload: {e}"
                    )));
                }
            };
            if let Err(e) = file.write_all(&buf[..n]).await {
                drop(file);
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(BundlerError::ObjectStore(e.to_string()));
            }
        }
        file.flush().await.map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> BundlerResult<(ByteStream, String)> {
        let path = self.path_for(key)?;
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BundlerError::MissingFromObjectStore(key.to_string())
            } else {
                BundlerError::ObjectStore(e.to_string())
            }
        })?;

        let metadata = file
            .metadata()
            .await
            .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
        let etag = fs_etag(&metadata);

        let stream: ByteStream = match range {
            None => Box::pin(file),
            Some(r) => {
                file.seek(std::io::SeekFrom::Start(r.start))
                    .await
                    .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
                Box::pin(file.take(r.end.saturating_sub(r.start)))
            }
        };
        Ok((stream, etag))
    }

    async fn head(&self, key: &str) -> BundlerResult<ObjectMeta> {
        let path = self.path_for(key)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BundlerError::MissingFromObjectStore(key.to_string())
            } else {
                BundlerError::ObjectStore(e.to_string())
            }
        })?;
        Ok(ObjectMeta {
            etag: fs_etag(&metadata),
            content_length: metadata.len(),
            content_type: None,
        })
    }

    async fn remove(&self, key: &str) -> BundlerResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BundlerError::ObjectStore(e.to_string())),
        }
    }
}

fn fs_etag(metadata: &std::fs::Metadata) -> String {
    use std::time::UNIX_EPOCH;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}-{:x}", metadata.len(), modified)
}

// ---------------------------------------------------------------------
// S3-compatible implementation (production)
// ---------------------------------------------------------------------

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStoreAdapter for S3ObjectStore {
    async fn put(&self, key: &str, mut body: ByteStream) -> BundlerResult<()> {
        let mut buf = Vec::new();
        if let Err(e) = body.read_to_end(&mut buf).await {
            return Err(BundlerError::ObjectStore(format!(
                "upstream read failed, aborting upload: {e}"
            )));
        }
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(S3ByteStream::from(buf))
            .send()
            .await
            .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> BundlerResult<(ByteStream, String)> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(r) = &range {
            // S3 byte ranges are inclusive-end.
            request = request.range(format!("bytes={}-{}", r.start, r.end.saturating_sub(1)));
        }
        let output = request.send().await.map_err(|e| {
            let msg = e.to_string();
            if msg.contains("NoSuchKey") {
                BundlerError::MissingFromObjectStore(key.to_string())
            } else {
                BundlerError::ObjectStore(msg)
            }
        })?;
        let etag = output.e_tag().unwrap_or_default().trim_matches('"').to_string();
        let reader = output.body.into_async_read();
        Ok((Box::pin(reader), etag))
    }

    async fn head(&self, key: &str) -> BundlerResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("NotFound") || msg.contains("404") {
                    BundlerError::MissingFromObjectStore(key.to_string())
                } else {
                    BundlerError::ObjectStore(msg)
                }
            })?;
        Ok(ObjectMeta {
            etag: output.e_tag().unwrap_or_default().trim_matches('"').to_string(),
            content_length: output.content_length().unwrap_or(0).max(0) as u64,
            content_type: output.content_type().map(|s| s.to_string()),
        })
    }

    async fn remove(&self, key: &str) -> BundlerResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl MultipartObjectStore for S3ObjectStore {
    async fn create_multipart(&self, key: &str) -> BundlerResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
        output
            .upload_id()
            .map(|s| s.to_string())
            .ok_or_else(|| BundlerError::ObjectStore("no upload_id returned".to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_no: i32,
        mut body: ByteStream,
    ) -> BundlerResult<String> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf)
            .await
            .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_no)
            .body(S3ByteStream::from(buf))
            .send()
            .await
            .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
        Ok(output.e_tag().unwrap_or_default().trim_matches('"').to_string())
    }

    async fn get_parts(&self, key: &str, upload_id: &str) -> BundlerResult<Vec<(i32, String)>> {
        let output = self
            .client
            .list_parts()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
        Ok(output
            .parts()
            .iter()
            .map(|p| {
                (
                    p.part_number().unwrap_or(0),
                    p.e_tag().unwrap_or_default().trim_matches('"').to_string(),
                )
            })
            .collect())
    }

    async fn complete(&self, key: &str, upload_id: &str) -> BundlerResult<String> {
        let parts = self.get_parts(key, upload_id).await?;
        let completed_parts: Vec<_> = parts
            .into_iter()
            .map(|(part_no, etag)| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part_no)
                    .e_tag(etag)
                    .build()
            })
            .collect();
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                aws_sdk_s3::types::CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
        Ok(output.e_tag().unwrap_or_default().trim_matches('"').to_string())
    }

    async fn copy_range(&self, src: &str, dst: &str, start: u64, end: u64) -> BundlerResult<()> {
        self.client
            .upload_part_copy()
            .bucket(&self.bucket)
            .key(dst)
            .copy_source(format!("{}/{}", self.bucket, src))
            .copy_source_range(format!("bytes={}-{}", start, end.saturating_sub(1)))
            .send()
            .await
            .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream_of(bytes: &'static [u8]) -> ByteStream {
        Box::pin(Cursor::new(bytes))
    }

    #[tokio::test]
    async fn fs_store_round_trips_full_object() {
        let dir = tempdir::TempDir::new("objectstore-test").unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());

        store.put("raw-data-item/abc", stream_of(b"hello world")).await.unwrap();
        let (mut reader, _etag) = store.get("raw-data-item/abc", None).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn fs_store_supports_byte_range_reads() {
        let dir = tempdir::TempDir::new("objectstore-test").unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());

        store.put("data/x", stream_of(b"0123456789")).await.unwrap();
        let (mut reader, _) = store.get("data/x", Some(2..5)).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"234");
    }

    #[tokio::test]
    async fn fs_store_get_missing_key_is_missing_from_object_store() {
        let dir = tempdir::TempDir::new("objectstore-test").unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());
        let err = store.get("raw-data-item/nope", None).await.unwrap_err();
        assert!(matches!(err, BundlerError::MissingFromObjectStore(_)));
    }

    #[tokio::test]
    async fn fs_store_byte_count_matches_put_length() {
        let dir = tempdir::TempDir::new("objectstore-test").unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());
        store.put("bundle/xyz", stream_of(b"abcdefgh")).await.unwrap();
        assert_eq!(store.byte_count("bundle/xyz").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn fs_store_remove_is_idempotent() {
        let dir = tempdir::TempDir::new("objectstore-test").unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());
        store.put("data/y", stream_of(b"z")).await.unwrap();
        store.remove("data/y").await.unwrap();
        store.remove("data/y").await.unwrap();
    }

    #[tokio::test]
    async fn fs_store_rejects_path_traversal_keys() {
        let dir = tempdir::TempDir::new("objectstore-test").unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());
        let err = store.put("../escape", stream_of(b"x")).await.unwrap_err();
        assert!(matches!(err, BundlerError::BadInput(_)));
    }
}
