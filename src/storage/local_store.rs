//! Local filesystem document storage implementation
//!
//! Layout under the data directory:
//!
//! ```text
//! <dir>/<bucket>/objects/<key>        document bytes followed by a metadata trailer
//! <dir>/.tmp/                         in-flight writes
//! ```
//!
//! Bucket and key are percent-encoded into single path segments. A write
//! streams into `.tmp`, appends the trailer and is renamed into place only
//! once complete. Bytes, content type and etag therefore change together in a
//! single rename, and an aborted upload never replaces the previous document.
//!
//! Trailer: `<meta json><meta length: u32 BE><TRAILER_MAGIC>`. Files without
//! the magic are served whole, with a content type guessed from the key.

use crate::error::StoreError;
use crate::storage::{guess_content_type, ByteStream, DocumentStore, PutReceipt, StoredDocument};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

const OBJECTS_DIR: &str = "objects";
const TEMP_DIR: &str = ".tmp";
const READ_CHUNK_SIZE: usize = 64 * 1024;
const TRAILER_MAGIC: &[u8; 8] = b"DOCMETA1";
const FOOTER_LEN: usize = 4 + TRAILER_MAGIC.len();

/// Metadata stored in the trailer of every document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    pub content_type: String,
    pub size: u64,
    pub etag: String,
    pub stored_at: DateTime<Utc>,
}

impl ObjectMeta {
    fn encode_trailer(&self) -> Result<Vec<u8>, StoreError> {
        let json = serde_json::to_vec(self)?;
        let mut trailer = Vec::with_capacity(json.len() + FOOTER_LEN);
        trailer.extend_from_slice(&json);
        trailer.extend_from_slice(&(json.len() as u32).to_be_bytes());
        trailer.extend_from_slice(TRAILER_MAGIC);
        Ok(trailer)
    }
}

/// Length of the metadata json announced by `footer`, if the file has a trailer
fn trailer_len(footer: &[u8], file_len: u64) -> Option<u64> {
    if footer.len() != FOOTER_LEN || &footer[4..] != TRAILER_MAGIC {
        return None;
    }
    let len = u32::from_be_bytes([footer[0], footer[1], footer[2], footer[3]]) as u64;
    (len + FOOTER_LEN as u64 <= file_len).then_some(len)
}

/// Split a whole stored file into document bytes and metadata
fn split_document(raw: Bytes) -> Result<(Bytes, Option<ObjectMeta>), StoreError> {
    let file_len = raw.len() as u64;
    if raw.len() < FOOTER_LEN {
        return Ok((raw, None));
    }
    let Some(meta_len) = trailer_len(&raw[raw.len() - FOOTER_LEN..], file_len) else {
        return Ok((raw, None));
    };
    let body_len = (file_len - meta_len) as usize - FOOTER_LEN;
    let meta = serde_json::from_slice(&raw[body_len..body_len + meta_len as usize])?;
    Ok((raw.slice(..body_len), Some(meta)))
}

/// Filesystem-backed document store
pub struct LocalStore {
    root: PathBuf,
    temp_path: PathBuf,
}

impl LocalStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = dir.as_ref().to_path_buf();
        let temp_path = root.join(TEMP_DIR);
        std::fs::create_dir_all(&temp_path)?;
        info!("Using storage directory: {}", root.display());
        Ok(Self { root, temp_path })
    }

    /// Percent-encode a bucket or key into one safe path segment
    ///
    /// A leading dot is encoded too, which rules out `.`, `..` and any clash
    /// with the temp directory.
    fn encode_segment(raw: &str) -> String {
        let encoded = urlencoding::encode(raw).into_owned();
        match encoded.strip_prefix('.') {
            Some(rest) => format!("%2E{}", rest),
            None => encoded,
        }
    }

    fn decode_segment(encoded: &str) -> Option<String> {
        urlencoding::decode(encoded).ok().map(|key| key.into_owned())
    }

    fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.root.join(Self::encode_segment(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_path(bucket)
            .join(OBJECTS_DIR)
            .join(Self::encode_segment(key))
    }

    fn temp_file(&self) -> PathBuf {
        self.temp_path.join(Uuid::new_v4().to_string())
    }

    /// Stream `body` into `path`, then append the trailer built from it
    async fn write_temp(
        path: &Path,
        content_type: &str,
        mut body: ByteStream,
    ) -> Result<ObjectMeta, StoreError> {
        let mut file = File::create(path).await?;
        let mut digest = md5::Context::new();
        let mut size = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }

        let meta = ObjectMeta {
            content_type: content_type.to_string(),
            size,
            etag: hex::encode(digest.compute().0),
            stored_at: Utc::now(),
        };
        file.write_all(&meta.encode_trailer()?).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(meta)
    }

    /// Move a finished temp file into place
    async fn commit(&self, temp: &Path, target: &Path) -> Result<(), StoreError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(temp, target).await?;
        Ok(())
    }

    async fn discard(temp: &Path) {
        if let Err(cleanup) = fs::remove_file(temp).await {
            if cleanup.kind() != ErrorKind::NotFound {
                warn!("Failed to remove temp file {}: {}", temp.display(), cleanup);
            }
        }
    }

    /// Read the trailer of an open document; returns the body length and metadata
    ///
    /// Leaves the file positioned at its start.
    async fn read_trailer(file: &mut File, file_len: u64) -> Result<(u64, Option<ObjectMeta>), StoreError> {
        if file_len < FOOTER_LEN as u64 {
            return Ok((file_len, None));
        }
        let mut footer = [0u8; FOOTER_LEN];
        file.seek(SeekFrom::End(-(FOOTER_LEN as i64))).await?;
        file.read_exact(&mut footer).await?;

        let result = match trailer_len(&footer, file_len) {
            Some(meta_len) => {
                let body_len = file_len - meta_len - FOOTER_LEN as u64;
                let mut raw = vec![0u8; meta_len as usize];
                file.seek(SeekFrom::Start(body_len)).await?;
                file.read_exact(&mut raw).await?;
                (body_len, Some(serde_json::from_slice(&raw)?))
            }
            None => (file_len, None),
        };
        file.seek(SeekFrom::Start(0)).await?;
        Ok(result)
    }
}

/// Read a file as a stream of chunks
fn file_stream<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::try_unfold(reader, |mut reader| async move {
        let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let read = reader.read_buf(&mut buffer).await?;
        if read == 0 {
            Ok::<_, StoreError>(None)
        } else {
            Ok(Some((buffer.freeze(), reader)))
        }
    })
    .boxed()
}

#[async_trait]
impl DocumentStore for LocalStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredDocument, StoreError> {
        let path = self.object_path(bucket, key);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::not_found(bucket, key));
            }
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata().await?.len();
        let (length, meta) = Self::read_trailer(&mut file, file_len).await?;

        let (content_type, etag) = match meta {
            Some(meta) => (meta.content_type, Some(meta.etag)),
            None => {
                debug!("No metadata for {}/{}, guessing content type from key", bucket, key);
                (guess_content_type(key), None)
            }
        };

        debug!("Local: opened {} ({} bytes)", path.display(), length);
        Ok(StoredDocument {
            content_type,
            content_length: Some(length),
            etag,
            body: file_stream(file.take(length)),
        })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: ByteStream,
    ) -> Result<PutReceipt, StoreError> {
        let temp = self.temp_file();
        let meta = match Self::write_temp(&temp, content_type, body).await {
            Ok(meta) => meta,
            Err(e) => {
                Self::discard(&temp).await;
                return Err(e);
            }
        };

        if let Err(e) = self.commit(&temp, &self.object_path(bucket, key)).await {
            Self::discard(&temp).await;
            return Err(e);
        }

        debug!("Local: wrote {} bytes for {}/{}", meta.size, bucket, key);
        Ok(PutReceipt {
            size: meta.size,
            etag: Some(meta.etag),
        })
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Bytes>, StoreError> {
        let dir = self.bucket_path(namespace).join(OBJECTS_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut documents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(Self::decode_segment) {
                Some(key) => documents.push((key, entry.path())),
                None => warn!("Skipping undecodable file {}", entry.path().display()),
            }
        }
        documents.sort_by(|a, b| a.0.cmp(&b.0));

        let mut values = Vec::with_capacity(documents.len());
        for (_, path) in documents {
            let (body, _) = split_document(Bytes::from(fs::read(&path).await?))?;
            values.push(body);
        }
        Ok(values)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(data: &'static [u8]) -> ByteStream {
        stream::once(async move { Ok(Bytes::from_static(data)) }).boxed()
    }

    #[test]
    fn test_encode_segment() {
        assert_eq!(LocalStore::encode_segment("plain-key_1"), "plain-key_1");
        assert_eq!(LocalStore::encode_segment("a/b"), "a%2Fb");
        assert_eq!(LocalStore::encode_segment(".."), "%2E.");
        assert_eq!(LocalStore::encode_segment(".tmp"), "%2Etmp");
        assert_eq!(LocalStore::encode_segment("../../etc/passwd"), "%2E.%2F..%2Fetc%2Fpasswd");
        assert_eq!(LocalStore::decode_segment("%2E.%2F..%2Fetc%2Fpasswd").unwrap(), "../../etc/passwd");
        assert_eq!(LocalStore::decode_segment("a%3A").unwrap(), "a:");
    }

    #[test]
    fn test_trailer_split() {
        let meta = ObjectMeta {
            content_type: "application/pdf".to_string(),
            size: 4,
            etag: "e".to_string(),
            stored_at: Utc::now(),
        };
        let mut raw = b"%PDF".to_vec();
        raw.extend(meta.encode_trailer().unwrap());

        let (body, parsed) = split_document(Bytes::from(raw)).unwrap();
        assert_eq!(body, Bytes::from_static(b"%PDF"));
        assert_eq!(parsed, Some(meta));

        let (body, parsed) = split_document(Bytes::from_static(b"no trailer here")).unwrap();
        assert_eq!(body, Bytes::from_static(b"no trailer here"));
        assert_eq!(parsed, None);
    }

    #[tokio::test]
    async fn test_local_store_basic_operations() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        let receipt = store
            .put("docs", "hello", "text/plain; charset=utf-8", body(b"Hello, Local Storage!"))
            .await
            .unwrap();
        assert_eq!(receipt.size, 21);
        assert_eq!(
            receipt.etag.as_deref(),
            Some(format!("{:x}", md5::compute(b"Hello, Local Storage!")).as_str())
        );

        let doc = store.get("docs", "hello").await.unwrap();
        assert_eq!(doc.content_type, "text/plain; charset=utf-8");
        assert_eq!(doc.content_length, Some(21));
        assert_eq!(doc.etag, receipt.etag);
        assert_eq!(
            doc.into_bytes(1024).await.unwrap(),
            Bytes::from_static(b"Hello, Local Storage!")
        );
    }

    #[tokio::test]
    async fn test_local_store_error_cases() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        assert!(store.get("docs", "missing").await.err().unwrap().is_not_found());

        store.put("docs", "k", "text/plain", body(b"original")).await.unwrap();
        let aborted: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"replace")),
            Err(StoreError::Aborted("client disconnected".into())),
        ])
        .boxed();
        assert!(store.put("docs", "k", "text/plain", aborted).await.is_err());

        // The failed write leaves the previous document and no temp files.
        let doc = store.get("docs", "k").await.unwrap();
        assert_eq!(doc.into_bytes(1024).await.unwrap(), Bytes::from_static(b"original"));
        let mut temp = std::fs::read_dir(dir.path().join(TEMP_DIR)).unwrap();
        assert!(temp.next().is_none());
    }

    #[tokio::test]
    async fn test_local_store_guesses_type_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        let objects = dir.path().join("legacy").join(OBJECTS_DIR);
        std::fs::create_dir_all(&objects).unwrap();
        std::fs::write(objects.join("paper.pdf"), b"%PDF-1.4").unwrap();

        let doc = store.get("legacy", "paper.pdf").await.unwrap();
        assert_eq!(doc.content_type, "application/pdf");
        assert_eq!(doc.etag, None);
    }

    #[tokio::test]
    async fn test_local_store_keys_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        let store = LocalStore::new(&root).unwrap();

        store.put("..", "../escape", "text/plain", body(b"contained")).await.unwrap();
        assert!(!dir.path().join("escape").exists());

        let doc = store.get("..", "../escape").await.unwrap();
        assert_eq!(doc.into_bytes(64).await.unwrap(), Bytes::from_static(b"contained"));
    }

    #[tokio::test]
    async fn test_local_store_large_document_streams_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let large: Vec<u8> = (0..300 * 1024).map(|i| (i % 251) as u8).collect();

        let payload = Bytes::from(large.clone());
        let upload: ByteStream = stream::iter(
            payload
                .chunks(10_000)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect::<Vec<_>>(),
        )
        .boxed();
        store.put("big", "blob", "application/octet-stream", upload).await.unwrap();

        let doc = store.get("big", "blob").await.unwrap();
        let chunks: Vec<_> = doc.body.collect().await;
        assert!(chunks.len() > 1);
        let joined: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap().to_vec()).collect();
        assert_eq!(joined, large);
    }

    #[tokio::test]
    async fn test_local_store_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        store.put("ns", "b", "text/plain", body(b"2")).await.unwrap();
        store.put("ns", "a", "text/plain", body(b"1")).await.unwrap();

        let values = store.list("ns").await.unwrap();
        assert_eq!(values, vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]);
        assert!(store.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_store_list_sorts_on_decoded_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        // Encoded, "a:" is "a%3A", which sorts before "a.".
        store.put("ns", "a.", "text/plain", body(b"first")).await.unwrap();
        store.put("ns", "a:", "text/plain", body(b"second")).await.unwrap();

        let values = store.list("ns").await.unwrap();
        assert_eq!(values, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
    }

    #[tokio::test]
    async fn test_local_store_one_file_per_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        store.put("docs", "k", "text/csv", body(b"a,b")).await.unwrap();

        let bucket = dir.path().join("docs");
        let entries: Vec<_> = std::fs::read_dir(&bucket)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(OBJECTS_DIR)]);

        let doc = store.get("docs", "k").await.unwrap();
        assert_eq!(doc.content_type, "text/csv");
        assert_eq!(doc.content_length, Some(3));
        assert_eq!(doc.into_bytes(64).await.unwrap(), Bytes::from_static(b"a,b"));
    }
}
