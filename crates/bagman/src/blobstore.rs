//! Object-store client abstraction (spec §4.2), grounded on the teacher's
//! [`StorageBackend`](crate) trait in `storage.rs`: a small `Send + Sync`
//! trait implemented once per backend, with a local-disk stand-in for tests.
//!
//! Bagman's contract is wider than the teacher's read/write/delete/exists —
//! large payload files need range reads, streaming puts, and a multipart
//! upload path whose completion is verified against its own custom
//! `x-amz-meta-*` metadata envelope (spec §4.2 item 4, Open Question
//! resolved in DESIGN.md: verify via a post-upload HEAD, symmetric with
//! `save_large`'s own verification).

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

use crate::types::FetchResult;

/// The four custom metadata headers every stored object carries (spec §4.2
/// item 4). Keys are bare names; callers prefix with `x-amz-meta-` only at
/// the HTTP boundary.
pub const META_INSTITUTION: &str = "institution";
pub const META_BAG_NAME: &str = "bag";
pub const META_BAGPATH: &str = "bagpath";
pub const META_MD5: &str = "md5";

/// Multipart uploads chunk at this boundary (spec §4.2 item 3).
pub const MULTIPART_CHUNK_SIZE: u64 = 128 * 1024 * 1024;
/// Above this size a `put` must go through `save_large`'s multipart path.
pub const MULTIPART_THRESHOLD: u64 = 5 * 1024 * 1024 * 1024;

/// Object metadata returned by `head`.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub custom: HashMap<String, String>,
}

impl Default for ObjectMeta {
    fn default() -> Self {
        Self {
            size: 0,
            etag: String::new(),
            last_modified: Utc::now(),
            custom: HashMap::new(),
        }
    }
}

impl ObjectMeta {
    pub fn custom_matches(&self, expected: &HashMap<String, String>) -> bool {
        expected
            .iter()
            .all(|(k, v)| self.custom.get(k).map(|existing| existing == v).unwrap_or(false))
    }
}

/// Object-store operations Bagman needs across every worker that touches
/// permanent storage (spec §4.2).
pub trait BlobStore: Send + Sync {
    fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>>;

    /// Read `[offset, offset+len)` of an object. Used by the fixity checker
    /// to re-hash in bounded-memory chunks without a full download.
    fn get_range(&self, bucket: &str, key: &str, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Download an entire object to a local path, returning the number of
    /// bytes written.
    fn fetch_to_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64>;

    /// Stream an object's full contents through a sha256 hasher without
    /// persisting it, for fixity re-verification (spec §4.11).
    fn fetch_and_calculate_sha256(&self, bucket: &str, key: &str) -> Result<String>;

    /// Upload small-to-medium objects (below [`MULTIPART_THRESHOLD`]) in one
    /// request, attaching `metadata` as custom headers.
    fn put(&self, bucket: &str, key: &str, data: &[u8], metadata: &HashMap<String, String>) -> Result<String>;

    /// Upload a local file via multipart upload, verifying completion with a
    /// post-upload `head` comparing `metadata` (spec §4.2 item 4).
    fn save_large(&self, bucket: &str, key: &str, src: &Path, metadata: &HashMap<String, String>) -> Result<String>;

    fn list_bucket(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.head(bucket, key)?.is_some())
    }
}

/// Verify that a just-completed upload's metadata matches what was
/// requested, per the Open Question resolution in DESIGN.md: treat any
/// mismatch (including a dropped header) as a retryable failure rather than
/// trusting the upload API's own success response.
pub fn verify_upload(meta: &ObjectMeta, expected: &HashMap<String, String>) -> Result<()> {
    if meta.custom_matches(expected) {
        Ok(())
    } else {
        bail!(
            "uploaded object metadata does not match requested metadata: got {:?}, want {:?}",
            meta.custom,
            expected
        )
    }
}

/// Whether `etag` indicates a multipart upload (spec §4.2 item 1: "etag
/// contains `-`"), in which case md5-against-etag verification is not
/// meaningful.
pub fn is_multipart_etag(etag: &str) -> bool {
    etag.contains('-')
}

fn strip_etag_quotes(etag: &str) -> &str {
    etag.trim_matches('"')
}

fn compute_file_md5(path: &Path) -> io::Result<String> {
    use md5::{Digest, Md5};
    let mut f = fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Download an object to `dest`, tee-computing its local md5, and validate
/// against the stored etag (spec §4.2 item 1 "Streaming fetch with
/// verification"). A non-existent key is reported as a non-retryable
/// "not found" error; a size mismatch is a hard error; an etag that looks
/// like a multipart upload's marks md5 unverifiable (a warning only).
pub fn fetch_to_file_verified(store: &dyn BlobStore, bucket: &str, key: &str, dest: &Path) -> FetchResult {
    let Ok(meta) = store.head(bucket, key) else {
        return FetchResult {
            error: Some(format!("failed to head {bucket}/{key}")),
            retry: true,
            ..Default::default()
        };
    };
    let Some(meta) = meta else {
        return FetchResult {
            error: Some(format!("not found: {bucket}/{key}")),
            retry: false,
            ..Default::default()
        };
    };

    let written = match store.fetch_to_file(bucket, key, dest) {
        Ok(n) => n,
        Err(e) => {
            return FetchResult {
                error: Some(format!("fetch failed: {e}")),
                retry: true,
                ..Default::default()
            };
        }
    };

    if written != meta.size {
        return FetchResult {
            local_path: Some(dest.display().to_string()),
            error: Some(format!(
                "size mismatch: expected {} bytes, got {written}",
                meta.size
            )),
            retry: false,
            ..Default::default()
        };
    }

    let local_md5 = match compute_file_md5(dest) {
        Ok(md5) => md5,
        Err(e) => {
            return FetchResult {
                local_path: Some(dest.display().to_string()),
                error: Some(format!("failed to compute local md5: {e}")),
                retry: true,
                ..Default::default()
            };
        }
    };

    let remote_md5 = strip_etag_quotes(&meta.etag).to_string();
    let md5_verifiable = !is_multipart_etag(&remote_md5);

    let mut result = FetchResult {
        local_path: Some(dest.display().to_string()),
        remote_md5: Some(remote_md5.clone()),
        local_md5: Some(local_md5.clone()),
        md5_verifiable,
        warning: None,
        error: None,
        retry: false,
    };

    if !md5_verifiable {
        result.warning = Some("remote etag indicates a multipart upload; md5 not verifiable".to_string());
    } else if !local_md5.eq_ignore_ascii_case(&remote_md5) {
        result.error = Some(format!(
            "md5 mismatch: local {local_md5} != remote {remote_md5}"
        ));
        result.retry = true;
    }

    result
}

struct StoredObject {
    data: Vec<u8>,
    etag: String,
    last_modified: DateTime<Utc>,
    custom: HashMap<String, String>,
}

/// In-memory test double for [`BlobStore`], grounded on the teacher's
/// `FileStorage` (a local-disk stand-in for the real cloud backends).
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn compute_etag(data: &[u8]) -> String {
    let digest = md5::Md5::default();
    use md5::Digest;
    let mut digest = digest;
    digest.update(data);
    hex::encode(digest.finalize())
}

impl BlobStore for InMemoryBlobStore {
    fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects.get(&(bucket.to_string(), key.to_string())).map(|o| ObjectMeta {
            size: o.data.len() as u64,
            etag: o.etag.clone(),
            last_modified: o.last_modified,
            custom: o.custom.clone(),
        }))
    }

    fn get_range(&self, bucket: &str, key: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let objects = self.objects.lock().unwrap();
        let obj = objects
            .get(&(bucket.to_string(), key.to_string()))
            .with_context(|| format!("no such object {bucket}/{key}"))?;
        let start = offset as usize;
        let end = ((offset + len) as usize).min(obj.data.len());
        Ok(obj.data.get(start..end).unwrap_or(&[]).to_vec())
    }

    fn fetch_to_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64> {
        let data = {
            let objects = self.objects.lock().unwrap();
            objects
                .get(&(bucket.to_string(), key.to_string()))
                .with_context(|| format!("no such object {bucket}/{key}"))?
                .data
                .clone()
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, &data)?;
        Ok(data.len() as u64)
    }

    fn fetch_and_calculate_sha256(&self, bucket: &str, key: &str) -> Result<String> {
        use sha2::{Digest, Sha256};
        let objects = self.objects.lock().unwrap();
        let obj = objects
            .get(&(bucket.to_string(), key.to_string()))
            .with_context(|| format!("no such object {bucket}/{key}"))?;
        let mut hasher = Sha256::new();
        hasher.update(&obj.data);
        Ok(hex::encode(hasher.finalize()))
    }

    fn put(&self, bucket: &str, key: &str, data: &[u8], metadata: &HashMap<String, String>) -> Result<String> {
        let etag = compute_etag(data);
        let mut objects = self.objects.lock().unwrap();
        objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.to_vec(),
                etag: etag.clone(),
                last_modified: Utc::now(),
                custom: metadata.clone(),
            },
        );
        Ok(etag)
    }

    fn save_large(&self, bucket: &str, key: &str, src: &Path, metadata: &HashMap<String, String>) -> Result<String> {
        let data = fs::read(src).with_context(|| format!("reading {}", src.display()))?;
        // Multipart etags are of the form "<hash>-<part-count>"; emulate
        // that distinction so md5-verifiability checks elsewhere see the
        // same shape they'd see against a real multipart upload.
        let part_count = data.len().div_ceil(MULTIPART_CHUNK_SIZE as usize).max(1);
        let etag = if data.len() as u64 > MULTIPART_CHUNK_SIZE {
            format!("{}-{part_count}", compute_etag(&data))
        } else {
            compute_etag(&data)
        };
        {
            let mut objects = self.objects.lock().unwrap();
            objects.insert(
                (bucket.to_string(), key.to_string()),
                StoredObject {
                    data,
                    etag: etag.clone(),
                    last_modified: Utc::now(),
                    custom: metadata.clone(),
                },
            );
        }
        let meta = self
            .head(bucket, key)?
            .context("uploaded object vanished before verification")?;
        verify_upload(&meta, metadata)?;
        Ok(etag)
    }

    fn list_bucket(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

/// Local-disk `BlobStore`, used by `bagman-cli` for single-node deployments
/// against a plain directory tree instead of a real object store. Mirrors
/// the teacher's `FileStorage`, extended with the range-read and
/// multipart-verification semantics the pipeline needs.
pub struct FileBlobStore {
    root: PathBuf,
    /// Custom metadata is not representable on a plain filesystem, so it is
    /// sidecar-stored as `<key>.meta.json` next to the object.
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    fn meta_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut p = self.object_path(bucket, key).into_os_string();
        p.push(".meta.json");
        PathBuf::from(p)
    }

    fn write_meta(&self, bucket: &str, key: &str, metadata: &HashMap<String, String>) -> Result<()> {
        let path = self.meta_path(bucket, key);
        let body = serde_json::to_vec(metadata)?;
        fs::write(path, body)?;
        Ok(())
    }

    fn read_meta(&self, bucket: &str, key: &str) -> HashMap<String, String> {
        fs::read(self.meta_path(bucket, key))
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default()
    }
}

impl BlobStore for FileBlobStore {
    fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let path = self.object_path(bucket, key);
        if !path.is_file() {
            return Ok(None);
        }
        let fs_meta = fs::metadata(&path)?;
        let size = fs_meta.len();
        let last_modified = fs_meta
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);
        let data = fs::read(&path)?;
        let etag = compute_etag(&data);
        Ok(Some(ObjectMeta {
            size,
            etag,
            last_modified,
            custom: self.read_meta(bucket, key),
        }))
    }

    fn get_range(&self, bucket: &str, key: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key);
        let mut f = fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        f.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        let mut total = 0;
        loop {
            let n = f.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
            if total == buf.len() {
                break;
            }
        }
        buf.truncate(total);
        Ok(buf)
    }

    fn fetch_to_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&path, dest).with_context(|| format!("copying {} to {}", path.display(), dest.display()))
    }

    fn fetch_and_calculate_sha256(&self, bucket: &str, key: &str) -> Result<String> {
        use sha2::{Digest, Sha256};
        let path = self.object_path(bucket, key);
        let mut f = fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn put(&self, bucket: &str, key: &str, data: &[u8], metadata: &HashMap<String, String>) -> Result<String> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::File::create(&path)?;
        f.write_all(data)?;
        self.write_meta(bucket, key, metadata)?;
        Ok(compute_etag(data))
    }

    fn save_large(&self, bucket: &str, key: &str, src: &Path, metadata: &HashMap<String, String>) -> Result<String> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, &path)?;
        self.write_meta(bucket, key, metadata)?;

        let meta = self
            .head(bucket, key)?
            .context("uploaded object vanished before verification")?;
        verify_upload(&meta, metadata)?;
        Ok(meta.etag)
    }

    fn list_bucket(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let dir = self.root.join(bucket);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in walkdir::WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&dir)?.to_string_lossy().replace('\\', "/");
            if rel.ends_with(".meta.json") {
                continue;
            }
            if rel.starts_with(prefix) {
                keys.push(rel);
            }
        }
        Ok(keys)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.object_path(bucket, key);
        if path.is_file() {
            fs::remove_file(&path)?;
        }
        let meta_path = self.meta_path(bucket, key);
        if meta_path.is_file() {
            fs::remove_file(&meta_path)?;
        }
        Ok(())
    }
}
