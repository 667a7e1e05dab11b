//! Domain types exchanged with the broker and registry as JSON.
//!
//! Field names mirror the semantic vocabulary of the spec rather than any
//! particular wire format; every type here is `Serialize + Deserialize` so
//! it can travel as a broker message payload or a registry request/response
//! body unchanged.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        Millis(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::Millis(ms) => Ok(Duration::from_millis(ms)),
    }
}

pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// One discovered archive in an intake bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3File {
    pub bucket_name: String,
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

impl S3File {
    /// `key` must end in `.tar` per spec §3 invariant.
    pub fn is_valid_key(&self) -> bool {
        self.key.ends_with(".tar")
    }

    /// The institutional domain that owns this intake bucket, e.g.
    /// `aptrust.receiving.unc.edu` -> `unc.edu`.
    pub fn institution_domain(&self) -> Option<&str> {
        owner_of(&self.bucket_name)
    }

    /// The bag name derived from the tar filename, e.g.
    /// `ncsu.1840.16-2928.tar` -> `ncsu.1840.16-2928`.
    pub fn bag_name(&self) -> Option<&str> {
        self.key.strip_suffix(".tar")
    }
}

/// Parse the owning institution out of a bucket name following the
/// `aptrust.<role>.<inst-domain>` convention (spec §8 testable property 7).
pub fn owner_of(bucket_name: &str) -> Option<&str> {
    let mut parts = bucket_name.splitn(3, '.');
    let _prefix = parts.next()?;
    let _role = parts.next()?;
    let rest = parts.next()?;
    if rest.is_empty() { None } else { Some(rest) }
}

pub fn receiving_bucket_for(inst_domain: &str) -> String {
    format!("aptrust.receiving.{inst_domain}")
}

pub fn restore_bucket_for(inst_domain: &str) -> String {
    format!("aptrust.restore.{inst_domain}")
}

/// The stage an ingest envelope has progressed through. Transitions are
/// only ever forward (spec §3 invariant, §9 design note: "the transition
/// function is the only writer of `Stage`").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Unpack,
    Validate,
    Store,
    Record,
    Cleanup,
    Resolve,
}

impl Stage {
    /// Advance to `next` if it is not a regression; returns the resulting
    /// stage. This is the sole writer referenced by spec §9's design note.
    pub fn advance(self, next: Stage) -> Stage {
        if next >= self { next } else { self }
    }
}

/// Per-download accounting produced by the blob-store client's
/// `fetch_to_file` (spec §4.2 item 1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResult {
    pub local_path: Option<String>,
    pub remote_md5: Option<String>,
    pub local_md5: Option<String>,
    /// False when the etag indicates a multipart upload (contains `-`),
    /// meaning md5 verification against the etag is not meaningful.
    pub md5_verifiable: bool,
    pub warning: Option<String>,
    pub error: Option<String>,
    pub retry: bool,
}

/// One payload file inside a bag's `data/` directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub relative_path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub md5: String,
    pub sha256: String,
    pub sha256_generated_at: DateTime<Utc>,
    /// UUIDv4 used as the permanent-storage key. Stable across re-ingest of
    /// an unchanged file (spec §3 invariant).
    pub uuid: String,
    pub mime_type: String,
    pub storage_url: Option<String>,
    pub storage_md5: Option<String>,
    /// `"<inst-domain>/<bag-name>/<relpath>"` — globally unique within the
    /// registry.
    pub identifier: String,
    /// Computed against a prior version of the same identifier during
    /// record-worker merge (spec §4.8 item 5).
    pub needs_save: bool,
    pub existing_file: bool,
    pub error: Option<String>,
    pub replication_error: Option<String>,
    pub stored_at: Option<DateTime<Utc>>,
}

impl File {
    pub fn owner_identifier(inst_domain: &str, bag_name: &str, relative_path: &str) -> String {
        format!("{inst_domain}.{bag_name}/{relative_path}")
    }
}

/// Outcome of untarring an archive (spec §3/§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TarResult {
    pub input_tar_path: String,
    pub output_dir: String,
    pub warnings: Vec<String>,
    pub unpacked_files: Vec<String>,
    pub files: Vec<File>,
}

/// A single manifest checksum mismatch found while reading a bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumError {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

/// Parsed bag state (spec §3/§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BagReadResult {
    pub path: String,
    pub tags: Vec<(String, String)>,
    pub checksum_errors: Vec<ChecksumError>,
    pub top_level_files: Vec<String>,
    pub access_rights: Option<String>,
    pub error: Option<String>,
}

impl BagReadResult {
    pub fn is_valid(&self) -> bool {
        self.error.is_none() && self.checksum_errors.is_empty()
    }
}

/// The ingest envelope carried across broker topics (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    pub s3_file: S3File,
    pub stage: Stage,
    pub error_message: String,
    pub retry: bool,
    pub fetch_result: Option<FetchResult>,
    pub tar_result: Option<TarResult>,
    pub bag_read_result: Option<BagReadResult>,
    pub intellectual_object: Option<IntellectualObject>,
}

impl ProcessResult {
    pub fn new(s3_file: S3File) -> Self {
        Self {
            s3_file,
            stage: Stage::Fetch,
            error_message: String::new(),
            retry: false,
            fetch_result: None,
            tar_result: None,
            bag_read_result: None,
            intellectual_object: None,
        }
    }

    pub fn has_error(&self) -> bool {
        !self.error_message.is_empty()
    }

    pub fn set_error(&mut self, msg: impl Into<String>, retry: bool) {
        self.error_message = msg.into();
        self.retry = retry;
    }

    pub fn advance_stage(&mut self, next: Stage) {
        self.stage = self.stage.advance(next);
    }
}

/// Registry view of one payload file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericFile {
    pub identifier: String,
    pub mime_type: String,
    pub uri: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub checksums: Vec<ChecksumAttribute>,
    pub events: Vec<PremisEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumAttribute {
    pub algorithm: String,
    pub datetime: DateTime<Utc>,
    pub digest: String,
}

/// One ingested bag's logical object in the registry's vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntellectualObject {
    pub institution: String,
    pub title: String,
    pub description: String,
    pub access: String,
    pub identifier: String,
    pub generic_files: Vec<GenericFile>,
    pub events: Vec<PremisEvent>,
}

impl IntellectualObject {
    pub fn file_paths(&self) -> Vec<String> {
        self.generic_files.iter().map(|f| f.identifier.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Ingest,
    FixityGeneration,
    FixityCheck,
    IdentifierAssignment,
    Delete,
    Replication,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
}

/// Immutable audit record. Events are only ever appended (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PremisEvent {
    pub uuid: String,
    pub event_type: EventType,
    pub datetime: DateTime<Utc>,
    pub detail: String,
    pub outcome: Outcome,
    pub outcome_detail: String,
    pub object_identifier: String,
    pub agent: String,
    pub outcome_information: String,
}

impl PremisEvent {
    pub fn new(
        event_type: EventType,
        object_identifier: impl Into<String>,
        detail: impl Into<String>,
        outcome: Outcome,
        outcome_detail: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            event_type,
            datetime: Utc::now(),
            detail: detail.into(),
            outcome,
            outcome_detail: outcome_detail.into(),
            object_identifier: object_identifier.into(),
            agent: "bagman".to_string(),
            outcome_information: String::new(),
        }
    }
}

/// Thin envelope carrying an `S3File` plus a broker-message handle id and an
/// error string, consumed by the cleanup worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResult {
    pub s3_file: S3File,
    pub message_id: String,
    pub error: Option<String>,
}

/// Thin envelope consumed by the fixity checker's failure-dump path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixityResult {
    pub generic_file: GenericFile,
    pub message_id: String,
    pub error: Option<String>,
}

/// Per-file replication work item (spec §6: `replicate_topic` payload is a
/// `File`, carried here alongside message bookkeeping).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationObject {
    pub institution: String,
    pub bag_name: String,
    pub file: File,
    pub message_id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteObject {
    pub generic_file_identifier: String,
    pub uuid: String,
    pub message_id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreObject {
    pub object_identifier: String,
    pub institution: String,
    pub message_id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatusValue {
    Started,
    Pending,
    Success,
    Failed,
}

/// Heartbeat record the registry mirrors for operator visibility. Written
/// at every stage transition (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub name: String,
    pub bucket: String,
    pub etag: String,
    pub bag_date: DateTime<Utc>,
    pub institution: String,
    pub stage: Stage,
    pub status: ProcessStatusValue,
    pub note: String,
    pub retry: bool,
    pub node: String,
    pub pid: u32,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ProcessStatusValue::Success | ProcessStatusValue::Failed
        )
    }
}
