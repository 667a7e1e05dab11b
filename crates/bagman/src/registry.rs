//! Metadata registry client (spec §6 HTTP endpoints), grounded on the
//! teacher's `RegistryClient` in `registry.rs`: a thin `reqwest::blocking`
//! wrapper keyed by a base URL, matching status codes to outcomes rather
//! than letting reqwest's own error type leak into worker logic.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{GenericFile, IntellectualObject, PremisEvent, ProcessStatus, Stage};

/// Registry operations every worker needs (spec §6 endpoint table). Not
/// object-safe would be preferable here, but every method is dyn-compatible
/// (no generics), so `dyn RegistryClient` is usable where a worker is
/// generic over broker type but not registry type.
pub trait RegistryClient: Send + Sync {
    fn get_object(&self, identifier: &str, include_files: bool) -> Result<Option<IntellectualObject>>;
    fn create_object(&self, object: &IntellectualObject) -> Result<()>;
    fn update_object(&self, identifier: &str, object: &IntellectualObject) -> Result<()>;
    /// `POST /objects/<identifier>/files/batch`, at most 200 files per call
    /// (spec §4.8 item 5).
    fn save_files_batch(&self, identifier: &str, files: &[GenericFile]) -> Result<()>;
    fn post_event(&self, file_identifier: &str, event: &PremisEvent) -> Result<()>;
    fn get_process_status(&self, etag: &str, name: &str, bag_date: DateTime<Utc>) -> Result<Option<ProcessStatus>>;
    fn put_process_status(&self, id: &str, status: &ProcessStatus) -> Result<()>;
    fn deletion_item_pending(&self, identifier: &str) -> Result<bool>;
    fn restoration_item_pending(&self, identifier: &str) -> Result<bool>;
}

/// `reqwest::blocking`-backed implementation talking to a real registry
/// deployment, mirroring the teacher's `RegistryClient::new` shape.
#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    api_base: String,
    http: Client,
}

impl HttpRegistryClient {
    pub fn new(api_base: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("bagman/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build registry HTTP client")?;
        Ok(Self {
            api_base: api_base.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base.trim_end_matches('/'), path)
    }
}

#[derive(Serialize)]
struct FilesBatchRequest<'a> {
    files: &'a [GenericFile],
}

impl RegistryClient for HttpRegistryClient {
    fn get_object(&self, identifier: &str, include_files: bool) -> Result<Option<IntellectualObject>> {
        let mut url = self.url(&format!("/objects/{identifier}"));
        if include_files {
            url.push_str("?include-files=true");
        }
        let resp = self.http.get(url).send().context("get_object request failed")?;
        match resp.status() {
            StatusCode::OK => Ok(Some(resp.json().context("failed to parse object JSON")?)),
            StatusCode::NOT_FOUND => Ok(None),
            s => bail!("unexpected status from GET /objects/{identifier}: {s}"),
        }
    }

    fn create_object(&self, object: &IntellectualObject) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/objects"))
            .json(object)
            .send()
            .context("create_object request failed")?;
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            s => bail!("unexpected status from POST /objects: {s}"),
        }
    }

    fn update_object(&self, identifier: &str, object: &IntellectualObject) -> Result<()> {
        let resp = self
            .http
            .put(self.url(&format!("/objects/{identifier}")))
            .json(object)
            .send()
            .context("update_object request failed")?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => bail!("object no longer present on PUT /objects/{identifier}"),
            s => bail!("unexpected status from PUT /objects/{identifier}: {s}"),
        }
    }

    fn save_files_batch(&self, identifier: &str, files: &[GenericFile]) -> Result<()> {
        if files.len() > 200 {
            bail!("save_files_batch called with {} files, limit is 200", files.len());
        }
        let resp = self
            .http
            .post(self.url(&format!("/objects/{identifier}/files/batch")))
            .json(&FilesBatchRequest { files })
            .send()
            .context("save_files_batch request failed")?;
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            s => bail!("unexpected status from POST /objects/{identifier}/files/batch: {s}"),
        }
    }

    fn post_event(&self, file_identifier: &str, event: &PremisEvent) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/files/{file_identifier}/events")))
            .json(event)
            .send()
            .context("post_event request failed")?;
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            s => bail!("unexpected status from POST /files/{file_identifier}/events: {s}"),
        }
    }

    fn get_process_status(&self, etag: &str, name: &str, bag_date: DateTime<Utc>) -> Result<Option<ProcessStatus>> {
        let url = format!(
            "{}?etag={}&name={}&bag-date={}",
            self.url("/process-status"),
            urlencode(etag),
            urlencode(name),
            urlencode(&bag_date.to_rfc3339()),
        );
        let resp = self.http.get(url).send().context("get_process_status request failed")?;
        match resp.status() {
            StatusCode::OK => Ok(Some(resp.json().context("failed to parse process-status JSON")?)),
            StatusCode::NOT_FOUND => Ok(None),
            s => bail!("unexpected status from GET /process-status: {s}"),
        }
    }

    fn put_process_status(&self, id: &str, status: &ProcessStatus) -> Result<()> {
        let resp = self
            .http
            .put(self.url(&format!("/process-status/{id}")))
            .json(status)
            .send()
            .context("put_process_status request failed")?;
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            s => bail!("unexpected status from PUT /process-status/{id}: {s}"),
        }
    }

    fn deletion_item_pending(&self, identifier: &str) -> Result<bool> {
        let url = format!("{}?identifier={}", self.url("/deletion-items"), urlencode(identifier));
        let resp = self.http.get(url).send().context("deletion_item_pending request failed")?;
        match resp.status() {
            StatusCode::OK => {
                let items: Vec<serde_json::Value> = resp.json().context("failed to parse deletion-items JSON")?;
                Ok(!items.is_empty())
            }
            StatusCode::NOT_FOUND => Ok(false),
            s => bail!("unexpected status from GET /deletion-items: {s}"),
        }
    }

    fn restoration_item_pending(&self, identifier: &str) -> Result<bool> {
        let url = format!("{}?identifier={}", self.url("/restoration-items"), urlencode(identifier));
        let resp = self.http.get(url).send().context("restoration_item_pending request failed")?;
        match resp.status() {
            StatusCode::OK => {
                let items: Vec<serde_json::Value> = resp.json().context("failed to parse restoration-items JSON")?;
                Ok(!items.is_empty())
            }
            StatusCode::NOT_FOUND => Ok(false),
            s => bail!("unexpected status from GET /restoration-items: {s}"),
        }
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// In-process registry double used in worker tests and for the
/// `bagman-cli` single-node mode's "no external registry configured" path.
#[derive(Default)]
pub struct InMemoryRegistryClient {
    objects: Mutex<HashMap<String, IntellectualObject>>,
    process_status: Mutex<HashMap<(String, String, String), ProcessStatus>>,
    pending_deletions: Mutex<HashMap<String, bool>>,
    pending_restorations: Mutex<HashMap<String, bool>>,
}

impl InMemoryRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_deletion_pending(&self, identifier: &str, pending: bool) {
        self.pending_deletions.lock().unwrap().insert(identifier.to_string(), pending);
    }

    pub fn mark_restoration_pending(&self, identifier: &str, pending: bool) {
        self.pending_restorations.lock().unwrap().insert(identifier.to_string(), pending);
    }
}

impl RegistryClient for InMemoryRegistryClient {
    fn get_object(&self, identifier: &str, _include_files: bool) -> Result<Option<IntellectualObject>> {
        Ok(self.objects.lock().unwrap().get(identifier).cloned())
    }

    fn create_object(&self, object: &IntellectualObject) -> Result<()> {
        self.objects.lock().unwrap().insert(object.identifier.clone(), object.clone());
        Ok(())
    }

    fn update_object(&self, identifier: &str, object: &IntellectualObject) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        if !objects.contains_key(identifier) {
            bail!("object no longer present: {identifier}");
        }
        objects.insert(identifier.to_string(), object.clone());
        Ok(())
    }

    fn save_files_batch(&self, identifier: &str, files: &[GenericFile]) -> Result<()> {
        if files.len() > 200 {
            bail!("save_files_batch called with {} files, limit is 200", files.len());
        }
        let mut objects = self.objects.lock().unwrap();
        let object = objects.get_mut(identifier).with_context(|| format!("no such object {identifier}"))?;
        for file in files {
            if let Some(existing) = object.generic_files.iter_mut().find(|f| f.identifier == file.identifier) {
                *existing = file.clone();
            } else {
                object.generic_files.push(file.clone());
            }
        }
        Ok(())
    }

    fn post_event(&self, file_identifier: &str, event: &PremisEvent) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        for object in objects.values_mut() {
            if let Some(file) = object.generic_files.iter_mut().find(|f| f.identifier == file_identifier) {
                file.events.push(event.clone());
                return Ok(());
            }
        }
        bail!("no such generic file {file_identifier}")
    }

    fn get_process_status(&self, etag: &str, name: &str, bag_date: DateTime<Utc>) -> Result<Option<ProcessStatus>> {
        let key = (etag.to_string(), name.to_string(), bag_date.to_rfc3339());
        Ok(self.process_status.lock().unwrap().get(&key).cloned())
    }

    fn put_process_status(&self, id: &str, status: &ProcessStatus) -> Result<()> {
        let key = (status.etag.clone(), status.name.clone(), status.bag_date.to_rfc3339());
        self.process_status.lock().unwrap().insert(key, status.clone());
        let _ = id;
        Ok(())
    }

    fn deletion_item_pending(&self, identifier: &str) -> Result<bool> {
        Ok(*self.pending_deletions.lock().unwrap().get(identifier).unwrap_or(&false))
    }

    fn restoration_item_pending(&self, identifier: &str) -> Result<bool> {
        Ok(*self.pending_restorations.lock().unwrap().get(identifier).unwrap_or(&false))
    }
}

/// `ProcessStatus` helper used by every worker on entry/exit of a stage
/// (spec §3: "The pipeline writes `ProcessStatus` at every stage
/// transition").
pub fn record_status(
    registry: &dyn RegistryClient,
    name: &str,
    bucket: &str,
    etag: &str,
    bag_date: DateTime<Utc>,
    institution: &str,
    stage: Stage,
    status: crate::types::ProcessStatusValue,
    note: impl Into<String>,
    retry: bool,
) -> Result<ProcessStatus> {
    let status = ProcessStatus {
        name: name.to_string(),
        bucket: bucket.to_string(),
        etag: etag.to_string(),
        bag_date,
        institution: institution.to_string(),
        stage,
        status,
        note: note.into(),
        retry,
        node: hostname(),
        pid: std::process::id(),
    };
    let id = format!("{etag}-{name}");
    registry.put_process_status(&id, &status)?;
    Ok(status)
}

pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}
