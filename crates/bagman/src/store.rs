//! Store worker (spec §4.7).
//!
//! Copies every payload file named by a prepare-worker envelope into the
//! preservation bucket. The loop is not transactional across files: if file
//! *k* of *n* fails, files before it are already durably stored, so the
//! disposition distinguishes "some files stored" (operator review via
//! `trouble_topic`, message finished) from "no files stored" (transient,
//! safe to retry the whole envelope).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use bagman_retry::{RetryStrategyConfig, attempts_exhausted, calculate_delay};
use chrono::Utc;

use crate::blobstore::{BlobStore, META_BAGPATH, META_BAG_NAME, META_INSTITUTION, META_MD5, MULTIPART_THRESHOLD};
use crate::broker::{Broker, BrokerMessage};
use crate::registry::{RegistryClient, record_status};
use crate::report::Reporter;
use crate::statuslog::StatusLog;
use crate::topics::RECORD_TOPIC;
use crate::trouble;
use crate::types::{File, GenericFile, ProcessResult, ProcessStatusValue, Stage};

#[allow(clippy::too_many_arguments)]
pub fn process_message<B: Broker>(
    msg: BrokerMessage,
    broker: &B,
    blobstore: &dyn BlobStore,
    registry: &dyn RegistryClient,
    preservation_bucket: &str,
    status_log: &StatusLog,
    log_dir: &Path,
    retry_cfg: &RetryStrategyConfig,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let mut result: ProcessResult = msg.decode()?;
    let inst = result.s3_file.institution_domain().unwrap_or("unknown").to_string();
    let bag_name = result.s3_file.bag_name().unwrap_or(&result.s3_file.key).to_string();

    record_status(
        registry,
        &bag_name,
        &result.s3_file.bucket_name,
        &result.s3_file.etag,
        result.s3_file.last_modified,
        &inst,
        Stage::Store,
        ProcessStatusValue::Started,
        "",
        false,
    )?;

    if result.tar_result.is_none() {
        result.set_error("store worker received an envelope with no tar_result", false);
        return finish_failed(msg, broker, result, registry, &inst, &bag_name, status_log, log_dir, retry_cfg, reporter);
    }

    let out_dir: PathBuf = Path::new(&result.tar_result.as_ref().unwrap().output_dir).to_path_buf();
    let object_identifier = format!("{inst}/{bag_name}");
    let existing_files = registry.get_object(&object_identifier, true)?.map(|o| o.generic_files).unwrap_or_default();

    let mut stored = 0usize;
    let mut had_error = false;

    {
        let files = &mut result.tar_result.as_mut().unwrap().files;
        for file in files.iter_mut() {
            broker.touch(&msg).ok();
            if let Some(prior) = unchanged_existing_file(file, &existing_files) {
                restore_from_existing(file, prior);
                stored += 1;
                broker.touch(&msg).ok();
                continue;
            }
            match store_one_file(blobstore, preservation_bucket, &inst, &bag_name, &out_dir, file) {
                Ok(()) => stored += 1,
                Err(e) => {
                    had_error = true;
                    file.error = Some(e.to_string());
                    reporter.warn(&format!("{bag_name}: failed to store {}: {e}", file.relative_path));
                }
            }
            broker.touch(&msg).ok();
        }
    }

    let total = result.tar_result.as_ref().unwrap().files.len();

    if !had_error {
        result.advance_stage(Stage::Store);
        let status = record_status(
            registry,
            &bag_name,
            &result.s3_file.bucket_name,
            &result.s3_file.etag,
            result.s3_file.last_modified,
            &inst,
            result.stage,
            ProcessStatusValue::Pending,
            "",
            false,
        )?;
        status_log.append(&status)?;

        if let Err(e) = broker.publish(RECORD_TOPIC, &result) {
            result.set_error(format!("failed to publish to record_topic: {e}"), true);
            return finish_failed(msg, broker, result, registry, &inst, &bag_name, status_log, log_dir, retry_cfg, reporter);
        }

        if out_dir.is_dir() {
            fs::remove_dir_all(&out_dir).ok();
        }
        reporter.info(&format!("{bag_name}: stored {stored} file(s), handed off to record_topic"));
        broker.finish(&msg)?;
        return Ok(());
    }

    if stored == 0 {
        result.set_error(format!("no files stored out of {total}"), true);
    } else {
        result.set_error(format!("incomplete copy: {stored} of {total} files stored"), false);
    }

    finish_failed(msg, broker, result, registry, &inst, &bag_name, status_log, log_dir, retry_cfg, reporter)
}

/// Finds the registry's prior record of `file`, if content (md5 + size) is
/// unchanged since the last ingest (spec §3 File invariant, end-to-end
/// scenario C).
fn unchanged_existing_file<'a>(file: &File, existing: &'a [GenericFile]) -> Option<&'a GenericFile> {
    let found = existing.iter().find(|g| g.identifier == file.identifier)?;
    let md5_matches =
        found.checksums.iter().any(|c| c.algorithm.eq_ignore_ascii_case("md5") && c.digest.eq_ignore_ascii_case(&file.md5));
    (md5_matches && found.size == file.size).then_some(found)
}

/// Restores the on-disk UUID and storage location from a prior ingest
/// instead of re-uploading unchanged bytes.
fn restore_from_existing(file: &mut File, prior: &GenericFile) {
    if let Some(uuid) = prior.uri.rsplit('/').next() {
        file.uuid = uuid.to_string();
    }
    file.storage_url = Some(prior.uri.clone());
    file.storage_md5 = Some(file.md5.clone());
    file.stored_at = Some(prior.created_at);
    file.needs_save = false;
    file.existing_file = true;
}

fn store_one_file(
    blobstore: &dyn BlobStore,
    preservation_bucket: &str,
    institution: &str,
    bag_name: &str,
    out_dir: &Path,
    file: &mut File,
) -> Result<()> {
    let local_path = out_dir.join("data").join(&file.relative_path);
    let metadata = HashMap::from([
        (META_INSTITUTION.to_string(), institution.to_string()),
        (META_BAG_NAME.to_string(), bag_name.to_string()),
        (META_BAGPATH.to_string(), file.relative_path.clone()),
        (META_MD5.to_string(), file.md5.clone()),
    ]);

    let etag = if file.size <= MULTIPART_THRESHOLD {
        let data = fs::read(&local_path)?;
        blobstore.put(preservation_bucket, &file.uuid, &data, &metadata)?
    } else {
        blobstore.save_large(preservation_bucket, &file.uuid, &local_path, &metadata)?
    };

    file.storage_url = Some(format!("https://{preservation_bucket}/{}", file.uuid));
    file.storage_md5 = Some(etag);
    file.stored_at = Some(Utc::now());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn finish_failed<B: Broker>(
    msg: BrokerMessage,
    broker: &B,
    result: ProcessResult,
    registry: &dyn RegistryClient,
    inst: &str,
    bag_name: &str,
    status_log: &StatusLog,
    log_dir: &Path,
    retry_cfg: &RetryStrategyConfig,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let final_failure = !result.retry || attempts_exhausted(retry_cfg, msg.attempt);
    let status_value = if final_failure {
        ProcessStatusValue::Failed
    } else {
        ProcessStatusValue::Pending
    };

    let status = record_status(
        registry,
        bag_name,
        &result.s3_file.bucket_name,
        &result.s3_file.etag,
        result.s3_file.last_modified,
        inst,
        result.stage,
        status_value,
        result.error_message.clone(),
        result.retry,
    )?;
    status_log.append(&status)?;
    reporter.error(&format!("{bag_name}: {}", result.error_message));

    if final_failure {
        trouble::dump(log_dir, inst, bag_name, &result)?;
        broker.finish(&msg)?;
    } else {
        let delay = calculate_delay(retry_cfg, msg.attempt);
        broker.requeue(msg, delay)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::InMemoryBlobStore;
    use crate::broker::InMemoryBroker;
    use crate::registry::InMemoryRegistryClient;
    use crate::report::NullReporter;
    use crate::topics::STORE_TOPIC;
    use crate::types::{S3File, TarResult};
    use bagman_retry::RetryPolicy;
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample_file(relative_path: &str, content: &[u8]) -> File {
        File {
            relative_path: relative_path.to_string(),
            size: content.len() as u64,
            modified: Utc::now(),
            md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            sha256: "deadbeef".to_string(),
            sha256_generated_at: Utc::now(),
            uuid: uuid::Uuid::new_v4().to_string(),
            mime_type: "application/octet-stream".to_string(),
            storage_url: None,
            storage_md5: None,
            identifier: format!("unc.edu.bag1/{relative_path}"),
            needs_save: true,
            existing_file: false,
            error: None,
            replication_error: None,
            stored_at: None,
        }
    }

    fn sample_result(out_dir: &Path, files: Vec<File>) -> ProcessResult {
        let s3_file = S3File {
            bucket_name: "aptrust.receiving.unc.edu".to_string(),
            key: "unc.edu.bag1.tar".to_string(),
            size: 100,
            etag: "etag-1".to_string(),
            last_modified: Utc::now(),
        };
        let mut result = ProcessResult::new(s3_file);
        result.stage = Stage::Validate;
        result.tar_result = Some(TarResult {
            input_tar_path: "bag1.tar".to_string(),
            output_dir: out_dir.display().to_string(),
            warnings: Vec::new(),
            unpacked_files: Vec::new(),
            files,
        });
        result
    }

    #[test]
    fn all_files_stored_moves_to_record_topic_and_deletes_out_dir() {
        let td = tempdir().unwrap();
        let out_dir = td.path().join("bag1");
        fs::create_dir_all(out_dir.join("data")).unwrap();
        fs::write(out_dir.join("data/metadata.xml"), b"hello").unwrap();

        let result = sample_result(&out_dir, vec![sample_file("metadata.xml", b"hello")]);

        let broker = InMemoryBroker::new();
        broker.publish(STORE_TOPIC, &result).unwrap();
        let msg = broker.receive(STORE_TOPIC).unwrap().unwrap();

        let blobstore = InMemoryBlobStore::new();
        let registry = InMemoryRegistryClient::new();
        let log_dir = tempdir().unwrap();
        let status_log = StatusLog::open(log_dir.path()).unwrap();
        let retry_cfg = RetryPolicy::Default.to_config();
        let mut reporter = NullReporter;

        process_message(
            msg,
            &broker,
            &blobstore,
            &registry,
            "aptrust.preservation.storage",
            &status_log,
            log_dir.path(),
            &retry_cfg,
            &mut reporter,
        )
        .unwrap();

        assert_eq!(broker.ready_len(RECORD_TOPIC), 1);
        assert!(!out_dir.exists());

        let msg = broker.receive(RECORD_TOPIC).unwrap().unwrap();
        let published: ProcessResult = msg.decode().unwrap();
        let stored_file = &published.tar_result.unwrap().files[0];
        assert!(stored_file.storage_url.is_some());
        assert!(stored_file.stored_at.is_some());
    }

    #[test]
    fn one_missing_file_is_an_incomplete_copy_sent_to_trouble() {
        let td = tempdir().unwrap();
        let out_dir = td.path().join("bag2");
        fs::create_dir_all(out_dir.join("data")).unwrap();
        fs::write(out_dir.join("data/a.txt"), b"a").unwrap();
        // b.txt deliberately not written to disk.

        let result = sample_result(&out_dir, vec![sample_file("a.txt", b"a"), sample_file("b.txt", b"b")]);

        let broker = InMemoryBroker::new();
        broker.publish(STORE_TOPIC, &result).unwrap();
        let msg = broker.receive(STORE_TOPIC).unwrap().unwrap();

        let blobstore = InMemoryBlobStore::new();
        let registry = InMemoryRegistryClient::new();
        let log_dir = tempdir().unwrap();
        let status_log = StatusLog::open(log_dir.path()).unwrap();
        let retry_cfg = RetryPolicy::Default.to_config();
        let mut reporter = NullReporter;

        process_message(
            msg,
            &broker,
            &blobstore,
            &registry,
            "aptrust.preservation.storage",
            &status_log,
            log_dir.path(),
            &retry_cfg,
            &mut reporter,
        )
        .unwrap();

        assert_eq!(broker.ready_len(RECORD_TOPIC), 0);
        assert_eq!(broker.ready_len(STORE_TOPIC), 0, "not requeued for an incomplete copy");
        let trouble_path = trouble::trouble_path(log_dir.path(), "unc.edu", "unc.edu.bag1");
        assert!(trouble_path.is_file());
        // out_dir survives for operator inspection of the partial copy.
        assert!(out_dir.exists());
    }

    #[test]
    fn unchanged_file_skips_upload_and_restores_prior_uuid() {
        let td = tempdir().unwrap();
        let out_dir = td.path().join("bag4");
        // No data/ directory: if store_one_file were invoked for this file
        // it would fail, proving the skip path was taken.
        fs::create_dir_all(&out_dir).unwrap();

        let file = sample_file("metadata.xml", b"hello");
        let fresh_uuid = file.uuid.clone();

        let result = sample_result(&out_dir, vec![file]);

        let registry = InMemoryRegistryClient::new();
        registry
            .create_object(&crate::types::IntellectualObject {
                institution: "unc.edu".to_string(),
                title: "Test".to_string(),
                description: String::new(),
                access: "consortia".to_string(),
                identifier: "unc.edu/unc.edu.bag1".to_string(),
                generic_files: vec![crate::types::GenericFile {
                    identifier: "unc.edu.bag1/metadata.xml".to_string(),
                    mime_type: "application/octet-stream".to_string(),
                    uri: "https://aptrust.preservation.storage/prior-uuid-1234".to_string(),
                    size: 5,
                    created_at: Utc::now(),
                    modified_at: Utc::now(),
                    checksums: vec![crate::types::ChecksumAttribute {
                        algorithm: "md5".to_string(),
                        datetime: Utc::now(),
                        digest: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
                    }],
                    events: Vec::new(),
                }],
                events: Vec::new(),
            })
            .unwrap();

        let broker = InMemoryBroker::new();
        broker.publish(STORE_TOPIC, &result).unwrap();
        let msg = broker.receive(STORE_TOPIC).unwrap().unwrap();

        let blobstore = InMemoryBlobStore::new();
        let log_dir = tempdir().unwrap();
        let status_log = StatusLog::open(log_dir.path()).unwrap();
        let retry_cfg = RetryPolicy::Default.to_config();
        let mut reporter = NullReporter;

        process_message(
            msg,
            &broker,
            &blobstore,
            &registry,
            "aptrust.preservation.storage",
            &status_log,
            log_dir.path(),
            &retry_cfg,
            &mut reporter,
        )
        .unwrap();

        assert_eq!(broker.ready_len(RECORD_TOPIC), 1);
        let msg = broker.receive(RECORD_TOPIC).unwrap().unwrap();
        let published: ProcessResult = msg.decode().unwrap();
        let stored_file = &published.tar_result.unwrap().files[0];
        assert_eq!(stored_file.uuid, "prior-uuid-1234", "UUID must be restored, not freshly minted");
        assert_ne!(stored_file.uuid, fresh_uuid);
        assert_eq!(stored_file.storage_url.as_deref(), Some("https://aptrust.preservation.storage/prior-uuid-1234"));
        assert!(!blobstore.exists("aptrust.preservation.storage", "prior-uuid-1234").unwrap());
    }

    #[test]
    fn no_files_stored_is_transient_and_requeues() {
        let td = tempdir().unwrap();
        let out_dir = td.path().join("bag3");
        fs::create_dir_all(&out_dir).unwrap();
        // No data/ directory at all: every store attempt fails.

        let result = sample_result(&out_dir, vec![sample_file("a.txt", b"a")]);

        let broker = InMemoryBroker::new();
        broker.publish(STORE_TOPIC, &result).unwrap();
        let msg = broker.receive(STORE_TOPIC).unwrap().unwrap();

        let blobstore = InMemoryBlobStore::new();
        let registry = InMemoryRegistryClient::new();
        let log_dir = tempdir().unwrap();
        let status_log = StatusLog::open(log_dir.path()).unwrap();
        let retry_cfg = RetryPolicy::Default.to_config();
        let mut reporter = NullReporter;

        process_message(
            msg,
            &broker,
            &blobstore,
            &registry,
            "aptrust.preservation.storage",
            &status_log,
            log_dir.path(),
            &retry_cfg,
            &mut reporter,
        )
        .unwrap();

        assert_eq!(broker.ready_len(RECORD_TOPIC), 0);
        assert_eq!(broker.ready_len(STORE_TOPIC), 1, "requeued for a fully transient failure");
    }
}
