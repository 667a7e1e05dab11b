//! Cleanup worker (spec §4.9).
//!
//! Last stop for a successfully recorded bag: deletes the source tar from
//! the intake bucket (when `delete-on-success` is configured) and marks the
//! envelope resolved. The untarred working tree is already gone by this
//! point — the store worker removed it on full success (spec §4.7).

use std::path::Path;

use anyhow::Result;
use bagman_retry::{RetryStrategyConfig, attempts_exhausted, calculate_delay};

use crate::broker::{Broker, BrokerMessage};
use crate::registry::{RegistryClient, record_status};
use crate::report::Reporter;
use crate::statuslog::StatusLog;
use crate::trouble;
use crate::types::{CleanupResult, ProcessStatusValue, Stage};

#[allow(clippy::too_many_arguments)]
pub fn process_message<B: Broker>(
    msg: BrokerMessage,
    broker: &B,
    blobstore: &dyn crate::blobstore::BlobStore,
    registry: &dyn RegistryClient,
    delete_on_success: bool,
    status_log: &StatusLog,
    log_dir: &Path,
    retry_cfg: &RetryStrategyConfig,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let mut envelope: CleanupResult = msg.decode()?;
    let inst = envelope.s3_file.institution_domain().unwrap_or("unknown").to_string();
    let bag_name = envelope.s3_file.bag_name().unwrap_or(&envelope.s3_file.key).to_string();

    record_status(
        registry,
        &bag_name,
        &envelope.s3_file.bucket_name,
        &envelope.s3_file.etag,
        envelope.s3_file.last_modified,
        &inst,
        Stage::Cleanup,
        ProcessStatusValue::Started,
        "",
        false,
    )?;

    if let Some(upstream_error) = envelope.error.clone() {
        reporter.warn(&format!("{bag_name}: cleanup received an envelope carrying an upstream error: {upstream_error}"));
    }

    if delete_on_success {
        if let Err(e) = blobstore.delete(&envelope.s3_file.bucket_name, &envelope.s3_file.key) {
            envelope.error = Some(format!("failed to delete source tar: {e}"));
            return finish_failed(msg, broker, envelope, registry, &inst, &bag_name, status_log, log_dir, retry_cfg, reporter);
        }
    }

    let status = record_status(
        registry,
        &bag_name,
        &envelope.s3_file.bucket_name,
        &envelope.s3_file.etag,
        envelope.s3_file.last_modified,
        &inst,
        Stage::Resolve,
        ProcessStatusValue::Success,
        "",
        false,
    )?;
    status_log.append(&status)?;
    reporter.info(&format!("{bag_name}: cleanup complete, bag resolved"));
    broker.finish(&msg)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn finish_failed<B: Broker>(
    msg: BrokerMessage,
    broker: &B,
    envelope: CleanupResult,
    registry: &dyn RegistryClient,
    inst: &str,
    bag_name: &str,
    status_log: &StatusLog,
    log_dir: &Path,
    retry_cfg: &RetryStrategyConfig,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let error_message = envelope.error.clone().unwrap_or_default();
    let final_failure = attempts_exhausted(retry_cfg, msg.attempt);
    let status_value = if final_failure {
        ProcessStatusValue::Failed
    } else {
        ProcessStatusValue::Pending
    };

    let status = record_status(
        registry,
        bag_name,
        &envelope.s3_file.bucket_name,
        &envelope.s3_file.etag,
        envelope.s3_file.last_modified,
        inst,
        Stage::Cleanup,
        status_value,
        error_message.clone(),
        !final_failure,
    )?;
    status_log.append(&status)?;
    reporter.error(&format!("{bag_name}: {error_message}"));

    if final_failure {
        trouble::dump(log_dir, inst, bag_name, &envelope)?;
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
    use crate::topics::CLEANUP_TOPIC;
    use crate::types::S3File;
    use bagman_retry::RetryPolicy;
    use chrono::Utc;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn sample_envelope(bucket: &str, key: &str) -> CleanupResult {
        CleanupResult {
            s3_file: S3File {
                bucket_name: bucket.to_string(),
                key: key.to_string(),
                size: 100,
                etag: "etag-1".to_string(),
                last_modified: Utc::now(),
            },
            message_id: "msg-1".to_string(),
            error: None,
        }
    }

    #[test]
    fn delete_on_success_removes_the_source_tar() {
        let bucket = "aptrust.receiving.unc.edu";
        let key = "unc.edu.bag1.tar";
        let blobstore = InMemoryBlobStore::new();
        blobstore.put(bucket, key, b"tar bytes", &HashMap::new()).unwrap();

        let broker = InMemoryBroker::new();
        broker.publish(CLEANUP_TOPIC, &sample_envelope(bucket, key)).unwrap();
        let msg = broker.receive(CLEANUP_TOPIC).unwrap().unwrap();

        let registry = InMemoryRegistryClient::new();
        let log_dir = tempdir().unwrap();
        let status_log = StatusLog::open(log_dir.path()).unwrap();
        let retry_cfg = RetryPolicy::Default.to_config();
        let mut reporter = NullReporter;

        process_message(msg, &broker, &blobstore, &registry, true, &status_log, log_dir.path(), &retry_cfg, &mut reporter)
            .unwrap();

        assert!(!blobstore.exists(bucket, key).unwrap());
    }

    #[test]
    fn delete_on_success_false_leaves_the_tar_in_place() {
        let bucket = "aptrust.receiving.unc.edu";
        let key = "unc.edu.bag2.tar";
        let blobstore = InMemoryBlobStore::new();
        blobstore.put(bucket, key, b"tar bytes", &HashMap::new()).unwrap();

        let broker = InMemoryBroker::new();
        broker.publish(CLEANUP_TOPIC, &sample_envelope(bucket, key)).unwrap();
        let msg = broker.receive(CLEANUP_TOPIC).unwrap().unwrap();

        let registry = InMemoryRegistryClient::new();
        let log_dir = tempdir().unwrap();
        let status_log = StatusLog::open(log_dir.path()).unwrap();
        let retry_cfg = RetryPolicy::Default.to_config();
        let mut reporter = NullReporter;

        process_message(msg, &broker, &blobstore, &registry, false, &status_log, log_dir.path(), &retry_cfg, &mut reporter)
            .unwrap();

        assert!(blobstore.exists(bucket, key).unwrap());
    }
}
