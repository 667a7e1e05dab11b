//! Replicator (spec §4.10).
//!
//! Copies one payload file at a time from the preservation bucket (region A)
//! to the replication bucket (region B), preserving the custom metadata
//! envelope the store worker attached (spec §4.2 item 3) and verifying the
//! copy with a post-upload `head` — the Open Question in DESIGN.md resolves
//! in favor of verifying, symmetric with `save_large`'s own verification.
//!
//! `ReplicationObject` carries no etag/bag-date, so unlike the upstream
//! workers this one skips `ProcessStatus`/`StatusLog` bookkeeping entirely;
//! the `replication` `PremisEvent` posted to the registry is this worker's
//! audit trail.

use std::path::Path;

use anyhow::Result;
use bagman_retry::{RetryStrategyConfig, attempts_exhausted, calculate_delay};

use crate::blobstore::{BlobStore, MULTIPART_THRESHOLD, verify_upload};
use crate::broker::{Broker, BrokerMessage};
use crate::registry::RegistryClient;
use crate::report::Reporter;
use crate::topics::FAILED_REPLICATION_TOPIC;
use crate::trouble;
use crate::types::{EventType, Outcome, PremisEvent, ReplicationObject};
use crate::volume::{VolumeArbiter, fetch_reservation};

#[allow(clippy::too_many_arguments)]
pub fn process_message<B: Broker>(
    msg: BrokerMessage,
    broker: &B,
    blobstore: &dyn BlobStore,
    registry: &dyn RegistryClient,
    preservation_bucket: &str,
    replication_bucket: &str,
    working_dir: &Path,
    volume: &VolumeArbiter,
    log_dir: &Path,
    retry_cfg: &RetryStrategyConfig,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let mut envelope: ReplicationObject = msg.decode()?;
    let dest_key = envelope.file.uuid.clone();

    // Idempotency: calling the replicator twice for the same file never
    // results in two copies (spec §8 testable property 2).
    if blobstore.exists(replication_bucket, &dest_key)? {
        reporter.info(&format!(
            "{}: already replicated, finishing without re-copying",
            envelope.file.identifier
        ));
        broker.finish(&msg)?;
        return Ok(());
    }

    let reservation = fetch_reservation(envelope.file.size);
    if volume.reserve(reservation).is_err() {
        reporter.info(&format!(
            "{}: insufficient disk space to reserve {reservation} bytes, requeuing",
            envelope.file.identifier
        ));
        let delay = calculate_delay(retry_cfg, msg.attempt);
        broker.requeue(msg, delay)?;
        return Ok(());
    }

    let result = replicate_one(blobstore, preservation_bucket, replication_bucket, working_dir, &mut envelope, &msg, broker, reporter);
    volume.release(reservation);

    match result {
        Ok(()) => {
            let event = PremisEvent::new(
                EventType::Replication,
                envelope.file.identifier.clone(),
                "File replicated to secondary-region storage",
                Outcome::Success,
                format!("{replication_bucket}/{dest_key}"),
            );
            registry.post_event(&envelope.file.identifier, &event)?;
            reporter.info(&format!("{}: replicated to {replication_bucket}", envelope.file.identifier));
            broker.finish(&msg)?;
            Ok(())
        }
        Err(e) => {
            envelope.error = Some(e.to_string());
            finish_failed(msg, broker, envelope, log_dir, retry_cfg, reporter)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn replicate_one<B: Broker>(
    blobstore: &dyn BlobStore,
    preservation_bucket: &str,
    replication_bucket: &str,
    working_dir: &Path,
    envelope: &mut ReplicationObject,
    msg: &BrokerMessage,
    broker: &B,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let dest_key = envelope.file.uuid.clone();

    let primary_meta = blobstore
        .head(preservation_bucket, &dest_key)?
        .ok_or_else(|| anyhow::anyhow!("source object missing from preservation bucket: {dest_key}"))?;

    let local_path = working_dir.join(format!("replicate-{dest_key}"));
    blobstore.fetch_to_file(preservation_bucket, &dest_key, &local_path)?;
    broker.touch(msg).ok();

    let metadata = primary_meta.custom.clone();
    let etag = if envelope.file.size <= MULTIPART_THRESHOLD {
        let data = std::fs::read(&local_path)?;
        let etag = blobstore.put(replication_bucket, &dest_key, &data, &metadata)?;
        let head = blobstore
            .head(replication_bucket, &dest_key)?
            .ok_or_else(|| anyhow::anyhow!("replicated object vanished before verification"))?;
        verify_upload(&head, &metadata)?;
        etag
    } else {
        blobstore.save_large(replication_bucket, &dest_key, &local_path, &metadata)?
    };
    broker.touch(msg).ok();

    std::fs::remove_file(&local_path).ok();
    reporter.info(&format!("{}: copy verified (etag {etag})", envelope.file.identifier));
    Ok(())
}

fn finish_failed<B: Broker>(
    msg: BrokerMessage,
    broker: &B,
    envelope: ReplicationObject,
    log_dir: &Path,
    retry_cfg: &RetryStrategyConfig,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let error_message = envelope.error.clone().unwrap_or_default();
    reporter.error(&format!("{}: {error_message}", envelope.file.identifier));

    if attempts_exhausted(retry_cfg, msg.attempt) {
        broker.publish(FAILED_REPLICATION_TOPIC, &envelope.file)?;
        trouble::dump(log_dir, &envelope.institution, &envelope.bag_name, &envelope)?;
        broker.finish(&msg)?;
    } else {
        let delay = calculate_delay(retry_cfg, msg.attempt);
        broker.requeue(msg, delay)?;
    }
    Ok(())
}
