//! Delete worker (spec §4.12).
//!
//! Consumes `DeleteObject`, re-checks the deletion is still pending in the
//! registry (a requester may have cancelled between enqueue and delivery),
//! removes the payload file from the preservation bucket by its UUID key,
//! and posts a `delete` PremisEvent.

use std::path::Path;

use anyhow::Result;
use bagman_retry::{RetryStrategyConfig, attempts_exhausted, calculate_delay};

use crate::blobstore::BlobStore;
use crate::broker::{Broker, BrokerMessage};
use crate::registry::RegistryClient;
use crate::report::Reporter;
use crate::trouble;
use crate::types::{DeleteObject, EventType, Outcome, PremisEvent};

pub fn process_message<B: Broker>(
    msg: BrokerMessage,
    broker: &B,
    blobstore: &dyn BlobStore,
    registry: &dyn RegistryClient,
    preservation_bucket: &str,
    institution: &str,
    log_dir: &Path,
    retry_cfg: &RetryStrategyConfig,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let envelope: DeleteObject = msg.decode()?;

    if !registry.deletion_item_pending(&envelope.generic_file_identifier)? {
        reporter.info(&format!(
            "{}: deletion no longer pending, skipping",
            envelope.generic_file_identifier
        ));
        broker.finish(&msg)?;
        return Ok(());
    }

    if let Err(e) = blobstore.delete(preservation_bucket, &envelope.uuid) {
        if attempts_exhausted(retry_cfg, msg.attempt) {
            reporter.error(&format!("{}: {e}", envelope.generic_file_identifier));
            trouble::dump(log_dir, institution, &envelope.generic_file_identifier.replace('/', "_"), &envelope)?;
            broker.finish(&msg)?;
            return Ok(());
        }
        reporter.warn(&format!("{}: delete failed, requeuing: {e}", envelope.generic_file_identifier));
        let delay = calculate_delay(retry_cfg, msg.attempt);
        broker.requeue(msg, delay)?;
        return Ok(());
    }

    let event = PremisEvent::new(
        EventType::Delete,
        envelope.generic_file_identifier.clone(),
        "File deleted from preservation storage",
        Outcome::Success,
        envelope.uuid.clone(),
    );
    registry.post_event(&envelope.generic_file_identifier, &event)?;
    reporter.info(&format!("{}: deleted", envelope.generic_file_identifier));
    broker.finish(&msg)?;
    Ok(())
}
