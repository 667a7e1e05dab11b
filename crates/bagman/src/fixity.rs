//! Fixity checker (spec §4.11).
//!
//! Re-hashes a permanent-storage object and compares it against the
//! registry's recorded sha256, posting a `fixity_check` PremisEvent either
//! way. A digest mismatch is a finding, not a worker failure: the message
//! finishes either way (spec example F — "written; the message is finished
//! (not retried)"). Only a failure to *read* the object is retried.

use std::path::Path;

use anyhow::Result;
use bagman_retry::{RetryStrategyConfig, attempts_exhausted, calculate_delay};

use crate::blobstore::BlobStore;
use crate::broker::{Broker, BrokerMessage};
use crate::registry::RegistryClient;
use crate::report::Reporter;
use crate::topics::FAILED_FIXITY_TOPIC;
use crate::trouble;
use crate::types::{EventType, FixityResult, GenericFile, Outcome, PremisEvent};

const SHA256_ALGORITHM: &str = "sha256";

#[allow(clippy::too_many_arguments)]
pub fn process_message<B: Broker>(
    msg: BrokerMessage,
    broker: &B,
    blobstore: &dyn BlobStore,
    registry: &dyn RegistryClient,
    preservation_bucket: &str,
    log_dir: &Path,
    retry_cfg: &RetryStrategyConfig,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let file: GenericFile = msg.decode()?;

    let Some(expected) = recorded_sha256(&file) else {
        reporter.error(&format!("{}: no sha256 on record, cannot audit", file.identifier));
        return finish_failed(msg, broker, file, "no sha256 recorded in registry", log_dir, reporter);
    };

    let key = storage_key(&file.uri);
    let actual = match blobstore.fetch_and_calculate_sha256(preservation_bucket, key) {
        Ok(digest) => digest,
        Err(e) => {
            if attempts_exhausted(retry_cfg, msg.attempt) {
                return finish_failed(msg, broker, file, &e.to_string(), log_dir, reporter);
            }
            reporter.warn(&format!("{}: fixity read failed, requeuing: {e}", file.identifier));
            let delay = calculate_delay(retry_cfg, msg.attempt);
            broker.requeue(msg, delay)?;
            return Ok(());
        }
    };

    let (outcome, detail) = if actual == expected {
        (Outcome::Success, format!("sha256: {actual}"))
    } else {
        (Outcome::Failed, format!("expected {expected}, got {actual}"))
    };
    let event = PremisEvent::new(EventType::FixityCheck, file.identifier.clone(), "fixity check against permanent storage", outcome, detail);
    registry.post_event(&file.identifier, &event)?;

    match outcome {
        Outcome::Success => reporter.info(&format!("{}: fixity check passed", file.identifier)),
        Outcome::Failed => reporter.error(&format!("{}: fixity mismatch, expected {expected} got {actual}", file.identifier)),
    }
    broker.finish(&msg)?;
    Ok(())
}

fn recorded_sha256(file: &GenericFile) -> Option<String> {
    file.checksums
        .iter()
        .find(|c| c.algorithm.eq_ignore_ascii_case(SHA256_ALGORITHM))
        .map(|c| c.digest.clone())
}

fn storage_key(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}

fn finish_failed<B: Broker>(msg: BrokerMessage, broker: &B, file: GenericFile, error: &str, log_dir: &Path, reporter: &mut dyn Reporter) -> Result<()> {
    reporter.error(&format!("{}: {error}", file.identifier));
    let envelope = FixityResult {
        generic_file: file.clone(),
        message_id: msg.id.clone(),
        error: Some(error.to_string()),
    };
    broker.publish(FAILED_FIXITY_TOPIC, &envelope)?;
    trouble::dump(log_dir, "unknown", &file.identifier.replace('/', "_"), &envelope)?;
    broker.finish(&msg)?;
    Ok(())
}
