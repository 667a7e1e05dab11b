//! Ingest discoverer (spec §4.5).
//!
//! A periodically run leaf with no state of its own: it lists each
//! configured intake bucket, and for every key ending in `.tar` that the
//! registry doesn't already show in a non-terminal `ProcessStatus`,
//! publishes an `S3File` to `prepare_topic`. The registry is the only
//! source of truth for "already ingested" — nothing here is remembered
//! between runs.

use anyhow::Result;

use crate::blobstore::BlobStore;
use crate::broker::Broker;
use crate::registry::RegistryClient;
use crate::report::Reporter;
use crate::topics::PREPARE_TOPIC;
use crate::types::S3File;

/// Scan every bucket in `buckets` once and publish newly-discovered
/// archives. Returns the number of `S3File`s published.
pub fn discover_once<B: Broker>(
    broker: &B,
    registry: &dyn RegistryClient,
    blobstore: &dyn BlobStore,
    buckets: &[String],
    reporter: &mut dyn Reporter,
) -> Result<usize> {
    let mut published = 0;

    for bucket in buckets {
        let keys = blobstore.list_bucket(bucket, "")?;
        for key in keys {
            if !key.ends_with(".tar") {
                continue;
            }

            let Some(meta) = blobstore.head(bucket, &key)? else {
                continue;
            };

            let s3_file = S3File {
                bucket_name: bucket.clone(),
                key: key.clone(),
                size: meta.size,
                etag: meta.etag,
                last_modified: meta.last_modified,
            };

            let Some(bag_name) = s3_file.bag_name() else {
                reporter.warn(&format!("skipping {bucket}/{key}: key does not end in .tar"));
                continue;
            };

            let already_in_progress = registry
                .get_process_status(&s3_file.etag, bag_name, s3_file.last_modified)?
                .map(|status| !status.is_terminal())
                .unwrap_or(false);

            if already_in_progress {
                continue;
            }

            broker.publish(PREPARE_TOPIC, &s3_file)?;
            published += 1;
            reporter.info(&format!("discovered {bucket}/{key}, published to prepare_topic"));
        }
    }

    Ok(published)
}
