//! Restore worker (spec §4.12).
//!
//! Reassembles an intellectual object's payload files into one or more
//! fresh bags and uploads them to the owning institution's restoration
//! bucket. Reuses the BagIt engine's `build_bag` (spec §4.1) so a restored
//! bag is structurally identical to one that could pass through `prepare`
//! again.

use std::fs::File as FsFile;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bagman_retry::{RetryStrategyConfig, attempts_exhausted, calculate_delay};

use crate::bagit::{self, BuiltBag};
use crate::blobstore::{BlobStore, MULTIPART_THRESHOLD};
use crate::broker::{Broker, BrokerMessage};
use crate::registry::RegistryClient;
use crate::report::Reporter;
use crate::trouble;
use crate::types::{EventType, File, GenericFile, IntellectualObject, Outcome, PremisEvent, RestoreObject, restore_bucket_for};
use crate::volume::{VolumeArbiter, fetch_reservation};

#[allow(clippy::too_many_arguments)]
pub fn process_message<B: Broker>(
    msg: BrokerMessage,
    broker: &B,
    blobstore: &dyn BlobStore,
    registry: &dyn RegistryClient,
    preservation_bucket: &str,
    working_dir: &Path,
    volume: &VolumeArbiter,
    log_dir: &Path,
    retry_cfg: &RetryStrategyConfig,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let envelope: RestoreObject = msg.decode()?;

    let Some(object) = registry.get_object(&envelope.object_identifier, true)? else {
        return finish_failed(msg, broker, &envelope, "object no longer present in registry", log_dir, reporter);
    };

    let total_size: u64 = object.generic_files.iter().map(|f| f.size).sum();
    let reservation = fetch_reservation(total_size);
    if volume.reserve(reservation).is_err() {
        reporter.info(&format!("{}: insufficient disk space to restore, requeuing", envelope.object_identifier));
        let delay = calculate_delay(retry_cfg, msg.attempt);
        broker.requeue(msg, delay)?;
        return Ok(());
    }

    let result = restore_one(blobstore, preservation_bucket, working_dir, &object, &envelope, &msg, broker, reporter);
    volume.release(reservation);

    match result {
        Ok(bag_names) => {
            let restore_event = PremisEvent::new(
                EventType::Restore,
                envelope.object_identifier.clone(),
                "Object restored to institution's restoration bucket",
                Outcome::Success,
                bag_names.join(", "),
            );
            let mut events = object.events.clone();
            events.push(restore_event);
            let updated = IntellectualObject {
                events,
                ..object
            };
            registry.update_object(&envelope.object_identifier, &updated)?;
            reporter.info(&format!("{}: restored {} bag(s)", envelope.object_identifier, bag_names.len()));
            broker.finish(&msg)?;
            Ok(())
        }
        Err(e) => finish_failed(msg, broker, &envelope, &e.to_string(), log_dir, reporter),
    }
}

#[allow(clippy::too_many_arguments)]
fn restore_one<B: Broker>(
    blobstore: &dyn BlobStore,
    preservation_bucket: &str,
    working_dir: &Path,
    object: &IntellectualObject,
    envelope: &RestoreObject,
    msg: &BrokerMessage,
    broker: &B,
    reporter: &mut dyn Reporter,
) -> Result<Vec<String>> {
    let bag_dir = working_dir.join(format!("restore-{}", envelope.object_identifier.replace('/', "_")));
    std::fs::create_dir_all(&bag_dir)?;

    let mut files = Vec::with_capacity(object.generic_files.len());
    let mut local_paths = Vec::with_capacity(object.generic_files.len());
    for generic_file in &object.generic_files {
        let key = storage_key(&generic_file.uri);
        let relative_path = relative_path_of(&generic_file.identifier);
        let local_path = bag_dir.join(&relative_path);
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        blobstore.fetch_to_file(preservation_bucket, key, &local_path)?;
        broker.touch(msg).ok();

        files.push(to_file(generic_file, key, &relative_path));
        local_paths.push(local_path);
    }

    let file_refs: Vec<(&File, &Path)> = files.iter().zip(local_paths.iter().map(PathBuf::as_path)).collect();
    let built_bags = bagit::build_bag(&envelope.object_identifier, &object.title, &object.access, &object.description, &file_refs, &bag_dir)?;

    let restoration_bucket = restore_bucket_for(&envelope.institution);
    let mut bag_names = Vec::with_capacity(built_bags.len());
    for built in &built_bags {
        upload_bag(blobstore, &restoration_bucket, built)?;
        broker.touch(msg).ok();
        bag_names.push(built.bag_name.clone());
    }

    std::fs::remove_dir_all(&bag_dir).ok();
    reporter.info(&format!("{}: built and uploaded {} bag(s)", envelope.object_identifier, bag_names.len()));
    Ok(bag_names)
}

fn upload_bag(blobstore: &dyn BlobStore, restoration_bucket: &str, built: &BuiltBag) -> Result<()> {
    let tar_path = built.directory.with_file_name(format!("{}.tar", built.bag_name));
    tar_directory(&built.directory, &tar_path)?;

    let key = format!("{}.tar", built.bag_name);
    let size = std::fs::metadata(&tar_path)?.len();
    if size <= MULTIPART_THRESHOLD {
        let data = std::fs::read(&tar_path)?;
        blobstore.put(restoration_bucket, &key, &data, &Default::default())?;
    } else {
        blobstore.save_large(restoration_bucket, &key, &tar_path, &Default::default())?;
    }
    std::fs::remove_file(&tar_path).ok();
    Ok(())
}

fn tar_directory(dir: &Path, tar_path: &Path) -> Result<()> {
    let file = FsFile::create(tar_path).with_context(|| format!("creating {}", tar_path.display()))?;
    let mut builder = tar::Builder::new(file);
    builder.append_dir_all(".", dir).with_context(|| format!("archiving {}", dir.display()))?;
    builder.finish()?;
    Ok(())
}

fn relative_path_of(identifier: &str) -> String {
    identifier.split_once('/').map(|(_, rel)| rel.to_string()).unwrap_or_else(|| identifier.to_string())
}

fn storage_key(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}

fn to_file(generic_file: &GenericFile, uuid: &str, relative_path: &str) -> File {
    let md5 = generic_file
        .checksums
        .iter()
        .find(|c| c.algorithm.eq_ignore_ascii_case("md5"))
        .map(|c| c.digest.clone())
        .unwrap_or_default();
    let sha256 = generic_file
        .checksums
        .iter()
        .find(|c| c.algorithm.eq_ignore_ascii_case("sha256"))
        .map(|c| c.digest.clone())
        .unwrap_or_default();

    File {
        relative_path: relative_path.to_string(),
        size: generic_file.size,
        modified: generic_file.modified_at,
        md5,
        sha256,
        sha256_generated_at: generic_file.modified_at,
        uuid: uuid.to_string(),
        mime_type: generic_file.mime_type.clone(),
        storage_url: Some(generic_file.uri.clone()),
        storage_md5: None,
        identifier: generic_file.identifier.clone(),
        needs_save: false,
        existing_file: true,
        error: None,
        replication_error: None,
        stored_at: Some(generic_file.modified_at),
    }
}

fn finish_failed<B: Broker>(msg: BrokerMessage, broker: &B, envelope: &RestoreObject, error: &str, log_dir: &Path, reporter: &mut dyn Reporter) -> Result<()> {
    reporter.error(&format!("{}: {error}", envelope.object_identifier));
    trouble::dump(log_dir, &envelope.institution, &envelope.object_identifier.replace('/', "_"), envelope)?;
    broker.finish(&msg)?;
    Ok(())
}
