//! Record worker (spec §4.8).
//!
//! Posts object-level metadata to the registry: builds an
//! `IntellectualObject` from the prepare/store stages' output, creates it if
//! absent or merges incoming files against an existing one, appends the
//! per-object `ingest`/`identifier_assignment` events, then fans each stored
//! payload file out to `replicate_topic` and the bag's source tar to
//! `cleanup_topic`.

use anyhow::Result;
use bagman_retry::{RetryStrategyConfig, attempts_exhausted, calculate_delay};
use chrono::Utc;

use crate::broker::{Broker, BrokerMessage};
use crate::registry::{RegistryClient, record_status};
use crate::report::Reporter;
use crate::statuslog::StatusLog;
use crate::topics::{CLEANUP_TOPIC, REPLICATE_TOPIC};
use crate::trouble;
use crate::types::{
    BagReadResult, ChecksumAttribute, CleanupResult, EventType, File, GenericFile, IntellectualObject, Outcome,
    PremisEvent, ProcessResult, ProcessStatusValue, ReplicationObject, Stage, TarResult,
};
use std::path::Path;

/// Registry batch ceilings (spec §4.8 items 3-5).
const CREATE_EMBED_LIMIT: usize = 500;
const SAVE_BATCH_LIMIT: usize = 200;

#[allow(clippy::too_many_arguments)]
pub fn process_message<B: Broker>(
    msg: BrokerMessage,
    broker: &B,
    registry: &dyn RegistryClient,
    status_log: &StatusLog,
    log_dir: &Path,
    retry_cfg: &RetryStrategyConfig,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let mut result: ProcessResult = msg.decode()?;
    let inst = result.s3_file.institution_domain().unwrap_or("unknown").to_string();
    let bag_name = result.s3_file.bag_name().unwrap_or(&result.s3_file.key).to_string();
    let object_identifier = format!("{inst}/{bag_name}");

    record_status(
        registry,
        &bag_name,
        &result.s3_file.bucket_name,
        &result.s3_file.etag,
        result.s3_file.last_modified,
        &inst,
        Stage::Record,
        ProcessStatusValue::Started,
        "",
        false,
    )?;

    let (Some(tar_result), Some(bag_read)) = (result.tar_result.clone(), result.bag_read_result.clone()) else {
        result.set_error("record worker received an envelope missing tar_result/bag_read_result", false);
        return finish_failed(msg, broker, result, registry, &inst, &bag_name, status_log, log_dir, retry_cfg, reporter);
    };

    if let Err(e) = record_object(registry, &tar_result, &bag_read, &inst, &object_identifier) {
        result.set_error(format!("record worker failed against registry: {e}"), true);
        return finish_failed(msg, broker, result, registry, &inst, &bag_name, status_log, log_dir, retry_cfg, reporter);
    }

    result.advance_stage(Stage::Record);
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

    for file in &tar_result.files {
        broker.touch(&msg).ok();
        broker.publish(
            REPLICATE_TOPIC,
            &ReplicationObject {
                institution: inst.clone(),
                bag_name: bag_name.clone(),
                file: file.clone(),
                message_id: msg.id.clone(),
                error: None,
            },
        )?;
    }
    broker.publish(
        CLEANUP_TOPIC,
        &CleanupResult {
            s3_file: result.s3_file.clone(),
            message_id: msg.id.clone(),
            error: None,
        },
    )?;

    reporter.info(&format!(
        "{bag_name}: recorded {} file(s), handed off to replicate_topic/cleanup_topic",
        tar_result.files.len()
    ));
    broker.finish(&msg)?;
    Ok(())
}

fn record_object(
    registry: &dyn RegistryClient,
    tar_result: &TarResult,
    bag_read: &BagReadResult,
    inst: &str,
    object_identifier: &str,
) -> Result<()> {
    let title = tag_value(&bag_read.tags, "Title").unwrap_or_else(|| object_identifier.to_string());
    let description = tag_value(&bag_read.tags, "Description").unwrap_or_default();
    let access = bag_read
        .access_rights
        .clone()
        .unwrap_or_else(|| "consortia".to_string())
        .to_lowercase();

    let ingest_event = PremisEvent::new(
        EventType::Ingest,
        object_identifier,
        "Bag ingested",
        Outcome::Success,
        "object created or updated in registry",
    );
    let identifier_event = PremisEvent::new(
        EventType::IdentifierAssignment,
        object_identifier,
        "Identifier assigned",
        Outcome::Success,
        object_identifier,
    );

    let existing = registry.get_object(object_identifier, true)?;

    match existing {
        None => {
            let (first, rest) = if tar_result.files.len() > CREATE_EMBED_LIMIT {
                tar_result.files.split_at(CREATE_EMBED_LIMIT)
            } else {
                (&tar_result.files[..], &[][..])
            };
            let object = IntellectualObject {
                institution: inst.to_string(),
                title,
                description,
                access,
                identifier: object_identifier.to_string(),
                generic_files: first.iter().map(to_generic_file).collect(),
                events: vec![ingest_event, identifier_event],
            };
            registry.create_object(&object)?;

            for chunk in rest.chunks(SAVE_BATCH_LIMIT) {
                let batch: Vec<GenericFile> = chunk.iter().map(to_generic_file).collect();
                registry.save_files_batch(object_identifier, &batch)?;
            }
        }
        Some(existing_object) => {
            let mut files = tar_result.files.clone();
            merge_existing_files(&mut files, &existing_object.generic_files);

            let to_save: Vec<&File> = files.iter().filter(|f| f.needs_save).collect();
            for chunk in to_save.chunks(SAVE_BATCH_LIMIT) {
                let batch: Vec<GenericFile> = chunk.iter().map(|f| to_generic_file(f)).collect();
                registry.save_files_batch(object_identifier, &batch)?;
            }

            let mut events = existing_object.events.clone();
            events.push(ingest_event);
            events.push(identifier_event);
            let updated = IntellectualObject {
                institution: inst.to_string(),
                title,
                description,
                access,
                identifier: object_identifier.to_string(),
                // Built from the merged `files`, not the pre-merge
                // `existing_object.generic_files` snapshot, so this PUT
                // doesn't clobber the batch saves just issued above with
                // stale checksums.
                generic_files: files.iter().map(to_generic_file).collect(),
                events,
            };
            registry.update_object(object_identifier, &updated)?;
        }
    }

    Ok(())
}

/// Flip `needs_save` off for files whose content is unchanged from the
/// registry's record of the same identifier (spec §4.8 item 5
/// `MergeExistingFiles`).
fn merge_existing_files(files: &mut [File], existing: &[GenericFile]) {
    for file in files.iter_mut() {
        let Some(found) = existing.iter().find(|g| g.identifier == file.identifier) else {
            continue;
        };
        file.existing_file = true;
        let md5_matches = found
            .checksums
            .iter()
            .any(|c| c.algorithm.eq_ignore_ascii_case("md5") && c.digest.eq_ignore_ascii_case(&file.md5));
        if md5_matches && found.size == file.size {
            file.needs_save = false;
        }
    }
}

fn to_generic_file(file: &File) -> GenericFile {
    GenericFile {
        identifier: file.identifier.clone(),
        mime_type: file.mime_type.clone(),
        uri: file.storage_url.clone().unwrap_or_default(),
        size: file.size,
        created_at: file.stored_at.unwrap_or_else(Utc::now),
        modified_at: Utc::now(),
        checksums: vec![
            ChecksumAttribute {
                algorithm: "md5".to_string(),
                datetime: Utc::now(),
                digest: file.md5.clone(),
            },
            ChecksumAttribute {
                algorithm: "sha256".to_string(),
                datetime: file.sha256_generated_at,
                digest: file.sha256.clone(),
            },
        ],
        events: Vec::new(),
    }
}

fn tag_value(tags: &[(String, String)], key: &str) -> Option<String> {
    tags.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v.clone())
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
