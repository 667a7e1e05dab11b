//! # Bagman
//!
//! The server-side ingest, replication, restoration, deletion, and
//! fixity-audit pipeline for a digital-preservation consortium.
//!
//! Depositors drop BagIt tar archives into per-institution intake buckets
//! in a primary object store. Bagman discovers those archives, validates
//! them, copies every payload file to permanent storage under a UUID key,
//! records metadata in an external registry, replicates each payload file
//! to a secondary-region bucket, periodically re-checks fixity against
//! permanent storage, and on demand restores an object into a fresh bag or
//! deletes an individual file.
//!
//! ## Pipeline
//!
//! ```text
//! discoverer ─► prepare_topic ─► prepare ─► store_topic ─► store
//!   ─► record_topic ─► record ─┬► replicate_topic ─► replicator
//!                              └► cleanup_topic ─► cleanup (done)
//!
//! fixity_reader (cron) ──► fixity_topic ──► fixity checker
//! request_reader (cron) ──► restore_topic / delete_topic ──► restore / delete
//! ```
//!
//! ## Modules
//!
//! - [`types`] — Domain types: envelopes, BagIt records, PREMIS events
//! - [`config`] — Configuration file (`bagman.toml`) loading and merging
//! - [`topics`] — Broker topic name constants
//! - [`broker`] — Pub/sub broker abstraction and in-memory implementation
//! - [`blobstore`] — Object-store client abstraction (head/get/put/list/delete)
//! - [`registry`] — Registry HTTP JSON API client
//! - [`bagit`] — BagIt read/write engine (untar, validate, build)
//! - [`volume`] — Disk-space arbiter shared by workers that write locally
//! - [`inflight`] — In-process duplicate-admission guard
//! - [`discoverer`] — Intake-bucket listing and `prepare_topic` seeding
//! - [`prepare`] — Fetch, untar, and validate a bag
//! - [`store`] — Upload payload files to permanent storage
//! - [`record`] — Write object/file metadata and PREMIS events to the registry
//! - [`cleanup`] — Delete the source tar and resolve the envelope
//! - [`replicate`] — Copy a payload file to the secondary-region bucket
//! - [`fixity`] — Re-hash a stored file and compare against its recorded digest
//! - [`restore`] — Reassemble an object's files into a fresh bag
//! - [`delete`] — Remove a single payload file from permanent storage
//! - [`report`] — Narration trait used by every worker
//! - [`statuslog`] — Append-only `ProcessStatus` JSONL log
//! - [`trouble`] — Dead-letter JSON dump for failed envelopes
//!
//! Configurable retry strategies with backoff and jitter, re-exported from
//! the `bagman-retry` crate.
pub use bagman_retry as retry;

pub mod bagit;
pub mod blobstore;
pub mod broker;
pub mod cleanup;
pub mod config;
pub mod delete;
pub mod discoverer;
pub mod fixity;
pub mod inflight;
pub mod prepare;
pub mod record;
pub mod registry;
pub mod replicate;
pub mod report;
pub mod restore;
pub mod statuslog;
pub mod store;
pub mod topics;
pub mod trouble;
pub mod types;
pub mod volume;
