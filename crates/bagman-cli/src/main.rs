use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use bagman::blobstore::{BlobStore, FileBlobStore};
use bagman::broker::{Broker, InMemoryBroker};
use bagman::config::{BagmanConfig, CliOverrides};
use bagman::inflight::InFlightRegistry;
use bagman::prepare::LargeBagGate;
use bagman::registry::{HttpRegistryClient, InMemoryRegistryClient, RegistryClient};
use bagman::report::Reporter;
use bagman::statuslog::StatusLog;
use bagman::topics;
use bagman::types::DeleteObject;
use bagman::volume::VolumeArbiter;
use bagman::{cleanup, delete, discoverer, fixity, prepare, record, replicate, restore, store};

/// Server-side ingest, replication, restoration, deletion, and
/// fixity-audit pipeline for a digital-preservation consortium.
#[derive(Parser, Debug)]
#[command(name = "bagman", version)]
#[command(about = "Run the Bagman preservation pipeline")]
struct Cli {
    /// Path to `bagman.toml`. Defaults are used if the file is absent.
    #[arg(long, default_value = "bagman.toml")]
    config: PathBuf,

    /// Root directory for the local disk-backed object store standing in
    /// for the real primary/secondary region SDKs (spec §1 Non-goal: "the
    /// object store SDK" is treated as opaque and supplied by the operator).
    #[arg(long, default_value = "./bagman-blobstore")]
    blob_root: PathBuf,

    /// Override `concurrency.workers`.
    #[arg(long)]
    workers: Option<usize>,

    /// Override `concurrency.fetchers`.
    #[arg(long)]
    fetchers: Option<usize>,

    /// Override `volume.working_dir`.
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Override `log_dir`.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Override `registry_api_base`. When unset and the config file has
    /// none either, an in-process registry double is used (suitable for
    /// local smoke-testing, not for production).
    #[arg(long)]
    registry_api_base: Option<String>,

    /// Override `volume.initial_free_bytes`.
    #[arg(long)]
    initial_free_bytes: Option<u64>,

    /// Run one discovery pass and drain every topic to completion, then
    /// exit, instead of running workers continuously.
    #[arg(long)]
    once: bool,

    /// Poll interval between empty-queue checks in continuous mode.
    #[arg(long, default_value = "2s")]
    poll_interval: String,
}

struct CliReporter {
    prefix: &'static str,
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[{}] info: {msg}", self.prefix);
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[{}] warn: {msg}", self.prefix);
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[{}] error: {msg}", self.prefix);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.is_file() {
        BagmanConfig::load_from_file(&cli.config)?
    } else {
        BagmanConfig::default()
    };
    let config = config.apply_overrides(CliOverrides {
        workers: cli.workers,
        fetchers: cli.fetchers,
        working_dir: cli.working_dir.clone(),
        log_dir: cli.log_dir.clone(),
        registry_api_base: cli.registry_api_base.clone(),
        initial_free_bytes: cli.initial_free_bytes,
    });
    config.validate().context("invalid configuration")?;

    let poll_interval = humantime::parse_duration(&cli.poll_interval).context("invalid --poll-interval")?;

    std::fs::create_dir_all(&config.volume.working_dir)
        .with_context(|| format!("creating working dir {}", config.volume.working_dir.display()))?;
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("creating log dir {}", config.log_dir.display()))?;
    std::fs::create_dir_all(&cli.blob_root)
        .with_context(|| format!("creating blob store root {}", cli.blob_root.display()))?;

    let blobstore: Arc<dyn BlobStore> = Arc::new(FileBlobStore::new(cli.blob_root.clone()));
    let registry: Arc<dyn RegistryClient> = match &config.registry_api_base {
        Some(base) => Arc::new(HttpRegistryClient::new(base.clone())?),
        None => Arc::new(InMemoryRegistryClient::new()),
    };
    let broker = Arc::new(InMemoryBroker::new());
    let volume = Arc::new(VolumeArbiter::new(config.volume.initial_free_bytes));
    let inflight = Arc::new(InFlightRegistry::new());
    let gate = Arc::new(LargeBagGate::new(config.volume.max_concurrent_large_bags));
    let status_log = Arc::new(StatusLog::open(&config.log_dir)?);

    if cli.once {
        run_once(&config, &blobstore, &registry, &broker, &volume, &inflight, &gate, &status_log)
    } else {
        run_forever(config, blobstore, registry, broker, volume, inflight, gate, status_log, poll_interval)
    }
}

/// Single discover-then-drain pass. Deterministic and bounded — useful for
/// CI smoke tests and cron-style invocation.
#[allow(clippy::too_many_arguments)]
fn run_once(
    config: &BagmanConfig,
    blobstore: &Arc<dyn BlobStore>,
    registry: &Arc<dyn RegistryClient>,
    broker: &Arc<InMemoryBroker>,
    volume: &Arc<VolumeArbiter>,
    inflight: &Arc<InFlightRegistry>,
    gate: &Arc<LargeBagGate>,
    status_log: &Arc<StatusLog>,
) -> Result<()> {
    let receiving_buckets: Vec<String> = config
        .buckets
        .institutions
        .iter()
        .map(|inst| bagman::types::receiving_bucket_for(inst))
        .collect();

    let mut reporter = CliReporter { prefix: "discover" };
    let discovered = discoverer::discover_once(broker.as_ref(), registry.as_ref(), blobstore.as_ref(), &receiving_buckets, &mut reporter)?;
    eprintln!("[discover] info: published {discovered} bag(s) to prepare_topic");

    drain_prepare(config, broker, blobstore, registry, inflight, volume, gate, status_log)?;
    drain_store(config, broker, blobstore, registry, status_log)?;
    drain_record(config, broker, registry, status_log)?;
    drain_cleanup(config, broker, blobstore, registry, status_log)?;
    drain_replicate(config, broker, blobstore, registry, volume)?;
    drain_fixity(config, broker, blobstore, registry)?;
    drain_restore(config, broker, blobstore, registry, volume)?;
    drain_delete(config, broker, blobstore, registry)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn drain_prepare(
    config: &BagmanConfig,
    broker: &InMemoryBroker,
    blobstore: &Arc<dyn BlobStore>,
    registry: &Arc<dyn RegistryClient>,
    inflight: &InFlightRegistry,
    volume: &VolumeArbiter,
    gate: &LargeBagGate,
    status_log: &StatusLog,
) -> Result<()> {
    let strategy = config.retry.to_strategy_config();
    let mut reporter = CliReporter { prefix: "prepare" };
    while let Some(msg) = broker.receive(topics::PREPARE_TOPIC)? {
        prepare::process_message(
            msg,
            broker,
            blobstore.as_ref(),
            registry.as_ref(),
            inflight,
            volume,
            gate,
            &config.volume.working_dir,
            status_log,
            &config.log_dir,
            &strategy,
            config.volume.large_bag_threshold_bytes,
            &mut reporter,
        )?;
    }
    Ok(())
}

fn drain_store(
    config: &BagmanConfig,
    broker: &InMemoryBroker,
    blobstore: &Arc<dyn BlobStore>,
    registry: &Arc<dyn RegistryClient>,
    status_log: &StatusLog,
) -> Result<()> {
    let strategy = config.retry.to_strategy_config();
    let mut reporter = CliReporter { prefix: "store" };
    while let Some(msg) = broker.receive(topics::STORE_TOPIC)? {
        store::process_message(
            msg,
            broker,
            blobstore.as_ref(),
            registry.as_ref(),
            &config.buckets.preservation_bucket,
            status_log,
            &config.log_dir,
            &strategy,
            &mut reporter,
        )?;
    }
    Ok(())
}

fn drain_record(config: &BagmanConfig, broker: &InMemoryBroker, registry: &Arc<dyn RegistryClient>, status_log: &StatusLog) -> Result<()> {
    let strategy = config.retry.to_strategy_config();
    let mut reporter = CliReporter { prefix: "record" };
    while let Some(msg) = broker.receive(topics::RECORD_TOPIC)? {
        record::process_message(msg, broker, registry.as_ref(), status_log, &config.log_dir, &strategy, &mut reporter)?;
    }
    Ok(())
}

fn drain_cleanup(
    config: &BagmanConfig,
    broker: &InMemoryBroker,
    blobstore: &Arc<dyn BlobStore>,
    registry: &Arc<dyn RegistryClient>,
    status_log: &StatusLog,
) -> Result<()> {
    let strategy = config.retry.to_strategy_config();
    let mut reporter = CliReporter { prefix: "cleanup" };
    while let Some(msg) = broker.receive(topics::CLEANUP_TOPIC)? {
        cleanup::process_message(
            msg,
            broker,
            blobstore.as_ref(),
            registry.as_ref(),
            config.cleanup.delete_on_success,
            status_log,
            &config.log_dir,
            &strategy,
            &mut reporter,
        )?;
    }
    Ok(())
}

fn drain_replicate(config: &BagmanConfig, broker: &InMemoryBroker, blobstore: &Arc<dyn BlobStore>, registry: &Arc<dyn RegistryClient>, volume: &VolumeArbiter) -> Result<()> {
    let strategy = config.retry.to_strategy_config();
    let mut reporter = CliReporter { prefix: "replicate" };
    while let Some(msg) = broker.receive(topics::REPLICATE_TOPIC)? {
        replicate::process_message(
            msg,
            broker,
            blobstore.as_ref(),
            registry.as_ref(),
            &config.buckets.preservation_bucket,
            &config.buckets.replication_bucket,
            &config.volume.working_dir,
            volume,
            &config.log_dir,
            &strategy,
            &mut reporter,
        )?;
    }
    Ok(())
}

fn drain_fixity(config: &BagmanConfig, broker: &InMemoryBroker, blobstore: &Arc<dyn BlobStore>, registry: &Arc<dyn RegistryClient>) -> Result<()> {
    let strategy = config.retry.to_strategy_config();
    let mut reporter = CliReporter { prefix: "fixity" };
    while let Some(msg) = broker.receive(topics::FIXITY_TOPIC)? {
        fixity::process_message(msg, broker, blobstore.as_ref(), registry.as_ref(), &config.buckets.preservation_bucket, &config.log_dir, &strategy, &mut reporter)?;
    }
    Ok(())
}

fn drain_restore(config: &BagmanConfig, broker: &InMemoryBroker, blobstore: &Arc<dyn BlobStore>, registry: &Arc<dyn RegistryClient>, volume: &VolumeArbiter) -> Result<()> {
    let strategy = config.retry.to_strategy_config();
    let mut reporter = CliReporter { prefix: "restore" };
    while let Some(msg) = broker.receive(topics::RESTORE_TOPIC)? {
        restore::process_message(
            msg,
            broker,
            blobstore.as_ref(),
            registry.as_ref(),
            &config.buckets.preservation_bucket,
            &config.volume.working_dir,
            volume,
            &config.log_dir,
            &strategy,
            &mut reporter,
        )?;
    }
    Ok(())
}

/// `DeleteObject` carries no institution of its own, unlike `RestoreObject`.
/// `generic_file_identifier` is `"<institution>.<bag-name>/<relative-path>"`;
/// split off the owner prefix before the path, then take everything but the
/// last dot-segment (the bag name) as the institution domain.
fn institution_of_delete_envelope(msg: &bagman::broker::BrokerMessage) -> String {
    msg.decode::<DeleteObject>()
        .ok()
        .and_then(|envelope| {
            let owner = envelope.generic_file_identifier.split('/').next()?.to_string();
            owner.rsplit_once('.').map(|(institution, _bag_name)| institution.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn drain_delete(config: &BagmanConfig, broker: &InMemoryBroker, blobstore: &Arc<dyn BlobStore>, registry: &Arc<dyn RegistryClient>) -> Result<()> {
    let strategy = config.retry.to_strategy_config();
    let mut reporter = CliReporter { prefix: "delete" };
    while let Some(msg) = broker.receive(topics::DELETE_TOPIC)? {
        let institution = institution_of_delete_envelope(&msg);
        delete::process_message(
            msg,
            broker,
            blobstore.as_ref(),
            registry.as_ref(),
            &config.buckets.preservation_bucket,
            &institution,
            &config.log_dir,
            &strategy,
            &mut reporter,
        )?;
    }
    Ok(())
}

/// Spawn one thread per worker kind, each polling its topic forever.
/// Grounded on the teacher's `engine_parallel` wave-worker pattern, but
/// simplified to one long-lived thread per pipeline stage rather than a
/// wave scheduler — Bagman's stages are fixed, not a dependency DAG.
#[allow(clippy::too_many_arguments)]
fn run_forever(
    config: BagmanConfig,
    blobstore: Arc<dyn BlobStore>,
    registry: Arc<dyn RegistryClient>,
    broker: Arc<InMemoryBroker>,
    volume: Arc<VolumeArbiter>,
    inflight: Arc<InFlightRegistry>,
    gate: Arc<LargeBagGate>,
    status_log: Arc<StatusLog>,
    poll_interval: Duration,
) -> Result<()> {
    let config = Arc::new(config);
    let mut handles = Vec::new();

    {
        let config = Arc::clone(&config);
        let broker = Arc::clone(&broker);
        let registry = Arc::clone(&registry);
        let blobstore = Arc::clone(&blobstore);
        handles.push(thread::spawn(move || loop {
            let receiving_buckets: Vec<String> = config.buckets.institutions.iter().map(|inst| bagman::types::receiving_bucket_for(inst)).collect();
            let mut reporter = CliReporter { prefix: "discover" };
            if let Err(e) = discoverer::discover_once(broker.as_ref(), registry.as_ref(), blobstore.as_ref(), &receiving_buckets, &mut reporter) {
                eprintln!("[discover] error: {e}");
            }
            thread::sleep(poll_interval * 10);
        }));
    }

    macro_rules! worker_thread {
        ($topic:expr, $prefix:expr, |$msg:ident, $broker:ident| $body:block) => {{
            let config = Arc::clone(&config);
            let broker = Arc::clone(&broker);
            let registry = Arc::clone(&registry);
            let blobstore = Arc::clone(&blobstore);
            let volume = Arc::clone(&volume);
            let inflight = Arc::clone(&inflight);
            let gate = Arc::clone(&gate);
            let status_log = Arc::clone(&status_log);
            handles.push(thread::spawn(move || {
                loop {
                    let $broker = broker.as_ref();
                    match $broker.receive($topic) {
                        Ok(Some($msg)) => {
                            let _ = (&config, &registry, &blobstore, &volume, &inflight, &gate, &status_log);
                            if let Err(e) = (|| -> Result<()> { $body })() {
                                eprintln!("[{}] error: {e}", $prefix);
                            }
                        }
                        Ok(None) => thread::sleep(poll_interval),
                        Err(e) => {
                            eprintln!("[{}] error receiving: {e}", $prefix);
                            thread::sleep(poll_interval);
                        }
                    }
                }
            }));
        }};
    }

    worker_thread!(topics::PREPARE_TOPIC, "prepare", |msg, broker| {
        let strategy = config.retry.to_strategy_config();
        let mut reporter = CliReporter { prefix: "prepare" };
        prepare::process_message(
            msg,
            broker,
            blobstore.as_ref(),
            registry.as_ref(),
            &inflight,
            &volume,
            &gate,
            &config.volume.working_dir,
            &status_log,
            &config.log_dir,
            &strategy,
            config.volume.large_bag_threshold_bytes,
            &mut reporter,
        )
    });

    worker_thread!(topics::STORE_TOPIC, "store", |msg, broker| {
        let strategy = config.retry.to_strategy_config();
        let mut reporter = CliReporter { prefix: "store" };
        store::process_message(
            msg,
            broker,
            blobstore.as_ref(),
            registry.as_ref(),
            &config.buckets.preservation_bucket,
            &status_log,
            &config.log_dir,
            &strategy,
            &mut reporter,
        )
    });

    worker_thread!(topics::RECORD_TOPIC, "record", |msg, broker| {
        let strategy = config.retry.to_strategy_config();
        let mut reporter = CliReporter { prefix: "record" };
        record::process_message(msg, broker, registry.as_ref(), &status_log, &config.log_dir, &strategy, &mut reporter)
    });

    worker_thread!(topics::CLEANUP_TOPIC, "cleanup", |msg, broker| {
        let strategy = config.retry.to_strategy_config();
        let mut reporter = CliReporter { prefix: "cleanup" };
        cleanup::process_message(
            msg,
            broker,
            blobstore.as_ref(),
            registry.as_ref(),
            config.cleanup.delete_on_success,
            &status_log,
            &config.log_dir,
            &strategy,
            &mut reporter,
        )
    });

    worker_thread!(topics::REPLICATE_TOPIC, "replicate", |msg, broker| {
        let strategy = config.retry.to_strategy_config();
        let mut reporter = CliReporter { prefix: "replicate" };
        replicate::process_message(
            msg,
            broker,
            blobstore.as_ref(),
            registry.as_ref(),
            &config.buckets.preservation_bucket,
            &config.buckets.replication_bucket,
            &config.volume.working_dir,
            &volume,
            &config.log_dir,
            &strategy,
            &mut reporter,
        )
    });

    worker_thread!(topics::FIXITY_TOPIC, "fixity", |msg, broker| {
        let strategy = config.retry.to_strategy_config();
        let mut reporter = CliReporter { prefix: "fixity" };
        fixity::process_message(msg, broker, blobstore.as_ref(), registry.as_ref(), &config.buckets.preservation_bucket, &config.log_dir, &strategy, &mut reporter)
    });

    worker_thread!(topics::RESTORE_TOPIC, "restore", |msg, broker| {
        let strategy = config.retry.to_strategy_config();
        let mut reporter = CliReporter { prefix: "restore" };
        restore::process_message(
            msg,
            broker,
            blobstore.as_ref(),
            registry.as_ref(),
            &config.buckets.preservation_bucket,
            &config.volume.working_dir,
            &volume,
            &config.log_dir,
            &strategy,
            &mut reporter,
        )
    });

    worker_thread!(topics::DELETE_TOPIC, "delete", |msg, broker| {
        let strategy = config.retry.to_strategy_config();
        let mut reporter = CliReporter { prefix: "delete" };
        let institution = institution_of_delete_envelope(&msg);
        delete::process_message(msg, broker, blobstore.as_ref(), registry.as_ref(), &config.buckets.preservation_bucket, &institution, &config.log_dir, &strategy, &mut reporter)
    });

    eprintln!("bagman: {} worker threads running, polling every {poll_interval:?}", handles.len());
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}
