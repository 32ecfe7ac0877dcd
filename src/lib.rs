// src/lib.rs

pub mod access;
pub mod batch;
pub mod cli;
pub mod config;
pub mod data;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod expression;
pub mod logging;
pub mod notify;
pub mod process;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::access::{ManagerHandle, Principal, policy_for};
use crate::batch::{Batch, load_batch};
use crate::cli::CliArgs;
use crate::config::{Settings, load_and_validate};
use crate::data::{DataId, DataObject, DataStatus, DataStore};
use crate::engine::{CoreManager, ManagerEvent, ManagerOptions, Runtime};
use crate::exec::{EngineSet, RealExecutorBackend};
use crate::notify::{NotificationPublisher, RedisPublisher, RedisSource, RetryPolicy, spawn_listener};
use crate::process::{FileSystemFinder, ProcessFinder, ProcessRegistry};
use crate::types::NotificationMode;

/// High-level entry point used by `main.rs`.
///
/// Wires together settings, the process registry, the notification channel,
/// the executor, the manager runtime and Ctrl-C handling, then submits the
/// batch (if any). Finished data objects are printed to stdout as JSON
/// lines.
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let settings = Arc::new(load_and_validate(&config_path)?);

    let finder = FileSystemFinder::new(settings.processes.paths.clone());
    let finders: [&dyn ProcessFinder; 1] = [&finder];
    let registry = Arc::new(ProcessRegistry::from_finders(&finders)?);

    let batch = args.batch.as_deref().map(load_batch).transpose()?;

    if args.dry_run {
        print_dry_run(&settings, &registry, batch.as_ref());
        return Ok(());
    }

    let (event_tx, event_rx) = mpsc::channel::<ManagerEvent>(256);
    let (notify_tx, notify_rx) = mpsc::channel(256);

    let (publisher, redis_source) = match settings.manager.notification {
        NotificationMode::InProcess => (NotificationPublisher::InProcess(notify_tx), None),
        NotificationMode::Redis => {
            let client = redis::Client::open(settings.redis.url())?;
            let channel = settings.notification_channel();
            let publisher = RedisPublisher::new(client.clone(), channel.clone(), notify_tx, RetryPolicy::default());
            let source = RedisSource {
                client,
                channel,
                retry: RetryPolicy::default(),
            };
            (NotificationPublisher::Redis(publisher), Some(source))
        }
    };
    let channel_available = redis_source.is_none();
    let _listeners = spawn_listener(notify_rx, redis_source, event_tx.clone());

    let executor = RealExecutorBackend::new(EngineSet::from_settings(&settings.executor), publisher);

    // Ctrl-C -> graceful shutdown.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(ManagerEvent::ShutdownRequested).await;
        });
    }

    let last_id = last_data_id(&settings.executor.data_dir);
    debug!(last_id, "continuing data ids after existing data directories");

    let options = ManagerOptions {
        exit_when_idle: args.once,
        channel_available,
    };
    let core = CoreManager::with_store(
        settings.clone(),
        registry.clone(),
        options,
        DataStore::starting_after(last_id),
    );

    let (results_tx, mut results_rx) = mpsc::channel::<DataObject>(64);
    let printer = tokio::spawn(async move {
        while let Some(object) = results_rx.recv().await {
            match serde_json::to_string(&object) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(data_id = object.id, error = %e, "could not serialize result"),
            }
        }
    });

    let runtime = Runtime::new(core, &event_tx, event_rx, executor).with_results(results_tx);
    let runtime_handle = tokio::spawn(runtime.run());

    let handle = ManagerHandle::new(event_tx.clone(), policy_for(settings.api.permissions));
    let who = args.user.clone().map(Principal::User).unwrap_or(Principal::Superuser);

    if let Some(batch) = &batch {
        let ids = batch.submit(&handle, &who).await?;
        info!(submitted = ids.len(), "batch submitted");
    }
    handle.close_submissions().await?;
    drop(handle);
    drop(event_tx);

    let core = runtime_handle.await??;
    printer.await?;

    let failed = core
        .store()
        .iter()
        .filter(|o| o.status == DataStatus::Error)
        .count();
    info!(
        total = core.store().len(),
        failed,
        "manager finished"
    );

    Ok(())
}

/// Highest numeric directory name under `data_dir`, or 0.
///
/// New ids continue after it, so a fresh data object never lands in an
/// existing directory.
fn last_data_id(data_dir: &Path) -> DataId {
    let Ok(entries) = std::fs::read_dir(data_dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<DataId>().ok()))
        .max()
        .unwrap_or(0)
}

/// Print settings, processes and the batch plan without executing anything.
fn print_dry_run(settings: &Settings, registry: &ProcessRegistry, batch: Option<&Batch>) {
    println!("flowmgr dry-run");
    println!("  executor.name = {}", settings.executor.name);
    println!("  executor.data_dir = {}", settings.executor.data_dir.display());
    println!("  manager.max_concurrent = {}", settings.manager.max_concurrent);
    for (class, limit) in &settings.manager.class_limits {
        println!("  manager.class_limits.{class} = {limit}");
    }
    println!("  manager.launch_retries = {}", settings.manager.launch_retries);
    println!("  manager.retain_finished = {}", settings.manager.retain_finished);
    println!("  notifications = {:?} ({})", settings.manager.notification, settings.notification_channel());
    println!();

    println!("mappings ({}):", settings.mappings.len());
    for m in &settings.mappings {
        println!("  - {} -> {} ({})", m.source, m.destination.display(), m.mode);
    }
    println!();

    println!("processes ({}):", registry.len());
    for p in registry.iter() {
        println!("  - {}", p.process_ref());
        println!("      engine: {}", p.engine.unwrap_or(settings.executor.name));
        if p.is_workflow() {
            let steps: Vec<_> = p.steps.iter().map(|s| format!("{} ({})", s.id, s.run)).collect();
            println!("      steps: {}", steps.join(" -> "));
        } else {
            println!("      command: {}", p.command.source());
        }
        if !p.inputs.is_empty() {
            let names: Vec<_> = p.inputs.iter().map(|f| format!("{}: {}", f.name, f.field_type)).collect();
            println!("      inputs: {}", names.join(", "));
        }
        if p.resource_class != process::model::DEFAULT_RESOURCE_CLASS {
            println!("      resource_class: {}", p.resource_class);
        }
    }

    if let Some(batch) = batch {
        println!();
        println!("batch ({} entries), submission order:", batch.len());
        for name in batch.order() {
            println!("  - {name}");
        }
    }

    debug!("dry-run complete (no execution)");
}
