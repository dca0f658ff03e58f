//! tokenflow - BPMN process engine
//!
//! Runs the engine over a WAL-backed store, deploys process files from a
//! directory and executes jobs in the background until ctrl-c.

use std::sync::Arc;
use tokenflow_core::{BehaviorRegistry, DelegateExecution};
use tokenflow_engine::{CheckpointManager, Config, JobExecutor, ProcessEngine};
use tracing_subscriber::EnvFilter;

/// Delegates and listeners available to processes deployed to the binary.
fn builtin_registry() -> BehaviorRegistry {
    let mut registry = BehaviorRegistry::new();
    registry.register_delegate("log", |execution: &mut DelegateExecution<'_>| {
        tracing::info!(
            process_instance = execution.process_instance_id(),
            execution = execution.id(),
            activity = execution.activity_id().as_deref().unwrap_or(""),
            "log delegate"
        );
        Ok(())
    });
    registry.register_listener("log", |execution: &mut DelegateExecution<'_>| {
        tracing::info!(
            process_instance = execution.process_instance_id(),
            execution = execution.id(),
            event = execution.event_name().as_deref().unwrap_or(""),
            source = execution.event_source().as_deref().unwrap_or(""),
            "log listener"
        );
        Ok(())
    });
    registry
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if TOKENFLOW_CONFIG is set, then env overrides)
    let config_path = std::env::var("TOKENFLOW_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting tokenflow engine");
    let engine = Arc::new(ProcessEngine::open(&config, builtin_registry())?);
    let stats = engine.stats();
    tracing::info!(
        "  Recovered {} definitions, {} process instances, {} jobs, {} incidents",
        stats.definitions,
        stats.process_instances,
        stats.jobs,
        stats.incidents
    );

    if let Some(dir) = &config.engine.processes_dir {
        let deployed = engine.deploy_directory(dir)?;
        let created = deployed.iter().filter(|d| d.created).count();
        tracing::info!(
            "  Deployed {} process files from {} ({} new versions)",
            deployed.len(),
            dir.display(),
            created
        );
    }

    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&engine),
        config.job_executor.clone(),
    ));
    let executor_handle = tokio::spawn(Arc::clone(&executor).run());

    let checkpoints = Arc::new(CheckpointManager::new(
        Arc::clone(&engine),
        config.checkpoint.clone(),
    ));
    let checkpoint_handle = {
        let checkpoints = Arc::clone(&checkpoints);
        tokio::spawn(async move { checkpoints.run().await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping job executor...");
    executor.shutdown();
    let _ = executor_handle.await;
    executor.drain().await;
    checkpoints.shutdown();
    let _ = checkpoint_handle.await;

    // Sync WAL before exit
    if let Err(e) = engine.sync() {
        tracing::error!("Failed to sync WAL on shutdown: {}", e);
    }
    if let Err(e) = engine.close() {
        tracing::error!("Failed to close store: {}", e);
    }

    tracing::info!("Engine stopped");
    Ok(())
}
