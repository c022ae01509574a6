//! Engage worker: runs computed-property evaluation, journey orchestration
//! and broadcast reconciliation for a set of workspaces.

mod seed;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use engage_broadcast::BroadcastCoordinator;
use engage_core::config::AppConfig;
use engage_core::event_bus::{EventSink, LifecycleEvent};
use engage_events::InMemoryEventStore;
use engage_journey::{InMemoryHost, JourneyEngine, RecordingTransport};
use engage_segmentation::{
    ComputePropertiesScheduler, InMemoryAssignmentStore, InMemoryPeriodStore,
    IncrementalEvaluator, SegmentationEngine,
};

use crate::seed::Seed;

#[derive(Parser, Debug)]
#[command(name = "engage-worker")]
#[command(about = "Segmentation and journey orchestration worker")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "ENGAGE__NODE_ID")]
    node_id: Option<String>,

    /// Base polling period for computed properties, in ms (overrides config)
    #[arg(long, env = "ENGAGE__COMPUTED_PROPERTIES__BASE_POLLING_PERIOD_MS")]
    polling_period_ms: Option<u64>,

    /// Workspace to evaluate; repeat for several
    #[arg(long = "workspace", env = "ENGAGE_WORKSPACES", value_delimiter = ',')]
    workspaces: Vec<Uuid>,

    /// JSON file with segments, journeys and events to load at startup
    #[arg(long)]
    seed: Option<PathBuf>,
}

/// Writes lifecycle notifications to the structured log.
struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: LifecycleEvent) {
        info!(
            kind = ?event.kind,
            workspace_id = %event.workspace_id,
            subject_id = %event.subject_id,
            user_id = event.user_id.as_deref().unwrap_or(""),
            detail = event.detail.as_deref().unwrap_or(""),
            "Lifecycle event"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "engage_worker=info,engage_segmentation=info,engage_journey=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Engage worker starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(period) = cli.polling_period_ms {
        config.computed_properties.base_polling_period_ms = period;
    }

    info!(
        node_id = %config.node_id,
        polling_period_ms = config.computed_properties.base_polling_period_ms,
        max_concurrent_sends = config.journey.max_concurrent_sends,
        "Configuration loaded"
    );

    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
    let events = Arc::new(InMemoryEventStore::new());
    let registry = Arc::new(SegmentationEngine::new());
    let assignments = Arc::new(InMemoryAssignmentStore::new());
    let host = Arc::new(InMemoryHost::new());

    let evaluator = Arc::new(IncrementalEvaluator::new(
        config.computed_properties.clone(),
        registry.clone(),
        events.clone(),
        Arc::new(InMemoryPeriodStore::new()),
        assignments.clone(),
        sink.clone(),
    ));
    let journeys = Arc::new(
        JourneyEngine::new(
            config.journey.clone(),
            host.clone(),
            Arc::new(RecordingTransport::new()),
            assignments.clone(),
        )
        .with_event_sink(sink.clone()),
    );
    let broadcasts = Arc::new(
        BroadcastCoordinator::new(
            config.broadcast.clone(),
            registry.clone(),
            events.clone(),
            journeys.clone(),
            host,
        )
        .with_event_sink(sink.clone()),
    );

    let mut workspaces = cli.workspaces;
    if let Some(path) = &cli.seed {
        let seeded = Seed::from_path(path)?.apply(&registry, &journeys, events.as_ref())?;
        for workspace_id in seeded {
            if !workspaces.contains(&workspace_id) {
                workspaces.push(workspace_id);
            }
        }
    }
    if workspaces.is_empty() {
        warn!("No workspaces configured, only journey ticks will run");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (updates_tx, mut updates_rx) = mpsc::channel(1024);

    let scheduler = Arc::new(ComputePropertiesScheduler::new(
        config.computed_properties.clone(),
        evaluator,
        updates_tx,
    ));
    let mut handles: Vec<_> = workspaces
        .iter()
        .map(|workspace_id| scheduler.spawn_workspace(*workspace_id, shutdown_rx.clone()))
        .collect();
    drop(scheduler);

    // Membership deltas drive journey entries and segment waits.
    let journeys_for_updates = journeys.clone();
    let consumer = tokio::spawn(async move {
        while let Some(update) = updates_rx.recv().await {
            journeys_for_updates
                .on_segment_update(&update, Utc::now())
                .await;
        }
    });

    // Resume due delays and settle broadcasts; now and then, enter members
    // whose membership delta never reached the journey engine.
    let mut tick_shutdown = shutdown_rx;
    let tick_every = Duration::from_millis(config.journey.tick_interval_ms.max(1));
    let reconcile_every = Duration::from_millis(config.journey.entry_reconcile_interval_ms.max(1));
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_every);
        let mut reconcile_interval = tokio::time::interval(reconcile_every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    if let Err(e) = journeys.tick(now).await {
                        warn!(error = %e, "Journey tick failed");
                    }
                    broadcasts.reconcile_all(now).await;
                }
                _ = reconcile_interval.tick() => {
                    if let Err(e) = journeys.reconcile_entries(Utc::now()).await {
                        warn!(error = %e, "Journey entry reconciliation failed");
                    }
                }
                changed = tick_shutdown.changed() => {
                    if changed.is_err() || *tick_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }));

    info!(workspaces = workspaces.len(), "Engage worker is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    // All schedulers are gone, so the update channel closes.
    let _ = consumer.await;

    info!("Engage worker stopped");
    Ok(())
}
