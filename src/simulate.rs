use anyhow::{Context, Result};
use arbiter::{
    test_utils::{destroy_all, owners, spawn_contenders, OwnershipChange, OwnershipEvent},
    ArbiterConfig, InMemoryStore, ResourceId, StoreStats,
};
use std::sync::Arc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{info, warn};

use crate::cli::SimulateArgs;

const DEFAULT_RESOURCE: &str = "baton-sim";

/// Outcome of one simulated run.
#[derive(Debug)]
pub struct Summary {
    pub owners: Vec<String>,
    pub propagation_delay: Duration,
    pub stats: StoreStats,
    /// Every ownership change, oldest first, with its offset from the start.
    pub timeline: Vec<(Duration, String, OwnershipEvent)>,
    pub crashed: Option<String>,
}

/// Builds the arbiter config from the optional file and the flag overrides.
pub fn build_config(args: &SimulateArgs) -> Result<ArbiterConfig> {
    let mut config = match &args.config {
        Some(path) => ArbiterConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ArbiterConfig::new(args.resource.as_deref().unwrap_or(DEFAULT_RESOURCE)),
    };
    if let Some(resource) = &args.resource {
        config.resource_id = ResourceId::new(resource.clone());
    }
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval_ms = ms;
    }
    if let Some(ms) = args.settle_delay_ms {
        config.settle_delay_ms = ms;
    }
    if let Some(ms) = args.renewal_interval_ms {
        config.renewal_interval_ms = ms;
    }
    if let Some(ms) = args.lease_extension_ms {
        config.lease_extension_ms = ms;
    }
    if let Some(jitter) = args.jitter {
        config.jitter = jitter;
    }
    config.validate()?;
    Ok(config)
}

pub async fn run(args: &SimulateArgs) -> Result<Summary> {
    anyhow::ensure!(args.participants > 0, "at least one participant is required");
    let config = build_config(args)?;
    let propagation_delay = Duration::from_millis(args.propagation_delay_ms);
    if config.settle_delay() <= propagation_delay {
        warn!(
            settle_ms = config.settle_delay_ms,
            propagation_ms = args.propagation_delay_ms,
            "settle delay does not exceed propagation delay, expect split ownership"
        );
    }

    let width = (args.participants - 1).to_string().len();
    let labels: Vec<String> = (0..args.participants).map(|i| format!("p{i:0width$}")).collect();
    let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();

    let store = Arc::new(InMemoryStore::with_propagation_delay(propagation_delay));
    let start = Instant::now();
    let end = start + Duration::from_millis(args.duration_ms);
    info!(
        resource = %config.resource_id,
        participants = args.participants,
        duration_ms = args.duration_ms,
        "starting simulation"
    );
    let mut contenders = spawn_contenders(&label_refs, &store, &config)?;

    let mut crashed = None;
    let mut crashed_log = None;
    if let Some(at) = args.crash_owner_at_ms.map(Duration::from_millis) {
        if start + at < end {
            sleep_until(start + at).await;
            match contenders.iter().position(|c| c.arbiter.is_owner()) {
                Some(index) => {
                    let owner = contenders.remove(index);
                    info!(participant = %owner.label, at_ms = at.as_millis(), "crashing owner");
                    crashed = Some(owner.label.clone());
                    crashed_log = Some((owner.label.clone(), owner.log.clone()));
                }
                None => warn!(at_ms = at.as_millis(), "no owner to crash"),
            }
        } else {
            warn!(at_ms = at.as_millis(), "crash time is past the end of the run, ignored");
        }
    }

    sleep_until(end).await;

    let mut timeline: Vec<_> = contenders
        .iter()
        .map(|c| (c.label.clone(), c.log.clone()))
        .chain(crashed_log)
        .flat_map(|(label, log)| log.events().into_iter().map(move |e| (label.clone(), e)))
        .map(|(label, event)| (event.at - start, label, event))
        .collect();
    timeline.sort_by_key(|(offset, label, _)| (*offset, label.clone()));

    let summary = Summary {
        owners: owners(&contenders).iter().map(|c| c.label.clone()).collect(),
        propagation_delay: store.propagation_delay(),
        stats: store.stats(),
        timeline,
        crashed,
    };
    destroy_all(&contenders).await;
    Ok(summary)
}

pub fn print_summary(summary: &Summary) {
    println!("ownership timeline:");
    if summary.timeline.is_empty() {
        println!("  (no ownership changes)");
    }
    for (offset, label, event) in &summary.timeline {
        let change = match event.change {
            OwnershipChange::Gained => "gained",
            OwnershipChange::Lost => "lost",
        };
        println!("  t={:>8}ms  {label:<6} {change:<6} {}", offset.as_millis(), event.token_name);
    }
    if let Some(label) = &summary.crashed {
        println!("crashed: {label}");
    }
    println!("owners at end: {:?}", summary.owners);
    println!("propagation delay: {}ms", summary.propagation_delay.as_millis());
    let StoreStats { lists, creates, deletes, renews } = &summary.stats;
    println!("store ops: lists={lists} creates={creates} deletes={deletes} renews={renews}");
}
