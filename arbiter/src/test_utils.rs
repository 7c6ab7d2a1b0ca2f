use crate::{
    config::{ArbiterConfig, Hooks},
    machine::{Arbiter, ArbiterState, Baton},
    store::InMemoryStore,
    token::LeaseToken,
    Result,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipChange {
    Gained,
    Lost,
}

#[derive(Debug, Clone)]
pub struct OwnershipEvent {
    pub change: OwnershipChange,
    pub token_name: String,
    pub at: Instant,
}

/// Records every ownership callback of one or more arbiters.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<OwnershipEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks whose callbacks append to this log.
    pub fn hooks(&self) -> Hooks {
        let gained = self.clone();
        let lost = self.clone();
        Hooks::default()
            .on_gained(move |token| gained.record(OwnershipChange::Gained, token))
            .on_lost(move |token| lost.record(OwnershipChange::Lost, token))
    }

    fn record(&self, change: OwnershipChange, token: &LeaseToken) {
        self.events.lock().push(OwnershipEvent {
            change,
            token_name: token.name.clone(),
            at: Instant::now(),
        });
    }

    pub fn events(&self) -> Vec<OwnershipEvent> {
        self.events.lock().clone()
    }

    pub fn gained(&self) -> usize {
        self.count(OwnershipChange::Gained)
    }

    pub fn lost(&self) -> usize {
        self.count(OwnershipChange::Lost)
    }

    fn count(&self, change: OwnershipChange) -> usize {
        self.events.lock().iter().filter(|e| e.change == change).count()
    }

    /// When ownership was last gained, if ever.
    pub fn last_gained_at(&self) -> Option<Instant> {
        self.events
            .lock()
            .iter()
            .rev()
            .find(|e| e.change == OwnershipChange::Gained)
            .map(|e| e.at)
    }
}

/// One simulated participant: a running arbiter plus its callback log.
#[derive(Debug)]
pub struct Contender {
    pub label: String,
    pub arbiter: Arc<Arbiter>,
    pub log: EventLog,
}

impl Contender {
    pub fn state(&self) -> ArbiterState {
        self.arbiter.state()
    }
}

/// Names every token `<prefix><label>-<attempt>`, so the order of candidates is
/// known in advance.
pub fn sequential_names(label: &str) -> impl Fn(&str) -> String + Send + Sync + 'static {
    let label = label.to_string();
    let attempt = AtomicUsize::new(0);
    move |prefix: &str| {
        let n = attempt.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}{label}-{n}")
    }
}

/// Starts one contender per label against a shared store. Labels double as
/// token names (see [`sequential_names`]), so alphabetical order of labels is
/// the tie-break order among simultaneous claims.
pub fn spawn_contenders(
    labels: &[&str],
    store: &Arc<InMemoryStore>,
    config: &ArbiterConfig,
) -> Result<Vec<Contender>> {
    labels
        .iter()
        .map(|label| {
            let log = EventLog::new();
            let hooks = log.hooks().name_generator(sequential_names(*label));
            let arbiter = Arbiter::start(config.clone(), hooks, store.clone())?;
            Ok(Contender {
                label: (*label).to_string(),
                arbiter,
                log,
            })
        })
        .collect()
}

pub fn owners(contenders: &[Contender]) -> Vec<&Contender> {
    contenders
        .iter()
        .filter(|c| c.state() == ArbiterState::Owned)
        .collect()
}

pub async fn destroy_all(contenders: &[Contender]) {
    futures::future::join_all(contenders.iter().map(|c| c.arbiter.destroy())).await;
}

/// Waits until the arbiter reports `state`, or gives up after `timeout`.
pub async fn wait_for_state(arbiter: &Arbiter, state: ArbiterState, timeout: Duration) -> bool {
    let mut rx = arbiter.subscribe();
    tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
        .await
        .is_ok_and(|r| r.is_ok())
}
