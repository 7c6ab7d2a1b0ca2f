// Arbiter state machine - claim, hold and re-claim a lease on one resource
//
// Each instance walks UNOWNED -> REQUESTING -> OWNED and back, driven only by
// its own timers and what it reads from the shared store:
// - UNOWNED: on poll, create a fresh candidate token
// - REQUESTING: on settle, re-list and apply the tie-break
// - OWNED: on renew, push the token's lifetime ahead of the clock
// Losing a race simply returns to UNOWNED; nothing ends the loop except destroy.

use crate::{
    config::{ArbiterConfig, Hooks},
    scheduler::{Scheduler, SchedulerHandle},
    store::ObjectStore,
    token::{ChildEntry, ChildId, LeaseToken},
    ResourceId, Result,
};
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tokio::{
    sync::watch,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArbiterState {
    Unowned,
    Requesting,
    Owned,
    /// Terminal, reached only through `destroy`.
    Destroyed,
}

impl fmt::Display for ArbiterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArbiterState::Unowned => "UNOWNED",
            ArbiterState::Requesting => "REQUESTING",
            ArbiterState::Owned => "OWNED",
            ArbiterState::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    Poll,
    Settle,
    Renew,
}

impl Timer {
    /// The one timer that may be armed while in `state`.
    pub fn for_state(state: ArbiterState) -> Option<Timer> {
        match state {
            ArbiterState::Unowned => Some(Timer::Poll),
            ArbiterState::Requesting => Some(Timer::Settle),
            ArbiterState::Owned => Some(Timer::Renew),
            ArbiterState::Destroyed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub timer: Timer,
    pub deadline: Instant,
}

/// Something a [`Scheduler`] can drive.
#[async_trait]
pub trait Baton: Send + Sync {
    fn state(&self) -> ArbiterState;

    /// The currently armed timer, `None` once nothing should fire again.
    fn armed(&self) -> Option<ArmedTimer>;

    /// Applies one timer fire. A fire that does not match the current state
    /// is ignored.
    async fn update(&self, fired: Timer);

    /// Stops the instance for good. Safe from any state and idempotent.
    async fn destroy(&self);
}

#[derive(Debug)]
struct Inner {
    state: ArbiterState,
    own_token: Option<LeaseToken>,
    armed: Option<ArmedTimer>,
    scheduler: Option<SchedulerHandle>,
}

/// One participant contesting one resource.
pub struct Arbiter {
    config: ArbiterConfig,
    hooks: Hooks,
    store: Arc<dyn ObjectStore>,
    inner: Mutex<Inner>,
    /// Token whose gain was last reported. Taken before `inner`, never after.
    delivered: Mutex<Option<ChildId>>,
    state_tx: watch::Sender<ArbiterState>,
}

impl Arbiter {
    /// Builds an instance in UNOWNED with its poll timer armed, without
    /// anything driving it. Fires are applied through [`Baton::update`].
    pub fn new(config: ArbiterConfig, hooks: Hooks, store: Arc<dyn ObjectStore>) -> Result<Arc<Self>> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ArbiterState::Unowned);
        let arbiter = Arc::new(Self {
            config,
            hooks,
            store,
            inner: Mutex::new(Inner {
                state: ArbiterState::Unowned,
                own_token: None,
                armed: None,
                scheduler: None,
            }),
            delivered: Mutex::new(None),
            state_tx,
        });
        {
            let mut inner = arbiter.inner.lock();
            arbiter.arm(&mut inner, ArbiterState::Unowned);
        }
        Ok(arbiter)
    }

    /// Builds an instance and starts its timers. The first poll fires one
    /// poll interval from now.
    pub fn start(config: ArbiterConfig, hooks: Hooks, store: Arc<dyn ObjectStore>) -> Result<Arc<Self>> {
        let arbiter = Self::new(config, hooks, store)?;
        let handle = Scheduler::spawn(&arbiter);
        arbiter.inner.lock().scheduler = Some(handle);
        debug!(resource = %arbiter.config.resource_id, "arbiter started");
        Ok(arbiter)
    }

    pub fn resource(&self) -> &ResourceId {
        &self.config.resource_id
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// The token this instance currently holds or contests.
    pub fn token(&self) -> Option<LeaseToken> {
        self.inner.lock().own_token.clone()
    }

    pub fn is_owner(&self) -> bool {
        self.state() == ArbiterState::Owned
    }

    pub fn subscribe(&self) -> watch::Receiver<ArbiterState> {
        self.state_tx.subscribe()
    }

    /// Locks the instance unless it has been destroyed. Every transition goes
    /// through here, so a fire that raced a destroy cannot resurrect it.
    fn lock_live(&self) -> Option<MutexGuard<'_, Inner>> {
        let inner = self.inner.lock();
        (inner.state != ArbiterState::Destroyed).then_some(inner)
    }

    /// Moves to `next` and arms the matching timer.
    fn arm(&self, inner: &mut Inner, next: ArbiterState) {
        let previous = std::mem::replace(&mut inner.state, next);
        inner.armed = Timer::for_state(next).map(|timer| ArmedTimer {
            timer,
            deadline: Instant::now() + self.interval(timer),
        });
        if previous != next {
            debug!(resource = %self.config.resource_id, from = %previous, to = %next, "state transition");
            self.state_tx.send_replace(next);
        }
    }

    fn interval(&self, timer: Timer) -> Duration {
        let base = match timer {
            Timer::Poll => self.config.poll_interval(),
            Timer::Settle => self.config.settle_delay(),
            Timer::Renew => self.config.renewal_interval(),
        };
        randomize(base, self.config.jitter)
    }

    fn retreat(&self) {
        if let Some(mut inner) = self.lock_live() {
            inner.own_token = None;
            self.arm(&mut inner, ArbiterState::Unowned);
        }
    }

    fn stay(&self, state: ArbiterState) {
        if let Some(mut inner) = self.lock_live() {
            if inner.state == state {
                self.arm(&mut inner, state);
            }
        }
    }

    async fn on_poll(&self) {
        let resource = &self.config.resource_id;
        let children = match self.store.list_children(resource).await {
            Ok(children) => children,
            Err(e) => {
                warn!(%resource, error = %e, "listing failed during poll, retrying next tick");
                self.stay(ArbiterState::Unowned);
                return;
            }
        };
        if self.config.defer_to_live_tokens && !children.is_empty() {
            debug!(%resource, live = children.len(), "resource is held, not claiming");
            self.stay(ArbiterState::Unowned);
            return;
        }

        let name = self.hooks.name_generator.generate(&self.config.name_prefix);
        let claim_ttl = self.config.claim_ttl();
        let id = match self.store.create_child(resource, &name, claim_ttl).await {
            Ok(id) => id,
            Err(e) => {
                warn!(%resource, error = %e, "creating claim token failed, retrying next tick");
                self.stay(ArbiterState::Unowned);
                return;
            }
        };

        let Some(mut inner) = self.lock_live() else {
            debug!(%resource, token = %name, "destroyed while claiming, token left to expire");
            return;
        };
        debug!(%resource, token = %name, child = %id, "claim token created");
        inner.own_token = Some(LeaseToken::new(id, name, Instant::now(), claim_ttl));
        self.arm(&mut inner, ArbiterState::Requesting);
    }

    async fn on_settle(&self) {
        let resource = &self.config.resource_id;
        let Some(own) = self.token() else {
            self.retreat();
            return;
        };
        let children = match self.store.list_children(resource).await {
            Ok(children) => children,
            Err(e) => {
                warn!(%resource, error = %e, token = %own.name, "listing failed during settle, abandoning claim");
                self.retreat();
                return;
            }
        };

        match self.hooks.tie_break.winner(&children) {
            Some(winner) if winner.id == own.id => {}
            winner => {
                // The losing token is not deleted; it expires on its own.
                debug!(
                    %resource,
                    token = %own.name,
                    winner = winner.map_or("<none visible>", |w| w.name.as_str()),
                    "lost settle check"
                );
                self.retreat();
                return;
            }
        }

        // Only a token pushed out to a full lease is worth owning; the claim
        // TTL would lapse long before the first renewal tick.
        let Some(renewed) = self.extend(&own).await else {
            debug!(%resource, token = %own.name, "won but could not extend, abandoning claim");
            self.retreat();
            return;
        };

        let live = match self.lock_live() {
            Some(mut inner) => {
                self.arm(&mut inner, ArbiterState::Owned);
                true
            }
            None => false,
        };
        if !live {
            debug!(%resource, token = %renewed.name, "destroyed while settling, releasing token");
            if let Err(e) = self.store.delete_child(renewed.id).await {
                warn!(%resource, error = %e, token = %renewed.name, "releasing token failed, leaving it to expire");
            }
            return;
        }
        self.notify_gained(&renewed);
    }

    async fn on_renew(&self) {
        let resource = &self.config.resource_id;
        let Some(own) = self.token() else {
            self.retreat();
            return;
        };
        // Renewals kept failing until the lease ran out
        if own.is_expired(Instant::now()) {
            self.lose(own, Loss::Expired).await;
            return;
        }

        if self.config.verify_on_renew {
            match self.store.list_children(resource).await {
                Ok(children) => {
                    if let Some(verdict) = self.check_still_winning(&own, &children) {
                        self.lose(own, verdict).await;
                        return;
                    }
                }
                Err(e) => {
                    warn!(%resource, error = %e, "listing failed during renewal, renewing unverified");
                }
            }
        }

        if self.extend(&own).await.is_none() {
            debug!(%resource, token = %own.name, "retrying renewal next tick");
        }
        self.stay(ArbiterState::Owned);
    }

    fn check_still_winning(&self, own: &LeaseToken, children: &[ChildEntry]) -> Option<Loss> {
        if !children.iter().any(|c| c.id == own.id) {
            return Some(Loss::Expired);
        }
        match self.hooks.tie_break.winner(children) {
            Some(winner) if winner.id != own.id => Some(Loss::Preempted(winner.name.clone())),
            _ => None,
        }
    }

    /// Pushes the token's lifetime out by one lease extension. Returns the
    /// renewed token, or `None` if the store rejected the renewal.
    async fn extend(&self, own: &LeaseToken) -> Option<LeaseToken> {
        let lifetime = own.extended_lifetime(Instant::now(), self.config.lease_extension());
        if let Err(e) = self.store.renew_child(own.id, lifetime).await {
            warn!(
                resource = %self.config.resource_id,
                error = %e,
                token = %own.name,
                "renewal failed"
            );
            return None;
        }
        let mut renewed = own.clone();
        renewed.renew(lifetime);
        if let Some(mut inner) = self.lock_live() {
            if let Some(token) = inner.own_token.as_mut().filter(|t| t.id == own.id) {
                *token = renewed.clone();
            }
        }
        Some(renewed)
    }

    /// Reports a gain unless the instance moved on since winning. Gains and
    /// losses go out under `delivered`, so a loss never precedes its gain and
    /// a destroyed instance never reports a gain.
    fn notify_gained(&self, token: &LeaseToken) {
        let mut delivered = self.delivered.lock();
        let still_owner = {
            let inner = self.inner.lock();
            inner.state == ArbiterState::Owned && inner.own_token.as_ref().is_some_and(|t| t.id == token.id)
        };
        if !still_owner {
            debug!(resource = %self.config.resource_id, token = %token.name, "ownership ended before it was reported");
            return;
        }
        *delivered = Some(token.id);
        info!(resource = %self.config.resource_id, token = %token.name, "gained ownership");
        if let Some(callback) = &self.hooks.on_gained_ownership {
            callback(token);
        }
    }

    /// Reports the loss of `token`, if its gain was reported.
    fn notify_lost(&self, token: &LeaseToken) {
        let mut delivered = self.delivered.lock();
        if *delivered != Some(token.id) {
            return;
        }
        *delivered = None;
        if let Some(callback) = &self.hooks.on_lost_ownership {
            callback(token);
        }
    }

    async fn lose(&self, own: LeaseToken, loss: Loss) {
        let resource = &self.config.resource_id;
        if let Loss::Preempted(winner) = &loss {
            info!(%resource, token = %own.name, %winner, "preempted, stepping down");
            if let Err(e) = self.store.delete_child(own.id).await {
                warn!(%resource, error = %e, token = %own.name, "deleting preempted token failed");
            }
        } else {
            info!(%resource, token = %own.name, "token expired while owned");
        }

        {
            let Some(mut inner) = self.lock_live() else { return };
            inner.own_token = None;
            self.arm(&mut inner, ArbiterState::Unowned);
        }
        self.notify_lost(&own);
    }
}

#[derive(Debug)]
enum Loss {
    Expired,
    Preempted(String),
}

#[async_trait]
impl Baton for Arbiter {
    fn state(&self) -> ArbiterState {
        self.inner.lock().state
    }

    fn armed(&self) -> Option<ArmedTimer> {
        self.inner.lock().armed
    }

    async fn update(&self, fired: Timer) {
        let state = self.state();
        if Timer::for_state(state) != Some(fired) {
            debug!(resource = %self.config.resource_id, ?fired, %state, "ignoring stale timer");
            return;
        }
        match state {
            ArbiterState::Unowned => self.on_poll().await,
            ArbiterState::Requesting => self.on_settle().await,
            ArbiterState::Owned => self.on_renew().await,
            ArbiterState::Destroyed => {}
        }
    }

    async fn destroy(&self) {
        let (previous, token, scheduler) = {
            let mut inner = self.inner.lock();
            if inner.state == ArbiterState::Destroyed {
                return;
            }
            let previous = std::mem::replace(&mut inner.state, ArbiterState::Destroyed);
            inner.armed = None;
            (previous, inner.own_token.take(), inner.scheduler.take())
        };
        self.state_tx.send_replace(ArbiterState::Destroyed);
        if let Some(scheduler) = scheduler {
            scheduler.cancel();
        }

        let resource = &self.config.resource_id;
        debug!(%resource, from = %previous, "arbiter destroyed");
        if previous != ArbiterState::Owned {
            return;
        }
        let Some(token) = token else { return };
        if let Err(e) = self.store.delete_child(token.id).await {
            warn!(%resource, error = %e, token = %token.name, "releasing token failed, leaving it to expire");
        }
        info!(%resource, token = %token.name, "released ownership");
        self.notify_lost(&token);
    }
}

impl fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arbiter")
            .field("resource", &self.config.resource_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// `base` scaled by a random factor in `[1 - variability, 1 + variability]`.
fn randomize(base: Duration, variability: f64) -> Duration {
    if variability <= 0.0 {
        return base;
    }
    let factor = rand::rng().random_range((1.0 - variability)..=(1.0 + variability));
    base.mul_f64(factor)
}
