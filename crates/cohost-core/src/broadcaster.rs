//! Latest-value-wins fan-out of session state.
//!
//! Each slice lives in its own `watch` channel: a new observer reads the
//! current value at once and is then woken on later changes. Intermediate
//! values an observer did not get to see are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::battle::BattleView;
use crate::connection::ConnectionView;
use crate::events::BattleOutcome;
use crate::ranking::RankedEntry;

/// Ranking slice published to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingView {
    pub entries: Vec<RankedEntry>,
    /// Two-party result for the session owner, set once the round ended.
    pub outcome: Option<BattleOutcome>,
    pub is_final: bool,
}

/// Consistent view of every slice at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub connection: ConnectionView,
    pub battle: BattleView,
    pub ranking: RankingView,
    pub countdown_seconds: Option<u32>,
}

/// Publishes the state slices of one session.
#[derive(Debug)]
pub struct StateBroadcaster {
    session_id: String,
    connection: watch::Sender<ConnectionView>,
    battle: watch::Sender<BattleView>,
    ranking: watch::Sender<RankingView>,
    countdown: watch::Sender<Option<u32>>,
}

/// Store `value` unless it equals the current one. Returns true if
/// observers were notified.
fn publish<T: PartialEq>(tx: &watch::Sender<T>, value: T) -> bool {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    })
}

impl StateBroadcaster {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            connection: watch::Sender::new(ConnectionView::default()),
            battle: watch::Sender::new(BattleView::default()),
            ranking: watch::Sender::new(RankingView::default()),
            countdown: watch::Sender::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn publish_connection(&self, view: ConnectionView) -> bool {
        publish(&self.connection, view)
    }

    pub fn publish_battle(&self, view: BattleView) -> bool {
        publish(&self.battle, view)
    }

    pub fn publish_ranking(&self, view: RankingView) -> bool {
        publish(&self.ranking, view)
    }

    pub fn publish_countdown(&self, seconds: Option<u32>) -> bool {
        publish(&self.countdown, seconds)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            connection: self.connection.borrow().clone(),
            battle: self.battle.borrow().clone(),
            ranking: self.ranking.borrow().clone(),
            countdown_seconds: *self.countdown.borrow(),
        }
    }

    /// Subscription that is not counted by any registry.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            session_id: self.session_id.clone(),
            connection: self.connection.subscribe(),
            battle: self.battle.subscribe(),
            ranking: self.ranking.subscribe(),
            countdown: self.countdown.subscribe(),
            _guard: None,
        }
    }
}

/// Observer handle for one session. Dropping it (or calling
/// [`Subscription::unsubscribe`]) stops delivery.
#[derive(Debug)]
pub struct Subscription {
    session_id: String,
    connection: watch::Receiver<ConnectionView>,
    battle: watch::Receiver<BattleView>,
    ranking: watch::Receiver<RankingView>,
    countdown: watch::Receiver<Option<u32>>,
    _guard: Option<ObserverGuard>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current state without consuming pending change notifications.
    pub fn current(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            connection: self.connection.borrow().clone(),
            battle: self.battle.borrow().clone(),
            ranking: self.ranking.borrow().clone(),
            countdown_seconds: *self.countdown.borrow(),
        }
    }

    /// Wait until any slice changes and return the resulting state.
    ///
    /// Returns `None` once the session has been torn down.
    pub async fn changed(&mut self) -> Option<SessionSnapshot> {
        let result = tokio::select! {
            r = self.connection.changed() => r,
            r = self.battle.changed() => r,
            r = self.ranking.changed() => r,
            r = self.countdown.changed() => r,
        };
        result.ok()?;
        Some(self.mark_seen())
    }

    pub fn connection_receiver(&self) -> watch::Receiver<ConnectionView> {
        self.connection.clone()
    }

    pub fn battle_receiver(&self) -> watch::Receiver<BattleView> {
        self.battle.clone()
    }

    pub fn ranking_receiver(&self) -> watch::Receiver<RankingView> {
        self.ranking.clone()
    }

    pub fn countdown_receiver(&self) -> watch::Receiver<Option<u32>> {
        self.countdown.clone()
    }

    /// Current state first, then one item per observed change.
    pub fn into_stream(self) -> impl Stream<Item = SessionSnapshot> + Send {
        futures_util::stream::unfold((self, true), |(mut sub, first)| async move {
            let snapshot = if first {
                sub.mark_seen()
            } else {
                sub.changed().await?
            };
            Some((snapshot, (sub, false)))
        })
    }

    pub fn unsubscribe(self) {
        tracing::debug!("observer detached from {}", self.session_id);
    }

    fn mark_seen(&mut self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            connection: self.connection.borrow_and_update().clone(),
            battle: self.battle.borrow_and_update().clone(),
            ranking: self.ranking.borrow_and_update().clone(),
            countdown_seconds: *self.countdown.borrow_and_update(),
        }
    }
}

/// Called with the session id and teardown epoch once a broadcaster has
/// been idle for the grace period. The hook owns the decision: it tears
/// down through [`BroadcasterRegistry::remove_idle`], which refuses if an
/// observer came back in the meantime.
pub type TeardownHook = Arc<dyn Fn(&str, u64) + Send + Sync>;

#[derive(Debug)]
struct ObserverGuard {
    registry: Weak<RegistryShared>,
    session_id: String,
    /// Broadcaster the observer attached to; a later one under the same id
    /// must not lose an observer when this guard drops.
    broadcaster: Weak<StateBroadcaster>,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.session_id, &self.broadcaster);
        }
    }
}

struct RegistryEntry {
    broadcaster: Arc<StateBroadcaster>,
    observers: usize,
    /// Bumped on every attach and on every drop to zero observers, so a
    /// pending teardown can tell whether it is still current.
    epoch: u64,
}

struct RegistryShared {
    entries: Mutex<HashMap<String, RegistryEntry>>,
    grace: Duration,
    hook: Mutex<Option<TeardownHook>>,
}

impl std::fmt::Debug for RegistryShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryShared")
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl RegistryShared {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(self: &Arc<Self>, session_id: &str, broadcaster: &Weak<StateBroadcaster>) {
        let epoch = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(session_id) else {
                return;
            };
            if !std::ptr::eq(Arc::as_ptr(&entry.broadcaster), broadcaster.as_ptr()) {
                return;
            }
            entry.observers = entry.observers.saturating_sub(1);
            if entry.observers > 0 {
                return;
            }
            entry.epoch += 1;
            entry.epoch
        };

        tracing::debug!("last observer left {session_id}, teardown in {:?}", self.grace);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(self);
                let grace = self.grace;
                let session_id = session_id.to_string();
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.expire(&session_id, epoch);
                    }
                });
            }
            Err(_) => self.expire(session_id, epoch),
        }
    }

    fn expire(&self, session_id: &str, epoch: u64) {
        let hook = self
            .hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match hook {
            Some(hook) => hook(session_id, epoch),
            None => {
                self.remove_idle(session_id, epoch);
            }
        }
    }

    fn remove_idle(&self, session_id: &str, epoch: u64) -> bool {
        {
            let mut entries = self.entries();
            match entries.get(session_id) {
                Some(entry) if entry.observers == 0 && entry.epoch == epoch => {
                    entries.remove(session_id);
                }
                _ => return false,
            }
        }
        tracing::info!("broadcaster for {session_id} torn down");
        true
    }
}

/// Broadcasters keyed by session id, created on first use and torn down
/// after a grace period without observers.
#[derive(Clone, Debug)]
pub struct BroadcasterRegistry {
    shared: Arc<RegistryShared>,
}

impl BroadcasterRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                entries: Mutex::new(HashMap::new()),
                grace,
                hook: Mutex::new(None),
            }),
        }
    }

    pub fn on_teardown(&self, hook: TeardownHook) {
        *self.shared.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn get_or_create(&self, session_id: &str) -> Arc<StateBroadcaster> {
        let mut entries = self.shared.entries();
        entries
            .entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::info!("broadcaster for {session_id} created");
                RegistryEntry {
                    broadcaster: Arc::new(StateBroadcaster::new(session_id)),
                    observers: 0,
                    epoch: 0,
                }
            })
            .broadcaster
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<StateBroadcaster>> {
        self.shared
            .entries()
            .get(session_id)
            .map(|e| e.broadcaster.clone())
    }

    /// Attach an observer, creating the broadcaster if needed.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let broadcaster = self.get_or_create(session_id);
        {
            let mut entries = self.shared.entries();
            if let Some(entry) = entries.get_mut(session_id) {
                entry.observers += 1;
                entry.epoch += 1;
            }
        }
        let mut subscription = broadcaster.subscribe();
        subscription._guard = Some(ObserverGuard {
            registry: Arc::downgrade(&self.shared),
            session_id: session_id.to_string(),
            broadcaster: Arc::downgrade(&broadcaster),
        });
        subscription
    }

    pub fn observer_count(&self, session_id: &str) -> usize {
        self.shared
            .entries()
            .get(session_id)
            .map_or(0, |e| e.observers)
    }

    /// Remove the broadcaster if it is still idle since the release that
    /// produced `epoch`. Returns false if an observer attached since.
    pub fn remove_idle(&self, session_id: &str, epoch: u64) -> bool {
        self.shared.remove_idle(session_id, epoch)
    }

    /// Drop the broadcaster now, without running the teardown hook.
    pub fn remove(&self, session_id: &str) -> Option<Arc<StateBroadcaster>> {
        self.shared
            .entries()
            .remove(session_id)
            .map(|e| e.broadcaster)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.shared.entries().keys().cloned().collect()
    }
}
