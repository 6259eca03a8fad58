//! Materialized view cache
//!
//! Readers asking for the same data under the same scope share one live
//! query and one current value. Each shared entry runs a small state
//! machine:
//!
//! ```text
//! Idle --subscribe--> Materializing --opened--> Active
//!  ^                                              |  ^
//!  |                                 last leaves  |  | subscribe
//!  |                                              v  |
//!  +-------------- ttl elapsed ------------ PendingTeardown
//! ```
//!
//! Materialization and teardown are scheduled on the Tokio runtime; no call
//! here waits for data. A torn-down entry leaves the cache and forgets its
//! value; subscribing through an old handle registers it again.
//!
//! # Metrics
//!
//! - `view_materializations_total`: Counter of live queries opened
//! - `view_dematerializations_total`: Counter of live queries closed after their TTL
//! - `views_materialized`: Gauge of entries currently holding a live query

use crate::error::Result;
use crate::live::query::{LiveQuery, QueryDescriptor, QueryResult, QuerySource};

use metrics::{decrement_gauge, increment_counter, increment_gauge};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Scope used for callers without an identity
pub const ANONYMOUS_SCOPE: &str = "anon";

/// TTL applied when none is configured
pub const DEFAULT_VIEW_TTL: Duration = Duration::from_secs(5);

/// Lifecycle phase of a view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPhase {
    /// No live query is open
    Idle,
    /// A live query is being opened
    Materializing,
    /// A live query is open and has subscribers
    Active,
    /// A live query is open, no subscribers, teardown scheduled
    PendingTeardown,
}

/// How a view is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewOptions {
    /// Share the view with other callers in the same scope
    pub enabled: bool,
    /// How long the view outlives its last subscriber
    pub ttl: Duration,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: DEFAULT_VIEW_TTL,
        }
    }
}

type ViewKey = (String, String);
type ViewMap = HashMap<ViewKey, Arc<ViewEntry>>;

/// Cache of shared views keyed by scope and descriptor hash
#[derive(Clone)]
pub struct ViewStore {
    source: Arc<dyn QuerySource>,
    views: Arc<Mutex<ViewMap>>,
}

impl ViewStore {
    /// Creates an empty cache over `source`
    pub fn new(source: Arc<dyn QuerySource>) -> Self {
        Self {
            source,
            views: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn views(&self) -> MutexGuard<'_, ViewMap> {
        lock_views(&self.views)
    }

    /// Returns the shared view of `descriptor` in `scope`
    ///
    /// An empty scope is treated as [`ANONYMOUS_SCOPE`]. Asking again for an
    /// existing view replaces its TTL with `ttl`.
    pub fn get_view(&self, scope: &str, descriptor: &QueryDescriptor, ttl: Duration) -> SharedView {
        self.get_view_with(
            scope,
            descriptor,
            ViewOptions {
                enabled: true,
                ttl,
            },
        )
    }

    /// Returns a view of `descriptor`; a disabled view is private to the caller
    pub fn get_view_with(
        &self,
        scope: &str,
        descriptor: &QueryDescriptor,
        options: ViewOptions,
    ) -> SharedView {
        let scope = if scope.is_empty() {
            ANONYMOUS_SCOPE
        } else {
            scope
        };

        if !options.enabled {
            return SharedView {
                entry: ViewEntry::new(
                    scope,
                    descriptor,
                    options.ttl,
                    Arc::clone(&self.source),
                    None,
                ),
            };
        }

        let key = (scope.to_string(), descriptor.hash_key());
        let mut views = self.views();
        let entry = match views.get(&key) {
            Some(entry) => {
                entry.state().ttl = options.ttl;
                Arc::clone(entry)
            }
            None => {
                let home = Home {
                    views: Arc::downgrade(&self.views),
                    key: key.clone(),
                };
                let entry = ViewEntry::new(
                    scope,
                    descriptor,
                    options.ttl,
                    Arc::clone(&self.source),
                    Some(home),
                );
                views.insert(key, Arc::clone(&entry));
                tracing::debug!(scope, ?descriptor, "Created shared view");
                entry
            }
        };
        SharedView { entry }
    }

    /// Number of shared entries
    pub fn len(&self) -> usize {
        self.views().len()
    }

    /// Whether no shared entry exists
    pub fn is_empty(&self) -> bool {
        self.views().is_empty()
    }

    /// Number of shared entries currently holding a live query
    pub fn materialized_count(&self) -> usize {
        self.views()
            .values()
            .filter(|entry| entry.phase() != ViewPhase::Idle)
            .count()
    }
}

impl std::fmt::Debug for ViewStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewStore")
            .field("views", &self.len())
            .finish()
    }
}

fn lock_views(views: &Mutex<ViewMap>) -> MutexGuard<'_, ViewMap> {
    views.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// Where a shared entry is registered.
struct Home {
    views: Weak<Mutex<ViewMap>>,
    key: ViewKey,
}

struct EntryState {
    phase: ViewPhase,
    subscribers: usize,
    ttl: Duration,
    // Bumped on every subscribe and release; a teardown timer only fires if
    // the epoch it captured is still current.
    epoch: u64,
    // Identifies the live query whose updates are accepted.
    generation: u64,
    materializations: u64,
    close: Option<CancellationToken>,
}

struct ViewEntry {
    scope: String,
    descriptor: QueryDescriptor,
    home: Option<Home>,
    source: Arc<dyn QuerySource>,
    value: watch::Sender<QueryResult>,
    state: Mutex<EntryState>,
}

impl ViewEntry {
    fn new(
        scope: &str,
        descriptor: &QueryDescriptor,
        ttl: Duration,
        source: Arc<dyn QuerySource>,
        home: Option<Home>,
    ) -> Arc<Self> {
        let (value, _) = watch::channel(QueryResult::pending(descriptor));
        Arc::new(Self {
            scope: scope.to_string(),
            descriptor: descriptor.clone(),
            home,
            source,
            value,
            state: Mutex::new(EntryState {
                phase: ViewPhase::Idle,
                subscribers: 0,
                ttl,
                epoch: 0,
                generation: 0,
                materializations: 0,
                close: None,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn phase(&self) -> ViewPhase {
        self.state().phase
    }

    fn acquire(self: &Arc<Self>) {
        // Lock order is cache map, then entry state.
        let views = self.home.as_ref().and_then(|home| home.views.upgrade());
        let mut map = views.as_deref().map(lock_views);

        let needs_materialize = {
            let mut state = self.state();
            state.subscribers += 1;
            state.epoch += 1;
            match state.phase {
                ViewPhase::Idle => {
                    if let (Some(map), Some(home)) = (map.as_mut(), self.home.as_ref()) {
                        map.entry(home.key.clone())
                            .or_insert_with(|| Arc::clone(self));
                    }
                    state.phase = ViewPhase::Materializing;
                    true
                }
                ViewPhase::PendingTeardown => {
                    state.phase = ViewPhase::Active;
                    tracing::debug!(scope = %self.scope, "Reusing view before teardown");
                    false
                }
                ViewPhase::Materializing | ViewPhase::Active => false,
            }
        };
        drop(map);

        if needs_materialize {
            self.materialize();
        }
    }

    fn materialize(self: &Arc<Self>) {
        // Runs without the state lock. While the phase is Materializing no
        // other subscriber opens a second query.
        let opened = self
            .source
            .materialize(&self.descriptor)
            .and_then(|query| self.start_forwarding(query));

        let mut state = self.state();
        match opened {
            Ok(close) => {
                state.close = Some(close);
                state.materializations += 1;
                increment_counter!("view_materializations_total");
                increment_gauge!("views_materialized", 1.0);
                tracing::debug!(scope = %self.scope, descriptor = ?self.descriptor, "Materialized view");

                if state.subscribers == 0 {
                    state.phase = ViewPhase::PendingTeardown;
                    state.epoch += 1;
                    let (epoch, ttl) = (state.epoch, state.ttl);
                    drop(state);
                    self.schedule_teardown(epoch, ttl);
                } else {
                    state.phase = ViewPhase::Active;
                }
            }
            Err(e) => {
                state.phase = ViewPhase::Idle;
                let abandoned = state.subscribers == 0;
                drop(state);
                tracing::warn!(
                    scope = %self.scope,
                    descriptor = ?self.descriptor,
                    error = %e,
                    "Failed to materialize view"
                );
                if abandoned {
                    self.evict_if_idle();
                }
            }
        }
    }

    fn start_forwarding(self: &Arc<Self>, mut query: LiveQuery) -> Result<CancellationToken> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let generation = {
            let mut state = self.state();
            state.generation += 1;
            state.generation
        };
        let close = query.close_token();
        let entry = Arc::downgrade(self);

        runtime.spawn(async move {
            while let Some(result) = query.next().await {
                let Some(entry) = entry.upgrade() else {
                    break;
                };
                entry.publish(generation, result);
            }
        });
        Ok(close)
    }

    fn publish(&self, generation: u64, result: QueryResult) {
        let current = {
            let state = self.state();
            state.generation == generation && state.phase != ViewPhase::Idle
        };
        if current {
            self.value.send_replace(result);
        }
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state();
        state.subscribers = state.subscribers.saturating_sub(1);
        state.epoch += 1;
        if state.subscribers > 0 {
            return;
        }
        match state.phase {
            ViewPhase::Active => {}
            ViewPhase::Idle => {
                // Materialization failed; nothing is open.
                drop(state);
                self.evict_if_idle();
                return;
            }
            ViewPhase::Materializing | ViewPhase::PendingTeardown => return,
        }

        state.phase = ViewPhase::PendingTeardown;
        let (epoch, ttl) = (state.epoch, state.ttl);
        drop(state);
        tracing::debug!(scope = %self.scope, ttl_ms = ttl.as_millis() as u64, "Last subscriber left view");
        self.schedule_teardown(epoch, ttl);
    }

    fn schedule_teardown(self: &Arc<Self>, epoch: u64, ttl: Duration) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let entry: Weak<Self> = Arc::downgrade(self);
                runtime.spawn(async move {
                    tokio::time::sleep(ttl).await;
                    if let Some(entry) = entry.upgrade() {
                        entry.teardown(epoch);
                    }
                });
            }
            Err(_) => self.teardown(epoch),
        }
    }

    fn teardown(&self, epoch: u64) {
        let mut state = self.state();
        if state.phase != ViewPhase::PendingTeardown || state.epoch != epoch || state.subscribers > 0
        {
            return;
        }

        if let Some(close) = state.close.take() {
            close.cancel();
        }
        state.phase = ViewPhase::Idle;
        // The next materialization starts unconfirmed.
        self.value.send_replace(QueryResult::pending(&self.descriptor));
        drop(state);

        increment_counter!("view_dematerializations_total");
        decrement_gauge!("views_materialized", 1.0);
        tracing::debug!(scope = %self.scope, descriptor = ?self.descriptor, "Dematerialized view");
        self.evict_if_idle();
    }

    fn evict_if_idle(&self) {
        let Some(home) = self.home.as_ref() else {
            return;
        };
        let Some(views) = home.views.upgrade() else {
            return;
        };

        let mut map = lock_views(&views);
        let registered = map
            .get(&home.key)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), self));
        if !registered {
            return;
        }
        let unused = {
            let state = self.state();
            state.phase == ViewPhase::Idle && state.subscribers == 0
        };
        if unused {
            let evicted = map.remove(&home.key);
            drop(map);
            drop(evicted);
            tracing::debug!(scope = %self.scope, "Evicted idle view");
        }
    }
}

impl Drop for ViewEntry {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(close) = state.close.take() {
            close.cancel();
            decrement_gauge!("views_materialized", 1.0);
        }
    }
}

/// Handle on a cached view
///
/// Cloning the handle does not subscribe; only [`SharedView::subscribe`]
/// counts toward keeping the view materialized.
#[derive(Clone)]
pub struct SharedView {
    entry: Arc<ViewEntry>,
}

impl SharedView {
    /// Attaches a subscriber, materializing the view if needed
    pub fn subscribe(&self) -> ViewSubscription {
        let receiver = self.entry.value.subscribe();
        self.entry.acquire();
        ViewSubscription {
            entry: Arc::clone(&self.entry),
            receiver,
            attached: true,
        }
    }

    /// Copy of the current value
    pub fn current(&self) -> QueryResult {
        self.entry.value.borrow().clone()
    }

    /// Descriptor this view follows
    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.entry.descriptor
    }

    /// Scope this view belongs to
    pub fn scope(&self) -> &str {
        &self.entry.scope
    }

    /// Whether other callers in the scope share this view
    pub fn is_shared(&self) -> bool {
        self.entry.home.is_some()
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> ViewPhase {
        self.entry.phase()
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.entry.state().subscribers
    }

    /// How many times a live query has been opened for this view
    pub fn materializations(&self) -> u64 {
        self.entry.state().materializations
    }

    /// TTL applied after the last subscriber leaves
    pub fn ttl(&self) -> Duration {
        self.entry.state().ttl
    }

    /// Whether both handles refer to the same cached entry
    pub fn same_view(&self, other: &SharedView) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl std::fmt::Debug for SharedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedView")
            .field("scope", &self.entry.scope)
            .field("descriptor", &self.entry.descriptor)
            .field("phase", &self.phase())
            .finish()
    }
}

/// One subscriber's attachment to a view
///
/// Dropping it detaches, like [`ViewSubscription::unsubscribe`].
pub struct ViewSubscription {
    entry: Arc<ViewEntry>,
    receiver: watch::Receiver<QueryResult>,
    attached: bool,
}

impl ViewSubscription {
    /// Copy of the current value
    ///
    /// Every call returns an owned copy; changing it never affects the cache
    /// or other subscribers.
    pub fn current(&self) -> QueryResult {
        self.receiver.borrow().clone()
    }

    /// Waits for the next value and returns a copy of it
    ///
    /// Returns `None` if the view has gone away.
    pub async fn changed(&mut self) -> Option<QueryResult> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Descriptor this subscription follows
    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.entry.descriptor
    }

    /// Detaches from the view
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if std::mem::take(&mut self.attached) {
            self.entry.release();
        }
    }
}

impl Drop for ViewSubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for ViewSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewSubscription")
            .field("descriptor", &self.entry.descriptor)
            .field("attached", &self.attached)
            .finish()
    }
}
