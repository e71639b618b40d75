//! `TrafficPolice<T>` — the bounded, concurrency-aware arbiter that tracks
//! connections (or nested pools), enforces "at most one active borrow per
//! task," maps traffic indicators back to their owning item, and reclaims
//! idle resources under pressure.
//!
//! Generalizes the teacher's `client::pool::Pool<C>` from "one bag of TCP
//! streams keyed by host" to "an arbiter of any [`Manageable`] resource,
//! addressable by pool key, promise, or response identity." The borrowing
//! discipline is the same shape as the teacher's `Pooled<T>` guard: a value
//! handed out of the bag that puts itself back when dropped, unless told to
//! discard itself instead.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::backend::Manageable;
use crate::error::Error;
use crate::promise::ConnectionHandle;
use crate::Result;

const POLL_QUANTUM: Duration = Duration::from_millis(1);

/// The three shapes a traffic indicator can take.
///
/// Mirrors [`Indicator`]'s own variants; kept as a separate type so
/// [`TrafficPolice::find_by`] can ask "does this item have any indicator of
/// this *shape*" without constructing a concrete key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndicatorKind {
    /// A pool-selection key (scheme/host/port/tls-params).
    PoolKey,
    /// A `ResponsePromise` uid.
    Promise,
    /// A response identity.
    Response,
}

/// A pool-selection key: the scheme/host/port/tls-params tuple used to find
/// a connection by the origin it talks to. Compared by value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// `"http"` or `"https"`.
    pub scheme: &'static str,
    /// Target host.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Opaque TLS configuration fingerprint, when the scheme is encrypted;
    /// `None` for plaintext connections. Two keys with different TLS
    /// parameters (client cert, ALPN set) never collide even for the same
    /// host/port.
    pub tls_params: Option<String>,
}

impl PoolKey {
    /// Build a plaintext pool key.
    pub fn new(scheme: &'static str, host: impl Into<String>, port: u16) -> Self {
        PoolKey {
            scheme,
            host: host.into(),
            port,
            tls_params: None,
        }
    }

    /// Attach a TLS configuration fingerprint to this key.
    pub fn with_tls_params(mut self, fingerprint: impl Into<String>) -> Self {
        self.tls_params = Some(fingerprint.into());
        self
    }
}

/// Any of {pool selection key, promise, response} used to identify the
/// connection that owns some logical unit of work.
///
/// `Promise` and `Response` indicators are compared by identity (a uid
/// assigned at creation, never a reused slot's address); `PoolKey` is
/// compared by value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Indicator {
    /// Selects a connection by the origin it was dialed for.
    PoolKey(PoolKey),
    /// Selects a connection by a `ResponsePromise`'s uid.
    Promise(String),
    /// Selects a connection by a response's identity.
    Response(u64),
}

impl Indicator {
    /// The shape of this indicator, for [`TrafficPolice::find_by`].
    pub fn kind(&self) -> IndicatorKind {
        match self {
            Indicator::PoolKey(_) => IndicatorKind::PoolKey,
            Indicator::Promise(_) => IndicatorKind::Promise,
            Indicator::Response(_) => IndicatorKind::Response,
        }
    }
}

/// A read-only existence probe into a nested arbiter.
///
/// [`Manageable::nested_pool`] returns one of these for items that are
/// themselves a pool (`PoolManager -> ConnectionPool -> Connection`), so
/// [`TrafficPolice::locate`]/[`TrafficPolice::beacon`] can descend exactly
/// one level without knowing the nested item's concrete resource type.
pub trait Beacon: Send + Sync {
    /// True iff the nested arbiter has a mapping (or a further nested
    /// beacon) for `indicator`.
    fn beacon_dyn(&self, indicator: &Indicator) -> bool;
}

impl<U> Beacon for TrafficPolice<U>
where
    U: Manageable + Clone + Send + 'static,
{
    fn beacon_dyn(&self, indicator: &Indicator) -> bool {
        self.beacon(indicator)
    }
}

struct Entry<T> {
    // `None` while the item is exclusively borrowed (taken out of the
    // registry for the duration); always `Some` for a `concurrency = true`
    // pool, where borrowers receive a clone instead.
    item: Option<T>,
    indicators: Vec<Indicator>,
}

#[derive(Default)]
struct TaskState {
    cursor: Option<u64>,
    wait_clock: Duration,
}

struct State<T> {
    order: Vec<u64>,
    registry: HashMap<u64, Entry<T>>,
    container: VecDeque<u64>,
    map: HashMap<Indicator, u64>,
    next_id: u64,
    shutdown: bool,
    tasks: HashMap<Option<tokio::task::Id>, TaskState>,
}

impl<T> State<T> {
    fn new() -> Self {
        State {
            order: Vec::new(),
            registry: HashMap::new(),
            container: VecDeque::new(),
            map: HashMap::new(),
            next_id: 0,
            shutdown: false,
            tasks: HashMap::new(),
        }
    }
}

/// A bounded, concurrency-aware multiplexer/arbiter over items of type `T`
/// (a connection, or a nested `TrafficPolice` acting as a sub-pool).
///
/// Every mutation happens inside a short, synchronous critical section
/// guarded by a plain [`std::sync::Mutex`] — no lock is ever held across an
/// `.await`, so a single-threaded cooperative scheduler pays no contention
/// cost, and a multi-threaded one stays correct for free.
pub struct TrafficPolice<T: Manageable + Clone> {
    state: Mutex<State<T>>,
    maxsize: Option<usize>,
    concurrency: bool,
}

impl<T: Manageable + Clone> fmt::Debug for TrafficPolice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("TrafficPolice")
            .field("registry", &state.registry.len())
            .field("container", &state.container.len())
            .field("maxsize", &self.maxsize)
            .field("concurrency", &self.concurrency)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl<T: Manageable + Clone> TrafficPolice<T> {
    /// Build an arbiter. `maxsize = None` means unbounded; `concurrency =
    /// true` lets a borrowed item remain visible to other tasks (used only
    /// for inherently multiplexed connections with internal stream-level
    /// locking).
    pub fn new(maxsize: Option<usize>, concurrency: bool) -> Self {
        TrafficPolice {
            state: Mutex::new(State::new()),
            maxsize,
            concurrency,
        }
    }

    /// `|registry|`.
    pub fn qsize(&self) -> usize {
        self.state.lock().unwrap().registry.len()
    }

    /// `|container|` (the available, not-currently-exclusively-borrowed
    /// subset).
    pub fn rsize(&self) -> usize {
        self.state.lock().unwrap().container.len()
    }

    /// True iff every registered item is idle. Used internally by
    /// [`Self::clear`]'s shutdown-drain decision.
    pub(crate) fn bag_only_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.order.iter().all(|id| {
            state
                .registry
                .get(id)
                .and_then(|e| e.item.as_ref())
                .map(|i| i.is_idle())
                .unwrap_or(true)
        })
    }

    fn current_task_wait_clock(&self) -> Duration {
        let state = self.state.lock().unwrap();
        let key = tokio::task::try_id();
        state.tasks.get(&key).map(|t| t.wait_clock).unwrap_or_default()
    }

    /// How long the calling task has spent inside blocking arbiter calls
    /// (`get`/`locate`/`wait_for_*`), accumulated in ~1ms quanta since the
    /// task's last borrow was released. Exposed for diagnostics and tests of
    /// the polling trade-off; not part of the steady-state hot path.
    pub fn wait_clock(&self) -> Duration {
        self.current_task_wait_clock()
    }

    fn bump_wait_clock(&self) {
        let mut state = self.state.lock().unwrap();
        let key = tokio::task::try_id();
        state.tasks.entry(key).or_default().wait_clock += POLL_QUANTUM;
    }

    /// Admit a new item. Fails with `OverwhelmedTraffic` if the pool is at
    /// `maxsize` and no idle item can be sacrificed to make room (and the
    /// caller did not ask to block). If the arbiter is shutting down, the
    /// item is closed and discarded immediately.
    ///
    /// `immediately_unavailable = true` places the item directly into the
    /// calling task's cursor instead of the idle bag, returning the borrow
    /// guard; otherwise the item enters `container` at the head and `None`
    /// is returned.
    pub async fn put(
        &self,
        item: T,
        indicators: &[Indicator],
        immediately_unavailable: bool,
    ) -> Result<Option<Borrowed<'_, T>>> {
        self.put_blocking(item, indicators, immediately_unavailable, false, None)
            .await
    }

    /// Like [`Self::put`], but willing to block (subject to `timeout`) until
    /// room frees up, instead of immediately failing with
    /// `OverwhelmedTraffic`.
    pub async fn put_blocking(
        &self,
        mut item: T,
        indicators: &[Indicator],
        immediately_unavailable: bool,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Borrowed<'_, T>>> {
        let start = Instant::now();
        loop {
            {
                let mut state = self.state.lock().unwrap();

                if state.shutdown {
                    item.close();
                    return Ok(None);
                }

                if let Some(max) = self.maxsize {
                    if state.registry.len() >= max && Self::sacrifice_first_idle(&mut state).is_none() {
                        drop(state);
                        if !block {
                            return Err(Error::new_overwhelmed(
                                "pool at capacity and nothing idle to evict",
                            ));
                        }
                        if let Some(t) = timeout {
                            if start.elapsed() >= t {
                                return Err(Error::new_overwhelmed(
                                    "pool at capacity and nothing idle to evict",
                                ));
                            }
                        }
                        tokio::time::sleep(POLL_QUANTUM).await;
                        self.bump_wait_clock();
                        continue;
                    }
                }

                let id = state.next_id;
                state.next_id += 1;
                state.order.push(id);

                let guard = if immediately_unavailable {
                    let key = tokio::task::try_id();
                    let task_state = state.tasks.entry(key).or_default();
                    if task_state.cursor.is_some() {
                        state.order.pop();
                        return Err(Error::new_atomic_traffic(
                            "task already holds a borrow from this arbiter",
                        ));
                    }
                    task_state.cursor = Some(id);
                    state.registry.insert(
                        id,
                        Entry {
                            item: None,
                            indicators: Vec::new(),
                        },
                    );
                    Some(Borrowed {
                        pool: self,
                        id,
                        item: Some(item),
                        poisoned: false,
                    })
                } else {
                    state.registry.insert(
                        id,
                        Entry {
                            item: Some(item),
                            indicators: Vec::new(),
                        },
                    );
                    state.container.push_front(id);
                    None
                };

                for indicator in indicators {
                    state.map.insert(indicator.clone(), id);
                    if let Some(entry) = state.registry.get_mut(&id) {
                        entry.indicators.push(indicator.clone());
                    }
                }

                return Ok(guard);
            }
        }
    }

    /// Scan `registry` in insertion order for the first item that is both in
    /// `container` and idle; close and remove it. Returns its id if one was
    /// found.
    fn sacrifice_first_idle(state: &mut State<T>) -> Option<u64> {
        let victim = state.order.iter().cloned().find(|id| {
            state.container.contains(id)
                && state
                    .registry
                    .get(id)
                    .and_then(|e| e.item.as_ref())
                    .map(|i| i.is_idle())
                    .unwrap_or(false)
        });
        if let Some(id) = victim {
            trace!("sacrificing idle connection to make room");
            Self::remove_id(state, id, true);
        }
        victim
    }

    fn remove_id(state: &mut State<T>, id: u64, close: bool) {
        state.order.retain(|&x| x != id);
        state.container.retain(|&x| x != id);
        state.map.retain(|_, v| *v != id);
        if let Some(mut entry) = state.registry.remove(&id) {
            if close {
                if let Some(mut item) = entry.item.take() {
                    item.close();
                }
            }
        }
    }

    fn borrow_id<'p>(&'p self, state: &mut State<T>, id: u64) -> Result<Borrowed<'p, T>> {
        let key = tokio::task::try_id();
        {
            let task_state = state.tasks.entry(key).or_default();
            if task_state.cursor.is_some() {
                return Err(Error::new_atomic_traffic(
                    "task already holds a borrow from this arbiter",
                ));
            }
        }

        let item = {
            let entry = state
                .registry
                .get_mut(&id)
                .ok_or_else(|| Error::new_unavailable("item no longer in registry"))?;
            if self.concurrency {
                entry
                    .item
                    .clone()
                    .ok_or_else(|| Error::new_unavailable("item unavailable"))?
            } else {
                entry
                    .item
                    .take()
                    .ok_or_else(|| Error::new_unavailable("item already borrowed"))?
            }
        };

        if self.concurrency {
            state.container.retain(|&x| x != id);
            state.container.push_front(id);
        } else {
            state.container.retain(|&x| x != id);
        }

        state.tasks.entry(key).or_default().cursor = Some(id);

        Ok(Borrowed {
            pool: self,
            id,
            item: Some(item),
            poisoned: false,
        })
    }

    /// Pop an item from `container`'s head (LIFO). `not_saturated` skips
    /// saturated items; `not_idle` skips fully idle ones (useful to prefer a
    /// warm multiplexed connection over a cold one).
    ///
    /// Fails with `UnavailableTraffic` if nothing matches — whether that's
    /// discovered immediately (`block = false`) or only after `timeout`
    /// elapses while blocking.
    pub async fn get(
        &self,
        not_saturated: bool,
        not_idle: bool,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Borrowed<'_, T>> {
        let start = Instant::now();
        loop {
            {
                let mut state = self.state.lock().unwrap();
                let candidate = state.container.iter().cloned().find(|id| {
                    state
                        .registry
                        .get(id)
                        .and_then(|e| e.item.as_ref())
                        .map(|item| {
                            if not_idle && item.is_idle() {
                                return false;
                            }
                            if not_saturated && item.is_saturated() {
                                return false;
                            }
                            true
                        })
                        .unwrap_or(false)
                });
                if let Some(id) = candidate {
                    return self.borrow_id(&mut state, id);
                }
            }
            if !block {
                return Err(Error::new_unavailable("no matching connection available"));
            }
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return Err(Error::new_unavailable("no matching connection available"));
                }
            }
            tokio::time::sleep(POLL_QUANTUM).await;
            self.bump_wait_clock();
        }
    }

    /// Look up `indicator` in `map`; on a miss, descend one level into any
    /// item whose [`Manageable::nested_pool`] is present and whose `beacon`
    /// reports the indicator.
    ///
    /// Fails with `UnavailableTraffic` on an immediate miss, or `Timeout` if
    /// the miss persists past `timeout` while blocking.
    pub async fn locate(
        &self,
        indicator: &Indicator,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Borrowed<'_, T>> {
        let start = Instant::now();
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(&id) = state.map.get(indicator) {
                    if state.registry.contains_key(&id) {
                        return self.borrow_id(&mut state, id);
                    }
                } else {
                    let mut found = None;
                    for &rid in state.order.iter() {
                        let hit = state
                            .registry
                            .get(&rid)
                            .and_then(|e| e.item.as_ref())
                            .and_then(|item| item.nested_pool())
                            .map(|beacon| beacon.beacon_dyn(indicator))
                            .unwrap_or(false);
                        if hit {
                            found = Some(rid);
                            break;
                        }
                    }
                    if let Some(id) = found {
                        return self.borrow_id(&mut state, id);
                    }
                }
            }
            if !block {
                return Err(Error::new_unavailable("indicator not found"));
            }
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return Err(Error::new_timeout());
                }
            }
            tokio::time::sleep(POLL_QUANTUM).await;
            self.bump_wait_clock();
        }
    }

    /// The first item in `container` that is not idle and has at least one
    /// indicator of shape `kind`. Never blocks.
    pub fn find_by(&self, kind: IndicatorKind) -> Result<Borrowed<'_, T>> {
        let mut state = self.state.lock().unwrap();
        let found = state.container.iter().cloned().find(|id| {
            let entry = match state.registry.get(id) {
                Some(e) => e,
                None => return false,
            };
            let idle = entry.item.as_ref().map(|i| i.is_idle()).unwrap_or(true);
            !idle && entry.indicators.iter().any(|i| i.kind() == kind)
        });
        match found {
            Some(id) => self.borrow_id(&mut state, id),
            None => Err(Error::new_unavailable("no item matches requested indicator shape")),
        }
    }

    /// Block until either the registry has room for another item, or an
    /// idle item already exists that could be evicted to make room.
    pub async fn wait_for_available_slot(&self, timeout: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        loop {
            {
                let state = self.state.lock().unwrap();
                let has_room = self.maxsize.map(|max| state.registry.len() < max).unwrap_or(true);
                let has_idle_to_evict = state.container.iter().any(|id| {
                    state
                        .registry
                        .get(id)
                        .and_then(|e| e.item.as_ref())
                        .map(|i| i.is_idle())
                        .unwrap_or(false)
                });
                if has_room || has_idle_to_evict {
                    return Ok(());
                }
            }
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return Err(Error::new_timeout());
                }
            }
            tokio::time::sleep(POLL_QUANTUM).await;
            self.bump_wait_clock();
        }
    }

    /// Block until at least one idle item exists in `container`.
    pub async fn wait_for_idle_slot(&self, timeout: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        loop {
            {
                let state = self.state.lock().unwrap();
                let has_idle = state.container.iter().any(|id| {
                    state
                        .registry
                        .get(id)
                        .and_then(|e| e.item.as_ref())
                        .map(|i| i.is_idle())
                        .unwrap_or(false)
                });
                if has_idle {
                    return Ok(());
                }
            }
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return Err(Error::new_timeout());
                }
            }
            tokio::time::sleep(POLL_QUANTUM).await;
            self.bump_wait_clock();
        }
    }

    /// Associate `indicator` with the item currently held by `on`.
    pub fn memorize(&self, indicator: Indicator, on: &Borrowed<'_, T>) {
        let mut state = self.state.lock().unwrap();
        state.map.insert(indicator.clone(), on.id);
        if let Some(entry) = state.registry.get_mut(&on.id) {
            entry.indicators.push(indicator);
        }
    }

    /// Remove a mapping. Missing keys are silently ignored.
    pub fn forget(&self, indicator: &Indicator) {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.map.remove(indicator) {
            if let Some(entry) = state.registry.get_mut(&id) {
                entry.indicators.retain(|i| i != indicator);
            }
        }
    }

    /// A read-only existence check: true if `indicator` maps to a live item
    /// either directly or through one level of nested-pool descent.
    pub fn beacon(&self, indicator: &Indicator) -> bool {
        let state = self.state.lock().unwrap();
        if state.map.contains_key(indicator) {
            return true;
        }
        state.order.iter().any(|id| {
            state
                .registry
                .get(id)
                .and_then(|e| e.item.as_ref())
                .and_then(|item| item.nested_pool())
                .map(|beacon| beacon.beacon_dyn(indicator))
                .unwrap_or(false)
        })
    }

    /// True iff `handle` still refers to a live item in this arbiter.
    /// Validated on every use rather than dereferenced, since a
    /// [`ConnectionHandle`] is only meaningful while its connection remains
    /// registered.
    pub fn is_valid(&self, handle: ConnectionHandle) -> bool {
        self.state.lock().unwrap().registry.contains_key(&handle.index)
    }

    /// Yield each idle item in `container`, one at a time, each placed into
    /// the caller's cursor for the duration of its borrow. The caller must
    /// not start a second borrow while holding one from this iterator.
    pub fn iter_idle(&self) -> IdleIter<'_, T> {
        let state = self.state.lock().unwrap();
        let ids = state
            .container
            .iter()
            .cloned()
            .filter(|id| {
                state
                    .registry
                    .get(id)
                    .and_then(|e| e.item.as_ref())
                    .map(|i| i.is_idle())
                    .unwrap_or(false)
            })
            .collect();
        IdleIter { pool: self, remaining: ids }
    }

    /// Enter shutdown. Every currently-idle item in `container` is closed
    /// and removed immediately. If any items are still borrowed, `shutdown`
    /// remains set so that their eventual release closes them too; only
    /// once the registry fully drains is the flag cleared.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        let idle_ids: Vec<u64> = state
            .container
            .iter()
            .cloned()
            .filter(|id| {
                state
                    .registry
                    .get(id)
                    .and_then(|e| e.item.as_ref())
                    .map(|i| i.is_idle())
                    .unwrap_or(false)
            })
            .collect();
        for id in idle_ids {
            Self::remove_id(&mut state, id, true);
        }
        if state.registry.is_empty() {
            state.shutdown = false;
        }
    }

    /// Unconditionally destroy a borrowed item: removes it from `registry`
    /// and `map`, calls `close`, and clears the calling task's cursor. Used
    /// when a connection is determined unusable (e.g. a cancelled read left
    /// it in an inconsistent state) — callers must use this instead of a
    /// plain release in that case.
    pub fn kill_cursor(&self, borrowed: Borrowed<'_, T>) {
        borrowed.kill();
    }

    /// Return a borrowed item to the idle bag. Equivalent to dropping the
    /// guard; exposed by name for readability at call sites.
    pub fn release(&self, borrowed: Borrowed<'_, T>) {
        drop(borrowed);
    }

    fn release_internal(&self, id: u64, item: Option<T>) {
        let mut state = self.state.lock().unwrap();
        let key = tokio::task::try_id();
        // The cursor is cleared and, by construction, no wait loop for this
        // task is still polling (a task can't be both awaiting this call
        // and blocked inside `get`/`locate` at once) — so the whole entry
        // can go rather than leaving a `TaskState` behind for every task id
        // that ever touched the arbiter.
        state.tasks.remove(&key);

        if state.shutdown {
            if let Some(mut it) = item {
                if let Some(entry) = state.registry.get_mut(&id) {
                    entry.item = Some(it);
                } else {
                    it.close();
                    return;
                }
            }
            Self::remove_id(&mut state, id, true);
            if state.registry.is_empty() {
                state.shutdown = false;
            }
            return;
        }

        if let Some(it) = item {
            match state.registry.get_mut(&id) {
                Some(entry) => entry.item = Some(it),
                None => return,
            }
        }

        if !self.concurrency {
            state.container.retain(|&x| x != id);
            state.container.push_front(id);
        }
    }

    fn kill_cursor_internal(&self, id: u64, item: Option<T>) {
        let mut state = self.state.lock().unwrap();
        let key = tokio::task::try_id();
        state.tasks.remove(&key);
        if let Some(mut it) = item {
            match state.registry.get_mut(&id) {
                Some(entry) => entry.item = Some(it),
                None => {
                    it.close();
                    return;
                }
            }
        }
        Self::remove_id(&mut state, id, true);
        if state.shutdown && state.registry.is_empty() {
            state.shutdown = false;
        }
    }
}

/// Exclusive (or, for a `concurrency = true` arbiter, shared) custody of an
/// item borrowed from a [`TrafficPolice`].
///
/// Dropping the guard releases the item back to the idle bag. Call
/// [`Self::kill`] first to destroy the item instead — the right move after a
/// cancelled or otherwise corrupting operation, since the connection can no
/// longer be trusted for reuse.
pub struct Borrowed<'p, T: Manageable + Clone> {
    pool: &'p TrafficPolice<T>,
    id: u64,
    item: Option<T>,
    poisoned: bool,
}

impl<'p, T: Manageable + Clone> Borrowed<'p, T> {
    /// A non-owning handle to the connection this guard borrows, usable to
    /// tag a [`crate::promise::ResponsePromise`] or a response.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(self.id, 0)
    }

    /// Mark this item for destruction instead of reuse once the guard is
    /// dropped.
    pub fn kill(mut self) {
        self.poisoned = true;
    }
}

impl<'p, T: Manageable + Clone> Deref for Borrowed<'p, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().expect("borrowed item present for its lifetime")
    }
}

impl<'p, T: Manageable + Clone> DerefMut for Borrowed<'p, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("borrowed item present for its lifetime")
    }
}

impl<'p, T: Manageable + Clone + fmt::Debug> fmt::Debug for Borrowed<'p, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Borrowed")
            .field("id", &self.id)
            .field("item", &self.item)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl<'p, T: Manageable + Clone> Drop for Borrowed<'p, T> {
    fn drop(&mut self) {
        let item = self.item.take();
        if self.poisoned {
            self.pool.kill_cursor_internal(self.id, item);
        } else {
            self.pool.release_internal(self.id, item);
        }
    }
}

/// Sequential iterator over the idle items in a [`TrafficPolice`], returned
/// by [`TrafficPolice::iter_idle`].
pub struct IdleIter<'p, T: Manageable + Clone> {
    pool: &'p TrafficPolice<T>,
    remaining: VecDeque<u64>,
}

impl<'p, T: Manageable + Clone> IdleIter<'p, T> {
    /// The next idle item, borrowed for inspection, or `None` once every
    /// idle item at iteration start has been visited.
    pub fn next(&mut self) -> Option<Borrowed<'p, T>> {
        while let Some(id) = self.remaining.pop_front() {
            let mut state = self.pool.state.lock().unwrap();
            if state.registry.contains_key(&id) {
                if let Ok(borrowed) = self.pool.borrow_id(&mut state, id) {
                    return Some(borrowed);
                }
            }
        }
        None
    }
}

impl<'p, T: Manageable + Clone> fmt::Debug for IdleIter<'p, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleIter").field("remaining", &self.remaining.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug)]
    struct MockItem {
        idle: bool,
        saturated: bool,
    }

    impl MockItem {
        fn idle() -> Self {
            MockItem { idle: true, saturated: false }
        }
    }

    impl Manageable for MockItem {
        fn is_idle(&self) -> bool {
            self.idle
        }
        fn is_saturated(&self) -> bool {
            self.saturated
        }
        fn is_multiplexed(&self) -> bool {
            false
        }
        fn close(&mut self) {}
    }

    fn pool(maxsize: Option<usize>) -> TrafficPolice<MockItem> {
        TrafficPolice::new(maxsize, false)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let p = pool(None);
        p.put(MockItem::idle(), &[], false).await.unwrap();
        assert_eq!(p.qsize(), 1);
        assert_eq!(p.rsize(), 1);

        let borrowed = p.get(false, false, false, None).await.unwrap();
        assert_eq!(p.rsize(), 0);
        drop(borrowed);
        assert_eq!(p.rsize(), 1);
    }

    #[tokio::test]
    async fn release_puts_item_at_lifo_head() {
        let p = pool(None);
        p.put(MockItem::idle(), &[], false).await.unwrap();
        p.put(MockItem::idle(), &[], false).await.unwrap();
        assert_eq!(p.rsize(), 2);

        // borrow the head (most recently put = second item), then release it
        let a = p.get(false, false, false, None).await.unwrap();
        drop(a);

        // container must still have the just-released item at its head
        let b = p.get(false, false, false, None).await.unwrap();
        assert_eq!(p.rsize(), 1);
        drop(b);
        assert_eq!(p.rsize(), 2);
    }

    #[tokio::test]
    async fn get_on_empty_pool_is_unavailable() {
        let p = pool(None);
        let err = p.get(false, false, false, None).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn double_borrow_from_same_task_is_atomic_traffic() {
        let p = pool(None);
        p.put(MockItem::idle(), &[], false).await.unwrap();
        p.put(MockItem::idle(), &[], false).await.unwrap();

        let _first = p.get(false, false, false, None).await.unwrap();
        let err = p.get(false, false, false, None).await.unwrap_err();
        assert!(err.is_atomic_traffic());
    }

    #[tokio::test]
    async fn task_state_does_not_accumulate_across_borrow_release_cycles() {
        let p = pool(None);
        p.put(MockItem::idle(), &[], false).await.unwrap();

        for _ in 0..5 {
            let borrowed = p.get(false, false, false, None).await.unwrap();
            drop(borrowed);
        }

        assert_eq!(p.state.lock().unwrap().tasks.len(), 0);
    }

    #[tokio::test]
    async fn sibling_tasks_each_get_their_own_borrow() {
        let p = std::sync::Arc::new(pool(None));
        p.put(MockItem::idle(), &[], false).await.unwrap();
        p.put(MockItem::idle(), &[], false).await.unwrap();

        let p1 = p.clone();
        let p2 = p.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { p1.get(false, false, false, None).await.is_ok() }),
            tokio::spawn(async move { p2.get(false, false, false, None).await.is_ok() }),
        );
        assert!(r1.unwrap());
        assert!(r2.unwrap());
    }

    #[tokio::test]
    async fn memorize_and_forget_roundtrip() {
        let p = pool(None);
        let borrowed = p.put(MockItem::idle(), &[], true).await.unwrap().unwrap();
        let indicator = Indicator::Promise("abc".to_owned());
        p.memorize(indicator.clone(), &borrowed);
        assert!(p.beacon(&indicator));
        drop(borrowed);

        assert!(p.locate(&indicator, false, None).await.is_ok());
        p.forget(&indicator);
        assert!(!p.beacon(&indicator));
    }

    #[tokio::test]
    async fn eviction_on_overflow_closes_first_idle_in_insertion_order() {
        let p = pool(Some(3));
        p.put(MockItem::idle(), &[Indicator::Promise("a".into())], false)
            .await
            .unwrap();
        p.put(MockItem::idle(), &[Indicator::Promise("b".into())], false)
            .await
            .unwrap();
        p.put(MockItem::idle(), &[Indicator::Promise("c".into())], false)
            .await
            .unwrap();
        assert_eq!(p.qsize(), 3);

        p.put(MockItem::idle(), &[Indicator::Promise("d".into())], false)
            .await
            .unwrap();
        assert_eq!(p.qsize(), 3);
        assert!(!p.beacon(&Indicator::Promise("a".into())));
        assert!(p.beacon(&Indicator::Promise("d".into())));
    }

    #[tokio::test]
    async fn overflow_with_no_idle_victim_is_overwhelmed() {
        let p = pool(Some(1));
        let _kept = p.put(MockItem::idle(), &[], true).await.unwrap().unwrap();
        let err = p.put(MockItem::idle(), &[], false).await.unwrap_err();
        assert!(err.is_overwhelmed());
    }

    #[tokio::test]
    async fn kill_cursor_removes_item_from_registry() {
        let p = pool(None);
        p.put(MockItem::idle(), &[], false).await.unwrap();
        let borrowed = p.get(false, false, false, None).await.unwrap();
        borrowed.kill();
        assert_eq!(p.qsize(), 0);
        assert_eq!(p.rsize(), 0);
    }

    #[tokio::test]
    async fn clear_closes_idle_items_immediately() {
        let p = pool(None);
        p.put(MockItem::idle(), &[], false).await.unwrap();
        p.put(MockItem::idle(), &[], false).await.unwrap();
        p.clear();
        assert_eq!(p.qsize(), 0);
    }

    #[tokio::test]
    async fn clear_defers_closing_a_still_borrowed_item() {
        let p = pool(None);
        p.put(MockItem::idle(), &[], false).await.unwrap();
        let borrowed = p.get(false, false, false, None).await.unwrap();
        p.clear();
        // still registered: the borrow outlives the shutdown-drain sweep
        assert_eq!(p.qsize(), 1);
        drop(borrowed);
        assert_eq!(p.qsize(), 0);
    }

    #[tokio::test]
    async fn read_timeout_on_locate_yields_timeout_not_unavailable() {
        let p = pool(None);
        let missing = Indicator::Promise("nope".into());
        let err = p
            .locate(&missing, true, Some(Duration::from_millis(5)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn non_blocking_locate_miss_is_unavailable() {
        let p = pool(None);
        let missing = Indicator::Promise("nope".into());
        let err = p.locate(&missing, false, None).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn find_by_skips_idle_items() {
        let p = pool(None);
        let borrowed = p
            .put(MockItem::idle(), &[Indicator::Promise("x".into())], true)
            .await
            .unwrap()
            .unwrap();
        // item is exclusively held (not idle from the arbiter's point of
        // view because it's not in `container`), but `find_by` requires the
        // item itself to report non-idle too
        drop(borrowed);
        let err = p.find_by(IndicatorKind::Promise).unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn iter_idle_visits_every_idle_item_once() {
        let p = pool(None);
        p.put(MockItem::idle(), &[], false).await.unwrap();
        p.put(MockItem::idle(), &[], false).await.unwrap();

        let mut iter = p.iter_idle();
        let mut seen = 0;
        while let Some(borrowed) = iter.next() {
            seen += 1;
            drop(borrowed);
        }
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn connection_handle_validity_tracks_registry_membership() {
        let p = pool(None);
        let borrowed = p.put(MockItem::idle(), &[], true).await.unwrap().unwrap();
        let handle = borrowed.handle();
        assert!(p.is_valid(handle));
        borrowed.kill();
        assert!(!p.is_valid(handle));
    }
}
