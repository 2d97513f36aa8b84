//! Progress fan-out to polling readers and streaming subscribers.
//!
//! The broadcaster remembers the latest [`Snapshot`] per job plus a "latest
//! job" alias, and pushes every publish into the mailbox of each matching
//! subscriber. Mailboxes are bounded ring buffers: when a slow subscriber's
//! buffer is full the oldest buffered snapshot is dropped, so a reader always
//! converges on the newest state.

use crate::job::JobId;
use crate::snapshot::Snapshot;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 32;

/// Default number of terminal jobs whose last snapshot is retained.
pub const DEFAULT_TERMINAL_RETENTION: usize = 500;

/// Which job a subscriber follows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionTarget {
    /// Whatever job most recently became active.
    Latest,
    Job(JobId),
    /// Every publish for every job, without replay.
    All,
}

impl From<Option<JobId>> for SubscriptionTarget {
    fn from(job_id: Option<JobId>) -> Self {
        job_id.map_or(SubscriptionTarget::Latest, SubscriptionTarget::Job)
    }
}

#[derive(Debug)]
struct MailboxState {
    queue: VecDeque<Arc<Snapshot>>,
    dropped: u64,
    closed: bool,
}

/// Bounded single-consumer delivery buffer.
#[derive(Debug)]
struct Mailbox {
    state: Mutex<MailboxState>,
    capacity: usize,
    notify: Notify,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(MailboxState {
                queue: VecDeque::with_capacity(capacity),
                dropped: 0,
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    fn push(&self, snapshot: Arc<Snapshot>) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return;
            }
            if state.queue.len() >= self.capacity {
                state.queue.pop_front();
                state.dropped += 1;
            }
            state.queue.push_back(snapshot);
        }
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Result<Option<Arc<Snapshot>>, Closed> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.queue.pop_front() {
            Some(snapshot) => Ok(Some(snapshot)),
            None if state.closed => Err(Closed),
            None => Ok(None),
        }
    }

    fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.notify.notify_one();
    }

    fn dropped(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dropped
    }
}

#[derive(Debug)]
struct Closed;

#[derive(Debug)]
struct SubscriberEntry {
    target: SubscriptionTarget,
    mailbox: Arc<Mailbox>,
}

#[derive(Debug, Default)]
struct Registry {
    latest: HashMap<JobId, Arc<Snapshot>>,
    alias: Option<JobId>,
    terminal_order: VecDeque<JobId>,
    subscribers: HashMap<u64, SubscriberEntry>,
}

#[derive(Debug)]
struct Inner {
    registry: RwLock<Registry>,
    next_subscriber: AtomicU64,
    buffer: usize,
    terminal_retention: usize,
}

/// Publish/subscribe hub for job snapshots. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    inner: Arc<Inner>,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER, DEFAULT_TERMINAL_RETENTION)
    }
}

impl ProgressBroadcaster {
    /// Creates a broadcaster.
    ///
    /// # Arguments
    ///
    /// * `buffer` - Per-subscriber mailbox capacity (minimum 1)
    /// * `terminal_retention` - How many finished jobs stay pollable; `0`
    ///   keeps every one
    pub fn new(buffer: usize, terminal_retention: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(Registry::default()),
                next_subscriber: AtomicU64::new(1),
                buffer,
                terminal_retention,
            }),
        }
    }

    /// Stores `snapshot` as the latest for its job and delivers it to every
    /// subscriber following that job or the alias.
    ///
    /// The alias moves to a job once it leaves the queue; queued snapshots
    /// only claim it while no job has been seen yet.
    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        let mut registry = self.write();

        let job_id = snapshot.job_id.clone();
        let claims_alias = registry.alias.is_none() || snapshot.status.is_active();
        if claims_alias {
            registry.alias = Some(job_id.clone());
        }
        let is_alias = registry.alias.as_ref() == Some(&job_id);

        registry.latest.insert(job_id.clone(), Arc::clone(&snapshot));
        if snapshot.is_terminal() {
            self.retain_terminal(&mut registry, &job_id);
        }

        let mut delivered = 0usize;
        for entry in registry.subscribers.values() {
            let matches = match &entry.target {
                SubscriptionTarget::Latest => is_alias,
                SubscriptionTarget::Job(id) => *id == job_id,
                SubscriptionTarget::All => true,
            };
            if matches {
                entry.mailbox.push(Arc::clone(&snapshot));
                delivered += 1;
            }
        }

        trace!(
            job_id = %job_id,
            status = %snapshot.status,
            percentage = snapshot.percentage,
            delivered,
            "Published snapshot"
        );
        snapshot
    }

    fn retain_terminal(&self, registry: &mut Registry, job_id: &JobId) {
        if self.inner.terminal_retention == 0 {
            return;
        }
        if !registry.terminal_order.contains(job_id) {
            registry.terminal_order.push_back(job_id.clone());
        }
        while registry.terminal_order.len() > self.inner.terminal_retention {
            let Some(evicted) = registry.terminal_order.pop_front() else {
                break;
            };
            if registry.alias.as_ref() == Some(&evicted) {
                // The alias must stay pollable; requeue it at the back.
                registry.terminal_order.push_back(evicted);
                if registry.terminal_order.len() == 1 {
                    break;
                }
                continue;
            }
            registry.latest.remove(&evicted);
            debug!(job_id = %evicted, "Evicted terminal snapshot");
        }
    }

    /// One-shot read of the latest snapshot for a job, or for the alias when
    /// `job_id` is `None`.
    pub fn poll(&self, job_id: Option<&JobId>) -> Option<Arc<Snapshot>> {
        let registry = self.read();
        let id = job_id.or(registry.alias.as_ref())?;
        registry.latest.get(id).cloned()
    }

    /// Registers a subscriber. The latest known snapshot for the target is
    /// captured atomically with registration, so no publish can fall between
    /// the replay and the live stream.
    pub fn subscribe(&self, target: SubscriptionTarget) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::new(self.inner.buffer));

        let initial = {
            let mut registry = self.write();
            let initial = match &target {
                SubscriptionTarget::Latest => registry
                    .alias
                    .as_ref()
                    .and_then(|alias| registry.latest.get(alias).cloned()),
                SubscriptionTarget::Job(job_id) => registry.latest.get(job_id).cloned(),
                SubscriptionTarget::All => None,
            };
            registry.subscribers.insert(
                id,
                SubscriberEntry {
                    target: target.clone(),
                    mailbox: Arc::clone(&mailbox),
                },
            );
            initial
        };

        debug!(subscriber = id, target = ?target, replay = initial.is_some(), "Subscriber connected");
        Subscription {
            id,
            target,
            initial,
            mailbox,
            broadcaster: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().subscribers.len()
    }

    /// Closes every mailbox; pending `recv` calls return `None` once drained.
    pub fn close_all(&self) {
        self.close_where(|_| true);
    }

    /// Closes the mailboxes of subscribers whose target matches `pred`.
    /// Closed subscribers receive nothing further.
    pub fn close_where<F>(&self, pred: F)
    where
        F: Fn(&SubscriptionTarget) -> bool,
    {
        for entry in self.read().subscribers.values() {
            if pred(&entry.target) {
                entry.mailbox.close();
            }
        }
    }

    fn unsubscribe(inner: &Inner, id: u64) {
        let removed = inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .remove(&id);
        if removed.is_some() {
            debug!(subscriber = id, "Subscriber disconnected");
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A live subscriber. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    target: SubscriptionTarget,
    initial: Option<Arc<Snapshot>>,
    mailbox: Arc<Mailbox>,
    broadcaster: std::sync::Weak<Inner>,
}

impl Subscription {
    pub fn target(&self) -> &SubscriptionTarget {
        &self.target
    }

    /// Snapshot replayed on connect, if one existed.
    pub fn initial(&self) -> Option<&Arc<Snapshot>> {
        self.initial.as_ref()
    }

    /// Takes the replay snapshot, leaving `None` behind.
    pub fn take_initial(&mut self) -> Option<Arc<Snapshot>> {
        self.initial.take()
    }

    /// Waits for the next delivered snapshot. Returns `None` once the
    /// broadcaster closed this subscriber and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Arc<Snapshot>> {
        loop {
            match self.mailbox.try_pop() {
                Ok(Some(snapshot)) => return Some(snapshot),
                Ok(None) => self.mailbox.notify.notified().await,
                Err(Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Subscription::recv).
    pub fn try_recv(&mut self) -> Option<Arc<Snapshot>> {
        self.mailbox.try_pop().ok().flatten()
    }

    /// Snapshots discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped()
    }

    /// Replay followed by live snapshots, as a stream.
    pub fn into_stream(mut self) -> impl tokio_stream::Stream<Item = Arc<Snapshot>> {
        async_stream::stream! {
            if let Some(initial) = self.take_initial() {
                yield initial;
            }
            while let Some(snapshot) = self.recv().await {
                yield snapshot;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.broadcaster.upgrade() {
            ProgressBroadcaster::unsubscribe(&inner, self.id);
        }
    }
}
