//! Prioritized local work queue with a dedicated worker thread.
//!
//! Work that must not block the caller (and does not involve the analyzer
//! process) runs here one item at a time. Three priority buckets are
//! drained strictly highest first. Re-enqueuing an item with the same key
//! moves it instead of duplicating it, and items that belong to an
//! [`AnalysisGroup`] are collected and handed to the group in one call.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// How often an idle worker re-checks for external cancellation.
const IDLE_POLL: Duration = Duration::from_millis(250);

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    fn bucket(self) -> usize {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    fn from_bucket(bucket: usize) -> Self {
        match bucket {
            0 => Self::Low,
            1 => Self::Normal,
            _ => Self::High,
        }
    }
}

/// Identity of a work item; two items with the same key are the same work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkKey(String);

impl WorkKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Completed,
    Cancelled,
}

pub trait Analyzable: Send + Sync {
    fn key(&self) -> WorkKey;

    /// Group this item is analyzed with, if any.
    fn group(&self) -> Option<Arc<dyn AnalysisGroup>> {
        None
    }

    /// Do the work. Long-running implementations should poll `cancel`.
    fn analyze(&self, cancel: &CancellationToken) -> AnalysisOutcome;
}

pub trait AnalysisGroup: Send + Sync {
    fn key(&self) -> GroupKey;

    /// Analyze every member queued since the group last ran.
    fn analyze_queued(
        &self,
        items: Vec<Arc<dyn Analyzable>>,
        cancel: &CancellationToken,
    ) -> AnalysisOutcome {
        for item in items {
            if cancel.is_cancelled() {
                return AnalysisOutcome::Cancelled;
            }
            item.analyze(cancel);
        }
        AnalysisOutcome::Completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// The queue ran out of work after executing at least one entry.
    Drained,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to spawn the analysis worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("analysis worker did not stop within {0:?}")]
    StopTimeout(Duration),
}

enum Entry {
    Item {
        key: WorkKey,
        item: Arc<dyn Analyzable>,
    },
    Group(GroupKey),
}

struct PendingGroup {
    group: Arc<dyn AnalysisGroup>,
    members: Vec<(WorkKey, Arc<dyn Analyzable>)>,
}

enum Job {
    Item(WorkKey, Arc<dyn Analyzable>),
    Group(GroupKey, PendingGroup),
}

#[derive(Default)]
struct QueueState {
    buckets: [VecDeque<Entry>; 3],
    groups: HashMap<GroupKey, PendingGroup>,
    running: bool,
    exited: bool,
}

impl QueueState {
    fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    fn pending(&self) -> usize {
        self.buckets
            .iter()
            .flatten()
            .map(|entry| match entry {
                Entry::Item { .. } => 1,
                Entry::Group(key) => self.groups.get(key).map_or(0, |g| g.members.len()),
            })
            .sum()
    }

    /// Remove a queued entry, returning the bucket it was in.
    fn take_entry(&mut self, matches: impl Fn(&Entry) -> bool) -> Option<(usize, Entry)> {
        for (bucket, entries) in self.buckets.iter_mut().enumerate() {
            if let Some(pos) = entries.iter().position(&matches) {
                return entries.remove(pos).map(|entry| (bucket, entry));
            }
        }
        None
    }

    fn insert(&mut self, entry: Entry, priority: Priority) {
        let bucket = &mut self.buckets[priority.bucket()];
        if priority == Priority::High {
            bucket.push_front(entry);
        } else {
            bucket.push_back(entry);
        }
    }

    fn enqueue(&mut self, key: WorkKey, item: Arc<dyn Analyzable>, priority: Priority) {
        let previous = self.take_entry(|entry| matches!(entry, Entry::Item { key: k, .. } if *k == key));
        let priority =
            previous.map_or(priority, |(bucket, _)| priority.max(Priority::from_bucket(bucket)));
        self.insert(Entry::Item { key, item }, priority);
    }

    fn enqueue_grouped(
        &mut self,
        key: WorkKey,
        item: Arc<dyn Analyzable>,
        group: Arc<dyn AnalysisGroup>,
        priority: Priority,
    ) {
        let group_key = group.key();
        match self.groups.get_mut(&group_key) {
            Some(pending) => {
                pending.members.retain(|(k, _)| *k != key);
                pending.members.push((key, item));
                let is_sentinel = |entry: &Entry| matches!(entry, Entry::Group(k) if *k == group_key);
                let queued_at = self
                    .buckets
                    .iter()
                    .position(|entries| entries.iter().any(is_sentinel))
                    .map(Priority::from_bucket);
                if queued_at.is_some_and(|current| priority > current)
                    && let Some((_, entry)) = self.take_entry(is_sentinel)
                {
                    self.insert(entry, priority);
                }
            }
            None => {
                self.groups.insert(
                    group_key.clone(),
                    PendingGroup {
                        group,
                        members: vec![(key, item)],
                    },
                );
                self.insert(Entry::Group(group_key), priority);
            }
        }
    }

    fn next_job(&mut self) -> Option<Job> {
        loop {
            let entry = self
                .buckets
                .iter_mut()
                .rev()
                .find_map(VecDeque::pop_front)?;
            match entry {
                Entry::Item { key, item } => return Some(Job::Item(key, item)),
                Entry::Group(key) => {
                    if let Some(pending) = self.groups.remove(&key) {
                        return Some(Job::Group(key, pending));
                    }
                    tracing::error!(group = %key, "group sentinel without a pending group");
                }
            }
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    idle: Condvar,
    cancel: CancellationToken,
    events: broadcast::Sender<QueueEvent>,
}

/// Handle to the queue and its worker thread.
pub struct LocalWorkQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LocalWorkQueue {
    /// Start the worker. It stops when `cancel` fires or [`stop`] is called.
    ///
    /// [`stop`]: LocalWorkQueue::stop
    pub fn start(cancel: CancellationToken) -> Result<Self, QueueError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            cancel,
            events,
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("anchor-analysis-queue".into())
            .spawn(move || run_worker(&worker_shared))
            .map_err(QueueError::Spawn)?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue `item`. Never waits for running work; safe to call from inside
    /// an item.
    pub fn enqueue(&self, item: Arc<dyn Analyzable>, priority: Priority) {
        let key = item.key();
        let group = item.group();
        {
            let mut state = self.shared.state.lock();
            match group {
                Some(group) => state.enqueue_grouped(key, item, group, priority),
                None => state.enqueue(key, item, priority),
            }
        }
        self.shared.work_ready.notify_one();
    }

    /// Number of queued items, counting each member of a queued group.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending()
    }

    /// True while anything is queued or executing.
    #[must_use]
    pub fn is_analyzing(&self) -> bool {
        let state = self.shared.state.lock();
        state.running || !state.is_empty()
    }

    /// Block until nothing is queued or executing. Returns false on timeout
    /// or if the worker has exited with work left.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.running || !state.is_empty() {
            if state.exited {
                return false;
            }
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                return !state.running && state.is_empty();
            }
        }
        true
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    /// Cancel, wake the worker and wait for it to exit. The item currently
    /// executing runs to completion first.
    pub fn stop(&self, timeout: Duration) -> Result<(), QueueError> {
        self.shared.cancel.cancel();
        self.shared.work_ready.notify_all();

        let deadline = Instant::now() + timeout;
        {
            let mut state = self.shared.state.lock();
            while !state.exited {
                if self.shared.idle.wait_until(&mut state, deadline).timed_out() && !state.exited {
                    tracing::warn!(?timeout, "analysis worker did not stop in time");
                    return Err(QueueError::StopTimeout(timeout));
                }
            }
        }

        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            tracing::error!("analysis worker thread panicked");
        }
        Ok(())
    }
}

impl Drop for LocalWorkQueue {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        self.shared.work_ready.notify_all();
    }
}

fn run_worker(shared: &Shared) {
    tracing::debug!("analysis worker started");
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if shared.cancel.is_cancelled() {
                    break None;
                }
                if let Some(job) = state.next_job() {
                    state.running = true;
                    break Some(job);
                }
                shared.work_ready.wait_for(&mut state, IDLE_POLL);
            }
        };
        let Some(job) = job else { break };

        execute(job, &shared.cancel);

        let drained = {
            let mut state = shared.state.lock();
            state.running = false;
            state.is_empty()
        };
        if drained {
            shared.idle.notify_all();
            let _ = shared.events.send(QueueEvent::Drained);
        }
    }

    shared.state.lock().exited = true;
    shared.idle.notify_all();
    tracing::debug!("analysis worker stopped");
}

fn execute(job: Job, cancel: &CancellationToken) {
    let (label, result) = match job {
        Job::Item(key, item) => {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| item.analyze(cancel)));
            (key.to_string(), result)
        }
        Job::Group(key, pending) => {
            let items = pending.members.into_iter().map(|(_, item)| item).collect();
            let group = pending.group;
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| group.analyze_queued(items, cancel)));
            (format!("group {key}"), result)
        }
    };
    match result {
        Ok(AnalysisOutcome::Completed) => tracing::trace!(work = %label, "analysis completed"),
        Ok(AnalysisOutcome::Cancelled) => tracing::debug!(work = %label, "analysis cancelled"),
        Err(_) => tracing::error!(work = %label, "analysis panicked; continuing with next item"),
    }
}
