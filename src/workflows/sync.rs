//! Workflow status synchronizer.
//!
//! Polls the record store for every workflow that has subscribers and hands
//! each subscriber the difference between the stored record and the last
//! snapshot it was shown. The polling task exists only while there is at
//! least one subscription.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{StepStatus, Workflow, WorkflowStatus, WorkflowStep};
use crate::error::StoreError;
use crate::store::RecordStore;

/// A step whose status differs from the last snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StepChange {
    pub step_id: String,
    pub previous: StepStatus,
    pub current: StepStatus,
}

/// What a subscriber is told on a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowChange {
    /// The full record as read from the store.
    pub workflow: Workflow,
    pub step_changes: Vec<StepChange>,
    pub new_steps: Vec<WorkflowStep>,
    pub previous_status: Option<WorkflowStatus>,
    pub has_status_change: bool,
    /// The subscriber had no snapshot before this tick.
    pub first_observation: bool,
}

impl WorkflowChange {
    /// Compare `current` against the subscriber's last snapshot. `None` when
    /// nothing the subscriber cares about changed.
    pub fn between(previous: Option<&Workflow>, current: &Workflow) -> Option<Self> {
        let Some(previous) = previous else {
            return Some(Self {
                workflow: current.clone(),
                step_changes: Vec::new(),
                new_steps: Vec::new(),
                previous_status: None,
                has_status_change: false,
                first_observation: true,
            });
        };

        let mut step_changes = Vec::new();
        let mut new_steps = Vec::new();
        for step in &current.steps {
            match previous.step(&step.id) {
                Some(old) if old.status != step.status => step_changes.push(StepChange {
                    step_id: step.id.clone(),
                    previous: old.status,
                    current: step.status,
                }),
                Some(_) => {}
                None => new_steps.push(step.clone()),
            }
        }
        let has_status_change = previous.status != current.status;

        if step_changes.is_empty() && new_steps.is_empty() && !has_status_change {
            return None;
        }
        Some(Self {
            workflow: current.clone(),
            step_changes,
            new_steps,
            previous_status: Some(previous.status),
            has_status_change,
            first_observation: false,
        })
    }

    /// The record is terminal but still shows unresolved steps; the caller
    /// should reconcile rather than trust it.
    pub fn is_inconsistent(&self) -> bool {
        self.workflow.is_inconsistent()
    }
}

type Callback = Arc<dyn Fn(WorkflowChange) + Send + Sync>;

struct Subscription {
    id: u64,
    workflow_id: String,
    callback: Callback,
    last: Option<Workflow>,
}

struct Poller {
    cancel: CancellationToken,
}

struct Inner {
    store: Arc<dyn RecordStore>,
    interval: Duration,
    subscriptions: Mutex<Vec<Subscription>>,
    poller: Mutex<Option<Poller>>,
    ticking: AtomicBool,
    next_id: AtomicU64,
}

impl Inner {
    /// Start the polling task. Caller holds the subscription lock.
    fn start_polling(self: &Arc<Self>) {
        let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if poller.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => inner.poll_once().await,
                }
            }
            debug!("Workflow polling stopped");
        });
        *poller = Some(Poller { cancel });
        info!(interval = ?self.interval, "Workflow polling started");
    }

    fn stop_polling(&self) {
        if let Some(poller) = self
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            poller.cancel.cancel();
        }
    }

    fn remove(&self, id: u64) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        if before > 0 && subscriptions.is_empty() {
            self.stop_polling();
        }
    }

    async fn poll_once(&self) {
        if self.ticking.swap(true, Ordering::SeqCst) {
            debug!("Previous workflow poll still running, skipping tick");
            return;
        }
        let _reset = TickGuard(&self.ticking);

        let mut ids: Vec<String> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| s.workflow_id.clone())
            .collect();
        ids.sort();
        ids.dedup();

        let mut records = HashMap::with_capacity(ids.len());
        for id in ids {
            match self.store.get_workflow(&id).await {
                Ok(Some(workflow)) => {
                    records.insert(id, workflow);
                }
                Ok(None) => {}
                Err(e) => warn!(workflow_id = %id, error = %e, "Failed to read workflow"),
            }
        }

        let notifications: Vec<(Callback, WorkflowChange)> = {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subscriptions
                .iter_mut()
                .filter_map(|sub| {
                    let current = records.get(&sub.workflow_id)?;
                    let change = WorkflowChange::between(sub.last.as_ref(), current)?;
                    sub.last = Some(current.clone());
                    Some((Arc::clone(&sub.callback), change))
                })
                .collect()
        };

        for (callback, change) in notifications {
            let workflow_id = change.workflow.id.clone();
            // A panicking subscriber must not take the shared poller down.
            if panic::catch_unwind(AssertUnwindSafe(|| callback(change))).is_err() {
                warn!(workflow_id = %workflow_id, "Workflow subscriber panicked");
            }
        }
    }
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Shared poller fanning workflow changes out to subscribers.
pub struct WorkflowSynchronizer {
    inner: Arc<Inner>,
}

impl WorkflowSynchronizer {
    pub fn new(store: Arc<dyn RecordStore>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                interval,
                subscriptions: Mutex::new(Vec::new()),
                poller: Mutex::new(None),
                ticking: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` for changes to `workflow_id`. Must be called
    /// inside a Tokio runtime.
    pub fn subscribe<F>(&self, workflow_id: impl Into<String>, callback: F) -> SubscriptionHandle
    where
        F: Fn(WorkflowChange) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let workflow_id = workflow_id.into();
        debug!(workflow_id = %workflow_id, subscription = id, "Workflow subscription added");

        let mut subscriptions = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscriptions.push(Subscription {
            id,
            workflow_id,
            callback: Arc::new(callback),
            last: None,
        });
        if subscriptions.len() == 1 {
            self.inner.start_polling();
        }

        SubscriptionHandle {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Like [`subscribe`](Self::subscribe), delivering changes on a channel.
    pub fn subscribe_channel(
        &self,
        workflow_id: impl Into<String>,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<WorkflowChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(workflow_id, move |change| {
            let _ = tx.send(change);
        });
        (handle, rx)
    }

    /// Read the stored record now, outside the polling cadence.
    pub async fn refresh(&self, workflow_id: &str) -> Result<Option<Workflow>, StoreError> {
        self.inner.store.get_workflow(workflow_id).await
    }

    /// Run one polling pass immediately. Skipped if a pass is in progress.
    pub async fn poll_now(&self) {
        self.inner.poll_once().await
    }

    pub fn subscription_count(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .poller
            .lock()
            .map(|p| p.is_some())
            .unwrap_or(false)
    }
}

impl Drop for WorkflowSynchronizer {
    fn drop(&mut self) {
        self.inner.stop_polling();
    }
}

/// Removes exactly one subscription, explicitly or when dropped.
#[must_use = "the subscription ends when the handle is dropped"]
pub struct SubscriptionHandle {
    inner: Weak<Inner>,
    id: u64,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove(self.id);
        }
    }
}
