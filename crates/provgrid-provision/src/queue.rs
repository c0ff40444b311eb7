//! Provision queue.
//!
//! Requests are kept in one FIFO lane per service element. At most one
//! request per element is in flight, so requests for the same element are
//! processed in submission order while different elements proceed in
//! parallel up to the worker count. Across lanes, the ready head with the
//! oldest submission goes first.
//!
//! A request retried after a failure goes back to the front of its lane
//! with a `not_before` deadline; the lane waits for it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use provgrid_state::{ElementId, InstanceId};

use crate::request::ProvisionRequest;

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    /// Same (element, instance) already queued or in flight.
    Merged,
}

#[derive(Debug)]
struct Queued {
    seq: u64,
    request: ProvisionRequest,
}

#[derive(Debug, Default)]
struct Lane {
    pending: VecDeque<Queued>,
    in_flight: Option<InstanceId>,
}

#[derive(Debug, Default)]
struct QueueInner {
    lanes: BTreeMap<ElementId, Lane>,
    next_seq: u64,
    closed: bool,
}

impl QueueInner {
    /// Pop the oldest ready head, or return the earliest future deadline.
    fn pop_ready(&mut self, now: Instant) -> Result<ProvisionRequest, Option<Instant>> {
        let mut best: Option<(&ElementId, u64)> = None;
        let mut earliest: Option<Instant> = None;

        for (element, lane) in &self.lanes {
            if lane.in_flight.is_some() {
                continue;
            }
            let Some(head) = lane.pending.front() else {
                continue;
            };
            if head.request.is_ready(now) {
                if best.is_none_or(|(_, seq)| head.seq < seq) {
                    best = Some((element, head.seq));
                }
            } else if let Some(t) = head.request.not_before {
                earliest = Some(earliest.map_or(t, |e| e.min(t)));
            }
        }

        let Some((element, _)) = best else {
            return Err(earliest);
        };
        let element = element.clone();
        let lane = self.lanes.get_mut(&element).ok_or(earliest)?;
        let queued = lane.pending.pop_front().ok_or(earliest)?;
        lane.in_flight = Some(queued.request.instance_id);
        Ok(queued.request)
    }

    fn prune(&mut self, element: &ElementId) {
        if self
            .lanes
            .get(element)
            .is_some_and(|l| l.pending.is_empty() && l.in_flight.is_none())
        {
            self.lanes.remove(element);
        }
    }
}

/// Shared provision queue. `Clone` shares the same queue.
#[derive(Debug, Clone, Default)]
pub struct ProvisionQueue {
    inner: Arc<Mutex<QueueInner>>,
    notify: Arc<Notify>,
}

impl ProvisionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request, merging it into an existing one for the same
    /// (element, instance).
    pub async fn submit(&self, request: ProvisionRequest) -> Submitted {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        let lane = inner.lanes.entry(request.element.clone()).or_default();

        if lane.in_flight == Some(request.instance_id) {
            debug!(element = %request.element, instance = request.instance_id, "request already in flight");
            return Submitted::Merged;
        }
        if let Some(existing) = lane
            .pending
            .iter_mut()
            .find(|q| q.request.instance_id == request.instance_id)
        {
            existing.request.attempt = existing.request.attempt.max(request.attempt);
            if request.last_failure.is_some() {
                existing.request.last_failure = request.last_failure;
            }
            debug!(element = %request.element, instance = request.instance_id, "request merged");
            return Submitted::Merged;
        }

        lane.pending.push_back(Queued { seq, request });
        inner.next_seq += 1;
        drop(inner);
        self.notify.notify_waiters();
        Submitted::Queued
    }

    /// Wait for the next eligible request. Returns `None` once closed.
    ///
    /// The caller must hand the request back with [`complete`](Self::complete)
    /// or [`retry`](Self::retry) to release its element's lane.
    pub async fn take_next(&self) -> Option<ProvisionRequest> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return None;
                }
                match inner.pop_ready(Instant::now()) {
                    Ok(request) => return Some(request),
                    Err(deadline) => deadline,
                }
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release the lane after a request reached a terminal outcome.
    pub async fn complete(&self, element: &ElementId) {
        let mut inner = self.inner.lock().await;
        if let Some(lane) = inner.lanes.get_mut(element) {
            lane.in_flight = None;
        }
        inner.prune(element);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Put a failed request back at the head of its lane after `delay`.
    pub async fn retry(&self, mut request: ProvisionRequest, delay: Duration) {
        request.not_before = Some(Instant::now() + delay);
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let lane = inner.lanes.entry(request.element.clone()).or_default();
        if lane.in_flight == Some(request.instance_id) {
            lane.in_flight = None;
        }
        lane.pending.push_front(Queued { seq, request });
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Drop every queued request for elements of `opstring`.
    /// In-flight requests are left to finish.
    pub async fn cancel_opstring(&self, opstring: &str) -> Vec<ProvisionRequest> {
        self.cancel_where(|element, _| element.opstring == opstring)
            .await
    }

    /// Drop every queued request for `element`.
    pub async fn cancel_element(&self, element: &ElementId) -> Vec<ProvisionRequest> {
        self.cancel_where(|e, _| e == element).await
    }

    /// Drop the queued request for one instance, if any.
    pub async fn cancel_instance(
        &self,
        element: &ElementId,
        instance_id: InstanceId,
    ) -> Option<ProvisionRequest> {
        self.cancel_where(|e, id| e == element && id == instance_id)
            .await
            .pop()
    }

    async fn cancel_where(
        &self,
        pred: impl Fn(&ElementId, InstanceId) -> bool,
    ) -> Vec<ProvisionRequest> {
        let mut inner = self.inner.lock().await;
        let mut cancelled = Vec::new();
        let elements: Vec<ElementId> = inner.lanes.keys().cloned().collect();
        for element in elements {
            if let Some(lane) = inner.lanes.get_mut(&element) {
                let (removed, keep): (VecDeque<Queued>, VecDeque<Queued>) = lane
                    .pending
                    .drain(..)
                    .partition(|q| pred(&element, q.request.instance_id));
                lane.pending = keep;
                cancelled.extend(removed.into_iter().map(|q| q.request));
            }
            inner.prune(&element);
        }
        drop(inner);
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), "provision requests cancelled");
            self.notify.notify_waiters();
        }
        cancelled
    }

    /// Instance IDs queued (not in flight) for `element`, in lane order.
    pub async fn queued_for(&self, element: &ElementId) -> Vec<InstanceId> {
        let inner = self.inner.lock().await;
        inner
            .lanes
            .get(element)
            .map(|l| l.pending.iter().map(|q| q.request.instance_id).collect())
            .unwrap_or_default()
    }

    /// Number of queued requests, not counting in-flight ones.
    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.lanes.values().map(|l| l.pending.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of requests currently being dispatched.
    pub async fn in_flight(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.lanes.values().filter(|l| l.in_flight.is_some()).count()
    }

    /// Stop handing out requests. Waiting workers get `None`.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_waiters();
    }
}
