//! Dispatcher: a bounded pool of workers draining the provision queue.
//!
//! For each request a worker:
//! 1. Checks the leader gate; a standby replica puts the request back
//! 2. Drops it if its pending record is gone (cancelled, scaled down)
//! 3. Selects a node and claims its slots against the latest snapshot
//! 4. Instantiates, runs the liveness check, and confirms `Pending → Active`
//!
//! Transient failures are retried with exponential backoff until the
//! attempt budget runs out; then the request is abandoned and reported.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use provgrid_cluster::{LeaderGate, NodeRegistry};
use provgrid_placement::{Selection, Selector, element_to_demand};
use provgrid_state::{
    DeploymentTracker, ElementId, InstanceConfig, InstanceId, InstanceRecord, NodeId, Report,
    ServiceElement, SharedSink, StateError,
};

use crate::error::{ProvisionError, ProvisionResult};
use crate::provisioner::Provisioner;
use crate::queue::ProvisionQueue;
use crate::request::{ProvisionRequest, RetryPolicy};

/// Terminal or intermediate result of processing one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Provisioned { node: NodeId },
    Retrying { attempt: u32, delay: Duration },
    Abandoned,
    /// The request no longer applied and was dropped.
    Cancelled,
    /// Not the leader; the request was put back untouched.
    Standby,
}

enum Step {
    Confirmed(NodeId),
    Dropped,
}

/// Shared dispatcher. `Clone` shares all collaborators.
#[derive(Clone)]
pub struct Dispatcher {
    queue: ProvisionQueue,
    tracker: DeploymentTracker,
    registry: NodeRegistry,
    selector: Selector,
    gate: LeaderGate,
    provisioner: Arc<dyn Provisioner>,
    sink: SharedSink,
    retry: RetryPolicy,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: ProvisionQueue,
        tracker: DeploymentTracker,
        registry: NodeRegistry,
        selector: Selector,
        gate: LeaderGate,
        provisioner: Arc<dyn Provisioner>,
        sink: SharedSink,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            tracker,
            registry,
            selector,
            gate,
            provisioner,
            sink,
            retry,
        }
    }

    pub fn queue(&self) -> &ProvisionQueue {
        &self.queue
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Spawn `count` workers that run until `shutdown` fires or the queue
    /// is closed.
    pub fn spawn_workers(&self, count: usize, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let this = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.worker_loop(worker, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "dispatch worker starting");
        loop {
            let request = tokio::select! {
                request = self.queue.take_next() => request,
                _ = shutdown.changed() => break,
            };
            let Some(request) = request else {
                break;
            };
            let outcome = self.process(request).await;
            debug!(worker, ?outcome, "request processed");
        }
        debug!(worker, "dispatch worker stopped");
    }

    /// Process one request taken from the queue.
    pub async fn process(&self, request: ProvisionRequest) -> Outcome {
        let _guard = match self.gate.write().await {
            Ok(guard) => guard,
            Err(e) => {
                debug!(element = %request.element, error = %e, "standby, request deferred");
                self.queue.retry(request, self.retry.delay_for(0)).await;
                return Outcome::Standby;
            }
        };

        let element = request.element.clone();
        let pending = self
            .tracker
            .pending_record(&element, request.instance_id)
            .await;
        let spec = self.tracker.element(&element).await.map(|v| v.spec);
        let (Some(_), Some(spec)) = (pending, spec) else {
            debug!(%element, instance = request.instance_id, "request no longer pending, dropped");
            self.queue.complete(&element).await;
            return Outcome::Cancelled;
        };

        match self.attempt(&request, &spec).await {
            Ok(Step::Confirmed(node)) => {
                self.queue.complete(&element).await;
                Outcome::Provisioned { node }
            }
            Ok(Step::Dropped) => {
                self.queue.complete(&element).await;
                Outcome::Cancelled
            }
            Err(e) => self.handle_failure(request, e).await,
        }
    }

    async fn attempt(&self, request: &ProvisionRequest, spec: &ServiceElement) -> ProvisionResult<Step> {
        let element = &request.element;
        let instance_id = request.instance_id;

        let mut demand = element_to_demand(spec);
        if let Some(from) = request.excluded_node() {
            demand.excluded.push(from.clone());
        }
        let snapshot = self.registry.snapshot();
        let hosted = self.tracker.hosted_counts(element).await;

        let node = match self.selector.select(&demand, &snapshot.nodes, &hosted) {
            Selection::Node(score) => score.node_id,
            Selection::NoCandidate { reason } => return Err(ProvisionError::NoCandidate(reason)),
        };
        if !self.registry.reserve_slots(&node, spec.slots) {
            return Err(ProvisionError::StaleSelection(node));
        }

        let config = InstanceConfig::new(&element.opstring, spec, instance_id);
        if let Err(e) = self.provisioner.instantiate(&node, &config).await {
            self.registry.release_slots(&node, spec.slots);
            return Err(e);
        }

        let liveness = match self.provisioner.verify(&node, &config).await {
            Ok(true) => Ok(()),
            Ok(false) => Err("instance not alive".to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(reason) = liveness {
            self.stop_on(&node, element, instance_id, spec.slots).await;
            return Err(ProvisionError::Liveness { node, reason });
        }

        match self.tracker.confirm_active(element, instance_id, &node).await {
            Ok(confirmation) => {
                info!(%element, instance = instance_id, %node, attempt = request.attempt + 1, "instance provisioned");
                self.sink.report(Report::Provisioned {
                    element: element.clone(),
                    instance_id,
                    node: node.clone(),
                });
                if let Some(old) = confirmation.retired {
                    self.retire_instance(&old, spec.slots, "relocated").await;
                }
                Ok(Step::Confirmed(node))
            }
            Err(StateError::InvariantViolation { detail, .. }) => {
                self.stop_on(&node, element, instance_id, spec.slots).await;
                if let Err(e) = self.tracker.retire(element, instance_id).await {
                    debug!(%element, instance = instance_id, error = %e, "nothing to retire");
                }
                self.sink.report(Report::InvariantViolation {
                    element: element.clone(),
                    detail,
                });
                Ok(Step::Dropped)
            }
            Err(e) => {
                // Cancelled while in flight: undeployed or scaled down.
                info!(%element, instance = instance_id, %node, error = %e, "request cancelled during dispatch, retiring instance");
                self.stop_on(&node, element, instance_id, spec.slots).await;
                self.sink.report(Report::Retired {
                    element: element.clone(),
                    instance_id,
                    node: Some(node),
                    reason: "cancelled during dispatch".to_string(),
                });
                Ok(Step::Dropped)
            }
        }
    }

    async fn handle_failure(&self, mut request: ProvisionRequest, error: ProvisionError) -> Outcome {
        let failed_attempt = request.attempt;
        let reason = error.to_string();
        request.attempt += 1;
        request.last_failure = Some(reason.clone());

        if self.retry.allows(request.attempt) {
            let delay = self.retry.delay_for(failed_attempt);
            let attempt = request.attempt;
            warn!(
                element = %request.element,
                instance = request.instance_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "provision attempt failed, retrying"
            );
            self.queue.retry(request, delay).await;
            return Outcome::Retrying { attempt, delay };
        }

        let element = request.element.clone();
        if let Err(e) = self.tracker.abandon(&element, request.instance_id).await {
            debug!(%element, error = %e, "abandon found no element");
        }
        let shortfall = self
            .tracker
            .element(&element)
            .await
            .map(|v| v.shortfall())
            .unwrap_or(0);
        self.sink.report(Report::Abandoned {
            element: element.clone(),
            instance_id: request.instance_id,
            attempts: request.attempt,
            reason,
            shortfall,
        });
        self.queue.complete(&element).await;
        Outcome::Abandoned
    }

    /// Stop a record's instance (if placed) and report its retirement.
    pub async fn retire_instance(&self, record: &InstanceRecord, slots: u32, reason: &str) {
        if let Some(node) = &record.node_id {
            self.stop_on(node, &record.element, record.instance_id, slots)
                .await;
        }
        self.sink.report(Report::Retired {
            element: record.element.clone(),
            instance_id: record.instance_id,
            node: record.node_id.clone(),
            reason: reason.to_string(),
        });
    }

    async fn stop_on(&self, node: &NodeId, element: &ElementId, instance_id: InstanceId, slots: u32) {
        if let Err(e) = self.provisioner.terminate(node, element, instance_id).await {
            warn!(%element, instance = instance_id, %node, error = %e, "terminate failed");
        }
        self.registry.release_slots(node, slots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use provgrid_state::{
        InstanceBounds, InstanceState, MemorySink, NodeSnapshot, OperationalString,
    };

    use crate::provisioner::ProvisionFuture;
    use crate::request::RequestKind;

    /// Provisioner whose instantiate results are scripted per call.
    #[derive(Default)]
    struct Scripted {
        instantiate: Mutex<VecDeque<bool>>,
        started: Mutex<Vec<(NodeId, InstanceId)>>,
        stopped: Mutex<Vec<(NodeId, InstanceId)>>,
    }

    impl Scripted {
        fn failing(times: usize) -> Arc<Self> {
            let s = Self::default();
            s.instantiate.lock().unwrap().extend(std::iter::repeat_n(false, times));
            Arc::new(s)
        }
    }

    impl Provisioner for Scripted {
        fn instantiate(&self, node: &NodeId, config: &InstanceConfig) -> ProvisionFuture<()> {
            let ok = self.instantiate.lock().unwrap().pop_front().unwrap_or(true);
            if ok {
                self.started
                    .lock()
                    .unwrap()
                    .push((node.clone(), config.instance_id));
            }
            let node = node.clone();
            Box::pin(async move {
                if ok {
                    Ok(())
                } else {
                    Err(ProvisionError::Instantiate {
                        node,
                        reason: "scripted failure".to_string(),
                    })
                }
            })
        }

        fn verify(&self, _node: &NodeId, _config: &InstanceConfig) -> ProvisionFuture<bool> {
            Box::pin(async { Ok(true) })
        }

        fn terminate(&self, node: &NodeId, _element: &ElementId, instance_id: InstanceId) -> ProvisionFuture<()> {
            self.stopped.lock().unwrap().push((node.clone(), instance_id));
            Box::pin(async { Ok(()) })
        }
    }

    fn node(id: &str, load: f64) -> NodeSnapshot {
        NodeSnapshot {
            id: id.to_string(),
            capabilities: Default::default(),
            load,
            total_slots: 4,
            used_slots: 0,
            draining: false,
        }
    }

    fn opstring(planned: u32) -> OperationalString {
        OperationalString {
            name: "shop".to_string(),
            version: "1".to_string(),
            elements: vec![ServiceElement {
                name: "api".to_string(),
                planned,
                bounds: InstanceBounds { min: 1, max: 5 },
                requirements: Vec::new(),
                slots: 1,
                max_per_node: None,
                slas: Vec::new(),
                parameters: Default::default(),
            }],
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        tracker: DeploymentTracker,
        registry: NodeRegistry,
        sink: Arc<MemorySink>,
        gate: LeaderGate,
    }

    async fn fixture(provisioner: Arc<Scripted>, leader: bool) -> Fixture {
        let tracker = DeploymentTracker::new();
        tracker.deploy(opstring(2)).await.unwrap();
        let registry = NodeRegistry::new();
        registry.publish(node("N1", 0.2));
        registry.publish(node("N2", 0.8));
        let sink = MemorySink::new();
        let gate = LeaderGate::new("r1", leader);
        let dispatcher = Dispatcher::new(
            ProvisionQueue::new(),
            tracker.clone(),
            registry.clone(),
            Selector::default(),
            gate.clone(),
            provisioner,
            sink.clone(),
            RetryPolicy {
                base_delay_ms: 5,
                max_delay_ms: 20,
                max_attempts: 3,
            },
        );
        Fixture {
            dispatcher,
            tracker,
            registry,
            sink,
            gate,
        }
    }

    fn api() -> ElementId {
        ElementId::new("shop", "api")
    }

    async fn submit_new(f: &Fixture) -> InstanceId {
        let record = f.tracker.record_pending(&api(), None).await.unwrap();
        f.dispatcher
            .queue()
            .submit(ProvisionRequest::new(api(), record.instance_id, RequestKind::New))
            .await;
        record.instance_id
    }

    #[tokio::test]
    async fn provisions_on_least_loaded_node() {
        let f = fixture(Arc::new(Scripted::default()), true).await;
        let id = submit_new(&f).await;

        let req = f.dispatcher.queue().take_next().await.unwrap();
        let outcome = f.dispatcher.process(req).await;
        assert_eq!(outcome, Outcome::Provisioned { node: "N1".to_string() });

        let view = f.tracker.element(&api()).await.unwrap();
        let record = view.records.iter().find(|r| r.instance_id == id).unwrap();
        assert_eq!(record.state, InstanceState::Active);
        assert_eq!(f.registry.snapshot().node("N1").unwrap().used_slots, 1);
        assert_eq!(f.sink.matching(|r| matches!(r, Report::Provisioned { .. })).len(), 1);
    }

    #[tokio::test]
    async fn failure_retries_with_backoff_then_succeeds() {
        let f = fixture(Scripted::failing(1), true).await;
        submit_new(&f).await;

        let req = f.dispatcher.queue().take_next().await.unwrap();
        let outcome = f.dispatcher.process(req).await;
        assert_eq!(
            outcome,
            Outcome::Retrying {
                attempt: 1,
                delay: Duration::from_millis(5)
            }
        );
        assert_eq!(f.registry.snapshot().node("N1").unwrap().used_slots, 0);

        let req = f.dispatcher.queue().take_next().await.unwrap();
        assert_eq!(req.attempt, 1);
        assert!(req.last_failure.is_some());
        assert!(matches!(f.dispatcher.process(req).await, Outcome::Provisioned { .. }));
    }

    #[tokio::test]
    async fn exhausted_retries_are_abandoned_and_reported() {
        let f = fixture(Scripted::failing(10), true).await;
        let id = submit_new(&f).await;

        let mut last = Outcome::Cancelled;
        for _ in 0..3 {
            let req = f.dispatcher.queue().take_next().await.unwrap();
            last = f.dispatcher.process(req).await;
        }
        assert_eq!(last, Outcome::Abandoned);
        assert!(f.tracker.pending_record(&api(), id).await.is_none());

        let abandoned = f.sink.matching(|r| matches!(r, Report::Abandoned { .. }));
        assert_eq!(abandoned.len(), 1);
        if let Report::Abandoned { attempts, shortfall, .. } = &abandoned[0] {
            assert_eq!(*attempts, 3);
            assert_eq!(*shortfall, 2);
        }
        assert!(f.dispatcher.queue().is_empty().await);
    }

    #[tokio::test]
    async fn no_candidate_is_retried() {
        let f = fixture(Arc::new(Scripted::default()), true).await;
        f.registry.drain("N1");
        f.registry.drain("N2");
        submit_new(&f).await;

        let req = f.dispatcher.queue().take_next().await.unwrap();
        assert!(matches!(f.dispatcher.process(req).await, Outcome::Retrying { .. }));
    }

    #[tokio::test]
    async fn standby_defers_without_consuming_attempts() {
        let f = fixture(Arc::new(Scripted::default()), false).await;
        let id = submit_new(&f).await;

        let req = f.dispatcher.queue().take_next().await.unwrap();
        assert_eq!(f.dispatcher.process(req).await, Outcome::Standby);
        assert!(f.tracker.pending_record(&api(), id).await.is_some());

        f.gate.promote().await;
        let req = f.dispatcher.queue().take_next().await.unwrap();
        assert_eq!(req.attempt, 0);
        assert!(matches!(f.dispatcher.process(req).await, Outcome::Provisioned { .. }));
    }

    #[tokio::test]
    async fn cancelled_record_is_dropped() {
        let f = fixture(Arc::new(Scripted::default()), true).await;
        let id = submit_new(&f).await;
        f.tracker.retire(&api(), id).await.unwrap();

        let req = f.dispatcher.queue().take_next().await.unwrap();
        assert_eq!(f.dispatcher.process(req).await, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn relocation_replaces_then_retires() {
        let provisioner = Arc::new(Scripted::default());
        let f = fixture(provisioner.clone(), true).await;
        submit_new(&f).await;
        let req = f.dispatcher.queue().take_next().await.unwrap();
        f.dispatcher.process(req).await;

        let original = f.tracker.element(&api()).await.unwrap().records[0].clone();
        let (old, replacement) = f
            .tracker
            .begin_relocation(&api(), original.instance_id)
            .await
            .unwrap();
        f.dispatcher
            .queue()
            .submit(ProvisionRequest::new(
                api(),
                replacement.instance_id,
                RequestKind::Relocation {
                    replaces: old.instance_id,
                    from: old.node_id.clone(),
                },
            ))
            .await;

        let req = f.dispatcher.queue().take_next().await.unwrap();
        let outcome = f.dispatcher.process(req).await;
        assert_eq!(outcome, Outcome::Provisioned { node: "N2".to_string() });

        let view = f.tracker.element(&api()).await.unwrap();
        assert_eq!(view.active_count(), 1);
        assert_eq!(view.records[0].instance_id, replacement.instance_id);
        assert!(provisioner
            .stopped
            .lock()
            .unwrap()
            .contains(&("N1".to_string(), original.instance_id)));
    }

    #[tokio::test]
    async fn workers_drain_queue() {
        let f = fixture(Arc::new(Scripted::default()), true).await;
        submit_new(&f).await;
        submit_new(&f).await;

        let (tx, rx) = watch::channel(false);
        let handles = f.dispatcher.spawn_workers(2, rx);

        for _ in 0..100 {
            if f.tracker.element(&api()).await.unwrap().active_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.tracker.element(&api()).await.unwrap().active_count(), 2);

        tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }
}
