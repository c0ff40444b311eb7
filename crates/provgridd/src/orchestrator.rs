//! Orchestrator: owns every subsystem and exposes the control operations.
//!
//! ```text
//!  ingest ──▶ WatchMonitor ──signals──▶ ScalingEvaluator
//!                                             │ ScaleDirective
//!                                             ▼
//!  deploy/update/relocate/mark_failed ──▶ Core::reconcile ──▶ ProvisionQueue
//!                                                                 │
//!                                                     Dispatcher workers
//!                                                                 │ reports
//!                                         LifecycleSink ◀─────────┘
//!                                               │ Provisioned / Retired / Failed
//!                                               ▼
//!                              start or stop watch timers, drop breach state
//! ```
//!
//! Every mutating operation takes the leader gate's write guard once and
//! passes it down as proof; helpers never take it again.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use provgrid_autoscale::{
    EvaluatorHandle, ScaleCallback, ScaleDirective, ScaleFuture, ScalingEvaluator, ScalingRule,
};
use provgrid_cluster::{CapabilityFeed, LeaderGate, NodeRegistry, Role, WriteGuard, run_refresh};
use provgrid_placement::{Selector, element_to_demand};
use provgrid_provision::{Dispatcher, ProvisionQueue, ProvisionRequest, Provisioner, RequestKind};
use provgrid_state::{
    DeploymentTracker, ElementId, InstanceId, InstanceState, NodeId, NodeSnapshot,
    OperationalString, Report, ReportSink, SharedSink, StateError, ThresholdEvent, WatchSample,
};
use provgrid_watch::{MetricSource, WatchMonitor};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorResult;

/// External collaborators handed to [`Orchestrator::start`].
pub struct Collaborators {
    pub provisioner: Arc<dyn Provisioner>,
    pub sink: SharedSink,
    /// Pull source for watch timers; without one, samples arrive only
    /// through [`Orchestrator::ingest`].
    pub metrics: Option<Arc<dyn MetricSource>>,
}

/// Per-element counts in a [`Status`].
#[derive(Debug, Clone, Serialize)]
pub struct ElementStatus {
    pub element: ElementId,
    pub planned: u32,
    pub active: u32,
    pub pending: u32,
    pub shortfall: u32,
    pub paused: bool,
}

/// Point-in-time overview of the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub replica_id: String,
    pub leader: bool,
    pub term: Option<u64>,
    pub ready_nodes: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub elements: Vec<ElementStatus>,
}

/// Forwards lifecycle records to the orchestrator besides the real sink.
struct LifecycleSink {
    inner: SharedSink,
    events: mpsc::UnboundedSender<Report>,
}

impl ReportSink for LifecycleSink {
    fn report(&self, record: Report) {
        if matches!(
            record,
            Report::Provisioned { .. } | Report::Retired { .. } | Report::Failed { .. }
        ) && self.events.send(record.clone()).is_err()
        {
            debug!("lifecycle loop gone, record not forwarded");
        }
        self.inner.report(record);
    }
}

/// Shared handles used by the operations, the scale callback and the
/// background loops.
#[derive(Clone)]
struct Core {
    tracker: DeploymentTracker,
    registry: NodeRegistry,
    gate: LeaderGate,
    dispatcher: Dispatcher,
    monitor: Arc<WatchMonitor>,
    evaluator: EvaluatorHandle,
    sink: SharedSink,
}

impl Core {
    /// Bring an element's live count back to its planned count.
    async fn reconcile(&self, element: &ElementId, guard: &WriteGuard) -> OrchestratorResult<()> {
        let Some(view) = self.tracker.element(element).await else {
            return Err(StateError::ElementNotFound(element.to_string()).into());
        };
        if view.shortfall() > 0 {
            self.provision(element, view.shortfall(), None, guard).await?;
        } else if view.excess() > 0 {
            self.shed(element, view.excess(), guard).await?;
        }
        Ok(())
    }

    /// Record and queue up to `count` new instances, never past the
    /// planned count. `failed` marks them as replacements. Returns how
    /// many were queued.
    async fn provision(
        &self,
        element: &ElementId,
        count: u32,
        failed: Option<InstanceId>,
        _guard: &WriteGuard,
    ) -> OrchestratorResult<u32> {
        let paused = self
            .tracker
            .element(element)
            .await
            .is_some_and(|v| v.paused);
        if paused {
            info!(%element, count, "element paused, provisioning deferred until resume");
            return Ok(0);
        }
        let records = match self.tracker.fill_shortfall(element, count).await {
            Ok(records) => records,
            Err(StateError::InvariantViolation { element: name, detail }) => {
                self.sink.report(Report::InvariantViolation {
                    element: element.clone(),
                    detail: detail.clone(),
                });
                return Err(StateError::InvariantViolation { element: name, detail }.into());
            }
            Err(e) => return Err(e.into()),
        };
        let kind = match failed {
            Some(failed) => RequestKind::Replacement { failed },
            None => RequestKind::New,
        };
        for record in &records {
            self.dispatcher
                .queue()
                .submit(ProvisionRequest::new(element.clone(), record.instance_id, kind.clone()))
                .await;
        }
        debug!(%element, queued = records.len(), "provision requests queued");
        Ok(records.len() as u32)
    }

    /// Remove `count` instances: pending ones first (newest first), then
    /// the least useful active ones.
    async fn shed(&self, element: &ElementId, count: u32, _guard: &WriteGuard) -> OrchestratorResult<()> {
        let Some(view) = self.tracker.element(element).await else {
            return Ok(());
        };
        let mut remaining = count as usize;

        let mut pending: Vec<InstanceId> = view
            .pending()
            .filter(|r| r.replaces.is_none())
            .map(|r| r.instance_id)
            .collect();
        pending.sort_unstable_by(|a, b| b.cmp(a));
        for id in pending.into_iter().take(remaining) {
            self.dispatcher.queue().cancel_instance(element, id).await;
            if self.tracker.abandon(element, id).await?.is_some() {
                remaining -= 1;
                debug!(%element, instance = id, "pending instance cancelled by scale-down");
            }
        }
        if remaining == 0 {
            return Ok(());
        }

        let active: Vec<_> = view
            .records
            .iter()
            .filter(|r| r.state == InstanceState::Active)
            .cloned()
            .collect();
        let snapshot = self.registry.snapshot();
        let hosted = self.tracker.hosted_counts(element).await;
        let order = self.dispatcher.selector().retirement_order(
            &element_to_demand(&view.spec),
            &active,
            &snapshot.nodes,
            &hosted,
        );
        for id in order.into_iter().take(remaining) {
            let record = self.tracker.retire(element, id).await?;
            self.dispatcher
                .retire_instance(&record, view.spec.slots, "scaled down")
                .await;
        }
        Ok(())
    }

    async fn apply_directive(&self, directive: ScaleDirective) -> OrchestratorResult<()> {
        let guard = match self.gate.write().await {
            Ok(guard) => guard,
            Err(e) => {
                debug!(element = %directive.element, rule = %directive.rule, error = %e, "standby, scale directive skipped");
                return Ok(());
            }
        };
        let element = &directive.element;
        let change = self
            .tracker
            .adjust_planned(element, directive.action.delta())
            .await?;
        if change.clamped() {
            info!(
                %element,
                rule = %directive.rule,
                requested = change.requested,
                planned = change.to,
                "scale action clamped to bounds"
            );
        }
        self.sink.report(Report::Scaled {
            element: element.clone(),
            rule: directive.rule.clone(),
            from: change.from,
            to: change.to,
            requested: change.requested,
        });
        if change.from != change.to {
            self.reconcile(element, &guard).await?;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        element: &ElementId,
        instance_id: InstanceId,
        reason: &str,
        guard: &WriteGuard,
    ) -> OrchestratorResult<u32> {
        let record = self.tracker.mark_failed(element, instance_id, reason).await?;
        if let Some(node) = &record.node_id
            && let Some(view) = self.tracker.element(element).await
        {
            self.registry.release_slots(node, view.spec.slots);
        }
        self.sink.report(Report::Failed {
            element: element.clone(),
            instance_id,
            reason: reason.to_string(),
        });

        let shortfall = self
            .tracker
            .element(element)
            .await
            .map(|v| v.shortfall())
            .unwrap_or(0);
        self.provision(element, shortfall, Some(instance_id), guard).await
    }

    /// Tear down the watch and scaling state of elements that are gone.
    async fn forget_elements(&self, elements: &[ElementId]) {
        for element in elements {
            self.dispatcher.queue().cancel_element(element).await;
            self.monitor.unregister_element(element).await;
            if let Err(e) = self.evaluator.forget(element) {
                debug!(%element, error = %e, "evaluator gone");
            }
        }
    }

    async fn on_lifecycle(&self, record: Report) {
        match record {
            Report::Provisioned {
                element,
                instance_id,
                ..
            } => self.monitor.watch_instance(&element, instance_id).await,
            Report::Retired {
                element,
                instance_id,
                ..
            }
            | Report::Failed {
                element,
                instance_id,
                ..
            } => {
                self.monitor.unwatch_instance(&element, instance_id).await;
                if let Err(e) = self.evaluator.instance_retired(&element, instance_id) {
                    debug!(%element, error = %e, "evaluator gone");
                }
            }
            _ => {}
        }
    }

    /// Reap expired nodes and replace their instances. Standby replicas
    /// leave the registry alone so the dead set survives until promotion.
    async fn reap_dead_nodes(&self) {
        let guard = match self.gate.write().await {
            Ok(guard) => guard,
            Err(_) => {
                debug!("standby, dead node reaping left to the leader");
                return;
            }
        };
        for node in self.registry.reap_dead() {
            self.fail_instances_on(&node, &guard).await;
        }
    }

    async fn fail_instances_on(&self, node: &NodeId, guard: &WriteGuard) {
        for record in self.tracker.instances_on_node(node).await {
            let reason = format!("node {node} lost");
            if let Err(e) = self
                .mark_failed(&record.element, record.instance_id, &reason, guard)
                .await
            {
                warn!(element = %record.element, instance = record.instance_id, error = %e, "could not replace instance of dead node");
            }
        }
    }

    /// Fail instances placed on nodes the registry no longer knows.
    async fn fail_orphans(&self, guard: &WriteGuard) {
        let snapshot = self.registry.snapshot();
        let tracked = self.tracker.snapshot().await;
        let mut lost: Vec<NodeId> = tracked
            .elements
            .iter()
            .flat_map(|v| v.records.iter())
            .filter(|r| r.state.is_serving())
            .filter_map(|r| r.node_id.clone())
            .filter(|node| snapshot.node(node).is_none())
            .collect();
        lost.sort_unstable();
        lost.dedup();
        for node in lost {
            info!(%node, "instances found on unknown node");
            self.fail_instances_on(&node, guard).await;
        }
    }

    /// Queue the shortfall of every unpaused element, after capacity grew.
    async fn reconcile_shortfalls(&self) {
        let guard = match self.gate.write().await {
            Ok(guard) => guard,
            Err(_) => return,
        };
        for view in self.tracker.snapshot().await.elements {
            if view.paused || view.shortfall() == 0 {
                continue;
            }
            info!(element = %view.id, shortfall = view.shortfall(), "capacity changed, retrying shortfall");
            if let Err(e) = self.reconcile(&view.id, &guard).await {
                warn!(element = %view.id, error = %e, "shortfall reconcile failed");
            }
        }
    }
}

/// The orchestrator process state. Dropping it without
/// [`shutdown`](Self::shutdown) leaves the background tasks running.
pub struct Orchestrator {
    core: Core,
    static_nodes: Vec<NodeId>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build every subsystem and start the background loops.
    pub fn start(config: OrchestratorConfig, collaborators: Collaborators) -> anyhow::Result<Self> {
        config.validate()?;
        let Collaborators {
            provisioner,
            sink,
            metrics,
        } = collaborators;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (lifecycle_tx, mut lifecycle_rx) = mpsc::unbounded_channel();
        let lifecycle: SharedSink = Arc::new(LifecycleSink {
            inner: sink.clone(),
            events: lifecycle_tx,
        });

        let tracker = DeploymentTracker::new();
        let registry = NodeRegistry::new().with_dead_timeout(config.registry.dead_timeout());
        for node in &config.nodes {
            registry.publish(node.clone());
        }
        let gate = LeaderGate::new(config.replica_id.clone(), config.leader);
        let dispatcher = Dispatcher::new(
            ProvisionQueue::new(),
            tracker.clone(),
            registry.clone(),
            Selector::new(config.weights),
            gate.clone(),
            provisioner,
            lifecycle.clone(),
            config.retry,
        );

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let mut monitor = WatchMonitor::new(signal_tx, sink);
        if let Some(source) = metrics {
            monitor = monitor.with_source(source);
        }
        let (evaluator, commands) = EvaluatorHandle::channel();

        let core = Core {
            tracker,
            registry,
            gate,
            dispatcher,
            monitor: Arc::new(monitor),
            evaluator,
            sink: lifecycle,
        };

        let mut tasks = core
            .dispatcher
            .spawn_workers(config.workers, shutdown_rx.clone());

        let scale_core = core.clone();
        let scale_fn: ScaleCallback = Arc::new(move |directive: ScaleDirective| -> ScaleFuture {
            let core = scale_core.clone();
            Box::pin(async move { Ok(core.apply_directive(directive).await?) })
        });
        tasks.push(tokio::spawn(
            ScalingEvaluator::new(config.stream.capacity)
                .with_scale_fn(scale_fn)
                .run(signal_rx, commands, shutdown_rx.clone()),
        ));

        let lifecycle_core = core.clone();
        let mut lifecycle_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    record = lifecycle_rx.recv() => match record {
                        Some(record) => lifecycle_core.on_lifecycle(record).await,
                        None => break,
                    },
                    _ = lifecycle_shutdown.changed() => break,
                }
            }
        }));

        let capacity_core = core.clone();
        let mut capacity = core.registry.capacity_changes();
        let mut capacity_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = capacity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        capacity_core.reconcile_shortfalls().await;
                    }
                    _ = capacity_shutdown.changed() => break,
                }
            }
        }));

        let static_nodes: Vec<NodeId> = config.nodes.iter().map(|n| n.id.clone()).collect();
        let reaper_core = core.clone();
        let reaper_static = static_nodes.clone();
        let reap_interval = config.registry.reap_interval();
        let mut reaper_shutdown = shutdown_rx;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(reap_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for node in &reaper_static {
                            reaper_core.registry.heartbeat(node);
                        }
                        reaper_core.reap_dead_nodes().await;
                    }
                    _ = reaper_shutdown.changed() => break,
                }
            }
        }));

        info!(
            replica = %config.replica_id,
            leader = config.leader,
            workers = config.workers,
            nodes = config.nodes.len(),
            "orchestrator started"
        );
        Ok(Self {
            core,
            static_nodes,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Poll `feed` for node snapshots every `interval`.
    pub async fn attach_feed(&self, feed: Arc<dyn CapabilityFeed>, interval: Duration) {
        let handle = tokio::spawn(run_refresh(
            self.core.registry.clone(),
            feed,
            interval,
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.lock().await.push(handle);
    }

    // ── Deployment ──────────────────────────────────────────────────

    /// Deploy an operational string and queue its planned instances.
    pub async fn deploy(&self, opstring: OperationalString) -> OrchestratorResult<Vec<ElementId>> {
        let guard = self.core.gate.write().await?;
        let ids = self.core.tracker.deploy(opstring.clone()).await?;
        for (id, spec) in ids.iter().zip(&opstring.elements) {
            self.core.monitor.register_element(id, &spec.slas)?;
        }
        for id in &ids {
            self.core.reconcile(id, &guard).await?;
        }
        Ok(ids)
    }

    /// Undeploy an operational string: cancel its queued requests, stop
    /// its watches and retire every placed instance. Instances still in
    /// flight are retired by the dispatcher once they land.
    pub async fn undeploy(&self, name: &str) -> OrchestratorResult<()> {
        let _guard = self.core.gate.write().await?;
        let Some(opstring) = self.core.tracker.opstring(name).await else {
            return Err(StateError::NotDeployed(name.to_string()).into());
        };
        let cancelled = self.core.dispatcher.queue().cancel_opstring(name).await;
        let terminated = self.core.tracker.undeploy(name).await?;
        self.core.forget_elements(&opstring.element_ids()).await;

        for record in &terminated {
            let slots = opstring
                .elements
                .iter()
                .find(|e| e.name == record.element.name)
                .map_or(1, |e| e.slots);
            if record.node_id.is_some() {
                self.core
                    .dispatcher
                    .retire_instance(record, slots, "undeployed")
                    .await;
            }
        }
        info!(
            opstring = %name,
            cancelled = cancelled.len(),
            retired = terminated.iter().filter(|r| r.node_id.is_some()).count(),
            "undeploy complete"
        );
        Ok(())
    }

    /// Apply a new version of a deployed operational string.
    pub async fn update(&self, opstring: OperationalString) -> OrchestratorResult<()> {
        let guard = self.core.gate.write().await?;
        let previous = self.core.tracker.opstring(&opstring.name).await;
        let plan = self.core.tracker.update(opstring.clone()).await?;

        let removed: Vec<ElementId> = plan.removed.iter().map(|(id, _)| id.clone()).collect();
        self.core.forget_elements(&removed).await;
        for (id, records) in &plan.removed {
            let slots = previous
                .as_ref()
                .and_then(|p| p.elements.iter().find(|e| e.name == id.name))
                .map_or(1, |e| e.slots);
            for record in records.iter().filter(|r| r.node_id.is_some()) {
                self.core
                    .dispatcher
                    .retire_instance(record, slots, "removed by update")
                    .await;
            }
        }

        for (id, spec) in opstring.element_ids().iter().zip(&opstring.elements) {
            self.core.monitor.register_element(id, &spec.slas)?;
        }
        for id in &plan.changed {
            self.relocate_all(id, &guard).await?;
        }
        for id in plan.added.iter().chain(&plan.replanned) {
            self.core.reconcile(id, &guard).await?;
        }
        Ok(())
    }

    async fn relocate_all(&self, element: &ElementId, guard: &WriteGuard) -> OrchestratorResult<()> {
        let Some(view) = self.core.tracker.element(element).await else {
            return Ok(());
        };
        for record in view.records.iter().filter(|r| r.state == InstanceState::Active) {
            self.submit_relocation(element, record.instance_id, guard).await?;
        }
        Ok(())
    }

    async fn submit_relocation(
        &self,
        element: &ElementId,
        instance_id: InstanceId,
        _guard: &WriteGuard,
    ) -> OrchestratorResult<InstanceId> {
        let (old, replacement) = self.core.tracker.begin_relocation(element, instance_id).await?;
        self.core
            .dispatcher
            .queue()
            .submit(ProvisionRequest::new(
                element.clone(),
                replacement.instance_id,
                RequestKind::Relocation {
                    replaces: old.instance_id,
                    from: old.node_id.clone(),
                },
            ))
            .await;
        info!(%element, instance = instance_id, replacement = replacement.instance_id, "relocation queued");
        Ok(replacement.instance_id)
    }

    // ── Instances ───────────────────────────────────────────────────

    /// Move an instance off its current node, replace-then-retire.
    /// Returns the replacement's instance ID.
    pub async fn relocate(&self, element: &ElementId, instance_id: InstanceId) -> OrchestratorResult<InstanceId> {
        let guard = self.core.gate.write().await?;
        self.submit_relocation(element, instance_id, &guard).await
    }

    /// Record a detected instance failure and queue its replacement.
    /// Returns the number of replacement requests queued.
    pub async fn mark_failed(
        &self,
        element: &ElementId,
        instance_id: InstanceId,
        reason: &str,
    ) -> OrchestratorResult<u32> {
        let guard = self.core.gate.write().await?;
        self.core.mark_failed(element, instance_id, reason, &guard).await
    }

    /// Lift a pause left by an invariant violation and queue whatever
    /// the element is short of.
    pub async fn resume(&self, element: &ElementId) -> OrchestratorResult<()> {
        let guard = self.core.gate.write().await?;
        self.core.tracker.resume(element).await?;
        self.core.reconcile(element, &guard).await
    }

    /// Operator override of the planned count, clamped into the element's
    /// bounds. Returns the planned count that took effect.
    pub async fn set_planned(&self, element: &ElementId, planned: u32) -> OrchestratorResult<u32> {
        let guard = self.core.gate.write().await?;
        let change = self.core.tracker.set_planned(element, planned).await?;
        if change.clamped() {
            info!(%element, requested = change.requested, planned = change.to, "planned count clamped to bounds");
        }
        if change.from != change.to {
            self.core.reconcile(element, &guard).await?;
        }
        Ok(change.to)
    }

    // ── Watches and rules ───────────────────────────────────────────

    /// Push a metric sample. Runs on standby replicas too.
    pub fn ingest(&self, sample: WatchSample) -> OrchestratorResult<Vec<ThresholdEvent>> {
        Ok(self.core.monitor.ingest(sample)?)
    }

    /// Install the scaling rules of a deployed element.
    pub async fn load_rules(&self, element: &ElementId, rules: Vec<ScalingRule>) -> OrchestratorResult<()> {
        if self.core.tracker.element(element).await.is_none() {
            return Err(StateError::ElementNotFound(element.to_string()).into());
        }
        self.core.evaluator.load_rules(element, rules)?;
        Ok(())
    }

    // ── Nodes ───────────────────────────────────────────────────────

    pub fn publish_node(&self, node: NodeSnapshot) -> bool {
        self.core.registry.publish(node)
    }

    /// Stop placing new instances on `node`.
    pub fn drain(&self, node: &str) -> bool {
        self.core.registry.drain(node)
    }

    pub fn undrain(&self, node: &str) -> bool {
        self.core.registry.undrain(node)
    }

    /// Reap dead nodes now instead of waiting for the reaper tick.
    pub async fn reap_dead_nodes(&self) {
        for node in &self.static_nodes {
            self.core.registry.heartbeat(node);
        }
        self.core.reap_dead_nodes().await;
    }

    // ── Leadership ──────────────────────────────────────────────────

    /// Take the ownership token and reconcile every element. Nodes that
    /// died or vanished while this replica was standby have their
    /// instances failed first.
    pub async fn promote(&self) -> OrchestratorResult<u64> {
        let term = self.core.gate.promote().await;
        let guard = self.core.gate.write().await?;
        for node in &self.static_nodes {
            self.core.registry.heartbeat(node);
        }
        for node in self.core.registry.reap_dead() {
            self.core.fail_instances_on(&node, &guard).await;
        }
        self.core.fail_orphans(&guard).await;
        let snapshot = self.core.tracker.snapshot().await;
        for view in &snapshot.elements {
            if !view.paused {
                self.core.reconcile(&view.id, &guard).await?;
            }
        }
        Ok(term)
    }

    /// Give up the ownership token after in-flight writes finish.
    pub async fn demote(&self) {
        self.core.gate.demote().await;
    }

    pub fn role(&self) -> Role {
        self.core.gate.role()
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn tracker(&self) -> &DeploymentTracker {
        &self.core.tracker
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.core.registry
    }

    pub async fn status(&self) -> Status {
        let snapshot = self.core.tracker.snapshot().await;
        let queue = self.core.dispatcher.queue();
        let role = self.core.gate.role();
        Status {
            replica_id: self.core.gate.replica_id().to_string(),
            leader: role.is_leader(),
            term: match role {
                Role::Leader { term } => Some(term),
                Role::Standby => None,
            },
            ready_nodes: self.core.registry.ready_count(),
            queued: queue.len().await,
            in_flight: queue.in_flight().await,
            elements: snapshot
                .elements
                .iter()
                .map(|v| ElementStatus {
                    element: v.id.clone(),
                    planned: v.planned(),
                    active: v.active_count(),
                    pending: v.pending_count(),
                    shortfall: v.shortfall(),
                    paused: v.paused,
                })
                .collect(),
        }
    }

    /// Stop all loops and wait for them.
    pub async fn shutdown(self) {
        info!("orchestrator shutting down");
        let _ = self.shutdown_tx.send(true);
        self.core.dispatcher.queue().close().await;
        self.core.monitor.stop_all().await;
        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await
                && e.is_panic()
            {
                warn!(error = %e, "background task panicked");
            }
        }
        info!("orchestrator stopped");
    }
}
