//! Deployment state tracker: the authoritative map of operational
//! strings → service elements → instance records.
//!
//! Every mutation is a single atomic operation under one write lock, so
//! readers always see a consistent [`TrackerSnapshot`]. No other
//! component keeps a writable copy of instance state.
//!
//! Counting rule: a record is *live* while `Pending`, `Active` or
//! `Relocating`. A pending record that replaces a relocating instance is
//! live but does not add to the element's effective count, which is what
//! lets relocation run replace-then-retire at `planned + 1`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::error::{StateError, StateResult};
use crate::types::*;

/// Per-element tracking state.
struct ElementSlot {
    spec: ServiceElement,
    /// Next instance ID to hand out. IDs are never reused.
    next_instance_id: InstanceId,
    /// Live records only; failed/terminated records are removed and
    /// returned to the caller.
    records: BTreeMap<InstanceId, InstanceRecord>,
    paused: bool,
}

impl ElementSlot {
    fn new(spec: ServiceElement, next_instance_id: InstanceId) -> Self {
        Self {
            spec,
            next_instance_id,
            records: BTreeMap::new(),
            paused: false,
        }
    }

    /// Live records that count toward the planned count. A pending
    /// replacement of a relocating instance does not.
    fn effective(&self) -> u32 {
        self.records
            .values()
            .filter(|r| r.state.is_live() && r.replaces.is_none())
            .count() as u32
    }

    fn push_pending(&mut self, element: &ElementId, replaces: Option<InstanceId>) -> InstanceRecord {
        let id = self.next_instance_id;
        self.next_instance_id += 1;
        let record = InstanceRecord {
            element: element.clone(),
            instance_id: id,
            node_id: None,
            state: InstanceState::Pending,
            replaces,
            updated_at: epoch_millis(),
        };
        self.records.insert(id, record.clone());
        debug!(%element, instance = id, ?replaces, "instance pending");
        record
    }

    fn serving(&self) -> u32 {
        self.records.values().filter(|r| r.state.is_serving()).count() as u32
    }
}

struct TrackerInner {
    opstrings: BTreeMap<String, OperationalString>,
    elements: BTreeMap<ElementId, ElementSlot>,
    /// Next instance ID of elements that were removed, so a later
    /// deployment of the same element continues the sequence.
    released_ids: HashMap<ElementId, InstanceId>,
}

impl TrackerInner {
    fn open_slot(&mut self, id: &ElementId, spec: ServiceElement) {
        let next = self.released_ids.remove(id).unwrap_or(1);
        self.elements.insert(id.clone(), ElementSlot::new(spec, next));
    }

    fn close_slot(&mut self, id: &ElementId) -> Option<ElementSlot> {
        let slot = self.elements.remove(id)?;
        self.released_ids.insert(id.clone(), slot.next_instance_id);
        Some(slot)
    }
}

/// Read-only copy of one element's state.
#[derive(Debug, Clone, Serialize)]
pub struct ElementView {
    pub id: ElementId,
    pub spec: ServiceElement,
    pub paused: bool,
    pub records: Vec<InstanceRecord>,
}

impl ElementView {
    pub fn planned(&self) -> u32 {
        self.spec.planned
    }

    pub fn serving(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.records.iter().filter(|r| r.state.is_serving())
    }

    pub fn pending(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.records
            .iter()
            .filter(|r| r.state == InstanceState::Pending)
    }

    pub fn active_count(&self) -> u32 {
        self.serving().count() as u32
    }

    pub fn pending_count(&self) -> u32 {
        self.pending().count() as u32
    }

    /// Live records, not counting pending replacements of relocating ones.
    pub fn effective_count(&self) -> u32 {
        self.records
            .iter()
            .filter(|r| r.state.is_live() && r.replaces.is_none())
            .count() as u32
    }

    pub fn shortfall(&self) -> u32 {
        self.planned().saturating_sub(self.effective_count())
    }

    pub fn excess(&self) -> u32 {
        self.effective_count().saturating_sub(self.planned())
    }
}

/// Consistent copy of all tracked state.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    /// Deployed operational strings: name → version.
    pub opstrings: BTreeMap<String, String>,
    pub elements: Vec<ElementView>,
}

impl TrackerSnapshot {
    pub fn element(&self, id: &ElementId) -> Option<&ElementView> {
        self.elements.iter().find(|e| &e.id == id)
    }
}

/// Outcome of confirming a pending instance.
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub record: InstanceRecord,
    /// The relocated instance retired by this confirmation.
    pub retired: Option<InstanceRecord>,
}

/// Result of a planned-count change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedChange {
    pub from: u32,
    pub to: u32,
    pub requested: i64,
}

impl PlannedChange {
    pub fn clamped(&self) -> bool {
        i64::from(self.to) != self.requested
    }
}

/// Element-level differences applied by [`DeploymentTracker::update`].
#[derive(Debug, Clone, Default)]
pub struct UpdatePlan {
    pub added: Vec<ElementId>,
    /// Removed elements with their terminated records.
    pub removed: Vec<(ElementId, Vec<InstanceRecord>)>,
    /// Elements whose placement-relevant declaration changed.
    pub changed: Vec<ElementId>,
    /// Elements whose planned count or bounds changed.
    pub replanned: Vec<ElementId>,
}

/// The deployment state tracker. `Clone` shares the same state.
#[derive(Clone)]
pub struct DeploymentTracker {
    inner: Arc<RwLock<TrackerInner>>,
}

impl Default for DeploymentTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(TrackerInner {
                opstrings: BTreeMap::new(),
                elements: BTreeMap::new(),
                released_ids: HashMap::new(),
            })),
        }
    }

    // ── Deployment lifecycle ────────────────────────────────────────

    /// Register an operational string. Rejects malformed declarations.
    pub async fn deploy(&self, opstring: OperationalString) -> StateResult<Vec<ElementId>> {
        opstring.validate()?;
        let mut inner = self.inner.write().await;
        if inner.opstrings.contains_key(&opstring.name) {
            return Err(StateError::AlreadyDeployed(opstring.name));
        }

        let ids = opstring.element_ids();
        for (id, spec) in ids.iter().zip(&opstring.elements) {
            inner.open_slot(id, spec.clone());
        }
        info!(opstring = %opstring.name, elements = ids.len(), "operational string deployed");
        inner.opstrings.insert(opstring.name.clone(), opstring);
        Ok(ids)
    }

    /// Remove an operational string. Returns every live record, now
    /// `Terminated`, so the caller can stop them.
    pub async fn undeploy(&self, name: &str) -> StateResult<Vec<InstanceRecord>> {
        let mut inner = self.inner.write().await;
        let opstring = inner
            .opstrings
            .remove(name)
            .ok_or_else(|| StateError::NotDeployed(name.to_string()))?;

        let mut terminated = Vec::new();
        for id in opstring.element_ids() {
            if let Some(slot) = inner.close_slot(&id) {
                terminated.extend(terminate_all(slot));
            }
        }
        info!(opstring = %name, instances = terminated.len(), "operational string undeployed");
        Ok(terminated)
    }

    /// Replace a deployed operational string with a new version.
    pub async fn update(&self, opstring: OperationalString) -> StateResult<UpdatePlan> {
        opstring.validate()?;
        let mut inner = self.inner.write().await;
        let previous = inner
            .opstrings
            .get(&opstring.name)
            .cloned()
            .ok_or_else(|| StateError::NotDeployed(opstring.name.clone()))?;

        let mut plan = UpdatePlan::default();
        let new_ids = opstring.element_ids();

        for old in previous.element_ids() {
            if !new_ids.contains(&old)
                && let Some(slot) = inner.close_slot(&old)
            {
                plan.removed.push((old, terminate_all(slot)));
            }
        }

        for (id, spec) in new_ids.iter().zip(&opstring.elements) {
            match inner.elements.get_mut(id) {
                None => {
                    inner.open_slot(id, spec.clone());
                    plan.added.push(id.clone());
                }
                Some(slot) => {
                    let old = &slot.spec;
                    if old.requirements != spec.requirements
                        || old.slots != spec.slots
                        || old.max_per_node != spec.max_per_node
                        || old.parameters != spec.parameters
                    {
                        plan.changed.push(id.clone());
                    }
                    if old.planned != spec.planned || old.bounds != spec.bounds {
                        plan.replanned.push(id.clone());
                    }
                    slot.spec = spec.clone();
                }
            }
        }

        info!(
            opstring = %opstring.name,
            from = %previous.version,
            to = %opstring.version,
            added = plan.added.len(),
            removed = plan.removed.len(),
            changed = plan.changed.len(),
            "operational string updated"
        );
        inner.opstrings.insert(opstring.name.clone(), opstring);
        Ok(plan)
    }

    // ── Instance transitions ────────────────────────────────────────

    /// Allocate a fresh instance ID and record it as `Pending`.
    ///
    /// `replaces` links the record to a relocating instance.
    pub async fn record_pending(
        &self,
        element: &ElementId,
        replaces: Option<InstanceId>,
    ) -> StateResult<InstanceRecord> {
        let mut inner = self.inner.write().await;
        let slot = slot_mut(&mut inner, element)?;
        if slot.paused {
            return Err(StateError::InvariantViolation {
                element: element.to_string(),
                detail: "element is paused pending reconciliation".to_string(),
            });
        }

        let counts_toward_plan = replaces.is_none();
        if counts_toward_plan && slot.effective() + 1 > slot.spec.planned {
            let detail = format!("pending would exceed planned {}", slot.spec.planned);
            return Err(violation(slot, element, detail));
        }

        Ok(slot.push_pending(element, replaces))
    }

    /// Record up to `max` pending instances, stopping once the element
    /// reaches its planned count. Check and insert happen under one lock,
    /// so concurrent callers never overshoot.
    pub async fn fill_shortfall(&self, element: &ElementId, max: u32) -> StateResult<Vec<InstanceRecord>> {
        let mut inner = self.inner.write().await;
        let slot = slot_mut(&mut inner, element)?;
        if slot.paused {
            return Err(StateError::InvariantViolation {
                element: element.to_string(),
                detail: "element is paused pending reconciliation".to_string(),
            });
        }
        let count = slot.spec.planned.saturating_sub(slot.effective()).min(max);
        Ok((0..count).map(|_| slot.push_pending(element, None)).collect())
    }

    /// The record for a still-pending instance, if it has not been
    /// cancelled or abandoned.
    pub async fn pending_record(
        &self,
        element: &ElementId,
        instance_id: InstanceId,
    ) -> Option<InstanceRecord> {
        let inner = self.inner.read().await;
        inner
            .elements
            .get(element)?
            .records
            .get(&instance_id)
            .filter(|r| r.state == InstanceState::Pending)
            .cloned()
    }

    /// Transition `Pending → Active` on `node`. When the record replaces
    /// a relocating instance, that instance is retired in the same step.
    pub async fn confirm_active(
        &self,
        element: &ElementId,
        instance_id: InstanceId,
        node: &NodeId,
    ) -> StateResult<Confirmation> {
        let mut inner = self.inner.write().await;
        let slot = slot_mut(&mut inner, element)?;
        if slot.paused {
            return Err(StateError::InvariantViolation {
                element: element.to_string(),
                detail: "element is paused pending reconciliation".to_string(),
            });
        }

        let record = slot
            .records
            .get_mut(&instance_id)
            .ok_or_else(|| not_found(element, instance_id))?;
        if record.state != InstanceState::Pending {
            return Err(illegal(record, InstanceState::Active));
        }
        record.state = InstanceState::Active;
        record.node_id = Some(node.clone());
        record.updated_at = epoch_millis();
        let replaces = record.replaces.take();
        let confirmed = record.clone();

        let retired = replaces.and_then(|old| slot.records.remove(&old)).map(|mut old| {
            old.state = InstanceState::Terminated;
            old.updated_at = epoch_millis();
            old
        });

        if slot.serving() > slot.spec.planned + 1 {
            let detail = format!(
                "{} serving instances exceed planned {} + 1",
                slot.serving(),
                slot.spec.planned
            );
            return Err(violation(slot, element, detail));
        }

        debug!(%element, instance = instance_id, %node, "instance active");
        Ok(Confirmation {
            record: confirmed,
            retired,
        })
    }

    /// Drop a pending record whose request was abandoned or cancelled.
    /// A relocating instance it was meant to replace goes back to `Active`.
    pub async fn abandon(
        &self,
        element: &ElementId,
        instance_id: InstanceId,
    ) -> StateResult<Option<InstanceRecord>> {
        let mut inner = self.inner.write().await;
        let slot = slot_mut(&mut inner, element)?;
        match slot.records.get(&instance_id) {
            Some(r) if r.state == InstanceState::Pending => {}
            _ => return Ok(None),
        }
        let removed = slot.records.remove(&instance_id);
        if let Some(old) = removed.as_ref().and_then(|r| r.replaces)
            && let Some(old) = slot.records.get_mut(&old)
            && old.state == InstanceState::Relocating
        {
            old.state = InstanceState::Active;
            old.updated_at = epoch_millis();
        }
        Ok(removed)
    }

    /// Mark a serving instance failed. The record leaves the live set.
    pub async fn mark_failed(
        &self,
        element: &ElementId,
        instance_id: InstanceId,
        reason: &str,
    ) -> StateResult<InstanceRecord> {
        let mut inner = self.inner.write().await;
        let slot = slot_mut(&mut inner, element)?;
        let record = slot
            .records
            .get(&instance_id)
            .ok_or_else(|| not_found(element, instance_id))?;
        if !record.state.is_serving() {
            return Err(illegal(record, InstanceState::Failed));
        }

        let mut failed = slot
            .records
            .remove(&instance_id)
            .ok_or_else(|| not_found(element, instance_id))?;
        failed.state = InstanceState::Failed;
        failed.updated_at = epoch_millis();

        // A pending replacement for this instance now stands on its own.
        for r in slot.records.values_mut() {
            if r.replaces == Some(instance_id) {
                r.replaces = None;
            }
        }
        info!(%element, instance = instance_id, %reason, "instance failed");
        Ok(failed)
    }

    /// Start a replace-then-retire relocation: `Active → Relocating`
    /// plus a linked pending replacement.
    pub async fn begin_relocation(
        &self,
        element: &ElementId,
        instance_id: InstanceId,
    ) -> StateResult<(InstanceRecord, InstanceRecord)> {
        let mut inner = self.inner.write().await;
        let slot = slot_mut(&mut inner, element)?;
        if slot.paused {
            return Err(StateError::InvariantViolation {
                element: element.to_string(),
                detail: "element is paused pending reconciliation".to_string(),
            });
        }
        let record = slot
            .records
            .get_mut(&instance_id)
            .ok_or_else(|| not_found(element, instance_id))?;
        if record.state != InstanceState::Active {
            return Err(illegal(record, InstanceState::Relocating));
        }
        record.state = InstanceState::Relocating;
        record.updated_at = epoch_millis();
        let old = record.clone();

        let replacement = slot.push_pending(element, Some(instance_id));
        debug!(%element, instance = instance_id, replacement = replacement.instance_id, "relocation started");
        Ok((old, replacement))
    }

    /// Retire any live record. Returns it as `Terminated`.
    pub async fn retire(
        &self,
        element: &ElementId,
        instance_id: InstanceId,
    ) -> StateResult<InstanceRecord> {
        let mut inner = self.inner.write().await;
        let slot = slot_mut(&mut inner, element)?;
        let mut record = slot
            .records
            .remove(&instance_id)
            .ok_or_else(|| not_found(element, instance_id))?;

        if let Some(old) = record.replaces
            && let Some(old) = slot.records.get_mut(&old)
            && old.state == InstanceState::Relocating
        {
            old.state = InstanceState::Active;
        }
        for r in slot.records.values_mut() {
            if r.replaces == Some(instance_id) {
                r.replaces = None;
            }
        }

        record.state = InstanceState::Terminated;
        record.updated_at = epoch_millis();
        debug!(%element, instance = instance_id, "instance retired");
        Ok(record)
    }

    // ── Planned count ───────────────────────────────────────────────

    /// Change the planned count by `delta`, clamped into the element's
    /// bounds. Clamping is not an error.
    pub async fn adjust_planned(&self, element: &ElementId, delta: i64) -> StateResult<PlannedChange> {
        let mut inner = self.inner.write().await;
        let slot = slot_mut(&mut inner, element)?;
        let requested = i64::from(slot.spec.planned) + delta;
        Ok(apply_planned(slot, element, requested))
    }

    /// Set the planned count outright, clamped into bounds.
    pub async fn set_planned(&self, element: &ElementId, planned: u32) -> StateResult<PlannedChange> {
        let mut inner = self.inner.write().await;
        let slot = slot_mut(&mut inner, element)?;
        Ok(apply_planned(slot, element, i64::from(planned)))
    }

    // ── Pause / resume ──────────────────────────────────────────────

    pub async fn pause(&self, element: &ElementId) -> StateResult<()> {
        let mut inner = self.inner.write().await;
        slot_mut(&mut inner, element)?.paused = true;
        Ok(())
    }

    pub async fn resume(&self, element: &ElementId) -> StateResult<()> {
        let mut inner = self.inner.write().await;
        slot_mut(&mut inner, element)?.paused = false;
        info!(%element, "element resumed");
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn element(&self, element: &ElementId) -> Option<ElementView> {
        let inner = self.inner.read().await;
        inner.elements.get(element).map(|s| view(element, s))
    }

    pub async fn opstring(&self, name: &str) -> Option<OperationalString> {
        self.inner.read().await.opstrings.get(name).cloned()
    }

    /// Serving instances of `element` per hosting node.
    pub async fn hosted_counts(&self, element: &ElementId) -> HashMap<NodeId, u32> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        if let Some(slot) = inner.elements.get(element) {
            for r in slot.records.values().filter(|r| r.state.is_serving()) {
                if let Some(node) = &r.node_id {
                    *counts.entry(node.clone()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Serving instances hosted on `node`, across all elements.
    pub async fn instances_on_node(&self, node: &str) -> Vec<InstanceRecord> {
        let inner = self.inner.read().await;
        inner
            .elements
            .values()
            .flat_map(|s| s.records.values())
            .filter(|r| r.state.is_serving() && r.node_id.as_deref() == Some(node))
            .cloned()
            .collect()
    }

    pub async fn snapshot(&self) -> TrackerSnapshot {
        let inner = self.inner.read().await;
        TrackerSnapshot {
            opstrings: inner
                .opstrings
                .iter()
                .map(|(k, v)| (k.clone(), v.version.clone()))
                .collect(),
            elements: inner.elements.iter().map(|(id, s)| view(id, s)).collect(),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn slot_mut<'a>(inner: &'a mut TrackerInner, element: &ElementId) -> StateResult<&'a mut ElementSlot> {
    inner
        .elements
        .get_mut(element)
        .ok_or_else(|| StateError::ElementNotFound(element.to_string()))
}

fn apply_planned(slot: &mut ElementSlot, element: &ElementId, requested: i64) -> PlannedChange {
    let from = slot.spec.planned;
    let to = slot.spec.bounds.clamp(requested);
    slot.spec.planned = to;

    let change = PlannedChange { from, to, requested };
    if change.clamped() {
        info!(
            %element,
            requested,
            to,
            min = slot.spec.bounds.min,
            max = slot.spec.bounds.max,
            "planned count clamped"
        );
    }
    change
}

fn view(id: &ElementId, slot: &ElementSlot) -> ElementView {
    ElementView {
        id: id.clone(),
        spec: slot.spec.clone(),
        paused: slot.paused,
        records: slot.records.values().cloned().collect(),
    }
}

fn terminate_all(slot: ElementSlot) -> Vec<InstanceRecord> {
    let now = epoch_millis();
    slot.records
        .into_values()
        .map(|mut r| {
            r.state = InstanceState::Terminated;
            r.updated_at = now;
            r
        })
        .collect()
}

/// Pause the element and build the violation error.
fn violation(slot: &mut ElementSlot, element: &ElementId, detail: String) -> StateError {
    slot.paused = true;
    error!(%element, %detail, "internal consistency violated, provisioning paused");
    StateError::InvariantViolation {
        element: element.to_string(),
        detail,
    }
}

fn not_found(element: &ElementId, instance: InstanceId) -> StateError {
    StateError::InstanceNotFound {
        element: element.to_string(),
        instance,
    }
}

fn illegal(record: &InstanceRecord, to: InstanceState) -> StateError {
    StateError::IllegalTransition {
        element: record.element.to_string(),
        instance: record.instance_id,
        from: format!("{:?}", record.state),
        to: format!("{to:?}"),
    }
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
