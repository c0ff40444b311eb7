//! Watch monitor: turns metric samples into threshold events.
//!
//! Samples arrive two ways: pushed through [`WatchMonitor::ingest`], or
//! polled from a [`MetricSource`] by a background timer per
//! (element, watch, instance) at the SLA's sampling cadence. Both paths
//! go through the same threshold trackers and forward every sample and
//! every resulting event, in order, on one signal channel for the scaling
//! evaluator. Threshold events also go to the reporting sink.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use provgrid_state::{
    ElementId, InstanceId, Report, SharedSink, SlaSpec, ThresholdEvent, WatchSample, epoch_millis,
};

use crate::error::{WatchError, WatchResult};
use crate::threshold::ThresholdTracker;

/// What the monitor forwards to the scaling evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchSignal {
    Sample(WatchSample),
    Threshold(ThresholdEvent),
}

pub type SignalSender = mpsc::UnboundedSender<WatchSignal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<WatchSignal>;

/// Future returned by a [`MetricSource`] read.
pub type MetricFuture = Pin<Box<dyn Future<Output = Option<f64>> + Send>>;

/// Pull-style metric provider used by the watch timers.
pub trait MetricSource: Send + Sync {
    /// Current value of `watch` on one instance, if available.
    fn sample(&self, element: &ElementId, watch: &str, instance_id: InstanceId) -> MetricFuture;
}

type WatchKey = (ElementId, String, InstanceId);

/// Per-watch timer state.
struct TimerSlot {
    /// Handle to the background sampling task.
    handle: JoinHandle<()>,
    /// Shutdown signal for this timer.
    shutdown_tx: watch::Sender<bool>,
}

/// Threshold state shared by the push path and the timers.
struct MonitorCore {
    slas: Mutex<HashMap<ElementId, Vec<SlaSpec>>>,
    trackers: Mutex<HashMap<WatchKey, ThresholdTracker>>,
    signals: SignalSender,
    sink: SharedSink,
}

impl MonitorCore {
    fn ingest(&self, sample: WatchSample) -> WatchResult<Vec<ThresholdEvent>> {
        let sla = {
            let slas = self.slas.lock().unwrap_or_else(PoisonError::into_inner);
            let specs = slas
                .get(&sample.element)
                .ok_or_else(|| WatchError::UnknownElement(sample.element.to_string()))?;
            specs.iter().find(|s| s.watch == sample.watch).cloned()
        };

        // One critical section per sample keeps per-key delivery ordered.
        let mut trackers = self.trackers.lock().unwrap_or_else(PoisonError::into_inner);
        let events = match &sla {
            Some(sla) => trackers
                .entry((sample.element.clone(), sample.watch.clone(), sample.instance_id))
                .or_insert_with(|| ThresholdTracker::new(sla))
                .observe(&sample),
            None => Vec::new(),
        };

        if self.signals.send(WatchSignal::Sample(sample)).is_err() {
            debug!("signal receiver closed, sample dropped");
        }
        for event in &events {
            debug!(
                element = %event.element,
                watch = %event.watch,
                instance = event.instance_id,
                direction = ?event.direction,
                value = event.value,
                "threshold transition"
            );
            self.sink.report(Report::Threshold(event.clone()));
            if self.signals.send(WatchSignal::Threshold(event.clone())).is_err() {
                debug!("signal receiver closed, event dropped");
            }
        }
        drop(trackers);
        Ok(events)
    }
}

/// Manages watch timers and threshold trackers for all elements.
pub struct WatchMonitor {
    core: Arc<MonitorCore>,
    /// Active timers: (element, watch, instance) → slot.
    timers: Arc<RwLock<HashMap<WatchKey, TimerSlot>>>,
    source: Option<Arc<dyn MetricSource>>,
}

impl WatchMonitor {
    /// Create a monitor forwarding to `signals`.
    pub fn new(signals: SignalSender, sink: SharedSink) -> Self {
        Self {
            core: Arc::new(MonitorCore {
                slas: Mutex::new(HashMap::new()),
                trackers: Mutex::new(HashMap::new()),
                signals,
                sink,
            }),
            timers: Arc::new(RwLock::new(HashMap::new())),
            source: None,
        }
    }

    /// Poll `source` on per-watch timers for watched instances.
    pub fn with_source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Register (or replace) an element's SLA set.
    ///
    /// Existing trackers keep their state under the new thresholds;
    /// trackers for watches no longer declared are dropped.
    pub fn register_element(&self, element: &ElementId, slas: &[SlaSpec]) -> WatchResult<()> {
        for sla in slas {
            sla.validate(&element.name)?;
        }
        self.core
            .slas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(element.clone(), slas.to_vec());

        let mut trackers = self.core.trackers.lock().unwrap_or_else(PoisonError::into_inner);
        trackers.retain(|(e, watch, _), tracker| {
            if e != element {
                return true;
            }
            match slas.iter().find(|s| &s.watch == watch) {
                Some(sla) => {
                    tracker.reconfigure(sla);
                    true
                }
                None => false,
            }
        });
        debug!(%element, watches = slas.len(), "element watches registered");
        Ok(())
    }

    /// Feed a pushed sample. Returns the threshold events it caused.
    pub fn ingest(&self, sample: WatchSample) -> WatchResult<Vec<ThresholdEvent>> {
        self.core.ingest(sample)
    }

    /// Start sampling timers for one instance (no-op without a source).
    pub async fn watch_instance(&self, element: &ElementId, instance_id: InstanceId) {
        let Some(source) = self.source.clone() else {
            return;
        };
        let slas = self
            .core
            .slas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(element)
            .cloned()
            .unwrap_or_default();

        let mut timers = self.timers.write().await;
        for sla in slas {
            let key = (element.clone(), sla.watch.clone(), instance_id);
            if timers.contains_key(&key) {
                continue;
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(run_watch_loop(
                key.clone(),
                sla.sample_interval(),
                Arc::clone(&source),
                Arc::clone(&self.core),
                shutdown_rx,
            ));
            timers.insert(
                key,
                TimerSlot {
                    handle,
                    shutdown_tx,
                },
            );
            debug!(%element, watch = %sla.watch, instance = instance_id, "watch timer started");
        }
    }

    /// Stop timers and drop threshold state for one instance.
    pub async fn unwatch_instance(&self, element: &ElementId, instance_id: InstanceId) {
        self.stop_where(|(e, _, i)| e == element && *i == instance_id)
            .await;
        self.core
            .trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(e, _, i), _| !(e == element && *i == instance_id));
    }

    /// Stop everything for an element and forget its SLAs.
    pub async fn unregister_element(&self, element: &ElementId) {
        self.stop_where(|(e, _, _)| e == element).await;
        self.core
            .trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(e, _, _), _| e != element);
        self.core
            .slas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(element);
        info!(%element, "element watches stopped");
    }

    async fn stop_where(&self, pred: impl Fn(&WatchKey) -> bool) {
        let mut timers = self.timers.write().await;
        let keys: Vec<WatchKey> = timers.keys().filter(|k| pred(k)).cloned().collect();
        for key in keys {
            if let Some(slot) = timers.remove(&key) {
                let _ = slot.shutdown_tx.send(true);
                slot.handle.abort();
            }
        }
    }

    /// Stop all timers (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut timers = self.timers.write().await;
        for ((element, watch, instance), slot) in timers.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%element, %watch, instance, "watch timer stopped");
        }
        info!("all watch timers stopped");
    }

    /// Number of running timers.
    pub async fn active_timers(&self) -> usize {
        self.timers.read().await.len()
    }

    /// Whether any timer runs for the instance.
    pub async fn is_watching(&self, element: &ElementId, instance_id: InstanceId) -> bool {
        self.timers
            .read()
            .await
            .keys()
            .any(|(e, _, i)| e == element && *i == instance_id)
    }
}

/// The sampling loop for a single (element, watch, instance).
async fn run_watch_loop(
    key: WatchKey,
    interval: Duration,
    source: Arc<dyn MetricSource>,
    core: Arc<MonitorCore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (element, watch, instance_id) = key;
    debug!(%element, %watch, instance = instance_id, "watch loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let Some(value) = source.sample(&element, &watch, instance_id).await else {
                    continue;
                };
                let sample = WatchSample {
                    element: element.clone(),
                    watch: watch.clone(),
                    instance_id,
                    value,
                    timestamp: epoch_millis(),
                };
                if let Err(e) = core.ingest(sample) {
                    warn!(%element, %watch, error = %e, "watch loop stopping");
                    break;
                }
            }
            _ = shutdown.changed() => {
                debug!(%element, %watch, instance = instance_id, "watch loop shutting down");
                break;
            }
        }
    }
}
