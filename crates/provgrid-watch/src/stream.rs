//! Bounded per-watch sample history with sequence numbers.
//!
//! Each (element, watch) series keeps the newest `capacity` samples,
//! ordered by sample timestamp rather than arrival. Every append gets a
//! global sequence number so consumers can replay what they have not
//! seen yet.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use provgrid_state::{ElementId, WatchSample};

/// How a window of samples is reduced to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    #[default]
    Latest,
    Mean,
    Min,
    Max,
}

impl Aggregate {
    /// Reduce `values` (oldest first). `None` when empty.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        Some(match self {
            Self::Latest => values[values.len() - 1],
            Self::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    sample: WatchSample,
}

/// Sample history, owned by a single consumer.
#[derive(Debug)]
pub struct MetricsStream {
    capacity: usize,
    series: HashMap<(ElementId, String), VecDeque<Entry>>,
    next_seq: u64,
}

impl Default for MetricsStream {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MetricsStream {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Insert a sample at its timestamp position; returns its sequence
    /// number. A late sample older than a full series is dropped.
    pub fn append(&mut self, sample: WatchSample) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let series = self
            .series
            .entry((sample.element.clone(), sample.watch.clone()))
            .or_default();
        let mut at = series.partition_point(|e| e.sample.timestamp <= sample.timestamp);
        if series.len() == self.capacity {
            if at == 0 {
                return seq;
            }
            series.pop_front();
            at -= 1;
        }
        series.insert(at, Entry { seq, sample });
        seq
    }

    /// Samples of one series with sequence number >= `since`.
    pub fn replay(&self, element: &ElementId, watch: &str, since: u64) -> Vec<WatchSample> {
        self.entries(element, watch)
            .filter(|e| e.seq >= since)
            .map(|e| e.sample.clone())
            .collect()
    }

    /// Values of the newest `n` samples, oldest first.
    pub fn window(&self, element: &ElementId, watch: &str, n: usize) -> Vec<f64> {
        let values: Vec<f64> = self.entries(element, watch).map(|e| e.sample.value).collect();
        let start = values.len().saturating_sub(n.max(1));
        values[start..].to_vec()
    }

    pub fn latest(&self, element: &ElementId, watch: &str) -> Option<&WatchSample> {
        self.entries(element, watch).next_back().map(|e| &e.sample)
    }

    /// Reduce the newest `n` samples of a series.
    pub fn aggregate(
        &self,
        element: &ElementId,
        watch: &str,
        aggregate: Aggregate,
        n: usize,
    ) -> Option<f64> {
        aggregate.apply(&self.window(element, watch, n))
    }

    /// Drop every series of `element`.
    pub fn forget(&mut self, element: &ElementId) {
        self.series.retain(|(e, _), _| e != element);
    }

    /// Drop samples of one instance, e.g. after it is retired.
    pub fn forget_instance(&mut self, element: &ElementId, instance_id: u64) {
        for ((e, _), series) in self.series.iter_mut() {
            if e == element {
                series.retain(|entry| entry.sample.instance_id != instance_id);
            }
        }
    }

    pub fn len(&self, element: &ElementId, watch: &str) -> usize {
        self.entries(element, watch).count()
    }

    pub fn is_empty(&self) -> bool {
        self.series.values().all(VecDeque::is_empty)
    }

    fn entries(&self, element: &ElementId, watch: &str) -> std::collections::vec_deque::Iter<'_, Entry> {
        static EMPTY: VecDeque<Entry> = VecDeque::new();
        self.series
            .get(&(element.clone(), watch.to_string()))
            .unwrap_or(&EMPTY)
            .iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(instance_id: u64, value: f64, timestamp: u64) -> WatchSample {
        WatchSample {
            element: ElementId::new("shop", "api"),
            watch: "cpu".to_string(),
            instance_id,
            value,
            timestamp,
        }
    }

    fn api() -> ElementId {
        ElementId::new("shop", "api")
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut stream = MetricsStream::new(3);
        for i in 0..5 {
            stream.append(sample(1, i as f64, i));
        }
        assert_eq!(stream.window(&api(), "cpu", 10), vec![2.0, 3.0, 4.0]);
        assert_eq!(stream.len(&api(), "cpu"), 3);
    }

    #[test]
    fn late_sample_lands_by_timestamp() {
        let mut stream = MetricsStream::new(3);
        stream.append(sample(1, 0.5, 100));
        stream.append(sample(1, 0.9, 300));
        stream.append(sample(1, 0.1, 200));

        assert_eq!(stream.latest(&api(), "cpu").map(|s| s.value), Some(0.9));
        assert_eq!(stream.aggregate(&api(), "cpu", Aggregate::Latest, 1), Some(0.9));
        assert_eq!(stream.window(&api(), "cpu", 2), vec![0.1, 0.9]);

        // Full, and older than everything kept.
        stream.append(sample(1, 7.0, 50));
        assert_eq!(stream.window(&api(), "cpu", 10), vec![0.5, 0.1, 0.9]);

        stream.append(sample(1, 0.3, 250));
        assert_eq!(stream.window(&api(), "cpu", 10), vec![0.1, 0.3, 0.9]);
    }

    #[test]
    fn replay_from_sequence() {
        let mut stream = MetricsStream::new(10);
        stream.append(sample(1, 0.1, 1));
        let seq = stream.append(sample(1, 0.2, 2));
        stream.append(sample(1, 0.3, 3));

        let replayed = stream.replay(&api(), "cpu", seq);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].value, 0.2);
    }

    #[test]
    fn aggregates_over_window() {
        let mut stream = MetricsStream::new(10);
        for (i, v) in [0.2, 0.4, 0.9, 0.5].iter().enumerate() {
            stream.append(sample(1, *v, i as u64));
        }
        assert_eq!(stream.aggregate(&api(), "cpu", Aggregate::Latest, 3), Some(0.5));
        assert_eq!(stream.aggregate(&api(), "cpu", Aggregate::Max, 3), Some(0.9));
        assert_eq!(stream.aggregate(&api(), "cpu", Aggregate::Min, 3), Some(0.4));
        let mean = stream.aggregate(&api(), "cpu", Aggregate::Mean, 2).unwrap();
        assert!((mean - 0.7).abs() < 1e-9);
        assert_eq!(stream.aggregate(&api(), "mem", Aggregate::Mean, 2), None);
    }

    #[test]
    fn forget_instance_and_element() {
        let mut stream = MetricsStream::new(10);
        stream.append(sample(1, 0.1, 1));
        stream.append(sample(2, 0.2, 2));

        stream.forget_instance(&api(), 1);
        assert_eq!(stream.window(&api(), "cpu", 10), vec![0.2]);

        stream.forget(&api());
        assert!(stream.is_empty());
        assert!(stream.latest(&api(), "cpu").is_none());
    }
}
