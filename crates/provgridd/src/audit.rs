//! Report sinks assembled by the daemon.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use serde::Serialize;
use tracing::warn;

use provgrid_state::{Report, ReportSink, SharedSink, epoch_millis};

#[derive(Serialize)]
struct Line<'a> {
    at: u64,
    #[serde(flatten)]
    record: &'a Report,
}

/// Appends every report as one JSON object per line.
pub struct JsonLinesSink {
    out: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening audit log {}", path.display()))?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write(&self, record: &Report) -> std::io::Result<()> {
        let line = serde_json::to_string(&Line {
            at: epoch_millis(),
            record,
        })?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

impl ReportSink for JsonLinesSink {
    fn report(&self, record: Report) {
        if let Err(e) = self.write(&record) {
            warn!(error = %e, "audit log write failed");
        }
    }
}

/// Delivers each report to every inner sink, in order.
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }
}

impl ReportSink for FanoutSink {
    fn report(&self, record: Report) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.report(record.clone());
            }
            last.report(record);
        }
    }
}
