//! Experiment tracking sinks: a local JSONL metrics log and an HTTP dashboard.

use crate::error::{TrainError, TrainResult};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Named scalar metrics, e.g. `train/loss`.
pub type Metrics = BTreeMap<String, f64>;

/// One logged row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRecord {
    pub step: Option<u64>,
    pub timestamp_ms: u64,
    pub metrics: Metrics,
}

impl MetricRecord {
    pub fn now(metrics: &Metrics, step: Option<u64>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            step,
            timestamp_ms,
            metrics: metrics.clone(),
        }
    }
}

/// Destination for run metrics. Only rank 0 owns one.
pub trait RunTracker: Send {
    fn log(&mut self, metrics: &Metrics, step: Option<u64>) -> TrainResult<()>;

    fn finish(&mut self) -> TrainResult<()> {
        Ok(())
    }
}

/// Appends one JSON object per call to a file.
#[derive(Debug)]
pub struct JsonlTracker {
    path: PathBuf,
    file: fs::File,
}

impl JsonlTracker {
    pub fn create(path: impl AsRef<Path>) -> TrainResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| TrainError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| TrainError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RunTracker for JsonlTracker {
    fn log(&mut self, metrics: &Metrics, step: Option<u64>) -> TrainResult<()> {
        let line = serde_json::to_string(&MetricRecord::now(metrics, step))?;
        writeln!(self.file, "{line}").map_err(|source| TrainError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn finish(&mut self) -> TrainResult<()> {
        self.file.flush().map_err(|source| TrainError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Read logged rows back, keeping the last `limit` when given. Malformed lines are skipped.
pub fn read_metrics(path: &Path, limit: Option<usize>) -> TrainResult<Vec<MetricRecord>> {
    let file = fs::File::open(path).map_err(|source| TrainError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = io::BufReader::new(file);
    let mut rows: Vec<MetricRecord> = reader
        .lines()
        .map_while(Result::ok)
        .filter_map(|line| serde_json::from_str(&line).ok())
        .collect();
    if let Some(n) = limit {
        if rows.len() > n {
            rows.drain(0..rows.len().saturating_sub(n));
        }
    }
    Ok(rows)
}

#[derive(Serialize)]
struct HttpPayload<'a> {
    project: &'a str,
    run: &'a str,
    #[serde(flatten)]
    record: MetricRecord,
}

/// Consecutive failed posts after which the dashboard is given up for the run.
pub const MAX_CONSECUTIVE_FAILURES: usize = 3;

const QUEUE_DEPTH: usize = 1024;

struct HttpSender {
    url: String,
    project: String,
    run: String,
    client: reqwest::blocking::Client,
    failures: Arc<AtomicUsize>,
}

impl HttpSender {
    fn run(self, rx: Receiver<MetricRecord>) {
        let mut consecutive = 0usize;
        for record in rx {
            if consecutive >= MAX_CONSECUTIVE_FAILURES {
                continue;
            }
            let payload = HttpPayload {
                project: &self.project,
                run: &self.run,
                record,
            };
            let result = self
                .client
                .post(&self.url)
                .json(&payload)
                .send()
                .and_then(|resp| resp.error_for_status());
            match result {
                Ok(_) => consecutive = 0,
                Err(err) => {
                    consecutive += 1;
                    let total = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(url = %self.url, failures = total, "dashboard log failed: {err}");
                    if consecutive == MAX_CONSECUTIVE_FAILURES {
                        tracing::warn!(
                            url = %self.url,
                            "dashboard unreachable after {consecutive} attempts; no further metrics will be posted"
                        );
                    }
                }
            }
        }
    }
}

/// POSTs each record to a dashboard endpoint from a background thread.
///
/// `log` only enqueues, so a slow or silent dashboard never holds up a training step.
/// Failures are logged and dropped; `finish` waits for queued records to be sent.
pub struct HttpTracker {
    tx: Option<Sender<MetricRecord>>,
    worker: Option<JoinHandle<()>>,
    failures: Arc<AtomicUsize>,
    dropped: usize,
}

impl HttpTracker {
    pub fn new(
        url: impl Into<String>,
        project: impl Into<String>,
        run: impl Into<String>,
    ) -> TrainResult<Self> {
        Self::with_timeout(url, project, run, Duration::from_secs(5))
    }

    pub fn with_timeout(
        url: impl Into<String>,
        project: impl Into<String>,
        run: impl Into<String>,
        timeout: Duration,
    ) -> TrainResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("resnet-trainer/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| TrainError::Tracker(format!("failed to create HTTP client: {e}")))?;
        let failures = Arc::new(AtomicUsize::new(0));
        let sender = HttpSender {
            url: url.into(),
            project: project.into(),
            run: run.into(),
            client,
            failures: Arc::clone(&failures),
        };
        let (tx, rx) = bounded(QUEUE_DEPTH);
        let worker = thread::Builder::new()
            .name("dashboard-tracker".into())
            .spawn(move || sender.run(rx))
            .map_err(|e| TrainError::Tracker(format!("failed to start tracker thread: {e}")))?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            failures,
            dropped: 0,
        })
    }

    /// Posts that failed so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Records discarded because the send queue was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    fn shutdown(&mut self) -> TrainResult<()> {
        drop(self.tx.take());
        match self.worker.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| TrainError::Tracker("tracker thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl RunTracker for HttpTracker {
    fn log(&mut self, metrics: &Metrics, step: Option<u64>) -> TrainResult<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        match tx.try_send(MetricRecord::now(metrics, step)) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                if self.dropped == 0 {
                    tracing::warn!("dashboard queue full; dropping metrics until it drains");
                }
                self.dropped += 1;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> TrainResult<()> {
        self.shutdown()
    }
}

impl Drop for HttpTracker {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Fans each call out to several trackers; the first error is returned after all have run.
#[derive(Default)]
pub struct TrackerSet {
    trackers: Vec<Box<dyn RunTracker>>,
}

impl TrackerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tracker: Box<dyn RunTracker>) {
        self.trackers.push(tracker);
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

impl RunTracker for TrackerSet {
    fn log(&mut self, metrics: &Metrics, step: Option<u64>) -> TrainResult<()> {
        let mut first_err = None;
        for tracker in &mut self.trackers {
            if let Err(err) = tracker.log(metrics, step) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn finish(&mut self) -> TrainResult<()> {
        let mut first_err = None;
        for tracker in &mut self.trackers {
            if let Err(err) = tracker.finish() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
