//! Acquisition loop.
//!
//! One tokio task owns the collector, the label store and the active matcher.
//! A periodic tick hands the blocking frame grab and oracle call to the
//! blocking pool; the result comes back to the task, which routes it by the
//! current mode. At most one oracle call is in flight: a tick that fires
//! while the previous call is still running is skipped.

use chrono::{DateTime, Utc};
use facekeep_core::store::validate_label;
use facekeep_core::{
    Collector, Detection, DrawingSurface, EmbeddingOracle, FrameSource, LabelStore, MatchResult,
    MatcherBuilder, MatcherError, MatcherIndex, Metric, OracleError, Overlay, Progress,
    SessionError, StoreError,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Matcher(#[from] MatcherError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("collection for {0:?} was cancelled")]
    Cancelled(String),
    #[error("engine task exited")]
    ChannelClosed,
}

/// Tunables for the acquisition loop.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub capture_interval: Duration,
    pub required_samples: usize,
    pub match_threshold: f32,
    pub metric: Metric,
    pub descriptor_len: usize,
    pub display_size: Option<(u32, u32)>,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            capture_interval: config.capture_interval(),
            required_samples: config.required_samples,
            match_threshold: config.match_threshold,
            metric: config.metric,
            descriptor_len: config.descriptor_len,
            display_size: config.display_size(),
        }
    }
}

/// External collaborators the engine drives.
pub struct EngineParts {
    pub source: Box<dyn FrameSource>,
    pub oracle: Box<dyn EmbeddingOracle>,
    pub store: Box<dyn LabelStore>,
    pub surface: Box<dyn DrawingSurface>,
}

/// A completed collection session.
#[derive(Debug, Clone, Serialize)]
pub struct CollectOutcome {
    pub label: String,
    pub samples: usize,
    pub collected_at: DateTime<Utc>,
}

/// Matches for every face in one recognized frame.
#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    pub sequence: u64,
    pub matches: Vec<MatchResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub mode: &'static str,
    pub label: Option<String>,
    pub collected: usize,
    pub required: usize,
    pub labels_indexed: usize,
    pub last_matches: Vec<String>,
    pub ticks: u64,
    pub skipped_ticks: u64,
}

/// Messages sent from control surfaces to the engine task.
enum EngineRequest {
    Collect {
        label: String,
        reply: oneshot::Sender<Result<CollectOutcome, EngineError>>,
    },
    Recognize {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    ListLabels {
        reply: oneshot::Sender<Result<Vec<String>, EngineError>>,
    },
    RemoveLabel {
        label: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Clone-safe handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    events: broadcast::Sender<Recognition>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Start collecting for `label` and wait until the record is stored.
    pub async fn collect(&self, label: &str) -> Result<CollectOutcome, EngineError> {
        let label = label.to_string();
        self.request(|reply| EngineRequest::Collect { label, reply }).await?
    }

    /// Switch to recognition. Returns the number of indexed labels.
    pub async fn recognize(&self) -> Result<usize, EngineError> {
        self.request(|reply| EngineRequest::Recognize { reply }).await?
    }

    /// Return to standby. Returns false if already in standby.
    pub async fn stop(&self) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::Stop { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    pub async fn list_labels(&self) -> Result<Vec<String>, EngineError> {
        self.request(|reply| EngineRequest::ListLabels { reply }).await?
    }

    pub async fn remove_label(&self, label: &str) -> Result<(), EngineError> {
        let label = label.to_string();
        self.request(|reply| EngineRequest::RemoveLabel { label, reply }).await?
    }

    /// Subscribe to recognition results.
    pub fn subscribe(&self) -> broadcast::Receiver<Recognition> {
        self.events.subscribe()
    }
}

/// Spawn the engine on the current tokio runtime.
pub fn spawn_engine(parts: EngineParts, settings: EngineSettings) -> EngineHandle {
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);
    let (events, _) = broadcast::channel(16);

    let acquisition = Arc::new(Mutex::new(Acquisition {
        source: parts.source,
        oracle: parts.oracle,
    }));
    let engine = Engine {
        collector: Collector::new(settings.required_samples),
        store: parts.store,
        surface: parts.surface,
        mode: Mode::Standby,
        epoch: 0,
        last_matches: Vec::new(),
        ticks: 0,
        skipped_ticks: 0,
        events: events.clone(),
        settings,
    };

    tokio::spawn(engine.run(acquisition, rx));
    EngineHandle { tx, events }
}

struct Acquisition {
    source: Box<dyn FrameSource>,
    oracle: Box<dyn EmbeddingOracle>,
}

struct TickOutcome {
    epoch: u64,
    sequence: u64,
    frame_size: (u32, u32),
    detections: Vec<Detection>,
}

impl Acquisition {
    fn run_once(&mut self, epoch: u64) -> Result<TickOutcome, OracleError> {
        let frame = self.source.grab()?;
        let detections = self.oracle.detect_all(&frame)?;
        Ok(TickOutcome {
            epoch,
            sequence: frame.sequence,
            frame_size: (frame.width, frame.height),
            detections,
        })
    }
}

enum Mode {
    Standby,
    Collecting {
        reply: oneshot::Sender<Result<CollectOutcome, EngineError>>,
    },
    Recognizing(MatcherIndex),
}

impl Mode {
    fn name(&self) -> &'static str {
        match self {
            Mode::Standby => "standby",
            Mode::Collecting { .. } => "collecting",
            Mode::Recognizing(_) => "recognizing",
        }
    }
}

struct Engine {
    settings: EngineSettings,
    collector: Collector,
    store: Box<dyn LabelStore>,
    surface: Box<dyn DrawingSurface>,
    mode: Mode,
    /// Bumped on every mode change; results dispatched under an older epoch are not routed.
    epoch: u64,
    last_matches: Vec<String>,
    ticks: u64,
    skipped_ticks: u64,
    events: broadcast::Sender<Recognition>,
}

impl Engine {
    async fn run(mut self, acquisition: Arc<Mutex<Acquisition>>, mut rx: mpsc::Receiver<EngineRequest>) {
        let mut interval = tokio::time::interval(self.settings.capture_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let in_flight = Arc::new(AtomicBool::new(false));
        let (done_tx, mut done_rx) = mpsc::channel::<TickOutcome>(4);

        tracing::info!(
            interval_ms = self.settings.capture_interval.as_millis() as u64,
            required_samples = self.settings.required_samples,
            "acquisition loop started"
        );

        loop {
            tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => self.handle(req),
                    None => break,
                },
                _ = interval.tick() => self.dispatch_tick(&acquisition, &in_flight, &done_tx),
                Some(outcome) = done_rx.recv() => self.route(outcome),
            }
        }

        self.set_mode(Mode::Standby);
        tracing::info!("acquisition loop exiting");
    }

    fn dispatch_tick(
        &mut self,
        acquisition: &Arc<Mutex<Acquisition>>,
        in_flight: &Arc<AtomicBool>,
        done: &mpsc::Sender<TickOutcome>,
    ) {
        if in_flight.swap(true, Ordering::AcqRel) {
            self.skipped_ticks += 1;
            tracing::debug!("oracle call still in flight; skipping tick");
            return;
        }
        self.ticks += 1;

        let epoch = self.epoch;
        let acquisition = Arc::clone(acquisition);
        let in_flight = Arc::clone(in_flight);
        let done = done.clone();
        tokio::task::spawn_blocking(move || {
            let result = {
                let mut acq = acquisition.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                acq.run_once(epoch)
            };
            let outcome = match result {
                Ok(outcome) => Some(outcome),
                Err(OracleError::Exhausted) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "tick produced no detections");
                    None
                }
            };
            if let Some(outcome) = outcome {
                let _ = done.blocking_send(outcome);
            }
            in_flight.store(false, Ordering::Release);
        });
    }

    fn route(&mut self, outcome: TickOutcome) {
        let mut labels: Vec<Option<String>> = vec![None; outcome.detections.len()];

        if outcome.epoch != self.epoch {
            tracing::debug!(sequence = outcome.sequence, "result from a previous mode; not routed");
        } else {
            match std::mem::replace(&mut self.mode, Mode::Standby) {
                Mode::Standby => {}
                Mode::Collecting { reply } => {
                    self.mode = self.route_collect(reply, outcome.detections.first());
                }
                Mode::Recognizing(index) => {
                    labels = self.route_recognize(&index, &outcome);
                    self.mode = Mode::Recognizing(index);
                }
            }
        }

        self.draw(&outcome, labels);
    }

    fn route_collect(
        &mut self,
        reply: oneshot::Sender<Result<CollectOutcome, EngineError>>,
        detection: Option<&Detection>,
    ) -> Mode {
        match self
            .collector
            .on_detection(detection, Utc::now(), self.store.as_mut())
        {
            Ok(Progress::Completed(record)) => {
                tracing::info!(label = %record.label, samples = record.samples.len(), "collection complete");
                let _ = reply.send(Ok(CollectOutcome {
                    label: record.label,
                    samples: record.samples.len(),
                    collected_at: record.collected_at,
                }));
                self.epoch += 1;
                Mode::Standby
            }
            Ok(Progress::Sampled { .. } | Progress::Ignored) => Mode::Collecting { reply },
            Err(e) => {
                tracing::error!(error = %e, "collection failed");
                let _ = reply.send(Err(e.into()));
                self.epoch += 1;
                Mode::Standby
            }
        }
    }

    fn route_recognize(&mut self, index: &MatcherIndex, outcome: &TickOutcome) -> Vec<Option<String>> {
        let mut matches = Vec::with_capacity(outcome.detections.len());
        let labels = outcome
            .detections
            .iter()
            .map(|d| match index.find_best_match(&d.descriptor) {
                Ok(m) => {
                    let text = m.to_string();
                    matches.push(m);
                    Some(text)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cannot match detection");
                    None
                }
            })
            .collect();

        if !matches.is_empty() {
            self.last_matches = matches.iter().map(ToString::to_string).collect();
            tracing::debug!(sequence = outcome.sequence, matches = ?self.last_matches, "recognized");
            // No subscribers is fine.
            let _ = self.events.send(Recognition {
                sequence: outcome.sequence,
                matches,
            });
        }
        labels
    }

    fn draw(&mut self, outcome: &TickOutcome, labels: Vec<Option<String>>) {
        let display = self.settings.display_size.unwrap_or(outcome.frame_size);
        let overlays: Vec<Overlay> = outcome
            .detections
            .iter()
            .zip(labels)
            .map(|(d, label)| {
                let resized = d.resized(outcome.frame_size, display);
                Overlay {
                    bbox: resized.bbox,
                    landmarks: resized.landmarks,
                    label,
                }
            })
            .collect();
        self.surface.draw(&overlays);
    }

    /// Replace the current mode, cancelling a pending collection.
    fn set_mode(&mut self, mode: Mode) {
        if let Mode::Collecting { reply } = std::mem::replace(&mut self.mode, mode) {
            let label = self
                .collector
                .stop()
                .map(|s| s.label().to_string())
                .unwrap_or_default();
            let _ = reply.send(Err(EngineError::Cancelled(label)));
        }
        self.epoch += 1;
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Collect { label, reply } => {
                // Invalid labels must not disturb whatever is running.
                if let Err(e) = validate_label(&label) {
                    let _ = reply.send(Err(SessionError::InvalidLabel(e).into()));
                    return;
                }
                // The caller of a replaced session hears about it first.
                self.set_mode(Mode::Standby);
                match self.collector.start(&label) {
                    Ok(()) => self.set_mode(Mode::Collecting { reply }),
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            EngineRequest::Recognize { reply } => {
                let builder = MatcherBuilder::new(self.settings.match_threshold)
                    .metric(self.settings.metric)
                    .descriptor_len(self.settings.descriptor_len);
                match builder.build(self.store.as_ref()) {
                    Ok(index) => {
                        let count = index.label_count();
                        self.last_matches.clear();
                        self.set_mode(Mode::Recognizing(index));
                        tracing::info!(labels = count, "recognition started");
                        let _ = reply.send(Ok(count));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot start recognition");
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            EngineRequest::Stop { reply } => {
                let was_active = !matches!(self.mode, Mode::Standby);
                if was_active {
                    self.set_mode(Mode::Standby);
                    tracing::info!("returned to standby");
                }
                let _ = reply.send(was_active);
            }
            EngineRequest::Status { reply } => {
                let session = self.collector.session();
                let _ = reply.send(EngineStatus {
                    mode: self.mode.name(),
                    label: session.map(|s| s.label().to_string()),
                    collected: session.map_or(0, |s| s.samples().len()),
                    required: self.collector.required_samples(),
                    labels_indexed: match &self.mode {
                        Mode::Recognizing(index) => index.label_count(),
                        _ => 0,
                    },
                    last_matches: self.last_matches.clone(),
                    ticks: self.ticks,
                    skipped_ticks: self.skipped_ticks,
                });
            }
            EngineRequest::ListLabels { reply } => {
                let _ = reply.send(self.store.labels().map_err(Into::into));
            }
            EngineRequest::RemoveLabel { label, reply } => {
                let _ = reply.send(self.store.remove(&label).map_err(Into::into));
            }
        }
    }
}
