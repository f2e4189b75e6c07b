//! Sample collection for one labeled subject.
//!
//! The [`Collector`] moves `Idle → Collecting → Flushing → Idle`. While
//! collecting it turns one detection per tick into a [`Sample`]; once the
//! target count is reached the session is written to the label store and
//! the collector returns to idle.
//!
//! Only the first detection of a frame is ever sampled. There is no check
//! that it belongs to the subject the session was started for, so sessions
//! assume one person in front of the camera at a time.

use crate::oracle::Detection;
use crate::store::{validate_label, LabelRecord, LabelStore, StoreError};
use crate::types::Sample;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    InvalidLabel(StoreError),
    #[error("failed to store collected samples: {0}")]
    Store(#[source] StoreError),
}

/// Samples gathered so far for one label.
#[derive(Debug, Clone)]
pub struct CollectionSession {
    label: String,
    samples: Vec<Sample>,
    target: usize,
}

impl CollectionSession {
    pub fn new(label: impl Into<String>, target: usize) -> Self {
        Self {
            label: label.into(),
            samples: Vec::with_capacity(target),
            target,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn is_complete(&self) -> bool {
        self.samples.len() >= self.target
    }

    /// Append a sample unless the session is already complete.
    /// Returns whether the sample was accepted.
    pub fn push(&mut self, sample: Sample) -> bool {
        if self.is_complete() {
            return false;
        }
        self.samples.push(sample);
        true
    }

    pub fn into_record(self, collected_at: DateTime<Utc>) -> LabelRecord {
        LabelRecord {
            label: self.label,
            samples: self.samples,
            collected_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    Collecting,
    Flushing,
}

/// Outcome of feeding one tick's detection to the collector.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Not collecting, or no face in this tick.
    Ignored,
    Sampled { collected: usize, required: usize },
    /// Target reached and the record was written.
    Completed(LabelRecord),
}

/// Collection state machine owned by the acquisition loop.
#[derive(Debug)]
pub struct Collector {
    state: CollectorState,
    session: Option<CollectionSession>,
    required_samples: usize,
}

impl Collector {
    /// `required_samples` is clamped to at least one.
    pub fn new(required_samples: usize) -> Self {
        Self {
            state: CollectorState::Idle,
            session: None,
            required_samples: required_samples.max(1),
        }
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    pub fn required_samples(&self) -> usize {
        self.required_samples
    }

    pub fn session(&self) -> Option<&CollectionSession> {
        self.session.as_ref()
    }

    /// Begin collecting for `label`, discarding any session in progress.
    pub fn start(&mut self, label: &str) -> Result<(), SessionError> {
        validate_label(label).map_err(SessionError::InvalidLabel)?;
        if let Some(previous) = self.session.take() {
            tracing::info!(
                label = previous.label(),
                collected = previous.samples().len(),
                "discarding unfinished collection session"
            );
        }
        self.session = Some(CollectionSession::new(label, self.required_samples));
        self.state = CollectorState::Collecting;
        tracing::info!(label, required = self.required_samples, "collection started");
        Ok(())
    }

    /// Abandon the current session. Nothing is written.
    pub fn stop(&mut self) -> Option<CollectionSession> {
        self.state = CollectorState::Idle;
        let session = self.session.take();
        if let Some(s) = &session {
            tracing::info!(label = s.label(), collected = s.samples().len(), "collection stopped");
        }
        session
    }

    /// Feed the first detection of a tick.
    ///
    /// On reaching the target the record is written to `store`. The collector
    /// is idle afterwards whether or not the write succeeded; on failure
    /// nothing is stored and the samples are dropped.
    pub fn on_detection<S: LabelStore + ?Sized>(
        &mut self,
        detection: Option<&Detection>,
        captured_at: DateTime<Utc>,
        store: &mut S,
    ) -> Result<Progress, SessionError> {
        if self.state != CollectorState::Collecting {
            return Ok(Progress::Ignored);
        }
        let (Some(detection), Some(session)) = (detection, self.session.as_mut()) else {
            return Ok(Progress::Ignored);
        };

        let sample = Sample::new(
            detection.landmarks.clone(),
            detection.descriptor.clone(),
            captured_at,
        );
        if !session.push(sample) {
            return Ok(Progress::Ignored);
        }
        let collected = session.samples().len();
        tracing::debug!(label = session.label(), collected, required = session.target(), "sample collected");

        if !session.is_complete() {
            return Ok(Progress::Sampled {
                collected,
                required: session.target(),
            });
        }

        self.state = CollectorState::Flushing;
        let record = match self.session.take() {
            Some(session) => session.into_record(Utc::now()),
            None => {
                self.state = CollectorState::Idle;
                return Ok(Progress::Ignored);
            }
        };
        let written = store.put(&record);
        self.state = CollectorState::Idle;
        written.map_err(SessionError::Store)?;
        Ok(Progress::Completed(record))
    }
}
