//! Detection feed: pre-computed oracle output read as JSON lines.
//!
//! Each line describes one frame:
//! `{"width": 640, "height": 480, "detections": [{"box": {..}, "landmarks": [..], "descriptor": [..]}]}`.
//! [`FeedSource`] turns lines into frames whose payload is the detection
//! list, and [`JsonOracle`] decodes and validates that payload.

use facekeep_core::{Detection, DrawingSurface, EmbeddingOracle, Frame, FrameSource, OracleError, OracleShape, Overlay};
use serde::Deserialize;
use std::io::{BufRead, BufReader};

#[derive(Deserialize)]
struct FeedLine {
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    detections: serde_json::Value,
}

/// Frame source reading one frame per non-empty line.
pub struct FeedSource<R> {
    reader: R,
    sequence: u64,
    exhausted: bool,
}

impl FeedSource<Box<dyn BufRead + Send>> {
    /// Open a feed file, or stdin for `-`.
    pub fn open(path: &str) -> std::io::Result<Self> {
        let reader: Box<dyn BufRead + Send> = if path == "-" {
            Box::new(BufReader::new(std::io::stdin()))
        } else {
            Box::new(BufReader::new(std::fs::File::open(path)?))
        };
        Ok(Self::new(reader))
    }
}

impl<R: BufRead> FeedSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            sequence: 0,
            exhausted: false,
        }
    }
}

impl<R: BufRead + Send> FrameSource for FeedSource<R> {
    fn grab(&mut self) -> Result<Frame, OracleError> {
        if self.exhausted {
            return Err(OracleError::Exhausted);
        }
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|e| OracleError::Acquisition(e.to_string()))?;
            if read == 0 {
                self.exhausted = true;
                tracing::info!(frames = self.sequence, "detection feed exhausted");
                return Err(OracleError::Exhausted);
            }
            if !line.trim().is_empty() {
                break;
            }
        }

        self.sequence += 1;
        let parsed: FeedLine = serde_json::from_str(line.trim())
            .map_err(|e| OracleError::Acquisition(format!("feed line {}: {e}", self.sequence)))?;
        let data = serde_json::to_vec(&parsed.detections)
            .map_err(|e| OracleError::Acquisition(e.to_string()))?;

        Ok(Frame {
            data,
            width: parsed.width,
            height: parsed.height,
            sequence: self.sequence,
        })
    }
}

/// Oracle adapter decoding detections carried in the frame payload.
pub struct JsonOracle {
    shape: OracleShape,
}

impl JsonOracle {
    pub fn new(shape: OracleShape) -> Self {
        Self { shape }
    }
}

impl EmbeddingOracle for JsonOracle {
    fn detect_all(&mut self, frame: &Frame) -> Result<Vec<Detection>, OracleError> {
        let detections: Vec<Detection> = serde_json::from_slice(&frame.data)
            .map_err(|e| OracleError::DetectionFailed(format!("frame {}: {e}", frame.sequence)))?;
        for detection in &detections {
            detection.validate(&self.shape)?;
        }
        Ok(detections)
    }
}

/// Drawing surface that emits overlays as trace events.
#[derive(Default)]
pub struct TraceSurface;

impl DrawingSurface for TraceSurface {
    fn draw(&mut self, overlays: &[Overlay]) {
        for overlay in overlays {
            tracing::trace!(
                x = overlay.bbox.x,
                y = overlay.bbox.y,
                width = overlay.bbox.width,
                height = overlay.bbox.height,
                landmarks = overlay.landmarks.len(),
                label = overlay.label.as_deref().unwrap_or(""),
                "overlay"
            );
        }
    }
}
