//! Boundary to the external face-embedding oracle.
//!
//! Frame acquisition, detection and descriptor extraction happen outside this
//! crate. The traits here are the seams the acquisition loop calls through,
//! and [`Detection`] is the fixed-shape contract every oracle result must
//! satisfy before it reaches the collector or the matcher.

use crate::types::{BoundingBox, Descriptor, Point};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Descriptor length of the default recognition model.
pub const DEFAULT_DESCRIPTOR_LEN: usize = 128;
/// Landmark count of the default 68-point landmark model.
pub const DEFAULT_LANDMARK_COUNT: usize = 68;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("frame acquisition failed: {0}")]
    Acquisition(String),
    #[error("frame source exhausted")]
    Exhausted,
    #[error("detection failed: {0}")]
    DetectionFailed(String),
    #[error("malformed detection: {0}")]
    Malformed(String),
}

/// A frame handed from the frame source to the oracle.
///
/// The payload is opaque to this crate; only the oracle interprets it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
}

/// Shape every detection from the configured oracle must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OracleShape {
    pub descriptor_len: usize,
    pub landmark_count: usize,
}

impl Default for OracleShape {
    fn default() -> Self {
        Self {
            descriptor_len: DEFAULT_DESCRIPTOR_LEN,
            landmark_count: DEFAULT_LANDMARK_COUNT,
        }
    }
}

/// One detected face: box, landmarks and identity descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub landmarks: Vec<Point>,
    pub descriptor: Descriptor,
}

impl Detection {
    /// Check the detection against the oracle's declared shape.
    pub fn validate(&self, shape: &OracleShape) -> Result<(), OracleError> {
        if self.descriptor.len() != shape.descriptor_len {
            return Err(OracleError::Malformed(format!(
                "expected {}-dim descriptor, got {}",
                shape.descriptor_len,
                self.descriptor.len()
            )));
        }
        if !self.descriptor.is_finite() {
            return Err(OracleError::Malformed("descriptor has non-finite values".into()));
        }
        if self.landmarks.len() != shape.landmark_count {
            return Err(OracleError::Malformed(format!(
                "expected {} landmarks, got {}",
                shape.landmark_count,
                self.landmarks.len()
            )));
        }
        if self.landmarks.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(OracleError::Malformed("landmark has non-finite coordinates".into()));
        }
        let b = &self.bbox;
        if ![b.x, b.y, b.width, b.height].iter().all(|v| v.is_finite()) || b.width < 0.0 || b.height < 0.0 {
            return Err(OracleError::Malformed("bounding box is not a finite, non-negative rect".into()));
        }
        Ok(())
    }

    /// Map the detection geometry from frame size to display size.
    pub fn resized(&self, from: (u32, u32), to: (u32, u32)) -> Detection {
        let sx = if from.0 > 0 { to.0 as f32 / from.0 as f32 } else { 1.0 };
        let sy = if from.1 > 0 { to.1 as f32 / from.1 as f32 } else { 1.0 };
        Detection {
            bbox: self.bbox.scaled(sx, sy),
            landmarks: self
                .landmarks
                .iter()
                .map(|p| Point::new(p.x * sx, p.y * sy))
                .collect(),
            descriptor: self.descriptor.clone(),
        }
    }
}

/// Source of frames for the acquisition loop (camera, recording, feed).
pub trait FrameSource: Send {
    fn grab(&mut self) -> Result<Frame, OracleError>;
}

/// The external detection + landmark + descriptor capability.
pub trait EmbeddingOracle: Send {
    /// Detect all faces in `frame`, ordered as the oracle reports them.
    fn detect_all(&mut self, frame: &Frame) -> Result<Vec<Detection>, OracleError>;
}

/// One face overlay for the drawing surface.
#[derive(Debug, Clone)]
pub struct Overlay {
    pub bbox: BoundingBox,
    pub landmarks: Vec<Point>,
    pub label: Option<String>,
}

/// External renderer for detection boxes, landmarks and labels.
pub trait DrawingSurface: Send {
    fn draw(&mut self, overlays: &[Overlay]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(descriptor_len: usize, landmarks: usize) -> Detection {
        Detection {
            bbox: BoundingBox { x: 10.0, y: 10.0, width: 50.0, height: 60.0, confidence: 0.8 },
            landmarks: (0..landmarks).map(|i| Point::new(i as f32, i as f32)).collect(),
            descriptor: Descriptor::new(vec![0.1; descriptor_len]),
        }
    }

    #[test]
    fn test_validate_accepts_declared_shape() {
        let shape = OracleShape::default();
        assert!(detection(128, 68).validate(&shape).is_ok());
    }

    #[test]
    fn test_validate_rejects_wrong_descriptor_len() {
        let shape = OracleShape::default();
        let err = detection(127, 68).validate(&shape).unwrap_err();
        assert!(matches!(err, OracleError::Malformed(_)));
    }

    #[test]
    fn test_validate_rejects_wrong_landmark_count() {
        let shape = OracleShape::default();
        assert!(detection(128, 5).validate(&shape).is_err());
    }

    #[test]
    fn test_validate_rejects_nan_descriptor() {
        let shape = OracleShape { descriptor_len: 2, landmark_count: 0 };
        let mut d = detection(2, 0);
        d.descriptor.values[1] = f32::NAN;
        assert!(d.validate(&shape).is_err());
    }

    #[test]
    fn test_validate_rejects_negative_box() {
        let shape = OracleShape { descriptor_len: 2, landmark_count: 0 };
        let mut d = detection(2, 0);
        d.bbox.width = -1.0;
        assert!(d.validate(&shape).is_err());
    }

    #[test]
    fn test_resized_scales_geometry_only() {
        let d = detection(2, 1);
        let r = d.resized((640, 480), (320, 240));
        assert_eq!(r.bbox.x, 5.0);
        assert_eq!(r.bbox.height, 30.0);
        assert_eq!(r.landmarks[0], Point::new(0.0, 0.0));
        assert_eq!(r.descriptor, d.descriptor);
    }

    #[test]
    fn test_detection_wire_shape() {
        let json = r#"{
            "box": {"x": 1, "y": 2, "width": 3, "height": 4, "confidence": 0.9},
            "landmarks": [{"x": 1, "y": 1}],
            "descriptor": [0.5, 0.25]
        }"#;
        let d: Detection = serde_json::from_str(json).unwrap();
        assert_eq!(d.bbox.width, 3.0);
        assert_eq!(d.descriptor.values, vec![0.5, 0.25]);
    }
}
