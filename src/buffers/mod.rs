//! The two per-source ring-buffer data planes: an analysis ring producing
//! fixed-size overlapping chunks for the detector, and a capture ring
//! supporting sub-second time-indexed segment reads for archival.

pub mod analysis;
pub mod capture;

pub use analysis::{AnalysisParams, AnalysisRegistry, AnalysisRing};
pub use capture::{CaptureRegistry, CaptureRing, CaptureSegment};
