//! rollcall-core: face matching and attendance bookkeeping.
//!
//! Faces are encoded with SCRFD + ArcFace via ONNX Runtime and matched by
//! Euclidean distance against a gallery of enrolled reference images.
//! Recognized people check in and out through a per-identity CSV ledger.

pub mod detector;
pub mod encoder;
pub mod enroll;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use encoder::{classify_frame, EncodedFace, EncoderError, FaceEncoder, FrameClassification, OnnxEncoder};
pub use enroll::{register_face, EnrollError, Enrollment, Rejection};
pub use gallery::{DirGallery, FaceGallery, GalleryError};
pub use ledger::{
    mark_attendance, AttendanceEvent, AttendanceKind, AttendanceRejection, CsvLedger, Ledger,
    LedgerError, Marking,
};
pub use matcher::{DistanceMatcher, MatchOutcome, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use types::{BoundingBox, Embedding, FaceRecord, Identity};

use std::path::PathBuf;

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// Gallery directory inside a data directory.
pub fn faces_dir(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("faces")
}

/// Ledger directory inside a data directory.
pub fn attendance_dir(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("attendance")
}
