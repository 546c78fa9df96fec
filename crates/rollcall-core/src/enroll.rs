//! Enrollment: validate a candidate frame and commit a new gallery entry.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::gallery::{FaceGallery, GalleryError};
use crate::matcher::Matcher;
use crate::types::FaceRecord;
use image::GrayImage;
use std::fmt;
use thiserror::Error;

/// Why an enrollment attempt was turned down. Shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    EmptyLabel,
    /// The label cannot be used as a storage key (path separators, control
    /// characters, leading dot).
    InvalidLabel(String),
    /// The face in the frame already matches this enrolled identity.
    AlreadyRegistered(String),
    /// Frame must contain exactly one face; carries the count seen.
    FaceCountInvalid(usize),
    /// Another face is already enrolled under this label.
    LabelTaken(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::EmptyLabel => f.write_str("enter a name first"),
            Rejection::InvalidLabel(label) => write!(f, "'{label}' cannot be used as a name"),
            Rejection::AlreadyRegistered(existing) => {
                write!(f, "face already registered as {existing}")
            }
            Rejection::FaceCountInvalid(0) => f.write_str("no face in view"),
            Rejection::FaceCountInvalid(_) => f.write_str("show only one face"),
            Rejection::LabelTaken(label) => write!(f, "name {label} is already taken"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Enrollment {
    Registered(FaceRecord),
    Rejected(Rejection),
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
}

/// Trim and check a label. Labels become file names in the gallery.
pub fn normalize_label(label: &str) -> Result<&str, Rejection> {
    let label = label.trim();
    if label.is_empty() {
        return Err(Rejection::EmptyLabel);
    }
    let unusable = label.starts_with('.')
        || label
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if unusable {
        return Err(Rejection::InvalidLabel(label.to_string()));
    }
    Ok(label)
}

/// Enroll the single face in `frame` under `label`.
///
/// Checks run in order and stop at the first failure: usable label, face not
/// already enrolled under any name, exactly one face in the frame. The
/// gallery is re-read for the duplicate check.
pub fn register_face(
    label: &str,
    frame: &GrayImage,
    encoder: &mut dyn FaceEncoder,
    matcher: &dyn Matcher,
    gallery: &dyn FaceGallery,
) -> Result<Enrollment, EnrollError> {
    let label = match normalize_label(label) {
        Ok(label) => label,
        Err(rejection) => return Ok(Enrollment::Rejected(rejection)),
    };

    let known = gallery.load_all(&mut *encoder)?;
    let mut faces = encoder.encode(frame)?;

    // Any detected face that is already enrolled blocks the enrollment.
    if let Some(existing) = faces
        .iter()
        .find_map(|face| matcher.classify(&face.embedding, &known).identity.as_known().map(str::to_string))
    {
        tracing::info!(label, existing = %existing, "enrollment rejected: face already registered");
        return Ok(Enrollment::Rejected(Rejection::AlreadyRegistered(existing)));
    }

    if faces.len() != 1 {
        tracing::info!(label, faces = faces.len(), "enrollment rejected: face count");
        return Ok(Enrollment::Rejected(Rejection::FaceCountInvalid(faces.len())));
    }

    let record = FaceRecord {
        identity: label.to_string(),
        embedding: faces.remove(0).embedding,
    };

    match gallery.append(&record, frame) {
        Ok(()) => {}
        Err(GalleryError::DuplicateIdentity(taken)) => {
            tracing::info!(label, "enrollment rejected: label taken");
            return Ok(Enrollment::Rejected(Rejection::LabelTaken(taken)));
        }
        Err(e) => return Err(e.into()),
    }

    tracing::info!(identity = %record.identity, "face enrolled");
    Ok(Enrollment::Registered(record))
}
