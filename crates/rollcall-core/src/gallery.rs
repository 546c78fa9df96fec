//! Face gallery: enrolled identities and their reference images.
//!
//! Encodings are not persisted. Every [`FaceGallery::load_all`] call decodes
//! the stored reference images and runs them through the encoder again, so a
//! fresh enrollment is visible to the next load without any invalidation.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::types::FaceRecord;
use image::{GrayImage, ImageFormat};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const REFERENCE_EXTENSION: &str = "jpg";

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write reference image: {0}")]
    Image(#[from] image::ImageError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("identity already enrolled: {0}")]
    DuplicateIdentity(String),
}

/// Durable set of enrolled faces.
pub trait FaceGallery {
    /// Read every enrolled face, re-deriving encodings from storage.
    fn load_all(&self, encoder: &mut dyn FaceEncoder) -> Result<Vec<FaceRecord>, GalleryError>;

    /// Persist a new enrollment. `reference` is the image the record's
    /// encoding was taken from. An identity that is already stored is
    /// rejected with [`GalleryError::DuplicateIdentity`], never overwritten.
    fn append(&self, record: &FaceRecord, reference: &GrayImage) -> Result<(), GalleryError>;

    /// Enrolled identity labels in stable order, without encoding anything.
    fn identities(&self) -> Result<Vec<String>, GalleryError>;
}

/// Gallery backed by a directory of `<identity>.jpg` reference images.
#[derive(Debug, Clone)]
pub struct DirGallery {
    dir: PathBuf,
}

impl DirGallery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn reference_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{identity}.{REFERENCE_EXTENSION}"))
    }

    fn io_err(path: &Path, source: std::io::Error) -> GalleryError {
        GalleryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// `(identity, path)` for every reference image, sorted by file name.
    fn references(&self) -> Result<Vec<(String, PathBuf)>, GalleryError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err(&self.dir, e)),
        };

        let mut refs = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Self::io_err(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(REFERENCE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                refs.push((stem.to_string(), path.clone()));
            }
        }
        refs.sort();
        Ok(refs)
    }
}

impl FaceGallery for DirGallery {
    fn load_all(&self, encoder: &mut dyn FaceEncoder) -> Result<Vec<FaceRecord>, GalleryError> {
        let mut records = Vec::new();

        for (identity, path) in self.references()? {
            let image = match image::open(&path) {
                Ok(img) => img.to_luma8(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable reference image; skipping");
                    continue;
                }
            };

            // The first (most confident) face is the enrolled one.
            match encoder.encode(&image)?.into_iter().next() {
                Some(face) => records.push(FaceRecord {
                    identity,
                    embedding: face.embedding,
                }),
                None => {
                    tracing::warn!(path = %path.display(), "no face in reference image; skipping");
                }
            }
        }

        tracing::debug!(dir = %self.dir.display(), count = records.len(), "gallery loaded");
        Ok(records)
    }

    fn append(&self, record: &FaceRecord, reference: &GrayImage) -> Result<(), GalleryError> {
        fs::create_dir_all(&self.dir).map_err(|e| Self::io_err(&self.dir, e))?;

        let path = self.reference_path(&record.identity);
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(GalleryError::DuplicateIdentity(record.identity.clone()));
            }
            Err(e) => return Err(Self::io_err(&path, e)),
        };

        let mut writer = BufWriter::new(file);
        let written = reference
            .write_to(&mut writer, ImageFormat::Jpeg)
            .map_err(GalleryError::from)
            .and_then(|()| writer.flush().map_err(|e| Self::io_err(&path, e)));
        if let Err(e) = written {
            drop(writer);
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        tracing::info!(identity = %record.identity, path = %path.display(), "reference image stored");
        Ok(())
    }

    fn identities(&self) -> Result<Vec<String>, GalleryError> {
        Ok(self.references()?.into_iter().map(|(identity, _)| identity).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::testing::{canvas, Painted, ShadeEncoder};
    use crate::types::Embedding;

    fn face(shade: u8) -> GrayImage {
        // Block-aligned square so JPEG keeps the interior flat.
        canvas(64, 64, &[Painted { x: 16, y: 16, side: 32, shade }])
    }

    fn record(identity: &str, shade: u8) -> FaceRecord {
        FaceRecord {
            identity: identity.into(),
            embedding: Embedding::new(vec![shade as f32 / 255.0]),
        }
    }

    #[test]
    fn test_missing_dir_is_empty_gallery() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = DirGallery::new(tmp.path().join("faces"));
        assert!(gallery.load_all(&mut ShadeEncoder::default()).unwrap().is_empty());
        assert!(gallery.identities().unwrap().is_empty());
    }

    #[test]
    fn test_append_then_load_rederives_encoding() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = DirGallery::new(tmp.path().join("faces"));
        gallery.append(&record("bob", 90), &face(90)).unwrap();
        gallery.append(&record("alice", 200), &face(200)).unwrap();

        let mut encoder = ShadeEncoder::default();
        let records = gallery.load_all(&mut encoder).unwrap();
        assert_eq!(encoder.calls, 2);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].identity, "alice");
        assert_eq!(records[1].identity, "bob");
        // JPEG may nudge the flat interior by a level or two.
        assert!((records[0].embedding.values[0] - 200.0 / 255.0).abs() < 0.02);
        assert!((records[1].embedding.values[0] - 90.0 / 255.0).abs() < 0.02);
    }

    #[test]
    fn test_load_all_is_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = DirGallery::new(tmp.path());
        let mut encoder = ShadeEncoder::default();
        assert!(gallery.load_all(&mut encoder).unwrap().is_empty());
        gallery.append(&record("alice", 200), &face(200)).unwrap();
        assert_eq!(gallery.load_all(&mut encoder).unwrap().len(), 1);
        assert_eq!(encoder.calls, 1);
    }

    #[test]
    fn test_append_rejects_duplicate_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = DirGallery::new(tmp.path());
        gallery.append(&record("alice", 200), &face(200)).unwrap();

        let err = gallery.append(&record("alice", 60), &face(60)).unwrap_err();
        assert!(matches!(err, GalleryError::DuplicateIdentity(ref id) if id == "alice"));
        assert_eq!(gallery.identities().unwrap(), vec!["alice".to_string()]);

        // Original reference untouched.
        let records = gallery.load_all(&mut ShadeEncoder::default()).unwrap();
        assert!((records[0].embedding.values[0] - 200.0 / 255.0).abs() < 0.02);
    }

    #[test]
    fn test_faceless_and_foreign_files_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = DirGallery::new(tmp.path());
        gallery.append(&record("blank", 0), &GrayImage::new(32, 32)).unwrap();
        gallery.append(&record("alice", 200), &face(200)).unwrap();
        fs::write(tmp.path().join("notes.txt"), "not an image").unwrap();
        fs::write(tmp.path().join("broken.jpg"), "not a jpeg").unwrap();

        let records = gallery.load_all(&mut ShadeEncoder::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity, "alice");
        assert_eq!(gallery.identities().unwrap(), vec!["alice", "blank", "broken"]);
    }
}
