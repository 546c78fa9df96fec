use std::fmt;

/// Bounding box for a detected face, in pixel coordinates of the image it was detected in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Multiply every coordinate by `factor`.
    ///
    /// Boxes found on a copy downscaled by `s` map back to the source frame
    /// with `scaled(1.0 / s)`.
    pub fn scaled(&self, factor: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face encoding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Embeddings of different dimension are never comparable and yield `+inf`.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// An enrolled face: identity label plus the encoding derived from its reference image.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceRecord {
    pub identity: String,
    pub embedding: Embedding,
}

/// Outcome of classifying a face: an enrolled identity, or nobody we know.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Identity {
    Known(String),
    #[default]
    Unknown,
}

impl Identity {
    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }

    pub fn as_known(&self) -> Option<&str> {
        match self {
            Identity::Known(name) => Some(name),
            Identity::Unknown => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Known(name) => f.write_str(name),
            Identity::Unknown => f.write_str("Unknown"),
        }
    }
}
