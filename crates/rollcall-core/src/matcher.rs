//! Nearest-distance identity matching.

use crate::types::{Embedding, FaceRecord, Identity};

/// Reference distance threshold: a gallery entry matches when strictly closer than this.
///
/// ArcFace embeddings are unit length, so Euclidean distance `d` and cosine
/// similarity `c` are tied by `d = sqrt(2 - 2c)`. 0.5 therefore means cosine
/// above 0.875, which is strict for this encoder; calibrate per deployment.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

/// Result of classifying a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub identity: Identity,
    /// Distance to the globally closest gallery entry, matched or not.
    /// `None` when the gallery is empty.
    pub distance: Option<f32>,
}

impl MatchOutcome {
    pub fn unknown() -> Self {
        Self {
            identity: Identity::Unknown,
            distance: None,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn classify(&self, probe: &Embedding, gallery: &[FaceRecord]) -> MatchOutcome;
}

/// Euclidean nearest-neighbour matcher.
///
/// Picks the globally closest entry first and only then applies the threshold
/// to that single entry. A close false match can therefore mask a second entry
/// that is also under the threshold; callers rely on that ordering.
#[derive(Debug, Clone, Copy)]
pub struct DistanceMatcher {
    threshold: f32,
}

impl DistanceMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for DistanceMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl Matcher for DistanceMatcher {
    fn classify(&self, probe: &Embedding, gallery: &[FaceRecord]) -> MatchOutcome {
        let mut best: Option<(usize, f32)> = None;

        for (i, record) in gallery.iter().enumerate() {
            let distance = probe.euclidean_distance(&record.embedding);
            // Strict `<` keeps the earliest entry on ties and skips NaN.
            let closer = match best {
                None => !distance.is_nan(),
                Some((_, best_distance)) => distance < best_distance,
            };
            if closer {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) if distance < self.threshold => MatchOutcome {
                identity: Identity::Known(gallery[idx].identity.clone()),
                distance: Some(distance),
            },
            Some((_, distance)) => MatchOutcome {
                identity: Identity::Unknown,
                distance: Some(distance),
            },
            None => MatchOutcome::unknown(),
        }
    }
}
