//! Nearest-neighbour matching of a live embedding against the authorized set.

use crate::store::Snapshot;
use crate::types::Embedding;

/// Result of matching a probe embedding against a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Whether the nearest stored embedding lies strictly under the threshold.
    pub authorized: bool,
    /// Identity of the matched embedding (only set when authorized).
    pub identity: Option<String>,
    /// Cosine distance to the nearest stored embedding; `None` for an empty store.
    pub distance: Option<f32>,
    /// Displayed confidence in [0, 100].
    pub confidence: f32,
}

impl MatchResult {
    /// The result for an empty authorized set.
    pub fn no_match() -> Self {
        Self {
            authorized: false,
            identity: None,
            distance: None,
            confidence: 0.0,
        }
    }

    /// Status line shown on the live display.
    pub fn display_text(&self) -> String {
        match (&self.identity, self.distance) {
            (Some(identity), _) if self.authorized => {
                format!("authorized: {identity} | confidence: {:.2}%", self.confidence)
            }
            (_, Some(_)) => format!("unauthorized | confidence: {:.2}%", self.confidence),
            _ => "no matching face found".to_string(),
        }
    }
}

/// Threshold-relative confidence: `(1 - distance / threshold) * 100`, clamped to [0, 100].
///
/// Distance 0 maps to 100%, distance at or beyond the threshold to 0%.
pub fn confidence(distance: f32, threshold: f32) -> f32 {
    if threshold <= 0.0 || !distance.is_finite() {
        return 0.0;
    }
    ((1.0 - distance / threshold) * 100.0).clamp(0.0, 100.0)
}

/// Strategy for comparing a probe embedding against the authorized set.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, snapshot: &Snapshot, threshold: f32) -> MatchResult;
}

/// Linear-scan cosine-distance matcher.
///
/// Every stored vector is compared; the first minimum in store order wins, so
/// the result is deterministic for a given snapshot. Stored vectors whose
/// dimension differs from the probe's are not comparable and are skipped.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, snapshot: &Snapshot, threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;
        let mut skipped = 0usize;

        for (i, stored) in snapshot.vectors().iter().enumerate() {
            if stored.values.len() != probe.values.len() {
                skipped += 1;
                continue;
            }
            let d = probe.cosine_distance(stored);
            match best {
                Some((_, best_d)) if d >= best_d => {}
                // NaN never beats a real distance, but seeds `best` if first.
                _ if d.is_nan() && best.is_some() => {}
                _ => best = Some((i, d)),
            }
        }

        if skipped > 0 {
            tracing::warn!(
                skipped,
                probe_dim = probe.values.len(),
                "stored embeddings with a different dimension were ignored"
            );
        }

        let Some((idx, distance)) = best else {
            return MatchResult::no_match();
        };

        let authorized = distance < threshold;
        MatchResult {
            authorized,
            identity: authorized.then(|| snapshot.names()[idx].clone()),
            distance: Some(distance),
            confidence: confidence(distance, threshold),
        }
    }
}
