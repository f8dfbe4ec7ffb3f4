//! Template representation and cosine-similarity matching.
//!
//! Templates are opaque numeric vectors produced upstream by the capture
//! pipeline. Matching is a pure function so it can be tested in isolation.

use sha2::{Digest, Sha256};

/// Upper bound on template dimensionality accepted at the boundary.
pub const MAX_TEMPLATE_DIM: usize = 4096;

const DEFAULT_MATCH_THRESHOLD: f64 = 0.75;
const DEFAULT_HIGH_CONFIDENCE_THRESHOLD: f64 = 0.85;
const DEFAULT_LIVENESS_THRESHOLD: f64 = 0.70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    #[error("Template dimensions differ: stored {stored}, candidate {candidate}")]
    DimensionMismatch { stored: usize, candidate: usize },
    #[error("Template is empty")]
    EmptyTemplate,
    #[error("Template has {0} dimensions, above the supported maximum")]
    TooLarge(usize),
    #[error("Template contains non-finite values")]
    NonFinite,
    #[error("Template has zero norm")]
    ZeroNorm,
    #[error("Template bytes are malformed")]
    Malformed,
}

/// A validated face template: non-empty, bounded, finite and non-zero.
#[derive(Clone, PartialEq)]
pub struct Template(Vec<f32>);

impl Template {
    /// # Errors
    /// Returns a `MatchError` if the vector is empty, too large, contains
    /// NaN/infinite values, or is all zeros.
    pub fn new(values: Vec<f32>) -> Result<Self, MatchError> {
        if values.is_empty() {
            return Err(MatchError::EmptyTemplate);
        }
        if values.len() > MAX_TEMPLATE_DIM {
            return Err(MatchError::TooLarge(values.len()));
        }
        if values.iter().any(|value| !value.is_finite()) {
            return Err(MatchError::NonFinite);
        }
        if values.iter().all(|value| *value == 0.0) {
            return Err(MatchError::ZeroNorm);
        }
        Ok(Self(values))
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Little-endian `f32` serialization used as encryption plaintext.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|value| value.to_le_bytes()).collect()
    }

    /// # Errors
    /// Returns `MatchError::Malformed` if the length is not a multiple of 4,
    /// or any validation error from [`Template::new`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MatchError> {
        if bytes.len() % 4 != 0 {
            return Err(MatchError::Malformed);
        }
        let values = bytes
            .chunks_exact(4)
            .map(|chunk| {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(chunk);
                f32::from_le_bytes(raw)
            })
            .collect();
        Self::new(values)
    }

    /// One-way SHA-256 digest of the serialized template.
    #[must_use]
    pub fn digest(&self) -> Vec<u8> {
        Sha256::digest(self.to_bytes()).to_vec()
    }
}

// Never print template values.
impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template").field("dim", &self.dim()).finish()
    }
}

/// Compare two templates and return a confidence in `[0, 1]`.
///
/// Cosine similarity in `[-1, 1]` is rescaled with `(cos + 1) / 2`.
///
/// # Errors
/// Returns `MatchError::DimensionMismatch` when the vectors differ in length.
pub fn compare(stored: &Template, candidate: &Template) -> Result<f64, MatchError> {
    if stored.dim() != candidate.dim() {
        return Err(MatchError::DimensionMismatch {
            stored: stored.dim(),
            candidate: candidate.dim(),
        });
    }

    let mut dot = 0.0_f64;
    let mut stored_norm = 0.0_f64;
    let mut candidate_norm = 0.0_f64;
    for (a, b) in stored.as_slice().iter().zip(candidate.as_slice()) {
        let (a, b) = (f64::from(*a), f64::from(*b));
        dot += a * b;
        stored_norm += a * a;
        candidate_norm += b * b;
    }

    let denominator = (stored_norm * candidate_norm).sqrt();
    if denominator == 0.0 || !denominator.is_finite() {
        return Err(MatchError::ZeroNorm);
    }
    let cosine = (dot / denominator).clamp(-1.0, 1.0);
    Ok(((cosine + 1.0) / 2.0).clamp(0.0, 1.0))
}

/// Thresholds applied to match and liveness scores.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchConfig {
    match_threshold: f64,
    high_confidence_threshold: f64,
    liveness_threshold: f64,
}

impl MatchConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            high_confidence_threshold: DEFAULT_HIGH_CONFIDENCE_THRESHOLD,
            liveness_threshold: DEFAULT_LIVENESS_THRESHOLD,
        }
    }

    #[must_use]
    pub fn with_match_threshold(mut self, threshold: f64) -> Self {
        self.match_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_high_confidence_threshold(mut self, threshold: f64) -> Self {
        self.high_confidence_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_liveness_threshold(mut self, threshold: f64) -> Self {
        self.liveness_threshold = threshold;
        self
    }

    #[must_use]
    pub fn match_threshold(&self) -> f64 {
        self.match_threshold
    }

    #[must_use]
    pub fn high_confidence_threshold(&self) -> f64 {
        self.high_confidence_threshold
    }

    #[must_use]
    pub fn liveness_threshold(&self) -> f64 {
        self.liveness_threshold
    }

    /// # Errors
    /// Returns an error if a threshold is outside `[0, 1]` or the match
    /// threshold exceeds the high-confidence threshold.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("match threshold", self.match_threshold),
            ("high-confidence threshold", self.high_confidence_threshold),
            ("liveness threshold", self.liveness_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{name} must be between 0 and 1, got {value}");
            }
        }
        if self.match_threshold > self.high_confidence_threshold {
            anyhow::bail!("match threshold must not exceed the high-confidence threshold");
        }
        Ok(())
    }
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn template(values: &[f32]) -> Template {
        Template::new(values.to_vec()).unwrap()
    }

    #[test]
    fn identical_vectors_score_one() {
        let x = template(&[0.12, -0.4, 0.9, 0.33]);
        let confidence = compare(&x, &x).unwrap();
        assert!((confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn opposite_vectors_score_zero() {
        let x = template(&[1.0, 2.0, 3.0]);
        let y = template(&[-1.0, -2.0, -3.0]);
        let confidence = compare(&x, &y).unwrap();
        assert!(confidence.abs() < 1e-9);
    }

    #[test]
    fn orthogonal_vectors_score_half() {
        let x = template(&[1.0, 0.0]);
        let y = template(&[0.0, 1.0]);
        assert!((compare(&x, &y).unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn confidence_stays_in_unit_range() {
        let samples = [
            vec![0.5_f32, -0.25, 1.0, 3.0],
            vec![-7.0, 0.001, 2.5, -0.3],
            vec![1e-6, 1e-6, -1e-6, 1e-6],
            vec![1e30, -1e30, 1e30, 1e30],
        ];
        for a in &samples {
            for b in &samples {
                let confidence = compare(&template(a), &template(b)).unwrap();
                assert!((0.0..=1.0).contains(&confidence), "{confidence}");
            }
        }
    }

    #[test]
    fn compare_is_symmetric() {
        let x = template(&[0.3, 0.1, -0.8]);
        let y = template(&[0.2, 0.4, -0.5]);
        assert_eq!(compare(&x, &y).unwrap(), compare(&y, &x).unwrap());
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let x = template(&[1.0, 2.0, 3.0]);
        let y = template(&[1.0, 2.0]);
        assert_eq!(
            compare(&x, &y),
            Err(MatchError::DimensionMismatch {
                stored: 3,
                candidate: 2
            })
        );
    }

    #[test]
    fn invalid_templates_are_rejected() {
        assert_eq!(Template::new(vec![]), Err(MatchError::EmptyTemplate));
        assert_eq!(
            Template::new(vec![0.0, 0.0]),
            Err(MatchError::ZeroNorm)
        );
        assert_eq!(
            Template::new(vec![1.0, f32::NAN]),
            Err(MatchError::NonFinite)
        );
        assert_eq!(
            Template::new(vec![1.0; MAX_TEMPLATE_DIM + 1]),
            Err(MatchError::TooLarge(MAX_TEMPLATE_DIM + 1))
        );
    }

    #[test]
    fn bytes_restore_the_same_template() {
        let x = template(&[0.25, -1.5, 3.75]);
        let restored = Template::from_bytes(&x.to_bytes()).unwrap();
        assert_eq!(restored, x);
        assert_eq!(restored.digest(), x.digest());
        assert_eq!(Template::from_bytes(&[1, 2, 3]), Err(MatchError::Malformed));
    }

    #[test]
    fn debug_hides_values() {
        let x = template(&[0.25, -1.5]);
        assert_eq!(format!("{x:?}"), "Template { dim: 2 }");
    }

    #[test]
    fn default_thresholds() {
        let config = MatchConfig::new();
        assert_eq!(config.match_threshold(), 0.75);
        assert_eq!(config.high_confidence_threshold(), 0.85);
        assert_eq!(config.liveness_threshold(), 0.70);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_thresholds() {
        let config = MatchConfig::new()
            .with_match_threshold(0.9)
            .with_high_confidence_threshold(0.8);
        assert!(config.validate().is_err());

        let config = MatchConfig::new().with_liveness_threshold(1.5);
        assert!(config.validate().is_err());
    }
}
