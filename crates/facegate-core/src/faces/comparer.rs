use serde::Serialize;

use crate::errors::{AppError, AppResult};

/// Cosine similarity in `[-1, 1]`. Differing lengths or a zero-magnitude side
/// indicate template/extractor skew and are reported as errors.
pub fn cosine_similarity(lhs: &[f64], rhs: &[f64]) -> AppResult<f64> {
    if lhs.len() != rhs.len() {
        return Err(AppError::ShapeMismatch {
            expected: lhs.len(),
            found: rhs.len(),
        });
    }

    let (Some(scale_lhs), Some(scale_rhs)) = (magnitude_scale(lhs), magnitude_scale(rhs)) else {
        return Err(AppError::DegenerateEmbedding);
    };

    // Components are divided by each side's largest magnitude so the sums
    // neither overflow nor underflow for any finite input.
    let mut dot = 0.0;
    let mut norm_lhs = 0.0;
    let mut norm_rhs = 0.0;
    for (l, r) in lhs.iter().zip(rhs.iter()) {
        let (l, r) = (l / scale_lhs, r / scale_rhs);
        dot += l * r;
        norm_lhs += l * l;
        norm_rhs += r * r;
    }

    Ok((dot / (norm_lhs.sqrt() * norm_rhs.sqrt())).clamp(-1.0, 1.0))
}

/// Largest absolute component, or `None` for an all-zero or non-finite vector.
fn magnitude_scale(values: &[f64]) -> Option<f64> {
    let mut scale = 0.0_f64;
    for value in values {
        if !value.is_finite() {
            return None;
        }
        scale = scale.max(value.abs());
    }
    (scale > 0.0).then_some(scale)
}

/// Similarity paired with the threshold it was judged against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchDecision {
    pub similarity: f64,
    pub threshold: f64,
    pub accepted: bool,
}

impl MatchDecision {
    pub fn judge(similarity: f64, threshold: f64) -> Self {
        Self {
            similarity,
            threshold,
            accepted: similarity >= threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let a = [0.3, -1.2, 4.5, 0.0, 2.2];
        let score = cosine_similarity(&a, &a).unwrap();
        assert!((score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn similarity_is_symmetric_and_bounded() {
        let pairs = [
            (vec![1.0, 2.0, 3.0], vec![-3.0, 0.5, 2.0]),
            (vec![1.0, 0.0], vec![-1.0, 0.0]),
            (vec![1e-3, 5.0, -7.0], vec![2.0, 2.0, 2.0]),
        ];
        for (a, b) in pairs {
            let ab = cosine_similarity(&a, &b).unwrap();
            let ba = cosine_similarity(&b, &a).unwrap();
            assert!((ab - ba).abs() < 1e-12);
            assert!((-1.0..=1.0).contains(&ab));
        }
    }

    #[test]
    fn opposite_vectors_score_minus_one() {
        let score = cosine_similarity(&[1.0, 2.0], &[-1.0, -2.0]).unwrap();
        assert!((score + 1.0).abs() < 1e-12);
    }

    #[test]
    fn length_mismatch_is_not_truncated() {
        let err = cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            AppError::ShapeMismatch {
                expected: 3,
                found: 2
            }
        ));
    }

    #[test]
    fn zero_vector_is_degenerate() {
        let err = cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).unwrap_err();
        assert!(matches!(err, AppError::DegenerateEmbedding));
    }

    #[test]
    fn tiny_vectors_are_not_degenerate() {
        let a = [1e-9, 2e-9];
        assert!((cosine_similarity(&a, &a).unwrap() - 1.0).abs() < 1e-12);
        let b = [1e-200, -3e-200, 5e-201];
        assert!((cosine_similarity(&b, &b).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn huge_vectors_do_not_overflow() {
        let a = [1e200, 1e200];
        assert!((cosine_similarity(&a, &a).unwrap() - 1.0).abs() < 1e-12);
        let score = cosine_similarity(&[1e300, 0.0], &[-2e300, 0.0]).unwrap();
        assert!((score + 1.0).abs() < 1e-12);
    }

    #[test]
    fn non_finite_components_are_degenerate() {
        let err = cosine_similarity(&[f64::NAN, 1.0], &[1.0, 1.0]).unwrap_err();
        assert!(matches!(err, AppError::DegenerateEmbedding));
    }

    #[test]
    fn threshold_is_inclusive() {
        assert!(MatchDecision::judge(0.75, 0.75).accepted);
        assert!(!MatchDecision::judge(0.7499, 0.75).accepted);
    }
}
