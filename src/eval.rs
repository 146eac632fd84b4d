//! Evaluation of model output against ground-truth LaTeX pairs.
//!
//! Scoring is intentionally simple: exact match on trimmed strings, plus a
//! normalized edit-distance similarity in `[0, 1]` over case-folded input.
//! Per-pair inference failures are recorded in the report instead of
//! aborting the batch.

use crate::pipeline::engine::GenerationRequest;
use crate::service::LatexGenerator;
use serde::Serialize;

/// One image with its expected LaTeX.
#[derive(Debug, Clone)]
pub struct EvalPair {
    pub image: Vec<u8>,
    pub ground_truth: String,
}

/// Outcome for a single pair.
#[derive(Debug, Clone, Serialize)]
pub struct EvalOutcome {
    pub ground_truth: String,
    /// The model's prediction, absent when inference failed.
    pub predicted: Option<String>,
    pub similarity: f64,
    pub exact_match: bool,
    pub tokens: u32,
    pub time_ms: u64,
    /// Inference error, when one occurred.
    pub error: Option<String>,
}

/// Aggregated batch results.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub exact_matches: usize,
    pub accuracy: f64,
    pub average_similarity: f64,
    pub results: Vec<EvalOutcome>,
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Normalized similarity in `[0, 1]` over case-folded, trimmed strings.
/// Identical strings score 1.0.
pub fn similarity(expected: &str, predicted: &str) -> f64 {
    let expected = expected.trim().to_lowercase();
    let predicted = predicted.trim().to_lowercase();
    let longest = expected.chars().count().max(predicted.chars().count());
    if longest == 0 {
        return 1.0;
    }
    let distance = levenshtein(&expected, &predicted);
    1.0 - (distance as f64 / longest as f64)
}

/// Scores one prediction against its ground truth.
pub fn score_pair(ground_truth: &str, predicted: &str, tokens: u32, time_ms: u64) -> EvalOutcome {
    EvalOutcome {
        ground_truth: ground_truth.to_string(),
        predicted: Some(predicted.to_string()),
        similarity: similarity(ground_truth, predicted),
        exact_match: ground_truth.trim() == predicted.trim(),
        tokens,
        time_ms,
        error: None,
    }
}

/// Runs the generator over every pair and aggregates the scores.
pub fn evaluate_pairs(
    generator: &dyn LatexGenerator,
    pairs: &[EvalPair],
    request: &GenerationRequest,
) -> BatchReport {
    let mut results = Vec::with_capacity(pairs.len());
    let mut exact_matches = 0usize;

    for pair in pairs {
        match generator.generate(&pair.image, request) {
            Ok(result) => {
                let outcome =
                    score_pair(&pair.ground_truth, &result.latex, result.tokens, result.time_ms);
                if outcome.exact_match {
                    exact_matches += 1;
                }
                results.push(outcome);
            }
            Err(e) => results.push(EvalOutcome {
                ground_truth: pair.ground_truth.clone(),
                predicted: None,
                similarity: 0.0,
                exact_match: false,
                tokens: 0,
                time_ms: 0,
                error: Some(e.to_string()),
            }),
        }
    }

    let total = pairs.len();
    let scored: Vec<&EvalOutcome> = results.iter().filter(|r| r.error.is_none()).collect();
    let average_similarity = if scored.is_empty() {
        0.0
    } else {
        scored.iter().map(|r| r.similarity).sum::<f64>() / scored.len() as f64
    };
    let accuracy = if total == 0 {
        0.0
    } else {
        exact_matches as f64 / total as f64
    };

    BatchReport {
        total,
        exact_matches,
        accuracy,
        average_similarity,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::InferenceError;
    use crate::pipeline::engine::GenerationResult;

    struct FixedGenerator {
        latex: &'static str,
        fail: bool,
    }

    impl LatexGenerator for FixedGenerator {
        fn generate(
            &self,
            _image: &[u8],
            _request: &GenerationRequest,
        ) -> Result<GenerationResult, InferenceError> {
            if self.fail {
                return Err(InferenceError::generation("device lost"));
            }
            Ok(GenerationResult {
                latex: self.latex.to_string(),
                tokens: 8,
                time_ms: 120,
            })
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            max_new_tokens: 256,
            temperature: 0.7,
            min_p: 0.1,
        }
    }

    #[test]
    fn identical_strings_are_exact_and_fully_similar() {
        let outcome = score_pair("E = mc^2", "E = mc^2", 8, 100);
        assert!(outcome.exact_match);
        assert_eq!(outcome.similarity, 1.0);
    }

    #[test]
    fn similarity_handles_disjoint_strings() {
        assert_eq!(similarity("abc", "xyz"), 0.0);
        assert_eq!(similarity("", ""), 1.0);
    }

    #[test]
    fn similarity_is_case_insensitive() {
        assert_eq!(similarity("E = MC^2", "e = mc^2"), 1.0);
    }

    #[test]
    fn batch_aggregates_match_hand_computation() {
        let generator = FixedGenerator {
            latex: "x^2",
            fail: false,
        };
        let pairs = vec![
            EvalPair {
                image: vec![1],
                ground_truth: "x^2".to_string(),
            },
            EvalPair {
                image: vec![2],
                ground_truth: "y^2".to_string(),
            },
        ];
        let report = evaluate_pairs(&generator, &pairs, &request());
        assert_eq!(report.total, 2);
        assert_eq!(report.exact_matches, 1);
        assert_eq!(report.accuracy, 0.5);
        // Second pair differs by one of three characters.
        let expected_avg = (1.0 + (1.0 - 1.0 / 3.0)) / 2.0;
        assert!((report.average_similarity - expected_avg).abs() < 1e-9);
    }

    #[test]
    fn failing_pairs_are_recorded_not_fatal() {
        let generator = FixedGenerator {
            latex: "",
            fail: true,
        };
        let pairs = vec![EvalPair {
            image: vec![1],
            ground_truth: "x".to_string(),
        }];
        let report = evaluate_pairs(&generator, &pairs, &request());
        assert_eq!(report.total, 1);
        assert_eq!(report.exact_matches, 0);
        assert_eq!(report.average_similarity, 0.0);
        assert!(report.results[0].error.is_some());
    }
}
