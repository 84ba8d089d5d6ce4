#![forbid(unsafe_code)]

use uda_domain::{EvidenceItem, UncertaintyReport, UncertaintySpan};

/// Rendered in place of a missing or blank `source_uri`.
pub const MISSING_SOURCE: &str = "unknown-source";
/// Rendered in place of a missing or blank `heading`.
pub const MISSING_HEADING: &str = "untitled";

const ENTROPY_EPSILON: f64 = 1e-12;

/// Shannon entropy (nats) of the distribution described by `logprobs`.
///
/// The log-probabilities are exponentiated and renormalized first, so they do
/// not need to sum to one. Empty or degenerate input yields `0.0`; the result
/// is never negative.
#[must_use]
pub fn entropy_from_logprobs(logprobs: &[f64]) -> f64 {
    if logprobs.is_empty() || logprobs.iter().any(|value| value.is_nan()) {
        return 0.0;
    }

    let peak = logprobs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !peak.is_finite() {
        return 0.0;
    }

    let weights: Vec<f64> = logprobs.iter().map(|value| (value - peak).exp()).collect();
    let total: f64 = weights.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        return 0.0;
    }

    let entropy: f64 = weights
        .iter()
        .map(|weight| {
            let p = weight / total;
            -p * (p + ENTROPY_EPSILON).ln()
        })
        .sum();
    entropy.max(0.0)
}

/// Mean of the span entropies, `0.0` for an empty list.
///
/// The mean is bounded by the largest span so float rounding never reports an
/// aggregate above any individual span.
#[must_use]
pub fn aggregate_uncertainty(entropies: &[f64]) -> f64 {
    if entropies.is_empty() {
        return 0.0;
    }
    let peak = entropies.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let sum: f64 = entropies.iter().sum();
    #[allow(clippy::cast_precision_loss)]
    let mean = sum / entropies.len() as f64;
    mean.min(peak).max(0.0)
}

#[must_use]
pub fn uncertainty_report(spans: Vec<UncertaintySpan>) -> UncertaintyReport {
    let entropies: Vec<f64> = spans.iter().map(|span| span.entropy).collect();
    UncertaintyReport {
        overall: aggregate_uncertainty(&entropies),
        spans,
    }
}

/// Render one citation as `[index] source :: heading`.
#[must_use]
pub fn format_citation(index: usize, item: &EvidenceItem) -> String {
    let source = non_blank(item.source_uri.as_deref()).unwrap_or(MISSING_SOURCE);
    let heading = non_blank(item.heading.as_deref()).unwrap_or(MISSING_HEADING);
    format!("[{index}] {source} :: {heading}")
}

/// Render citations for `evidence`, numbered from 1 in slice order.
#[must_use]
pub fn format_citations(evidence: &[EvidenceItem]) -> Vec<String> {
    evidence
        .iter()
        .enumerate()
        .map(|(offset, item)| format_citation(offset + 1, item))
        .collect()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
