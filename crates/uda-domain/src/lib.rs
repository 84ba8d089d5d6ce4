#![forbid(unsafe_code)]

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Answer text used whenever no evidence supports a response.
pub const ABSTENTION_ANSWER: &str = "I don't have enough information to answer confidently. \
Please provide more details or ingest relevant documents.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    #[default]
    Lookup,
    Synthesis,
    Policy,
}

impl Intent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Synthesis => "synthesis",
            Self::Policy => "policy",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Answer,
    Dlq,
}

impl Decision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Answer => "answer",
            Self::Dlq => "dlq",
        }
    }
}

/// Pipeline stage names in their fixed execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Router,
    Retriever,
    Ranker,
    Answerer,
    Uncertainty,
    Validator,
    Auditor,
    Supervisor,
}

impl StageName {
    pub const ALL: [Self; 8] = [
        Self::Router,
        Self::Retriever,
        Self::Ranker,
        Self::Answerer,
        Self::Uncertainty,
        Self::Validator,
        Self::Auditor,
        Self::Supervisor,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Retriever => "retriever",
            Self::Ranker => "ranker",
            Self::Answerer => "answerer",
            Self::Uncertainty => "uncertainty",
            Self::Validator => "validator",
            Self::Auditor => "auditor",
            Self::Supervisor => "supervisor",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceItem {
    pub doc_id: String,
    #[serde(default)]
    pub source_uri: Option<String>,
    #[serde(default)]
    pub heading: Option<String>,
    pub score: f64,
    pub text: String,
}

/// Anything that can answer a keyword query with scored evidence.
///
/// An empty or unmatched query yields an empty list, never an error.
pub trait EvidenceSource: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn search(&self, query: &str, limit: usize) -> Result<Vec<EvidenceItem>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UncertaintySpan {
    pub start: usize,
    pub end: usize,
    pub entropy: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UncertaintyReport {
    pub overall: f64,
    pub spans: Vec<UncertaintySpan>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub faithful: bool,
    pub checks: Vec<String>,
    pub evidence_count: usize,
}

/// One record per executed stage, serialized as `{"node": <stage>, ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum AuditEntry {
    Router { intent: Intent },
    Retriever { hits: usize },
    Ranker { kept: usize },
    Answerer { len: usize },
    Uncertainty { overall: f64 },
    Validator { faithful: bool },
    Auditor { flag: bool },
    Supervisor { decision: Decision },
}

impl AuditEntry {
    #[must_use]
    pub fn node(&self) -> StageName {
        match self {
            Self::Router { .. } => StageName::Router,
            Self::Retriever { .. } => StageName::Retriever,
            Self::Ranker { .. } => StageName::Ranker,
            Self::Answerer { .. } => StageName::Answerer,
            Self::Uncertainty { .. } => StageName::Uncertainty,
            Self::Validator { .. } => StageName::Validator,
            Self::Auditor { .. } => StageName::Auditor,
            Self::Supervisor { .. } => StageName::Supervisor,
        }
    }
}

/// The record threaded through every stage of one run.
///
/// Field names are part of the external contract. `query`, `run_id` and the
/// audit trail are only reachable through accessors: the query is fixed at
/// construction and the trail only grows through [`PipelineState::record`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineState {
    #[serde(default)]
    run_id: RunId,
    #[serde(alias = "user_query")]
    query: String,
    #[serde(default)]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub retrieved_evidence: Vec<EvidenceItem>,
    #[serde(default)]
    pub ranked_evidence: Vec<EvidenceItem>,
    #[serde(default)]
    pub draft_answer: Option<String>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub uncertainty: Option<UncertaintyReport>,
    #[serde(default, alias = "validation_reports")]
    pub validation: Option<ValidationReport>,
    #[serde(default)]
    pub flag: Option<bool>,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    audit_trail: Vec<AuditEntry>,
}

impl PipelineState {
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self::with_run_id(RunId::new(), query)
    }

    #[must_use]
    pub fn with_run_id(run_id: RunId, query: impl Into<String>) -> Self {
        Self {
            run_id,
            query: query.into(),
            intent: None,
            retrieved_evidence: Vec::new(),
            ranked_evidence: Vec::new(),
            draft_answer: None,
            citations: Vec::new(),
            uncertainty: None,
            validation: None,
            flag: None,
            decision: None,
            audit_trail: Vec::new(),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[must_use]
    pub fn audit_trail(&self) -> &[AuditEntry] {
        &self.audit_trail
    }

    /// Append one audit entry. Entries are never removed or reordered.
    pub fn record(&mut self, entry: AuditEntry) {
        self.audit_trail.push(entry);
    }

    #[must_use]
    pub fn audit_nodes(&self) -> Vec<StageName> {
        self.audit_trail.iter().map(AuditEntry::node).collect()
    }
}

/// Externally visible response shape; key names are a stability contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerPayload {
    pub answer: String,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub uncertainty: Option<UncertaintyReport>,
    #[serde(default)]
    pub validation: Option<ValidationReport>,
    pub decision: Decision,
}

impl From<&PipelineState> for AnswerPayload {
    fn from(state: &PipelineState) -> Self {
        Self {
            answer: state
                .draft_answer
                .clone()
                .unwrap_or_else(|| ABSTENTION_ANSWER.to_string()),
            citations: state.citations.clone(),
            uncertainty: state.uncertainty.clone(),
            validation: state.validation.clone(),
            decision: state.decision.unwrap_or(Decision::Dlq),
        }
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn audit_entries_serialize_with_node_tag() {
        let value = must_ok(serde_json::to_value(AuditEntry::Router {
            intent: Intent::Policy,
        }));
        assert_eq!(value, json!({"node": "router", "intent": "policy"}));

        let value = must_ok(serde_json::to_value(AuditEntry::Supervisor {
            decision: Decision::Dlq,
        }));
        assert_eq!(value, json!({"node": "supervisor", "decision": "dlq"}));
    }

    #[test]
    fn stage_names_serialize_as_their_display_names() {
        for stage in StageName::ALL {
            let value = must_ok(serde_json::to_value(stage));
            assert_eq!(value, json!(stage.to_string()));
        }
        assert!(serde_json::from_value::<StageName>(json!("planner")).is_err());
    }

    #[test]
    fn state_serializes_contract_keys() {
        let state = PipelineState::new("what is uda?");
        let value = must_ok(serde_json::to_value(&state));
        let object = match value.as_object() {
            Some(object) => object,
            None => panic!("state must serialize to an object"),
        };
        for key in [
            "query",
            "intent",
            "retrieved_evidence",
            "ranked_evidence",
            "draft_answer",
            "citations",
            "uncertainty",
            "validation",
            "flag",
            "decision",
            "audit_trail",
        ] {
            assert!(object.contains_key(key), "missing state key {key}");
        }
    }

    #[test]
    fn state_rejects_unknown_fields() {
        let parsed = serde_json::from_value::<PipelineState>(json!({
            "query": "q",
            "mystery": true,
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn state_accepts_legacy_field_aliases() {
        let parsed = must_ok(serde_json::from_value::<PipelineState>(json!({
            "user_query": "legacy",
            "validation_reports": {"faithful": true, "checks": ["stub"], "evidence_count": 1},
        })));
        assert_eq!(parsed.query(), "legacy");
        assert_eq!(parsed.validation.map(|report| report.faithful), Some(true));
    }

    #[test]
    fn payload_falls_back_to_abstention_without_draft() {
        let state = PipelineState::new("q");
        let payload = AnswerPayload::from(&state);
        assert_eq!(payload.answer, ABSTENTION_ANSWER);
        assert_eq!(payload.decision, Decision::Dlq);
        assert!(payload.citations.is_empty());
    }

    #[test]
    fn hash_bytes_is_stable() {
        assert_eq!(hash_bytes(b"uda"), hash_bytes(b"uda"));
        assert_ne!(hash_bytes(b"uda"), hash_bytes(b"udb"));
    }
}
