#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uda_domain::{
    AuditEntry, EvidenceItem, EvidenceSource, Intent, PipelineState, StageName, UncertaintySpan,
    ValidationReport, ABSTENTION_ANSWER,
};
use uda_policy::DecisionPolicy;
use uda_scoring::{format_citations, uncertainty_report};

/// Number of ranked evidence items quoted in a grounded answer.
pub const MAX_QUOTED_EVIDENCE: usize = 2;
/// Span entropy reported for lines backed by retrieved evidence.
pub const GROUNDED_SPAN_ENTROPY: f64 = 0.1;
/// Span entropy reported when the answer has no evidence behind it.
pub const UNGROUNDED_SPAN_ENTROPY: f64 = 1.0;

const EVIDENCE_PRESENT_CHECK: &str = "evidence_present";
const QUOTE_PREFIX: &str = "- [";

const SYNTHESIS_KEYWORDS: &[&str] = &[
    "why",
    "how",
    "compare",
    "design",
    "tradeoff",
    "tradeoffs",
    "draft",
    "write",
    "summarize",
    "explain",
];

const POLICY_KEYWORDS: &[&str] = &[
    "policy",
    "policies",
    "gdpr",
    "security",
    "compliance",
    "governance",
    "rule",
    "rules",
    "regulation",
    "regulations",
];

/// One processing step. A stage consumes the state, writes its own fields and
/// records exactly one audit entry tagged with [`Stage::name`].
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    #[allow(clippy::missing_errors_doc)]
    fn run(&self, state: PipelineState) -> Result<PipelineState>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    Graph,
    Sequential,
}

impl ExecutionPath {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Graph => "graph",
            Self::Sequential => "sequential",
        }
    }
}

impl std::fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that can drive a state through the compiled stage sequence.
pub trait PipelineExecutor: Send + Sync {
    fn execution_path(&self) -> ExecutionPath;

    #[allow(clippy::missing_errors_doc)]
    fn invoke(&self, state: PipelineState) -> Result<PipelineState>;
}

/// Successor of a graph node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Next {
    Stage(StageName),
    End,
}

/// Declarative node/edge description compiled by a [`GraphBackend`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphSpec {
    pub nodes: Vec<StageName>,
    pub entry: StageName,
    pub edges: Vec<(StageName, Next)>,
}

impl GraphSpec {
    /// Chain `order` front to back, ending at [`Next::End`].
    ///
    /// # Errors
    /// Returns an error when `order` is empty.
    pub fn linear(order: &[StageName]) -> Result<Self> {
        let (&entry, rest) = order
            .split_first()
            .ok_or_else(|| anyhow!("graph spec requires at least one node"))?;
        Ok(Self::chain(entry, rest))
    }

    /// The fixed eight-stage chain.
    #[must_use]
    pub fn standard() -> Self {
        let [entry, rest @ ..] = StageName::ALL;
        Self::chain(entry, &rest)
    }

    fn chain(entry: StageName, rest: &[StageName]) -> Self {
        let nodes: Vec<StageName> = std::iter::once(entry).chain(rest.iter().copied()).collect();
        let mut edges: Vec<(StageName, Next)> = nodes
            .windows(2)
            .map(|pair| (pair[0], Next::Stage(pair[1])))
            .collect();
        edges.push((rest.last().copied().unwrap_or(entry), Next::End));
        Self {
            nodes,
            entry,
            edges,
        }
    }
}

/// Compiles a [`GraphSpec`] plus stage implementations into an executor.
pub trait GraphBackend: Send + Sync {
    fn name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn compile(
        &self,
        spec: &GraphSpec,
        stages: &[Arc<dyn Stage>],
    ) -> Result<Box<dyn PipelineExecutor>>;
}

/// Run one stage and enforce the audit contract around it.
///
/// # Errors
/// Returns an error when the stage fails, when the trail did not grow by
/// exactly one entry tagged with the stage's name, or when the stage replaced
/// the run identity or query.
pub fn run_stage(stage: &dyn Stage, state: PipelineState) -> Result<PipelineState> {
    let name = stage.name();
    let run_id = state.run_id();
    let query = state.query().to_string();
    let before = state.audit_trail().len();

    let next = stage
        .run(state)
        .with_context(|| format!("stage {name} failed"))?;

    if next.run_id() != run_id || next.query() != query {
        bail!("stage {name} replaced the run identity or query");
    }
    let after = next.audit_trail().len();
    if after != before + 1 {
        bail!("stage {name} must append exactly one audit entry (trail went from {before} to {after})");
    }
    match next.audit_trail().last().map(AuditEntry::node) {
        Some(node) if node == name => {}
        Some(node) => bail!("stage {name} recorded an audit entry for {node}"),
        None => bail!("stage {name} left the audit trail empty"),
    }

    debug!(run_id = %run_id, stage = %name, "stage completed");
    Ok(next)
}

/// Applies stages in declaration order on the calling thread.
pub struct SequentialExecutor {
    stages: Vec<Arc<dyn Stage>>,
}

impl SequentialExecutor {
    #[must_use]
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }
}

impl PipelineExecutor for SequentialExecutor {
    fn execution_path(&self) -> ExecutionPath {
        ExecutionPath::Sequential
    }

    fn invoke(&self, state: PipelineState) -> Result<PipelineState> {
        self.stages
            .iter()
            .try_fold(state, |state, stage| run_stage(stage.as_ref(), state))
    }
}

#[cfg(feature = "graph-backend")]
mod graph {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    use anyhow::{anyhow, bail, Result};
    use petgraph::algo::is_cyclic_directed;
    use petgraph::graph::{DiGraph, NodeIndex};
    use petgraph::visit::Dfs;
    use uda_domain::{PipelineState, StageName};

    use super::{run_stage, ExecutionPath, GraphBackend, GraphSpec, Next, PipelineExecutor, Stage};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum GraphNode {
        Stage(StageName),
        End,
    }

    /// Graph backend built on `petgraph`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct PetgraphBackend;

    pub(super) struct GraphExecutor {
        graph: DiGraph<GraphNode, ()>,
        entry: NodeIndex,
        stages: BTreeMap<StageName, Arc<dyn Stage>>,
    }

    impl GraphBackend for PetgraphBackend {
        fn name(&self) -> &'static str {
            "petgraph"
        }

        fn compile(
            &self,
            spec: &GraphSpec,
            stages: &[Arc<dyn Stage>],
        ) -> Result<Box<dyn PipelineExecutor>> {
            let mut implementations: BTreeMap<StageName, Arc<dyn Stage>> = BTreeMap::new();
            for stage in stages {
                if implementations.insert(stage.name(), Arc::clone(stage)).is_some() {
                    bail!("duplicate stage implementation for {}", stage.name());
                }
            }

            if spec.nodes.is_empty() {
                bail!("graph spec declares no nodes");
            }

            let mut graph: DiGraph<GraphNode, ()> = DiGraph::new();
            let mut indices: BTreeMap<StageName, NodeIndex> = BTreeMap::new();
            for &node in &spec.nodes {
                if !implementations.contains_key(&node) {
                    bail!("graph node {node} has no stage implementation");
                }
                if indices.insert(node, graph.add_node(GraphNode::Stage(node))).is_some() {
                    bail!("graph node {node} declared more than once");
                }
            }
            let end = graph.add_node(GraphNode::End);

            let entry = *indices
                .get(&spec.entry)
                .ok_or_else(|| anyhow!("entry node {} is not declared", spec.entry))?;

            let mut with_successor: BTreeSet<StageName> = BTreeSet::new();
            for &(from, to) in &spec.edges {
                let source = *indices
                    .get(&from)
                    .ok_or_else(|| anyhow!("edge source {from} is not declared"))?;
                let target = match to {
                    Next::End => end,
                    Next::Stage(name) => *indices
                        .get(&name)
                        .ok_or_else(|| anyhow!("edge target {name} is not declared"))?,
                };
                if !with_successor.insert(from) {
                    bail!("graph node {from} has more than one successor");
                }
                graph.add_edge(source, target, ());
            }

            if let Some(dead_end) = spec.nodes.iter().find(|node| !with_successor.contains(node)) {
                bail!("graph node {dead_end} has no successor");
            }
            if is_cyclic_directed(&graph) {
                bail!("graph spec contains a cycle");
            }

            let mut reached: BTreeSet<NodeIndex> = BTreeSet::new();
            let mut dfs = Dfs::new(&graph, entry);
            while let Some(index) = dfs.next(&graph) {
                reached.insert(index);
            }
            if let Some(unreachable) = spec
                .nodes
                .iter()
                .find(|node| indices.get(node).is_some_and(|index| !reached.contains(index)))
            {
                bail!("graph node {unreachable} is unreachable from {}", spec.entry);
            }
            if !reached.contains(&end) {
                bail!("graph spec never reaches END");
            }

            let stages = spec
                .nodes
                .iter()
                .filter_map(|node| implementations.remove(node).map(|stage| (*node, stage)))
                .collect();

            Ok(Box::new(GraphExecutor {
                graph,
                entry,
                stages,
            }))
        }
    }

    impl PipelineExecutor for GraphExecutor {
        fn execution_path(&self) -> ExecutionPath {
            ExecutionPath::Graph
        }

        fn invoke(&self, mut state: PipelineState) -> Result<PipelineState> {
            let mut current = self.entry;
            for _ in 0..=self.graph.node_count() {
                let name = match self.graph[current] {
                    GraphNode::End => return Ok(state),
                    GraphNode::Stage(name) => name,
                };
                let stage = self
                    .stages
                    .get(&name)
                    .ok_or_else(|| anyhow!("no stage bound to graph node {name}"))?;
                state = run_stage(stage.as_ref(), state)?;
                current = self
                    .graph
                    .neighbors(current)
                    .next()
                    .ok_or_else(|| anyhow!("graph node {name} has no successor"))?;
            }
            bail!("graph walk exceeded {} steps", self.graph.node_count())
        }
    }
}

#[cfg(feature = "graph-backend")]
pub use graph::PetgraphBackend;

/// The graph backend compiled into this build, if any.
#[must_use]
pub fn probe_graph_backend() -> Option<Box<dyn GraphBackend>> {
    #[cfg(feature = "graph-backend")]
    {
        Some(Box::new(PetgraphBackend))
    }
    #[cfg(not(feature = "graph-backend"))]
    {
        None
    }
}

/// Compile through `backend` when given, otherwise (or on compile failure)
/// fall back to the sequential executor.
#[must_use]
pub fn select_executor(
    backend: Option<&dyn GraphBackend>,
    spec: &GraphSpec,
    stages: &[Arc<dyn Stage>],
) -> Box<dyn PipelineExecutor> {
    match backend {
        Some(backend) => match backend.compile(spec, stages) {
            Ok(executor) => {
                info!(backend = backend.name(), "compiled pipeline graph");
                executor
            }
            Err(err) => {
                let detail = format!("{err:#}");
                warn!(
                    backend = backend.name(),
                    error = %detail,
                    "graph compilation failed; using sequential executor"
                );
                Box::new(SequentialExecutor::new(stages.to_vec()))
            }
        },
        None => {
            warn!("graph backend unavailable; using sequential executor");
            Box::new(SequentialExecutor::new(stages.to_vec()))
        }
    }
}

/// Composes the stages into the fixed order and guards every run.
pub struct Orchestrator {
    executor: Box<dyn PipelineExecutor>,
}

impl Orchestrator {
    #[must_use]
    pub fn with_executor(executor: Box<dyn PipelineExecutor>) -> Self {
        Self { executor }
    }

    /// Build with whichever graph backend this build provides.
    #[must_use]
    pub fn build(stages: Vec<Arc<dyn Stage>>) -> Self {
        let backend = probe_graph_backend();
        Self::build_with_backend(backend.as_deref(), stages)
    }

    #[must_use]
    pub fn build_with_backend(backend: Option<&dyn GraphBackend>, stages: Vec<Arc<dyn Stage>>) -> Self {
        let executor = select_executor(backend, &GraphSpec::standard(), &stages);
        Self::with_executor(executor)
    }

    #[must_use]
    pub fn execution_path(&self) -> ExecutionPath {
        self.executor.execution_path()
    }

    /// Run the full pipeline for `query`.
    ///
    /// # Errors
    /// Returns an error when any stage fails, when a stage breaks the audit
    /// contract, or when the finished run lacks a decision.
    pub fn invoke(&self, query: &str) -> Result<PipelineState> {
        self.invoke_state(PipelineState::new(query))
    }

    /// Run the full pipeline over a caller-built initial state.
    ///
    /// # Errors
    /// Same conditions as [`Orchestrator::invoke`].
    pub fn invoke_state(&self, state: PipelineState) -> Result<PipelineState> {
        let run_id = state.run_id();
        let path = self.execution_path();
        info!(run_id = %run_id, path = %path, "pipeline run started");

        let state = self
            .executor
            .invoke(state)
            .with_context(|| format!("pipeline run {run_id} failed on {path} path"))?;
        verify_completed_run(&state)?;

        if let Some(decision) = state.decision {
            info!(run_id = %run_id, decision = decision.as_str(), "pipeline run finished");
        }
        Ok(state)
    }
}

/// Check the trail matches the fixed stage order and a decision was made.
///
/// # Errors
/// Returns an error describing the first mismatch.
pub fn verify_completed_run(state: &PipelineState) -> Result<()> {
    let nodes = state.audit_nodes();
    if nodes != StageName::ALL {
        let rendered: Vec<&str> = nodes.iter().map(|node| node.as_str()).collect();
        bail!(
            "audit trail out of order for run {}: [{}]",
            state.run_id(),
            rendered.join(", ")
        );
    }
    if state.decision.is_none() {
        bail!("run {} finished without a decision", state.run_id());
    }
    Ok(())
}

/// Classify a query by whole-word keyword families; policy wins over synthesis.
#[must_use]
pub fn classify_intent(query: &str) -> Intent {
    let words: Vec<String> = query
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect();
    let mentions = |family: &[&str]| words.iter().any(|word| family.contains(&word.as_str()));

    if mentions(POLICY_KEYWORDS) {
        Intent::Policy
    } else if mentions(SYNTHESIS_KEYWORDS) {
        Intent::Synthesis
    } else {
        Intent::Lookup
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStage;

impl Stage for RouterStage {
    fn name(&self) -> StageName {
        StageName::Router
    }

    fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        let intent = classify_intent(state.query());
        state.intent = Some(intent);
        state.record(AuditEntry::Router { intent });
        Ok(state)
    }
}

pub struct RetrieverStage {
    source: Arc<dyn EvidenceSource>,
    limit: usize,
}

impl RetrieverStage {
    #[must_use]
    pub fn new(source: Arc<dyn EvidenceSource>, limit: usize) -> Self {
        Self { source, limit }
    }
}

impl Stage for RetrieverStage {
    fn name(&self) -> StageName {
        StageName::Retriever
    }

    fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        let mut evidence = if state.query().trim().is_empty() {
            Vec::new()
        } else {
            self.source
                .search(state.query(), self.limit)
                .context("evidence source search failed")?
        };
        // Sources are not trusted to order their results.
        evidence.sort_by(|left, right| right.score.total_cmp(&left.score));
        evidence.truncate(self.limit);

        let hits = evidence.len();
        state.retrieved_evidence = evidence;
        state.record(AuditEntry::Retriever { hits });
        Ok(state)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RankerStage;

impl Stage for RankerStage {
    fn name(&self) -> StageName {
        StageName::Ranker
    }

    fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        state.ranked_evidence = state.retrieved_evidence.clone();
        let kept = state.ranked_evidence.len();
        state.record(AuditEntry::Ranker { kept });
        Ok(state)
    }
}

/// Quote-first answer body and the citations for the quoted items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundedAnswer {
    pub text: String,
    pub citations: Vec<String>,
    /// Character range of each quotation in `text`, in citation order.
    pub spans: Vec<(usize, usize)>,
}

/// Compose an answer from the top ranked evidence, or abstain without any.
#[must_use]
pub fn compose_answer(query: &str, evidence: &[EvidenceItem]) -> GroundedAnswer {
    if evidence.is_empty() {
        return GroundedAnswer {
            text: ABSTENTION_ANSWER.to_string(),
            citations: Vec::new(),
            spans: Vec::new(),
        };
    }

    let quoted = &evidence[..evidence.len().min(MAX_QUOTED_EVIDENCE)];
    let mut text = format!("Q: {query}\nA (grounded):");
    let mut width = text.chars().count();
    let mut spans = Vec::with_capacity(quoted.len());
    for (offset, item) in quoted.iter().enumerate() {
        let line = format!("{QUOTE_PREFIX}{}] {}", offset + 1, item.text);
        text.push('\n');
        let start = width + 1;
        width = start + line.chars().count();
        text.push_str(&line);
        spans.push((start, width));
    }
    GroundedAnswer {
        text,
        citations: format_citations(quoted),
        spans,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnswererStage;

impl Stage for AnswererStage {
    fn name(&self) -> StageName {
        StageName::Answerer
    }

    fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        let answer = compose_answer(state.query(), &state.ranked_evidence);
        let len = answer.text.chars().count();
        state.draft_answer = Some(answer.text);
        state.citations = answer.citations;
        state.record(AuditEntry::Answerer { len });
        Ok(state)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UncertaintyStage;

impl Stage for UncertaintyStage {
    fn name(&self) -> StageName {
        StageName::Uncertainty
    }

    fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        let draft = state.draft_answer.as_deref().unwrap_or(ABSTENTION_ANSWER);
        let draft_len = draft.chars().count();

        let spans = if state.ranked_evidence.is_empty() {
            vec![UncertaintySpan {
                start: 0,
                end: draft_len,
                entropy: UNGROUNDED_SPAN_ENTROPY,
            }]
        } else {
            // Quotation ranges are only known for drafts composed from this evidence.
            let composed = compose_answer(state.query(), &state.ranked_evidence);
            let quoted = if composed.text == draft {
                composed.spans
            } else {
                Vec::new()
            };
            if quoted.is_empty() {
                vec![UncertaintySpan {
                    start: 0,
                    end: draft_len,
                    entropy: GROUNDED_SPAN_ENTROPY,
                }]
            } else {
                quoted
                    .into_iter()
                    .map(|(start, end)| UncertaintySpan {
                        start,
                        end,
                        entropy: GROUNDED_SPAN_ENTROPY,
                    })
                    .collect()
            }
        };

        let report = uncertainty_report(spans);
        let overall = report.overall;
        state.uncertainty = Some(report);
        state.record(AuditEntry::Uncertainty { overall });
        Ok(state)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatorStage;

impl Stage for ValidatorStage {
    fn name(&self) -> StageName {
        StageName::Validator
    }

    fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        let evidence_count = state.retrieved_evidence.len();
        let faithful = evidence_count > 0;
        state.validation = Some(ValidationReport {
            faithful,
            checks: vec![EVIDENCE_PRESENT_CHECK.to_string()],
            evidence_count,
        });
        state.record(AuditEntry::Validator { faithful });
        Ok(state)
    }
}

/// Upstream judgments with missing values resolved pessimistically.
fn judgments(state: &PipelineState) -> (f64, bool) {
    let overall = state
        .uncertainty
        .as_ref()
        .map_or(UNGROUNDED_SPAN_ENTROPY, |report| report.overall);
    let faithful = state
        .validation
        .as_ref()
        .is_some_and(|report| report.faithful);
    (overall, faithful)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AuditorStage {
    policy: DecisionPolicy,
}

impl AuditorStage {
    #[must_use]
    pub fn new(policy: DecisionPolicy) -> Self {
        Self { policy }
    }
}

impl Stage for AuditorStage {
    fn name(&self) -> StageName {
        StageName::Auditor
    }

    fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        let (overall, faithful) = judgments(&state);
        let flag = self.policy.flag(overall, faithful);
        state.flag = Some(flag);
        state.record(AuditEntry::Auditor { flag });
        Ok(state)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisorStage {
    policy: DecisionPolicy,
}

impl SupervisorStage {
    #[must_use]
    pub fn new(policy: DecisionPolicy) -> Self {
        Self { policy }
    }
}

impl Stage for SupervisorStage {
    fn name(&self) -> StageName {
        StageName::Supervisor
    }

    fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        let (overall, faithful) = judgments(&state);
        let decision = self.policy.decide(overall, faithful);
        state.decision = Some(decision);
        state.record(AuditEntry::Supervisor { decision });
        Ok(state)
    }
}

/// The eight stages in execution order, sharing one decision policy.
#[must_use]
pub fn standard_stages(
    source: Arc<dyn EvidenceSource>,
    policy: DecisionPolicy,
    retrieval_limit: usize,
) -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(RouterStage),
        Arc::new(RetrieverStage::new(source, retrieval_limit)),
        Arc::new(RankerStage),
        Arc::new(AnswererStage),
        Arc::new(UncertaintyStage),
        Arc::new(ValidatorStage),
        Arc::new(AuditorStage::new(policy)),
        Arc::new(SupervisorStage::new(policy)),
    ]
}
