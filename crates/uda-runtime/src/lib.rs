#![forbid(unsafe_code)]

pub mod logging;
pub mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};
use uda_dlq::{DlqRecord, FileDlq};
use uda_domain::{AnswerPayload, Decision, PipelineState};
use uda_ingest::{
    builtin_corpus, chunk_sections, load_corpus_from_path, normalize_document, Chunk,
    CorpusEntry, KeywordIndex, LocalStore, DEFAULT_CHUNK_SIZE,
};
use uda_pipeline::{standard_stages, ExecutionPath, Orchestrator};
use uda_policy::DecisionPolicy;

pub use logging::{init_logging, LogFormat};
pub use settings::{Settings, SettingsError};

/// Read a document from disk, normalize it and split it into chunks.
///
/// # Errors
/// Returns an error when the file cannot be read or chunked.
pub fn chunk_document(path: &Path, chunk_size: usize) -> Result<Vec<Chunk>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let document = normalize_document(&bytes, &path.display().to_string());
    let chunks = chunk_sections(&document, chunk_size)
        .with_context(|| format!("failed to chunk {}", path.display()))?;
    debug!(
        path = %path.display(),
        sections = document.sections.len(),
        chunks = chunks.len(),
        "document chunked"
    );
    Ok(chunks)
}

/// # Errors
/// Same conditions as [`chunk_document`].
pub fn ingest_document(path: &Path, chunk_size: usize) -> Result<Vec<CorpusEntry>> {
    let chunks = chunk_document(path, chunk_size)?;
    Ok(chunks.into_iter().map(CorpusEntry::from).collect())
}

/// Configured corpus (or the builtin one) plus any extra documents.
///
/// # Errors
/// Returns an error when the corpus file or a document cannot be loaded.
pub fn assemble_corpus(settings: &Settings, documents: &[PathBuf]) -> Result<LocalStore> {
    let mut store = LocalStore::new();
    match &settings.corpus_file {
        Some(path) => store.add(
            load_corpus_from_path(path)
                .with_context(|| format!("failed to load corpus {}", path.display()))?,
        ),
        None => store.add(builtin_corpus()),
    }
    for document in documents {
        store.add(ingest_document(document, DEFAULT_CHUNK_SIZE)?);
    }
    debug!(entries = store.len(), documents = documents.len(), "corpus assembled");
    Ok(store)
}

/// Runs the pipeline and routes escalated runs to the dead-letter sink.
pub struct Assistant {
    orchestrator: Orchestrator,
    policy: DecisionPolicy,
    dlq: Option<FileDlq>,
}

impl Assistant {
    #[must_use]
    pub fn new(orchestrator: Orchestrator, policy: DecisionPolicy, dlq: Option<FileDlq>) -> Self {
        Self {
            orchestrator,
            policy,
            dlq,
        }
    }

    /// Build an assistant over a snapshot of `store` using the settings' tags,
    /// limits and dead-letter file.
    ///
    /// # Errors
    /// Returns an error when the dead-letter file cannot be prepared.
    pub fn from_store(settings: &Settings, store: &LocalStore) -> Result<Self> {
        let policy = DecisionPolicy::default();
        let index = KeywordIndex::from_store(store, settings.default_security_tags.iter().cloned());
        let orchestrator = Orchestrator::build(standard_stages(
            Arc::new(index),
            policy,
            settings.retrieval_limit,
        ));
        let dlq = FileDlq::open(&settings.dlq_file).with_context(|| {
            format!("failed to open dead-letter file {}", settings.dlq_file.display())
        })?;
        info!(
            path = %orchestrator.execution_path(),
            dlq = %settings.dlq_file.display(),
            "assistant ready"
        );
        Ok(Self::new(orchestrator, policy, Some(dlq)))
    }

    /// # Errors
    /// Returns an error when the corpus or dead-letter file cannot be loaded.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let store = assemble_corpus(settings, &[])?;
        Self::from_store(settings, &store)
    }

    #[must_use]
    pub fn execution_path(&self) -> ExecutionPath {
        self.orchestrator.execution_path()
    }

    #[must_use]
    pub fn dlq(&self) -> Option<&FileDlq> {
        self.dlq.as_ref()
    }

    /// Run the pipeline, enqueueing the run when it is escalated.
    ///
    /// # Errors
    /// Returns an error when the pipeline fails or the dead-letter write fails.
    pub fn run(&self, query: &str) -> Result<PipelineState> {
        self.run_until(query, None)
    }

    /// Like [`Assistant::run`], but a run that completes after `deadline` is
    /// discarded without touching the dead-letter sink.
    ///
    /// # Errors
    /// Returns an error when the deadline has passed, the pipeline fails or
    /// the dead-letter write fails.
    pub fn run_until(&self, query: &str, deadline: Option<Instant>) -> Result<PipelineState> {
        let state = self.orchestrator.invoke(query)?;
        if deadline.is_some_and(|deadline| Instant::now() > deadline) {
            warn!(run_id = %state.run_id(), "run finished after its deadline; discarded");
            bail!("run {} finished after its deadline", state.run_id());
        }
        if state.decision == Some(Decision::Dlq) {
            match &self.dlq {
                Some(dlq) => {
                    let record = DlqRecord::from_state(&state, &self.policy);
                    let reasons: Vec<&str> =
                        record.reason_codes.iter().map(|code| code.as_str()).collect();
                    dlq.enqueue(&record).with_context(|| {
                        format!("failed to enqueue run {} for review", state.run_id())
                    })?;
                    info!(
                        run_id = %state.run_id(),
                        reasons = %reasons.join(","),
                        "run routed to dead-letter queue"
                    );
                }
                None => warn!(run_id = %state.run_id(), "escalated run has no dead-letter sink"),
            }
        }
        Ok(state)
    }

    /// Run the pipeline and project the response payload.
    ///
    /// # Errors
    /// Same conditions as [`Assistant::run`].
    pub fn ask(&self, query: &str) -> Result<AnswerPayload> {
        self.ask_until(query, None)
    }

    /// # Errors
    /// Same conditions as [`Assistant::run_until`].
    pub fn ask_until(&self, query: &str, deadline: Option<Instant>) -> Result<AnswerPayload> {
        let state = self.run_until(query, deadline)?;
        Ok(AnswerPayload::from(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uda_dlq::ReasonCode;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_settings() -> Settings {
        let root = std::env::temp_dir().join(format!("uda-runtime-{}", ulid::Ulid::new()));
        Settings {
            storage_dir: root.clone(),
            dlq_file: root.join("dlq.jsonl"),
            ..Settings::default()
        }
    }

    #[test]
    fn answered_runs_skip_the_dead_letter_queue() {
        let settings = temp_settings();
        let assistant = must(Assistant::from_settings(&settings));
        let payload = must(assistant.ask("What is the refund policy?"));
        assert_eq!(payload.decision, Decision::Answer);
        assert_eq!(payload.citations.len(), 1);

        let dlq = assistant.dlq().unwrap_or_else(|| unreachable!());
        let records: Vec<DlqRecord> = dlq.stream().unwrap_or_else(|_| unreachable!());
        assert!(records.is_empty());
    }

    #[test]
    fn escalated_runs_are_enqueued_with_reasons() {
        let settings = temp_settings();
        let assistant = must(Assistant::from_settings(&settings));
        let payload = must(assistant.ask("asdkjasd nonsense"));
        assert_eq!(payload.decision, Decision::Dlq);
        assert_eq!(payload.answer, uda_domain::ABSTENTION_ANSWER);

        let dlq = assistant.dlq().unwrap_or_else(|| unreachable!());
        let records: Vec<DlqRecord> = dlq.stream().unwrap_or_else(|_| unreachable!());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].query, "asdkjasd nonsense");
        assert_eq!(
            records[0].reason_codes,
            vec![ReasonCode::Unfaithful, ReasonCode::HighUncertainty]
        );
        assert_eq!(records[0].audit_trail.len(), 8);
    }

    #[test]
    fn security_tags_hide_restricted_entries() {
        let settings = temp_settings();
        let mut store = LocalStore::new();
        store.add([CorpusEntry {
            doc_id: "hr-1".to_string(),
            heading: Some("Salary Bands".to_string()),
            text: "Salary bands are reviewed every spring.".to_string(),
            source_uri: Some("internal://hr/salaries.md".to_string()),
            security_tags: vec!["restricted".to_string()],
        }]);
        let assistant = must(Assistant::from_store(&settings, &store));
        let state = must(assistant.run("salary bands"));
        assert!(state.retrieved_evidence.is_empty());
        assert_eq!(state.decision, Some(Decision::Dlq));
    }

    #[test]
    fn ingested_documents_become_searchable() {
        let settings = temp_settings();
        let doc_path = settings.storage_dir.join("handbook.md");
        must(std::fs::create_dir_all(&settings.storage_dir).map_err(anyhow::Error::from));
        must(
            std::fs::write(
                &doc_path,
                "# Shipping\nParcels leave the warehouse within two business days.\n",
            )
            .map_err(anyhow::Error::from),
        );

        let store = must(assemble_corpus(&settings, &[doc_path.clone()]));
        assert_eq!(store.len(), builtin_corpus().len() + 1);

        let assistant = must(Assistant::from_store(&settings, &store));
        let payload = must(assistant.ask("When do parcels leave the warehouse?"));
        assert_eq!(payload.decision, Decision::Answer);
        assert_eq!(
            payload.citations,
            vec![format!("[1] {} :: Shipping", doc_path.display())]
        );
    }

    #[test]
    fn runs_past_their_deadline_are_not_enqueued() {
        let settings = temp_settings();
        let assistant = must(Assistant::from_settings(&settings));
        let expired = Instant::now();
        std::thread::sleep(std::time::Duration::from_millis(2));

        let err = match assistant.ask_until("asdkjasd nonsense", Some(expired)) {
            Ok(_) => panic!("an expired run should be discarded"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("after its deadline"), "{err:#}");

        let dlq = assistant.dlq().unwrap_or_else(|| unreachable!());
        let records: Vec<DlqRecord> = dlq.stream().unwrap_or_else(|_| unreachable!());
        assert!(records.is_empty());

        let later = Instant::now() + std::time::Duration::from_secs(60);
        let payload = must(assistant.ask_until("asdkjasd nonsense", Some(later)));
        assert_eq!(payload.decision, Decision::Dlq);
        let records: Vec<DlqRecord> = dlq.stream().unwrap_or_else(|_| unreachable!());
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn zero_chunk_size_is_rejected_with_path_context() {
        let settings = temp_settings();
        let doc_path = settings.storage_dir.join("notes.txt");
        must(std::fs::create_dir_all(&settings.storage_dir).map_err(anyhow::Error::from));
        must(std::fs::write(&doc_path, "plain notes").map_err(anyhow::Error::from));

        let err = match chunk_document(&doc_path, 0) {
            Ok(_) => panic!("zero chunk size should fail"),
            Err(err) => err,
        };
        let rendered = format!("{err:#}");
        assert!(rendered.contains("failed to chunk"), "{rendered}");
        assert!(rendered.contains("chunk size must be greater than zero"), "{rendered}");
    }

    #[test]
    fn missing_corpus_file_is_reported() {
        let settings = Settings {
            corpus_file: Some(PathBuf::from("/nonexistent/uda/corpus.yaml")),
            ..temp_settings()
        };
        let err = match Assistant::from_settings(&settings) {
            Ok(_) => panic!("expected corpus load failure"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("failed to load corpus"));
    }

    #[test]
    fn assistant_without_sink_still_answers() {
        let index = KeywordIndex::new(builtin_corpus(), ["public"]);
        let policy = DecisionPolicy::default();
        let orchestrator = Orchestrator::build(standard_stages(Arc::new(index), policy, 5));
        let assistant = Assistant::new(orchestrator, policy, None);
        let payload = must(assistant.ask("nothing matches zzzz"));
        assert_eq!(payload.decision, Decision::Dlq);
        assert!(assistant.dlq().is_none());
    }
}
