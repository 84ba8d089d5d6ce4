#![forbid(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uda_domain::{
    now_utc, AuditEntry, DateTimeUtc, Decision, PipelineState, RunId, UncertaintyReport,
    ValidationReport,
};
use uda_policy::DecisionPolicy;

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("dead-letter I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode dead-letter record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("corrupt dead-letter record at {path}:{line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Unfaithful,
    HighUncertainty,
}

impl ReasonCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unfaithful => "unfaithful",
            Self::HighUncertainty => "high_uncertainty",
        }
    }
}

/// Envelope written for every run routed to human review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DlqRecord {
    pub run_id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: DateTimeUtc,
    pub reason_codes: Vec<ReasonCode>,
    pub query: String,
    pub decision: Option<Decision>,
    pub uncertainty: Option<UncertaintyReport>,
    pub validation: Option<ValidationReport>,
    pub audit_trail: Vec<AuditEntry>,
}

impl DlqRecord {
    /// Capture a finished run, explaining the escalation with reason codes.
    #[must_use]
    pub fn from_state(state: &PipelineState, policy: &DecisionPolicy) -> Self {
        let mut reason_codes = Vec::new();
        if !state
            .validation
            .as_ref()
            .is_some_and(|report| report.faithful)
        {
            reason_codes.push(ReasonCode::Unfaithful);
        }
        let overall = state.uncertainty.as_ref().map_or(1.0, |report| report.overall);
        if policy.exceeds(overall) {
            reason_codes.push(ReasonCode::HighUncertainty);
        }

        Self {
            run_id: state.run_id(),
            enqueued_at: now_utc(),
            reason_codes,
            query: state.query().to_string(),
            decision: state.decision,
            uncertainty: state.uncertainty.clone(),
            validation: state.validation.clone(),
            audit_trail: state.audit_trail().to_vec(),
        }
    }
}

/// Append-only JSON-lines dead-letter file.
///
/// Each `enqueue` writes one complete line with a single write while holding
/// the sink's lock, so concurrent producers never interleave records.
#[derive(Debug)]
pub struct FileDlq {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDlq {
    /// Open the sink at `path`, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns an error when the parent directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DlqError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| DlqError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `record` as one JSON line.
    ///
    /// # Errors
    /// Returns an error when the record cannot be serialized or written.
    pub fn enqueue<T: Serialize>(&self, record: &T) -> Result<(), DlqError> {
        let mut line = serde_json::to_string(record).map_err(DlqError::Encode)?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let io_err = |source| DlqError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        append_whole_line(&mut file, line.as_bytes()).map_err(io_err)?;

        debug!(path = %self.path.display(), bytes = line.len(), "dead-letter record appended");
        Ok(())
    }

    /// Replay every record in insertion order. A missing file is empty.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or a line is not a valid
    /// record.
    pub fn stream<T: DeserializeOwned>(&self) -> Result<Vec<T>, DlqError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(DlqError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| DlqError::Io {
                path: self.path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| DlqError::Corrupt {
                path: self.path.clone(),
                line: index + 1,
                source,
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Append-only sink that can be cut back to an earlier length.
trait Truncatable: Write {
    fn end(&mut self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl Truncatable for File {
    fn end(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Writes `line` completely or restores the sink to its previous length, so a
/// failed append never leaves a partial record behind.
fn append_whole_line<W: Truncatable>(sink: &mut W, line: &[u8]) -> io::Result<()> {
    let start = sink.end()?;
    let written = sink.write_all(line).and_then(|()| sink.flush());
    if let Err(err) = written {
        if let Err(rollback) = sink.truncate_to(start) {
            warn!(error = %rollback, "failed to roll back partial dead-letter write");
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use uda_domain::Intent;

    fn must<T>(result: Result<T, DlqError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn unique_dlq_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("uda-dlq-{}", ulid::Ulid::new()))
            .join("nested")
            .join("dlq.jsonl")
    }

    fn escalated_state() -> PipelineState {
        let mut state = PipelineState::new("asdkjasd nonsense");
        state.record(AuditEntry::Router {
            intent: Intent::Lookup,
        });
        state.uncertainty = Some(UncertaintyReport {
            overall: 1.0,
            spans: Vec::new(),
        });
        state.validation = Some(ValidationReport {
            faithful: false,
            checks: vec!["evidence_present".to_string()],
            evidence_count: 0,
        });
        state.decision = Some(Decision::Dlq);
        state
    }

    #[test]
    fn open_creates_directories_idempotently() {
        let path = unique_dlq_path();
        let first = must(FileDlq::open(&path));
        let second = must(FileDlq::open(&path));
        assert_eq!(first.path(), second.path());
        assert!(path.parent().is_some_and(Path::is_dir));
    }

    #[test]
    fn stream_of_missing_file_is_empty() {
        let dlq = must(FileDlq::open(unique_dlq_path()));
        let records: Vec<Value> = must(dlq.stream());
        assert!(records.is_empty());
    }

    #[test]
    fn records_replay_in_insertion_order() {
        let dlq = must(FileDlq::open(unique_dlq_path()));
        for index in 0..3 {
            must(dlq.enqueue(&json!({"seq": index, "text": "line\nbreak"})));
        }
        let records: Vec<Value> = must(dlq.stream());
        let seqs: Vec<i64> = records
            .iter()
            .filter_map(|record| record["seq"].as_i64())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(records[0]["text"], "line\nbreak");
    }

    #[test]
    fn corrupt_line_fails_the_stream() {
        let path = unique_dlq_path();
        let dlq = must(FileDlq::open(&path));
        must(dlq.enqueue(&json!({"ok": true})));
        if let Err(err) = std::fs::write(&path, "{\"ok\": true}\n{broken\n") {
            panic!("failed to corrupt fixture: {err}");
        }
        match dlq.stream::<Value>() {
            Err(DlqError::Corrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected corrupt-line error, got {other:?}"),
        }
    }

    #[test]
    fn record_round_trips_with_reason_codes() {
        let dlq = must(FileDlq::open(unique_dlq_path()));
        let record = DlqRecord::from_state(&escalated_state(), &DecisionPolicy::default());
        assert_eq!(
            record.reason_codes,
            vec![ReasonCode::Unfaithful, ReasonCode::HighUncertainty]
        );
        must(dlq.enqueue(&record));

        let replayed: Vec<DlqRecord> = must(dlq.stream());
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].run_id, record.run_id);
        assert_eq!(replayed[0].query, "asdkjasd nonsense");
        assert_eq!(replayed[0].reason_codes, record.reason_codes);
        assert_eq!(replayed[0].audit_trail, record.audit_trail);

        let raw: Vec<Value> = must(dlq.stream());
        assert_eq!(raw[0]["reason_codes"], json!(["unfaithful", "high_uncertainty"]));
        assert!(raw[0]["enqueued_at"].is_string());
    }

    #[test]
    fn concurrent_producers_never_interleave_lines() {
        let dlq = Arc::new(must(FileDlq::open(unique_dlq_path())));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let dlq = Arc::clone(&dlq);
                std::thread::spawn(move || {
                    for seq in 0..25 {
                        must(dlq.enqueue(&json!({"worker": worker, "seq": seq})));
                    }
                })
            })
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                panic!("producer thread panicked");
            }
        }

        let records: Vec<Value> = must(dlq.stream());
        assert_eq!(records.len(), 100);
        for worker in 0..4 {
            let seqs: Vec<i64> = records
                .iter()
                .filter(|record| record["worker"] == worker)
                .filter_map(|record| record["seq"].as_i64())
                .collect();
            assert_eq!(seqs, (0..25).collect::<Vec<i64>>());
        }
    }

    /// In-memory sink that accepts `capacity` bytes and then fails.
    struct ShortSink {
        bytes: Vec<u8>,
        capacity: usize,
    }

    impl Write for ShortSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.capacity.saturating_sub(self.bytes.len());
            if room == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "disk full"));
            }
            let taken = room.min(buf.len());
            self.bytes.extend_from_slice(&buf[..taken]);
            Ok(taken)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Truncatable for ShortSink {
        fn end(&mut self) -> io::Result<u64> {
            Ok(self.bytes.len() as u64)
        }

        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.bytes
                .truncate(usize::try_from(len).unwrap_or_else(|_| unreachable!()));
            Ok(())
        }
    }

    #[test]
    fn failed_append_leaves_no_partial_line() {
        let mut sink = ShortSink {
            bytes: b"{\"seq\":1}\n".to_vec(),
            capacity: 16,
        };
        let err = match append_whole_line(&mut sink, b"{\"seq\":2,\"pad\":true}\n") {
            Ok(()) => panic!("short sink should reject the second line"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(sink.bytes, b"{\"seq\":1}\n".to_vec());

        sink.capacity = 64;
        if let Err(err) = append_whole_line(&mut sink, b"{\"seq\":2}\n") {
            panic!("append with room should succeed: {err}");
        }
        assert_eq!(sink.bytes, b"{\"seq\":1}\n{\"seq\":2}\n".to_vec());
    }

    #[test]
    fn file_rollback_restores_the_previous_length() {
        let path = unique_dlq_path();
        let dlq = must(FileDlq::open(&path));
        must(dlq.enqueue(&json!({"seq": 1})));

        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap_or_else(|err| panic!("open failed: {err}"));
        let start = file.end().unwrap_or_else(|err| panic!("metadata failed: {err}"));
        file.write_all(b"{\"seq\":")
            .unwrap_or_else(|err| panic!("write failed: {err}"));
        file.truncate_to(start)
            .unwrap_or_else(|err| panic!("truncate failed: {err}"));
        must(dlq.enqueue(&json!({"seq": 2})));

        let records: Vec<Value> = must(dlq.stream());
        assert_eq!(records, vec![json!({"seq": 1}), json!({"seq": 2})]);
    }
}
