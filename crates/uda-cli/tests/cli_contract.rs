#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::Value;
use ulid::Ulid;

fn uda_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_uda"))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("uda-cli-contract-{}", Ulid::new()));
    fs::create_dir_all(&dir).unwrap_or_else(|err| panic!("failed to create {}: {err}", dir.display()));
    dir
}

fn uda_output(storage: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(uda_binary_path());
    command
        .env("STORAGE_DIR", storage)
        .env_remove("DLQ_FILE")
        .env_remove("UDA_CORPUS")
        .env("UDA_LOG", "warn");
    for arg in args {
        command.arg(arg);
    }
    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run uda command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_payload_schema(value: &Value) {
    let schema_path = repo_root().join("contracts/answer-payload.schema.json");
    let body = fs::read_to_string(&schema_path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", schema_path.display()));
    let schema: Value = serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", schema_path.display()));
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!("payload failed schema validation:\n{}", errors.join("\n"));
    }
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(uda_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["ask", "ingest", "dlq"] {
        assert!(stdout.contains(required), "missing {required} in help:\n{stdout}");
    }
}

#[test]
fn answered_payload_matches_schema() {
    let storage = scratch_dir();
    let output = uda_output(&storage, &["ask", "What is the refund policy?", "--json"]);
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let payload = stdout_json(&output);
    assert_payload_schema(&payload);
    assert_eq!(payload["decision"], "answer");
    assert_eq!(
        payload["citations"],
        serde_json::json!(["[1] internal://docs/policies/refunds.md :: Refund Policy"])
    );
    assert_eq!(payload["validation"]["faithful"], true);
    assert!(!storage.join("dlq.jsonl").exists());
}

#[test]
fn escalated_payload_matches_schema_and_lands_in_dlq() {
    let storage = scratch_dir();
    let output = uda_output(&storage, &["ask", "asdkjasd nonsense", "--json"]);
    assert!(output.status.success());

    let payload = stdout_json(&output);
    assert_payload_schema(&payload);
    assert_eq!(payload["decision"], "dlq");
    assert_eq!(payload["answer"], uda_domain::ABSTENTION_ANSWER);
    assert_eq!(payload["citations"], serde_json::json!([]));

    let listed = uda_output(&storage, &["dlq", "list"]);
    assert!(listed.status.success());
    let stdout = String::from_utf8_lossy(&listed.stdout);
    let records: Vec<Value> = stdout
        .lines()
        .map(|line| {
            serde_json::from_str(line).unwrap_or_else(|err| panic!("bad dlq line {line:?}: {err}"))
        })
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["query"], "asdkjasd nonsense");
    assert_eq!(
        records[0]["reason_codes"],
        serde_json::json!(["unfaithful", "high_uncertainty"])
    );
    assert_eq!(records[0]["audit_trail"].as_array().map(Vec::len), Some(8));
}

#[test]
fn sample_corpus_hides_restricted_entries() {
    let storage = scratch_dir();
    let corpus = repo_root().join("data/sample-corpus.yaml");
    let corpus_arg = corpus.display().to_string();

    let shipping = uda_output(
        &storage,
        &["ask", "How fast do express orders ship?", "--corpus", &corpus_arg, "--json"],
    );
    assert!(shipping.status.success());
    let payload = stdout_json(&shipping);
    assert_eq!(payload["decision"], "answer");
    assert_eq!(
        payload["citations"][0],
        "[1] internal://docs/policies/shipping.md :: Shipping Times"
    );

    let salary = uda_output(
        &storage,
        &["ask", "salary bands", "--corpus", &corpus_arg, "--json"],
    );
    assert!(salary.status.success());
    assert_eq!(stdout_json(&salary)["decision"], "dlq");
}

#[test]
fn invalid_chunk_size_fails_with_message() {
    let storage = scratch_dir();
    let doc = storage.join("notes.txt");
    fs::write(&doc, "some notes").unwrap_or_else(|err| panic!("failed to write fixture: {err}"));
    let doc_arg = doc.display().to_string();

    let output = uda_output(&storage, &["ingest", "--doc", &doc_arg, "--chunk-size", "0"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("chunk size must be greater than zero"), "{stderr}");
}
