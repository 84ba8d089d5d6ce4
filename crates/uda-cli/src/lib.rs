//! Command surface of the `uda` binary.
//!
//! - `uda ask` runs one query through the pipeline.
//! - `uda ingest` prints the chunks a document would contribute to a corpus.
//! - `uda dlq list` replays the dead-letter file.
#![forbid(unsafe_code)]

use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use uda_dlq::{DlqRecord, FileDlq};
use uda_domain::AnswerPayload;
use uda_ingest::DEFAULT_CHUNK_SIZE;
use uda_runtime::{assemble_corpus, chunk_document, Assistant, Settings};

#[derive(Debug, Parser)]
#[command(name = "uda")]
#[command(about = "Universal Data Assistant CLI")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Answer a question from the configured corpus.
    Ask(AskArgs),
    /// Normalize and chunk documents, printing one JSON chunk per line.
    Ingest(IngestArgs),
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
}

#[derive(Debug, Args)]
pub struct AskArgs {
    query: String,
    /// YAML or JSON corpus file, relative to the working directory; overrides `UDA_CORPUS`.
    #[arg(long)]
    corpus: Option<PathBuf>,
    /// Extra document to index alongside the corpus (repeatable).
    #[arg(long = "doc")]
    docs: Vec<PathBuf>,
    /// Dead-letter file; overrides `DLQ_FILE`.
    #[arg(long)]
    dlq: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long = "doc", required = true)]
    docs: Vec<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

#[derive(Debug, Subcommand)]
pub enum DlqCommand {
    /// Print every dead-letter record as one JSON line.
    List(DlqListArgs),
}

#[derive(Debug, Args)]
pub struct DlqListArgs {
    #[arg(long)]
    dlq: Option<PathBuf>,
}

/// Executes a parsed command, writing results to stdout.
///
/// # Errors
/// Returns an error when corpus loading, the pipeline, the dead-letter file or
/// writing output fails.
pub fn run_cli(cli: Cli, settings: Settings) -> Result<()> {
    let stdout = std::io::stdout();
    let mut writer = BufWriter::new(stdout.lock());
    run_command(cli.command, settings, &mut writer)?;
    writer.flush()?;
    Ok(())
}

/// Executes `command` against `settings`, writing results to `writer`.
///
/// # Errors
/// Same conditions as [`run_cli`].
pub fn run_command<W: Write>(command: Command, settings: Settings, writer: &mut W) -> Result<()> {
    match command {
        Command::Ask(args) => {
            let mut settings = settings;
            if let Some(corpus) = args.corpus {
                settings.corpus_file = Some(corpus);
            }
            if let Some(dlq) = args.dlq {
                settings.dlq_file = dlq;
            }
            let store = assemble_corpus(&settings, &args.docs)?;
            let assistant = Assistant::from_store(&settings, &store)?;
            let payload = assistant.ask(&args.query)?;
            if args.json {
                writeln!(writer, "{}", serde_json::to_string_pretty(&payload)?)?;
            } else {
                print_answer(writer, &payload)?;
            }
        }
        Command::Ingest(args) => {
            for doc in &args.docs {
                let chunks = chunk_document(doc, args.chunk_size)?;
                write_jsonl(writer, &chunks)?;
            }
        }
        Command::Dlq {
            command: DlqCommand::List(args),
        } => {
            let path = args.dlq.unwrap_or(settings.dlq_file);
            let dlq = FileDlq::open(&path)
                .with_context(|| format!("failed to open dead-letter file {}", path.display()))?;
            let records: Vec<DlqRecord> = dlq.stream()?;
            write_jsonl(writer, &records)?;
        }
    }
    Ok(())
}

fn write_jsonl<W: Write, T: Serialize>(writer: &mut W, items: &[T]) -> Result<()> {
    for item in items {
        writeln!(writer, "{}", serde_json::to_string(item)?)?;
    }
    Ok(())
}

fn print_answer<W: Write>(writer: &mut W, payload: &AnswerPayload) -> Result<()> {
    writeln!(writer, "{}", payload.answer)?;
    if !payload.citations.is_empty() {
        writeln!(writer)?;
        writeln!(writer, "citations:")?;
        for citation in &payload.citations {
            writeln!(writer, "  {citation}")?;
        }
    }
    let overall = payload
        .uncertainty
        .as_ref()
        .map_or(1.0, |report| report.overall);
    writeln!(writer)?;
    writeln!(
        writer,
        "decision={} uncertainty={overall:.3}",
        payload.decision.as_str()
    )?;
    Ok(())
}
