#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uda_domain::{hash_bytes, EvidenceItem, EvidenceSource};

pub const DEFAULT_CHUNK_SIZE: usize = 400;
pub const DEFAULT_RETRIEVAL_LIMIT: usize = 5;

const STOPWORDS: &[&str] = &[
    "about", "after", "all", "and", "any", "are", "but", "can", "could", "did", "does", "for",
    "from", "had", "has", "have", "how", "into", "its", "not", "our", "should", "that", "the",
    "their", "them", "then", "there", "these", "they", "this", "those", "was", "were", "what",
    "when", "where", "which", "who", "why", "will", "with", "would", "you", "your",
];

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    #[error("failed to read corpus {path}: {source}")]
    CorpusRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse corpus {path}: {message}")]
    CorpusParse { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentMeta {
    pub id: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub source_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub id: String,
    pub heading: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedDocument {
    pub document: DocumentMeta,
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub doc_id: String,
    pub source_uri: String,
    pub heading: Option<String>,
    pub text: String,
    pub hash: String,
}

/// One searchable unit of the keyword index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorpusEntry {
    pub doc_id: String,
    #[serde(default)]
    pub heading: Option<String>,
    pub text: String,
    #[serde(default)]
    pub source_uri: Option<String>,
    #[serde(default)]
    pub security_tags: Vec<String>,
}

impl From<Chunk> for CorpusEntry {
    fn from(chunk: Chunk) -> Self {
        Self {
            doc_id: chunk.doc_id,
            heading: chunk.heading,
            text: chunk.text,
            source_uri: Some(chunk.source_uri),
            security_tags: Vec::new(),
        }
    }
}

/// Decode bytes as UTF-8, dropping invalid sequences instead of failing.
#[must_use]
pub fn decode_ignoring_invalid(mut bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    loop {
        match std::str::from_utf8(bytes) {
            Ok(valid) => {
                out.push_str(valid);
                return out;
            }
            Err(err) => {
                let (valid, rest) = bytes.split_at(err.valid_up_to());
                out.push_str(&String::from_utf8_lossy(valid));
                match err.error_len() {
                    Some(len) => bytes = &rest[len..],
                    None => return out,
                }
            }
        }
    }
}

fn is_markdown(source_uri: &str) -> bool {
    let lowered = source_uri.to_ascii_lowercase();
    lowered.ends_with(".md") || lowered.ends_with(".markdown")
}

fn heading_of(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|ch| *ch == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some((level, rest.trim()))
}

fn push_section(
    sections: &mut Vec<Section>,
    source_uri: &str,
    heading: Option<&(usize, String)>,
    body: &mut Vec<&str>,
) {
    let text = body.join("\n").trim().to_string();
    body.clear();
    if text.is_empty() && heading.is_none() {
        return;
    }
    let mut metadata = BTreeMap::new();
    if let Some((level, _)) = heading {
        metadata.insert("heading_level".to_string(), Value::from(*level));
    }
    sections.push(Section {
        id: format!("{source_uri}#{}", sections.len()),
        heading: heading.map(|(_, title)| title.clone()),
        text,
        metadata,
    });
}

fn markdown_sections(source_uri: &str, text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut heading: Option<(usize, String)> = None;
    let mut body: Vec<&str> = Vec::new();

    for line in text.lines() {
        if let Some((level, title)) = heading_of(line) {
            push_section(&mut sections, source_uri, heading.as_ref(), &mut body);
            heading = Some((level, title.to_string()));
        } else {
            body.push(line);
        }
    }
    push_section(&mut sections, source_uri, heading.as_ref(), &mut body);
    sections
}

/// Normalize raw bytes into a document with ordered sections.
///
/// Markdown sources (`.md`, `.markdown`) are split at ATX headings; anything
/// else becomes a single untitled section.
#[must_use]
pub fn normalize_document(bytes: &[u8], source_uri: &str) -> NormalizedDocument {
    let text = decode_ignoring_invalid(bytes);
    let markdown = is_markdown(source_uri);
    let sections = if markdown {
        markdown_sections(source_uri, &text)
    } else {
        vec![Section {
            id: format!("{source_uri}#0"),
            heading: None,
            text,
            metadata: BTreeMap::new(),
        }]
    };

    NormalizedDocument {
        document: DocumentMeta {
            id: source_uri.to_string(),
            media_type: if markdown { "text/markdown" } else { "text/plain" }.to_string(),
            source_uri: source_uri.to_string(),
        },
        sections,
    }
}

/// Normalize each `(bytes, source_uri)` pair, preserving input order.
pub fn batch_ingest<'a, I>(blobs: I) -> Vec<NormalizedDocument>
where
    I: IntoIterator<Item = (&'a [u8], &'a str)>,
{
    blobs
        .into_iter()
        .map(|(bytes, source_uri)| normalize_document(bytes, source_uri))
        .collect()
}

/// Split every section into chunks of at most `max_len` characters.
///
/// # Errors
/// Returns [`IngestError::InvalidChunkSize`] when `max_len` is zero.
pub fn chunk_sections(doc: &NormalizedDocument, max_len: usize) -> Result<Vec<Chunk>, IngestError> {
    if max_len == 0 {
        return Err(IngestError::InvalidChunkSize);
    }

    let mut chunks = Vec::new();
    for section in &doc.sections {
        let chars: Vec<char> = section.text.chars().collect();
        for window in chars.chunks(max_len) {
            let part: String = window.iter().collect();
            if part.trim().is_empty() {
                continue;
            }
            chunks.push(Chunk {
                doc_id: doc.document.id.clone(),
                source_uri: doc.document.source_uri.clone(),
                heading: section.heading.clone(),
                hash: hash_bytes(part.as_bytes()),
                text: part,
            });
        }
    }
    Ok(chunks)
}

/// In-memory append-only collection of corpus entries.
#[derive(Debug, Clone, Default)]
pub struct LocalStore {
    entries: Vec<CorpusEntry>,
}

impl LocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = CorpusEntry>,
    {
        self.entries.extend(items);
    }

    /// Snapshot of every entry; later `add` calls do not affect it.
    #[must_use]
    pub fn all(&self) -> Vec<CorpusEntry> {
        self.entries.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lower-cased alphanumeric terms longer than two characters, minus stopwords.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| token.chars().count() > 2)
        .map(str::to_lowercase)
        .filter(|token| !STOPWORDS.contains(&token.as_str()))
        .collect()
}

#[derive(Debug, Clone)]
struct IndexedEntry {
    entry: CorpusEntry,
    tokens: Vec<String>,
}

/// Term-occurrence keyword index over a fixed corpus.
///
/// Entries without security tags are visible to everyone; tagged entries are
/// visible only when one of their tags is in the allowed set.
#[derive(Debug, Clone)]
pub struct KeywordIndex {
    entries: Vec<IndexedEntry>,
    allowed_tags: BTreeSet<String>,
}

impl KeywordIndex {
    pub fn new<I, T>(entries: Vec<CorpusEntry>, allowed_tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let entries = entries
            .into_iter()
            .map(|entry| IndexedEntry {
                tokens: tokenize(&entry.text),
                entry,
            })
            .collect();
        Self {
            entries,
            allowed_tags: allowed_tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_store<I, T>(store: &LocalStore, allowed_tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::new(store.all(), allowed_tags)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn visible(&self, entry: &CorpusEntry) -> bool {
        entry.security_tags.is_empty()
            || entry
                .security_tags
                .iter()
                .any(|tag| self.allowed_tags.contains(tag))
    }

    /// Score, filter and order entries for `query`.
    #[must_use]
    pub fn rank(&self, query: &str, limit: usize) -> Vec<EvidenceItem> {
        let terms = tokenize(query);
        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }

        let mut scored: Vec<EvidenceItem> = self
            .entries
            .iter()
            .filter(|indexed| self.visible(&indexed.entry))
            .filter_map(|indexed| {
                let hits: usize = terms
                    .iter()
                    .map(|term| indexed.tokens.iter().filter(|token| *token == term).count())
                    .sum();
                if hits == 0 {
                    return None;
                }
                #[allow(clippy::cast_precision_loss)]
                let score = hits as f64;
                Some(EvidenceItem {
                    doc_id: indexed.entry.doc_id.clone(),
                    source_uri: indexed.entry.source_uri.clone(),
                    heading: indexed.entry.heading.clone(),
                    score,
                    text: indexed.entry.text.clone(),
                })
            })
            .collect();

        scored.sort_by(|left, right| right.score.total_cmp(&left.score));
        scored.truncate(limit);
        scored
    }
}

impl EvidenceSource for KeywordIndex {
    fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<EvidenceItem>> {
        Ok(self.rank(query, limit))
    }
}

/// Small corpus used when no corpus file is configured.
#[must_use]
pub fn builtin_corpus() -> Vec<CorpusEntry> {
    let public = || vec!["public".to_string()];
    vec![
        CorpusEntry {
            doc_id: "doc-1".to_string(),
            heading: Some("UDA Overview".to_string()),
            text: "Universal Data Assistant provides precise, cited answers using RAG."
                .to_string(),
            source_uri: Some("internal://docs/uda/overview.md".to_string()),
            security_tags: public(),
        },
        CorpusEntry {
            doc_id: "doc-2".to_string(),
            heading: Some("Uncertainty Handling".to_string()),
            text: "UDA tracks token-level uncertainty via logprob entropy and span aggregation."
                .to_string(),
            source_uri: Some("internal://docs/uda/uncertainty.md".to_string()),
            security_tags: public(),
        },
        CorpusEntry {
            doc_id: "doc-3".to_string(),
            heading: Some("Refund Policy".to_string()),
            text: "Our refund policy allows customers to request a full refund within 30 days \
of purchase when the product is unused."
                .to_string(),
            source_uri: Some("internal://docs/policies/refunds.md".to_string()),
            security_tags: public(),
        },
    ]
}

/// Load corpus entries from a YAML or JSON list.
///
/// # Errors
/// Returns an error when the file cannot be read or does not parse as a list
/// of corpus entries.
pub fn load_corpus_from_path(path: &Path) -> Result<Vec<CorpusEntry>, IngestError> {
    let raw = std::fs::read_to_string(path).map_err(|source| IngestError::CorpusRead {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let entries: Vec<CorpusEntry> = if is_json {
        serde_json::from_str(&raw).map_err(|err| IngestError::CorpusParse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?
    } else {
        serde_yaml::from_str(&raw).map_err(|err| IngestError::CorpusParse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?
    };

    debug!(path = %path.display(), entries = entries.len(), "loaded corpus");
    Ok(entries)
}
