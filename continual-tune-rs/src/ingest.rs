//! Turning chat turns, JSONL datasets, and text documents into examples.
//!
//! Every importer reports per item. A malformed line or an unreadable file
//! produces a failed [`ImportOutcome`] and the rest of the input is still
//! processed.
//!
//! # JSONL records
//!
//! Each non-empty line is one of:
//!
//! - a pair: `{"input": "", "output": "", "priority"?: "high", "source"?: "import",
//!   "content_type"?: "text", "url"?: "", "id"?: ""}`
//! - a conversation: `{"conversations": [{"from": "human", "value": ""},
//!   {"from": "gpt", "value": ""}]}`, yielding one example per answered turn.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::example::{ContentType, ExampleSource, Priority, TrainingExample};

/// Result of importing one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    /// What was imported, e.g. `data.jsonl:3` or a file path.
    pub item: String,
    /// Whether the item produced examples.
    pub success: bool,
    /// Examples produced.
    pub examples: usize,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImportOutcome {
    fn ok(item: String, examples: usize) -> Self {
        Self {
            item,
            success: true,
            examples,
            error: None,
        }
    }

    fn failed(item: String, error: impl Into<String>) -> Self {
        let error = error.into();
        warn!(item = %item, error = %error, "import failed");
        Self {
            item,
            success: false,
            examples: 0,
            error: Some(error),
        }
    }
}

/// Examples gathered by an importer plus one outcome per item.
#[derive(Debug, Clone, Default)]
pub struct ImportBatch {
    /// Successfully parsed examples, in input order.
    pub examples: Vec<TrainingExample>,
    /// Per-item results.
    pub outcomes: Vec<ImportOutcome>,
}

impl ImportBatch {
    /// Items that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    /// Items that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    fn extend(&mut self, other: Self) {
        self.examples.extend(other.examples);
        self.outcomes.extend(other.outcomes);
    }
}

/// A logged chat turn, always high priority.
#[must_use]
pub fn chat_turn(user: impl Into<String>, assistant: impl Into<String>) -> TrainingExample {
    TrainingExample::new(user, assistant, Priority::High, ExampleSource::Chat)
        .with_content_type(ContentType::Text)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonlRecord {
    Pair(PairRecord),
    Conversation(ConversationRecord),
}

#[derive(Deserialize)]
struct PairRecord {
    input: String,
    output: String,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    source: Option<ExampleSource>,
    #[serde(default)]
    content_type: Option<ContentType>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize)]
struct ConversationRecord {
    conversations: Vec<ConversationMessage>,
    #[serde(default)]
    priority: Option<Priority>,
}

#[derive(Deserialize)]
struct ConversationMessage {
    from: String,
    value: String,
}

impl PairRecord {
    fn into_example(self) -> Option<TrainingExample> {
        if self.output.trim().is_empty() {
            return None;
        }
        let mut example = TrainingExample::new(
            self.input,
            self.output,
            self.priority.unwrap_or(Priority::Medium),
            self.source.unwrap_or(ExampleSource::Import),
        );
        if let Some(id) = self.id {
            example = example.with_id(id);
        }
        if let Some(content_type) = self.content_type {
            example = example.with_content_type(content_type);
        }
        if let Some(url) = self.url {
            example = example.with_url(url);
        }
        Some(example)
    }
}

impl ConversationRecord {
    fn into_examples(self) -> Vec<TrainingExample> {
        let priority = self.priority.unwrap_or(Priority::Medium);
        let mut examples = Vec::new();
        let mut prompt: Option<String> = None;
        for msg in self.conversations {
            match msg.from.as_str() {
                "human" | "user" => prompt = Some(msg.value),
                "gpt" | "assistant" => {
                    if let Some(input) = prompt.take() {
                        examples.push(
                            TrainingExample::new(input, msg.value, priority, ExampleSource::Import)
                                .with_content_type(ContentType::Text),
                        );
                    }
                }
                _ => {}
            }
        }
        examples
    }
}

/// Parse JSONL text. `origin` names the source in outcomes.
#[must_use]
pub fn parse_jsonl(origin: &str, content: &str) -> ImportBatch {
    let mut batch = ImportBatch::default();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let item = format!("{origin}:{}", idx + 1);
        let parsed: JsonlRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                batch
                    .outcomes
                    .push(ImportOutcome::failed(item, format!("failed to parse line: {e}")));
                continue;
            }
        };
        let examples = match parsed {
            JsonlRecord::Pair(pair) => pair.into_example().into_iter().collect(),
            JsonlRecord::Conversation(conv) => conv.into_examples(),
        };
        if examples.is_empty() {
            batch
                .outcomes
                .push(ImportOutcome::failed(item, "record has no output text"));
            continue;
        }
        batch.outcomes.push(ImportOutcome::ok(item, examples.len()));
        batch.examples.extend(examples);
    }
    debug!(
        origin,
        examples = batch.examples.len(),
        failed = batch.failed(),
        "parsed jsonl"
    );
    batch
}

/// Read a JSONL file. An unreadable file yields a single failed outcome.
pub fn import_jsonl<P: AsRef<Path>>(path: P) -> ImportBatch {
    let path = path.as_ref();
    let origin = path.display().to_string();
    match std::fs::read_to_string(path) {
        Ok(content) => parse_jsonl(&origin, &content),
        Err(e) => ImportBatch {
            examples: Vec::new(),
            outcomes: vec![ImportOutcome::failed(origin, e.to_string())],
        },
    }
}

/// Split `text` into chunks of at most `chunk_chars` characters, breaking on
/// paragraph boundaries where possible. `0` disables chunking.
#[must_use]
pub fn chunk_text(text: &str, chunk_chars: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if chunk_chars == 0 || text.chars().count() <= chunk_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let para_len = para.chars().count();
        if current_len > 0 && current_len + 2 + para_len > chunk_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if para_len > chunk_chars {
            let chars: Vec<char> = para.chars().collect();
            for window in chars.chunks(chunk_chars) {
                chunks.push(window.iter().collect());
            }
            continue;
        }
        if current_len > 0 {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(para);
        current_len += para_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn document_examples(path: &Path, text: &str, chunk_chars: usize) -> Vec<TrainingExample> {
    let title = path
        .file_stem()
        .map_or_else(|| path.display().to_string(), |s| s.to_string_lossy().into_owned());
    let chunks = chunk_text(text, chunk_chars);
    let total = chunks.len();
    let priority = if total == 1 {
        Priority::Medium
    } else {
        Priority::Low
    };
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let prompt = if total == 1 {
                title.clone()
            } else {
                format!("{title} ({}/{total})", i + 1)
            };
            TrainingExample::new(prompt, chunk, priority, ExampleSource::Import)
                .with_content_type(ContentType::Text)
        })
        .collect()
}

/// Import plain-text documents, one outcome per path.
///
/// A document that fits in one chunk becomes a single medium-priority
/// example; longer documents become low-priority chunks titled
/// `name (i/n)`.
pub fn import_documents<P: AsRef<Path>>(paths: &[P], chunk_chars: usize) -> ImportBatch {
    let mut batch = ImportBatch::default();
    for path in paths {
        let path = path.as_ref();
        let item = path.display().to_string();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                batch.outcomes.push(ImportOutcome::failed(item, e.to_string()));
                continue;
            }
        };
        let examples = document_examples(path, &text, chunk_chars);
        if examples.is_empty() {
            batch
                .outcomes
                .push(ImportOutcome::failed(item, "document is empty"));
            continue;
        }
        batch.outcomes.push(ImportOutcome::ok(item, examples.len()));
        batch.examples.extend(examples);
    }
    batch
}

/// Import a mix of `.jsonl` datasets and text documents.
pub fn import_paths(paths: &[PathBuf], chunk_chars: usize) -> ImportBatch {
    let mut batch = ImportBatch::default();
    let (jsonl, docs): (Vec<&PathBuf>, Vec<&PathBuf>) = paths
        .iter()
        .partition(|p| p.extension().is_some_and(|e| e == "jsonl"));
    for path in jsonl {
        batch.extend(import_jsonl(path));
    }
    batch.extend(import_documents(&docs, chunk_chars));
    batch
}
