//! Training examples produced by collectors and importers.

use serde::{Deserialize, Serialize};

/// Example priority. Ordering is `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Bulk imports.
    Low,
    /// Curated imports.
    Medium,
    /// Live chat turns.
    High,
}

impl Priority {
    /// Weight used when the batch manager orders a batch.
    #[must_use]
    pub fn weight(self) -> u8 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Where an example came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExampleSource {
    /// Logged chat turn.
    Chat,
    /// Imported document or dataset.
    Import,
    /// Added by hand.
    Manual,
}

/// Kind of content an example was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// Plain text.
    Text,
    /// Image description.
    Image,
    /// Web page.
    Web,
}

/// Provenance attached to each example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleMetadata {
    /// Producer of the example.
    pub source: ExampleSource,
    /// Content kind, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    /// Origin URL, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ExampleMetadata {
    /// Metadata with only a source.
    #[must_use]
    pub fn from_source(source: ExampleSource) -> Self {
        Self {
            source,
            content_type: None,
            url: None,
        }
    }
}

/// A single input/output pair waiting to be trained on.
///
/// Examples are immutable once created; the queue takes ownership on insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    /// Unique id used for deduplication.
    pub id: String,
    /// Prompt text.
    pub input: String,
    /// Target text.
    pub output: String,
    /// Scheduling priority.
    pub priority: Priority,
    /// Creation time in milliseconds.
    pub timestamp: i64,
    /// Provenance.
    pub metadata: ExampleMetadata,
}

impl TrainingExample {
    /// Create an example with a fresh UUID and the current time.
    #[must_use]
    pub fn new(
        input: impl Into<String>,
        output: impl Into<String>,
        priority: Priority,
        source: ExampleSource,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            input: input.into(),
            output: output.into(),
            priority,
            timestamp: crate::clock::now_ms(),
            metadata: ExampleMetadata::from_source(source),
        }
    }

    /// Replace the id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Replace the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach a content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.metadata.content_type = Some(content_type);
        self
    }

    /// Attach an origin URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.metadata.url = Some(url.into());
        self
    }

    /// Queue ordering key: higher priority first, then newer first.
    #[must_use]
    pub fn rank(&self) -> (Priority, i64) {
        (self.priority, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_and_weight() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::High.weight(), 3);
        assert_eq!(Priority::Low.weight(), 1);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_new_example_has_unique_id() {
        let a = TrainingExample::new("hi", "hello", Priority::High, ExampleSource::Chat);
        let b = TrainingExample::new("hi", "hello", Priority::High, ExampleSource::Chat);
        assert_ne!(a.id, b.id);
        assert!(a.timestamp > 0);
    }

    #[test]
    fn test_metadata_serialization_skips_missing_fields() {
        let ex = TrainingExample::new("q", "a", Priority::Low, ExampleSource::Import)
            .with_id("fixed")
            .with_timestamp(7);
        let json = serde_json::to_string(&ex).unwrap();
        assert!(json.contains("\"source\":\"import\""));
        assert!(!json.contains("url"));

        let web = ex.with_content_type(ContentType::Web).with_url("https://example.org");
        let back: TrainingExample =
            serde_json::from_str(&serde_json::to_string(&web).unwrap()).unwrap();
        assert_eq!(back.metadata.content_type, Some(ContentType::Web));
        assert_eq!(back.metadata.url.as_deref(), Some("https://example.org"));
    }
}
