//! Context enrichment: cause/action lookup plus an optional natural-language
//! summary from an external text-generation service.

pub mod summarizer;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::detect::{AlarmClass, DetectError};
use crate::retry::with_timeout;

pub use summarizer::{ChatSummarizer, DisabledSummarizer, Summarizer};

/// Human-authored guidance for one (variable, alarm label) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    #[serde(rename = "Cause", default)]
    pub cause: String,
    #[serde(rename = "Actions", default)]
    pub actions: String,
}

impl ContextEntry {
    pub fn is_empty(&self) -> bool {
        self.cause.is_empty() && self.actions.is_empty()
    }

    /// Deterministic text used when no summary is available.
    pub fn fallback_text(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| format!("Cause: {}; Actions: {}", self.cause, self.actions))
    }
}

/// Collapse runs of whitespace and trim.
fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Read-only `variable -> alarm label -> entry` knowledge base.
#[derive(Debug, Clone, Default)]
pub struct ContextCorpus {
    entries: HashMap<String, HashMap<String, ContextEntry>>,
}

impl ContextCorpus {
    pub fn new(raw: HashMap<String, HashMap<String, ContextEntry>>) -> Self {
        let entries = raw
            .into_iter()
            .map(|(var, labels)| {
                let labels = labels
                    .into_iter()
                    .map(|(label, e)| {
                        let e = ContextEntry {
                            cause: clean_text(&e.cause),
                            actions: clean_text(&e.actions),
                        };
                        (clean_text(&label), e)
                    })
                    .collect();
                (clean_text(&var), labels)
            })
            .collect();
        Self { entries }
    }

    pub fn from_json_str(content: &str) -> Result<Self, DetectError> {
        let raw = serde_json::from_str(content)
            .map_err(|e| DetectError::Configuration(format!("invalid alarm context: {}", e)))?;
        Ok(Self::new(raw))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DetectError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DetectError::Configuration(format!(
                "could not read alarm context {}: {}",
                path.display(),
                e
            ))
        })?;
        let corpus = Self::from_json_str(&content)?;
        info!(path = %path.display(), variables = corpus.entries.len(), "Loaded alarm context");
        Ok(corpus)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, variable: &str, label: &str) -> Option<&ContextEntry> {
        self.entries
            .get(variable)
            .and_then(|labels| labels.get(label))
            .filter(|e| !e.is_empty())
    }
}

/// Turns a non-OK classification into context text.
pub struct Enricher {
    corpus: ContextCorpus,
    summarizer: Arc<dyn Summarizer>,
    timeout: Duration,
}

impl Enricher {
    /// `timeout` bounds the whole summarize call, retries included.
    pub fn new(corpus: ContextCorpus, summarizer: Arc<dyn Summarizer>, timeout: Duration) -> Self {
        Self {
            corpus,
            summarizer,
            timeout,
        }
    }

    /// Corpus-only enrichment; every hit uses the fallback text.
    pub fn without_summaries(corpus: ContextCorpus) -> Self {
        Self::new(corpus, Arc::new(DisabledSummarizer), Duration::from_secs(1))
    }

    pub fn corpus(&self) -> &ContextCorpus {
        &self.corpus
    }

    /// Context for a classification. A lookup miss yields an empty string; a
    /// hit always yields non-empty text, summarized when the service answers
    /// in time and the stringified entry otherwise.
    pub async fn context_for(&self, variable: &str, class: AlarmClass) -> String {
        let Some(entry) = self.corpus.lookup(variable, class.label()) else {
            return String::new();
        };

        let summary = with_timeout(
            "summarizer",
            self.timeout,
            self.summarizer.summarize(variable, class.label(), entry),
        )
        .await;

        match summary {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => entry.fallback_text(),
            Err(e) => {
                debug!(%variable, alarm = %class, error = %e, "Summary unavailable, using raw context");
                entry.fallback_text()
            }
        }
    }
}
