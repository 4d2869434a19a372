//! Generative drafting abstraction.
//!
//! A [`Drafter`] turns source text into a structured manual draft and
//! summarizes the differences between two manual texts. Both calls are
//! stateless request/response. Concrete backends (OpenAI, Ollama) live in
//! the app crate; [`scripted::ScriptedDrafter`] is the deterministic double.

pub mod scripted;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::ManualContent;

/// Maximum keywords kept from a generated draft.
pub const MAX_KEYWORDS: usize = 3;

/// Structured output of [`Drafter::draft`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GeneratedDraft {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub guideline: String,
}

impl GeneratedDraft {
    /// Tidy the generated fields into manual content.
    ///
    /// Keywords are trimmed, de-duplicated, and capped at [`MAX_KEYWORDS`].
    /// A draft with no usable keyword or an empty topic is malformed.
    pub fn into_content(self) -> std::result::Result<ManualContent, String> {
        let mut keywords: Vec<String> = Vec::new();
        for k in self.keywords {
            let k = k.trim().to_string();
            if !k.is_empty() && !keywords.contains(&k) {
                keywords.push(k);
            }
        }
        keywords.truncate(MAX_KEYWORDS);

        if keywords.is_empty() {
            return Err("generated draft has no keywords".to_string());
        }
        let topic = self.topic.trim().to_string();
        if topic.is_empty() {
            return Err("generated draft has an empty topic".to_string());
        }

        Ok(ManualContent {
            keywords,
            topic,
            background: self.background.trim().to_string(),
            guideline: self.guideline.trim().to_string(),
        })
    }
}

/// Structured output of [`Drafter::compare`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Comparison {
    #[serde(default)]
    pub differences: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

#[async_trait]
pub trait Drafter: Send + Sync {
    async fn draft(&self, source_text: &str, instructions: &str) -> Result<GeneratedDraft>;

    async fn compare(&self, old_text: &str, new_text: &str) -> Result<Comparison>;
}
