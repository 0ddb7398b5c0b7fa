//! Entity extraction and summarization collaborator.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::domain::Enrichment;

/// Derives structured data and a summary from transcript text
pub trait Enricher: Send + Sync {
    fn extract(&self, text: &str) -> anyhow::Result<Enrichment>;

    fn summarize(&self, text: &str) -> anyhow::Result<Option<String>>;
}

const MEDICATIONS: &[&str] = &["aspirin", "ibuprofen", "metformin", "lisinopril"];
const PROBLEMS: &[&str] = &["diabetes", "hypertension", "asthma"];

/// Keyword matcher plus first-sentences summary
#[derive(Debug, Clone)]
pub struct KeywordEnricher {
    pub summary_sentences: usize,
}

impl Default for KeywordEnricher {
    fn default() -> Self {
        Self { summary_sentences: 2 }
    }
}

impl KeywordEnricher {
    fn matches(text: &str, vocabulary: &[&str]) -> Vec<String> {
        let found: BTreeSet<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .map(str::to_lowercase)
            .filter(|word| vocabulary.contains(&word.as_str()))
            .collect();
        found.into_iter().collect()
    }
}

impl Enricher for KeywordEnricher {
    fn extract(&self, text: &str) -> anyhow::Result<Enrichment> {
        let mut enrichment = Enrichment::new();
        enrichment.insert(
            "medications".to_string(),
            Value::from(Self::matches(text, MEDICATIONS)),
        );
        enrichment.insert(
            "problems".to_string(),
            Value::from(Self::matches(text, PROBLEMS)),
        );
        Ok(enrichment)
    }

    fn summarize(&self, text: &str) -> anyhow::Result<Option<String>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let mut sentences = Vec::new();
        let mut start = 0;
        let chars: Vec<(usize, char)> = text.char_indices().collect();
        for (i, (pos, c)) in chars.iter().enumerate() {
            let at_boundary = matches!(c, '.' | '!' | '?')
                && chars.get(i + 1).map(|(_, next)| next.is_whitespace()).unwrap_or(true);
            if at_boundary {
                let end = pos + c.len_utf8();
                sentences.push(text[start..end].trim());
                start = end;
                if sentences.len() == self.summary_sentences {
                    break;
                }
            }
        }
        if sentences.len() < self.summary_sentences && start < text.len() {
            sentences.push(text[start..].trim());
        }

        Ok(Some(
            sentences
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_sorted_unique_keywords() {
        let enrichment = KeywordEnricher::default()
            .extract("Aspirin daily. History of asthma; aspirin again, plus Metformin.")
            .unwrap();

        assert_eq!(enrichment["medications"], serde_json::json!(["aspirin", "metformin"]));
        assert_eq!(enrichment["problems"], serde_json::json!(["asthma"]));
    }

    #[test]
    fn test_summary_takes_first_two_sentences() {
        let summary = KeywordEnricher::default()
            .summarize("First one. Second one! Third one? Fourth.")
            .unwrap();
        assert_eq!(summary.as_deref(), Some("First one. Second one!"));
    }

    #[test]
    fn test_summary_without_terminator() {
        let summary = KeywordEnricher::default().summarize("no punctuation here").unwrap();
        assert_eq!(summary.as_deref(), Some("no punctuation here"));
        assert_eq!(KeywordEnricher::default().summarize("   ").unwrap(), None);
    }
}
