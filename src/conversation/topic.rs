//! Topic log: a rough category for every user message, newest first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TopicCategory {
    Skills,
    Projects,
    Contact,
    Experience,
    General,
}

/// Keyword table checked in order; the first category with a match wins.
/// Covers English and Spanish phrasing.
const KEYWORDS: &[(TopicCategory, &[&str])] = &[
    (TopicCategory::Skills, &["skill", "habilidad", "tech"]),
    (TopicCategory::Projects, &["project", "proyecto"]),
    (TopicCategory::Contact, &["contact", "contacto"]),
    (TopicCategory::Experience, &["experi", "work"]),
];

/// Classify a user message by case-insensitive keyword substrings.
pub fn categorize(text: &str) -> TopicCategory {
    let lower = text.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(category, _)| *category)
        .unwrap_or(TopicCategory::General)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Topic {
    pub id: Uuid,
    pub category: TopicCategory,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl Topic {
    /// Build a topic entry; the summary keeps the first `summary_length`
    /// characters and marks truncation with `...`.
    pub fn from_input(text: &str, summary_length: usize) -> Self {
        let mut summary: String = text.chars().take(summary_length).collect();
        if text.chars().count() > summary_length {
            summary.push_str("...");
        }

        Self {
            id: Uuid::new_v4(),
            category: categorize(text),
            summary,
            timestamp: Utc::now(),
        }
    }
}
