//! Keyword-based reply sentiment.
//!
//! Matching is plain substring containment on the lowercased text, so short
//! keywords fire inside longer words ("nope" contains "no"). Any negative hit
//! wins over any number of positive hits.

use serde::{Deserialize, Serialize};

/// Coarse tone of an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "POSITIVE",
            Self::Neutral => "NEUTRAL",
            Self::Negative => "NEGATIVE",
        }
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Sentiment {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "POSITIVE" => Ok(Self::Positive),
            "NEUTRAL" => Ok(Self::Neutral),
            "NEGATIVE" => Ok(Self::Negative),
            _ => Err(format!("Unknown sentiment: {}", s)),
        }
    }
}

pub const POSITIVE_KEYWORDS: &[&str] = &[
    "yes",
    "interested",
    "sounds good",
    "let's talk",
    "call me",
    "meeting",
    "demo",
    "pricing",
    "book",
    "schedule",
    "tell me more",
];

pub const NEGATIVE_KEYWORDS: &[&str] = &[
    "no",
    "not interested",
    "remove",
    "unsubscribe",
    "stop",
    "spam",
    "don't contact",
    "do not contact",
    "opt out",
    "opt-out",
];

/// Explicit removal requests. Only these, combined with a negative
/// classification, put a sender on the suppression list.
pub const OPT_OUT_KEYWORDS: &[&str] = &["unsubscribe", "remove", "stop", "opt out", "opt-out"];

fn combined_lower(body: &str, subject: &str) -> String {
    format!("{body} {subject}").to_lowercase()
}

fn count_hits(text: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|kw| text.contains(*kw)).count()
}

/// Classify a reply from its body and subject.
pub fn classify_sentiment(body: &str, subject: &str) -> Sentiment {
    let text = combined_lower(body, subject);

    if count_hits(&text, NEGATIVE_KEYWORDS) > 0 {
        return Sentiment::Negative;
    }
    if count_hits(&text, POSITIVE_KEYWORDS) > 0 {
        return Sentiment::Positive;
    }
    Sentiment::Neutral
}

/// Whether body or subject contains an explicit opt-out keyword.
pub fn has_opt_out_keyword(body: &str, subject: &str) -> bool {
    count_hits(&combined_lower(body, subject), OPT_OUT_KEYWORDS) > 0
}
