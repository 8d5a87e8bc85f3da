//! Web search augmentation for queries that explicitly ask for it.

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info};

use crate::state::Conversation;

const SEARCH_PHRASES: &[&str] = &[
    "search the web for",
    "perform a web search for",
    "web search for",
    "search for",
    "look up",
    "find information about",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

pub trait SearchService: Send + Sync + 'static {
    fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<SearchHit>>;
}

/// What to search for, if `query` asks for a search.
///
/// A short follow-up ("look up its population") borrows the previous
/// non-search question for context.
pub fn search_query(query: &str, conversation: &Conversation) -> Option<String> {
    let lowered = query.to_lowercase();
    let (pos, phrase) = SEARCH_PHRASES
        .iter()
        .find_map(|p| lowered.find(p).map(|pos| (pos, *p)))?;
    let subject = lowered[pos + phrase.len()..]
        .trim()
        .trim_end_matches(['?', '.', '!'])
        .trim()
        .to_string();

    let previous = conversation
        .user_queries()
        .find(|q| !is_search_request(q) && q.split_whitespace().count() >= 3);

    match (subject.split_whitespace().count(), previous) {
        (0, Some(prev)) => Some(prev.to_string()),
        (0, None) => None,
        (1..=3, Some(prev)) => Some(format!("{prev} {subject}")),
        _ => Some(subject),
    }
}

fn is_search_request(query: &str) -> bool {
    let lowered = query.to_lowercase();
    SEARCH_PHRASES.iter().any(|p| lowered.contains(p))
}

/// Numbered, source-cited block appended to the prompt.
pub fn format_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No search results found.".into();
    }
    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, hit.title));
        if !hit.snippet.is_empty() {
            out.push_str(&format!("   {}\n", hit.snippet));
        }
        out.push_str(&format!("   [Source: {}]\n\n", hit.url));
    }
    out
}

/// DuckDuckGo Instant Answer API. Needs no key.
pub struct DuckDuckGoSearch {
    client: reqwest::blocking::Client,
}

impl DuckDuckGoSearch {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("prism/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building search client")?;
        Ok(Self { client })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InstantAnswer {
    heading: String,
    abstract_text: String,
    #[serde(rename = "AbstractURL")]
    abstract_url: String,
    related_topics: Vec<RelatedTopic>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RelatedTopic {
    text: String,
    #[serde(rename = "FirstURL")]
    first_url: String,
    /// Present on category groups instead of `text`.
    topics: Vec<RelatedTopic>,
}

impl InstantAnswer {
    fn into_hits(self, max_results: usize) -> Vec<SearchHit> {
        let mut hits = Vec::new();
        if !self.abstract_text.is_empty() {
            hits.push(SearchHit {
                title: self.heading,
                snippet: self.abstract_text,
                url: self.abstract_url,
            });
        }
        let topics = self
            .related_topics
            .into_iter()
            .flat_map(|t| if t.topics.is_empty() { vec![t] } else { t.topics });
        for topic in topics {
            if hits.len() >= max_results {
                break;
            }
            if topic.text.is_empty() {
                continue;
            }
            let title = topic
                .text
                .split(" - ")
                .next()
                .unwrap_or(&topic.text)
                .to_string();
            hits.push(SearchHit {
                title,
                snippet: topic.text,
                url: topic.first_url,
            });
        }
        hits.truncate(max_results);
        hits
    }
}

impl SearchService for DuckDuckGoSearch {
    fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<SearchHit>> {
        info!(query, "web search");
        let answer: InstantAnswer = self
            .client
            .get("https://api.duckduckgo.com/")
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .context("search request failed")?
            .error_for_status()
            .context("search service returned an error")?
            .json()
            .context("unreadable search response")?;
        let hits = answer.into_hits(max_results);
        debug!(results = hits.len(), "web search done");
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ConversationTurn, Sender};

    fn with_queries(queries: &[&str]) -> Conversation {
        let mut conversation = Conversation::new();
        for q in queries {
            conversation.push(ConversationTurn::new(Sender::User, *q));
            conversation.push(ConversationTurn::new(Sender::Assistant, "ok"));
        }
        conversation
    }

    #[test]
    fn plain_questions_do_not_search() {
        assert_eq!(search_query("what is the capital of peru", &Conversation::new()), None);
    }

    #[test]
    fn explicit_request_extracts_subject() {
        let query = search_query("Search for rust async runtimes comparison?", &Conversation::new());
        assert_eq!(query.as_deref(), Some("rust async runtimes comparison"));
    }

    #[test]
    fn short_follow_up_borrows_previous_question() {
        let conversation = with_queries(&["who designed the eiffel tower", "look up paris"]);
        let query = search_query("look up height", &conversation);
        assert_eq!(query.as_deref(), Some("who designed the eiffel tower height"));
    }

    #[test]
    fn bare_command_searches_previous_question() {
        let conversation = with_queries(&["latest mars rover news today"]);
        let query = search_query("please search for", &conversation);
        assert_eq!(query.as_deref(), Some("latest mars rover news today"));
    }

    #[test]
    fn instant_answer_flattens_topic_groups() {
        let raw = r#"{
            "Heading": "Rust",
            "AbstractText": "Rust is a programming language.",
            "AbstractURL": "https://en.wikipedia.org/wiki/Rust",
            "RelatedTopics": [
                { "Text": "Cargo - Rust package manager", "FirstURL": "https://d.example/cargo" },
                { "Name": "Group", "Topics": [
                    { "Text": "Ferris - mascot", "FirstURL": "https://d.example/ferris" }
                ]}
            ]
        }"#;
        let answer: InstantAnswer = serde_json::from_str(raw).unwrap();
        let hits = answer.into_hits(5);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].title, "Rust");
        assert_eq!(hits[1].title, "Cargo");
        assert_eq!(hits[2].url, "https://d.example/ferris");
    }

    #[test]
    fn formatted_hits_cite_sources() {
        let text = format_hits(&[SearchHit {
            title: "T".into(),
            snippet: "S".into(),
            url: "https://x".into(),
        }]);
        assert!(text.starts_with("1. T\n"));
        assert!(text.contains("[Source: https://x]"));
        assert_eq!(format_hits(&[]), "No search results found.");
    }
}
