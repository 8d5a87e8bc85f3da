//! Answer generation: the multimodal LLM behind the assistant.

use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::state::{ConversationTurn, Sender};
use crate::vision::Frame;

const SYSTEM_PROMPT: &str = "You are Prism, a voice and vision assistant. \
Your answers are read aloud, so be concise and direct and avoid markdown. \
When web search results are provided, answer only from them and name the sources. \
When an image is provided, describe what is relevant to the question.";

/// Everything one answer is generated from.
#[derive(Debug, Clone, Copy)]
pub struct AnswerRequest<'a> {
    pub query: &'a str,
    /// Earlier turns, oldest first, not including `query`.
    pub history: &'a [ConversationTurn],
    pub frame: Option<&'a Frame>,
    pub search_results: Option<&'a str>,
}

/// Turns a user query into the assistant's reply.
///
/// Called from a blocking worker; implementations may block on the network.
pub trait AnswerService: Send + Sync + 'static {
    fn generate(&self, request: &AnswerRequest<'_>) -> anyhow::Result<String>;
}

// ── Gemini ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// Gemini `generateContent` client.
pub struct GeminiAnswerService {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
    max_history: usize,
}

impl GeminiAnswerService {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building Gemini client")?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            max_history: 10,
        })
    }

    pub fn with_max_history(mut self, turns: usize) -> Self {
        self.max_history = turns.max(1);
        self
    }

    fn build_request(&self, request: &AnswerRequest<'_>) -> GenerateRequest {
        let start = request.history.len().saturating_sub(self.max_history);
        let mut contents: Vec<Content> = request.history[start..]
            .iter()
            .map(|turn| Content {
                role: Some(match turn.sender {
                    Sender::User => "user",
                    Sender::Assistant => "model",
                }),
                parts: vec![Part::Text {
                    text: turn.text.clone(),
                }],
            })
            .collect();

        let mut prompt = request.query.to_string();
        if let Some(results) = request.search_results {
            prompt = format!(
                "Answer the question using these web search results.\n\n\
                 Question: {}\n\nSearch results:\n{results}",
                request.query
            );
        }
        let mut parts = vec![Part::Text { text: prompt }];
        if let Some(frame) = request.frame {
            parts.push(Part::InlineData {
                inline_data: InlineData {
                    mime_type: frame.mime_type.clone(),
                    data: general_purpose::STANDARD.encode(&frame.bytes),
                },
            });
        }
        contents.push(Content {
            role: Some("user"),
            parts,
        });

        GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part::Text {
                    text: SYSTEM_PROMPT.into(),
                }],
            },
            contents,
            generation_config: GenerationConfig {
                temperature: 0.7,
                max_output_tokens: 1024,
            },
        }
    }
}

impl AnswerService for GeminiAnswerService {
    fn generate(&self, request: &AnswerRequest<'_>) -> anyhow::Result<String> {
        info!(
            model = self.model.as_str(),
            history = request.history.len().min(self.max_history),
            image = request.frame.is_some(),
            search = request.search_results.is_some(),
            "generating answer"
        );
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.build_request(request))
            .send()
            .context("Gemini request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            bail!("Gemini API returned {status}: {body}");
        }

        let body: GenerateResponse = response.json().context("unreadable Gemini response")?;
        if let Some(reason) = body.prompt_feedback.and_then(|f| f.block_reason) {
            bail!("Gemini blocked the request: {reason}");
        }
        let text: String = body
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("Gemini returned no text"));
        }
        debug!(chars = text.len(), "answer received");
        Ok(text.to_string())
    }
}

/// Offline stand-in that repeats the question back.
pub struct EchoAnswerService;

impl AnswerService for EchoAnswerService {
    fn generate(&self, request: &AnswerRequest<'_>) -> anyhow::Result<String> {
        let mut answer = format!("You said: {}.", request.query.trim_end_matches('.'));
        if request.frame.is_some() {
            answer.push_str(" I can see the image you shared.");
        }
        if request.search_results.is_some() {
            answer.push_str(" I looked that up for you.");
        }
        Ok(answer)
    }
}
