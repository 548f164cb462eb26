//! Request body and response parsing for batch classification

use serde::{Deserialize, Serialize};

use commentline_core::{Classification, ClassifyResponse, ServiceError};

const SYSTEM_PROMPT: &str = "You classify the sentiment of YouTube comments. \
For every comment you receive, answer with one label out of POSITIVE, NEUTRAL, \
NEGATIVE or MIXED and a confidence between 0 and 1. \
Reply with a JSON object of the form \
{\"results\": [{\"index\": 0, \"label\": \"POSITIVE\", \"confidence\": 0.93}]} \
containing exactly one entry per comment, using the comment's index.";

#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub temperature: f32,
    pub response_format: ResponseFormat,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Serialize)]
struct UserPayload<'a> {
    comments: Vec<IndexedText<'a>>,
}

#[derive(Serialize)]
struct IndexedText<'a> {
    index: usize,
    text: &'a str,
}

/// Chat request classifying `texts` in one call
pub fn build_request<'a>(model: &'a str, texts: &[&str]) -> ChatRequest<'a> {
    let payload = UserPayload {
        comments: texts
            .iter()
            .enumerate()
            .map(|(index, text)| IndexedText { index, text })
            .collect(),
    };
    let user = serde_json::to_string(&payload).unwrap_or_default();
    ChatRequest {
        model,
        temperature: 0.0,
        response_format: ResponseFormat {
            kind: "json_object",
        },
        messages: vec![
            Message {
                role: "system".to_string(),
                content: Some(SYSTEM_PROMPT.to_string()),
            },
            Message {
                role: "user".to_string(),
                content: Some(user),
            },
        ],
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct LabelSet {
    results: Vec<LabelEntry>,
}

#[derive(Debug, Deserialize)]
struct LabelEntry {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    label: String,
    #[serde(default)]
    confidence: f64,
}

/// Turn a chat completion body into positional results for `expected` texts.
///
/// Entries are placed by their `index`; a hole left by a skipped index gets
/// an empty label. Indices at or past `expected` are dropped. Entries
/// without an index are taken in order.
pub fn parse_response(
    body: &str,
    fallback_model: &str,
    expected: usize,
) -> Result<ClassifyResponse, ServiceError> {
    let chat: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::InvalidResponse(format!("chat completion: {e}")))?;
    let model_version = chat
        .model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| fallback_model.to_string());
    let content = chat
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ServiceError::InvalidResponse("completion has no content".into()))?;
    let labels: LabelSet = serde_json::from_str(content.trim())
        .map_err(|e| ServiceError::InvalidResponse(format!("label JSON: {e}")))?;

    let indexed = labels.results.iter().all(|e| e.index.is_some());
    let results = if indexed {
        let mut slots: Vec<Option<Classification>> = vec![None; expected];
        for entry in labels.results {
            if let Some(slot) = entry.index.and_then(|i| slots.get_mut(i)) {
                slot.get_or_insert(Classification::new(entry.label, entry.confidence));
            }
        }
        // Keep trailing gaps as a short result, fill inner gaps with empty labels
        let filled = slots.iter().rposition(Option::is_some).map_or(0, |i| i + 1);
        slots
            .into_iter()
            .take(filled)
            .map(|s| s.unwrap_or_else(|| Classification::new("", 0.0)))
            .collect()
    } else {
        labels
            .results
            .into_iter()
            .take(expected)
            .map(|e| Classification::new(e.label, e.confidence))
            .collect()
    };

    Ok(ClassifyResponse {
        model_version,
        results,
    })
}
