//! OpenAI chat-completions sentiment classifier
//!
//! Sends a batch of comment texts in one request and asks for a JSON object
//! with one `{index, label, confidence}` entry per text. Label validation is
//! left to the pipeline; this crate only turns the wire format into a
//! positional [`ClassifyResponse`](commentline_core::ClassifyResponse).

pub mod client;
pub mod prompt;

pub use client::{DEFAULT_BASE_URL, DEFAULT_MODEL, OpenAiClassifier};
