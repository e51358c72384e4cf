//! xAI Grok chat-completions client.
//!
//! Thin reqwest wrapper plus the payload/response plumbing the import
//! pipeline needs: Live Search parameters with excluded-website lists,
//! response-text extraction for both the `/chat/completions` and
//! `/responses` wire shapes, and JSON extraction from model output.

mod client;
mod types;
mod util;

pub use client::{GrokCallError, GrokClient, GrokResponse};
pub use types::{
    ChatMessage, ChatRequest, MessageRole, SearchParameters, DEFAULT_MODEL, SYSTEM_PROMPT,
};
pub use util::{
    extract_json_array, extract_json_object, extract_response_text, extract_upstream_request_id,
};
