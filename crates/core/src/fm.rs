// crates/core/src/fm.rs

//! Foundation model gateway: the only way the loop talks to an LLM.
//!
//! Implementations can use Azure Foundry, OpenAI, a local server, or a
//! scripted double in tests. Retries are the caller's policy, see
//! [`crate::retry`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Named JSON schema the response must conform to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub token_usage: TokenUsage,
}

#[async_trait]
pub trait FmGateway: Send + Sync {
    /// Send a conversation, optionally constraining the reply to a schema.
    async fn complete(
        &self,
        conversation: &[Message],
        response_schema: Option<&ResponseSchema>,
    ) -> Result<Completion, FmError>;
}
