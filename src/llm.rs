//! Language model abstractions.
//!
//! Provider clients live outside this crate; the pool only needs something that
//! honours the structured function-calling contract below.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PeargentError, Result};
use crate::message::{Message, ToolCall};
use crate::tool::ToolDescription;

/// Result of a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelCompletion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            content: None,
            tool_calls: vec![call],
        }
    }
}

/// Minimal abstraction around a chat completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ModelCompletion>;
}

/// Which backend and model an agent talks to. Stored in pears as plain data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelBinding {
    #[serde(rename = "type")]
    pub provider: String,
    pub model_name: String,
}

impl ModelBinding {
    pub fn new(provider: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_name: model_name.into(),
        }
    }
}

impl std::fmt::Display for ModelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.model_name)
    }
}

/// Turns a [`ModelBinding`] into a live backend when a pear is loaded.
pub trait ModelProvider: Send + Sync {
    fn model_for(&self, binding: &ModelBinding) -> Result<Arc<dyn LanguageModel>>;
}

impl<F> ModelProvider for F
where
    F: Fn(&ModelBinding) -> Result<Arc<dyn LanguageModel>> + Send + Sync,
{
    fn model_for(&self, binding: &ModelBinding) -> Result<Arc<dyn LanguageModel>> {
        self(binding)
    }
}

/// A deterministic model used for tests and demos.
///
/// Responses are replayed in order. Each one is either a JSON directive
/// (`{"action":"respond",...}` / `{"action":"call_tool",...}`) or raw text.
pub struct StubModel {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl StubModel {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// Every message list the model has been asked to complete.
    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StubDirective {
    Respond { content: String },
    CallTool { name: String, arguments: Value },
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn complete_chat(
        &self,
        messages: &[Message],
        _tools: &[ToolDescription],
    ) -> Result<ModelCompletion> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(messages.to_vec());
        }
        let raw = self
            .responses
            .lock()
            .map_err(|_| PeargentError::LanguageModel("stub model poisoned".into()))?
            .pop_front()
            .ok_or_else(|| {
                PeargentError::LanguageModel("StubModel ran out of scripted responses".into())
            })?;

        match serde_json::from_str::<StubDirective>(&raw) {
            Ok(StubDirective::Respond { content }) => Ok(ModelCompletion::text(content)),
            Ok(StubDirective::CallTool { name, arguments }) => {
                Ok(ModelCompletion::tool_call(ToolCall::new(name, arguments)))
            }
            Err(_) => Ok(ModelCompletion::text(raw)),
        }
    }
}
