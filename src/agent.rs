use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::ContextPolicy;
use crate::error::{PeargentError, Result};
use crate::llm::{LanguageModel, ModelBinding, ModelCompletion};
use crate::message::{Message, ToolCall, Turn};
use crate::retry::RetryPolicy;
use crate::tool::{ToolDescription, ToolRegistry};

const MODEL_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Structured instructions a model may emit as plain text when it has no native tool calling.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentDirective {
    Respond { content: String },
    CallTool { name: String, arguments: Value },
}

/// Outcome of one agent turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    FinalAnswer(String),
    ToolRequest(ToolCall),
}

/// A persona-bound specialist with a fixed toolset and model binding.
///
/// Everything is set before the agent joins a pool and never changes afterwards.
pub struct Agent {
    name: String,
    description: String,
    persona: String,
    tools: ToolRegistry,
    binding: ModelBinding,
    model: Arc<dyn LanguageModel>,
    max_retries: u32,
    context: ContextPolicy,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("binding", &self.binding)
            .field("tools", &self.tools.names())
            .finish()
    }
}

impl Agent {
    pub fn new(name: impl Into<String>, binding: ModelBinding, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            persona: "You are a helpful agent.".to_string(),
            tools: ToolRegistry::new(),
            binding,
            model,
            max_retries: 0,
            context: ContextPolicy::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_context(mut self, context: ContextPolicy) -> Self {
        self.context = context;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn binding(&self) -> &ModelBinding {
        &self.binding
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn context_policy(&self) -> &ContextPolicy {
        &self.context
    }

    /// Ask the model for the next step given the conversation so far.
    pub async fn run_turn(&self, conversation: &[Turn]) -> Result<TurnResult> {
        let messages = self.build_messages(conversation);
        let tools = self.tools.describe();
        let completion = RetryPolicy::new(self.max_retries, MODEL_RETRY_BACKOFF)
            .with_exponential_backoff(true)
            .retry(
                &self.name,
                |_| self.model.complete_chat(&messages, &tools),
                |err| matches!(err, PeargentError::LanguageModel(_)),
            )
            .await?;
        self.interpret(completion)
    }

    /// Run one of this agent's own tools. Names outside the toolset are refused.
    pub async fn call_tool(&self, call: &ToolCall) -> Result<Value> {
        if !self.tools.contains(&call.name) {
            warn!(agent = %self.name, tool = %call.name, "agent requested a tool it does not own");
            return Err(PeargentError::ToolNotFound(call.name.clone()));
        }
        self.tools.call(&call.name, call.arguments.clone()).await
    }

    fn interpret(&self, completion: ModelCompletion) -> Result<TurnResult> {
        let mut calls = completion.tool_calls.into_iter();
        if let Some(call) = calls.next() {
            let dropped = calls.count();
            if dropped > 0 {
                warn!(agent = %self.name, dropped, "model requested several tools, keeping the first");
            }
            debug!(agent = %self.name, tool = %call.name, "turn yielded a tool request");
            return Ok(TurnResult::ToolRequest(call));
        }

        let content = completion.content.ok_or_else(|| {
            PeargentError::Protocol(format!(
                "agent `{}` received neither text nor a tool call",
                self.name
            ))
        })?;

        match serde_json::from_str::<AgentDirective>(content.trim()) {
            Ok(AgentDirective::CallTool { name, arguments }) => {
                Ok(TurnResult::ToolRequest(ToolCall::new(name, arguments)))
            }
            Ok(AgentDirective::Respond { content }) => Ok(TurnResult::FinalAnswer(content)),
            Err(_) => Ok(TurnResult::FinalAnswer(content)),
        }
    }

    fn build_messages(&self, conversation: &[Turn]) -> Vec<Message> {
        let mut messages = vec![Message::system(self.system_prompt())];
        for turn in self.context.apply(conversation) {
            messages.extend(turn.to_messages());
        }
        messages
    }

    fn system_prompt(&self) -> String {
        let mut prompt = String::new();
        prompt.push_str(&self.persona);
        prompt.push_str("\n\n");
        prompt.push_str("Answer directly, or request exactly one tool at a time. Without native tool calling, reply with JSON:\n");
        prompt.push_str("- {\"action\":\"respond\",\"content\":\"<final answer>\"}\n");
        prompt.push_str("- {\"action\":\"call_tool\",\"name\":\"<tool name>\",\"arguments\":{...}}\n\n");
        if self.tools.is_empty() {
            prompt.push_str("No tools are available.\n");
        } else {
            prompt.push_str("Available tools:\n");
            for tool in self.tools.describe() {
                prompt.push_str(&describe_tool(&tool));
            }
        }
        prompt
    }
}

fn describe_tool(tool: &ToolDescription) -> String {
    let params: Vec<String> = tool
        .parameters
        .iter()
        .map(|p| {
            let marker = if p.required { "" } else { "?" };
            format!("{}{marker}: {}", p.name, p.kind.as_str())
        })
        .collect();
    format!("- {}({}): {}\n", tool.name, params.join(", "), tool.description)
}
