use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message handed to a language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A structured request from the model to run a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            arguments,
        }
    }
}

/// Output of a tool, fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub name: String,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// One entry in the prompt sent to a model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool(name: impl Into<String>, output: Value) -> Self {
        let name = name.into();
        Self {
            role: Role::Tool,
            content: format!("Tool `{name}` responded"),
            tool_call: None,
            tool_result: Some(ToolResult {
                name,
                output,
                tool_call_id: None,
            }),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call: None,
            tool_result: None,
        }
    }
}

/// Role of a persisted transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// The caller's request; `agent` records where the router sent it.
    User,
    /// A final answer or a clarification question.
    Assistant,
    /// One agent-to-tool exchange: the call and what came back.
    Tool,
    /// Pool notices such as budget exhaustion or cancellation.
    System,
}

/// What a tool exchange produced, success or error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolObservation {
    pub name: String,
    pub output: Value,
    #[serde(default)]
    pub is_error: bool,
}

/// An append-only transcript entry stored in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<ToolObservation>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    fn new(role: TurnRole, agent: Option<String>, content: impl Into<String>) -> Self {
        Self {
            role,
            agent,
            content: content.into(),
            tool_calls: Vec::new(),
            observation: None,
            created_at: Utc::now(),
        }
    }

    pub fn request(content: impl Into<String>, routed_to: Option<String>) -> Self {
        Self::new(TurnRole::User, routed_to, content)
    }

    pub fn answer(agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, Some(agent.into()), content)
    }

    pub fn clarification(question: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, None, question)
    }

    pub fn notice(content: impl Into<String>) -> Self {
        Self::new(TurnRole::System, None, content)
    }

    pub fn tool_exchange(agent: impl Into<String>, call: ToolCall, observation: ToolObservation) -> Self {
        let content = if observation.is_error {
            format!("Tool `{}` failed: {}", observation.name, render_value(&observation.output))
        } else {
            format!("Tool `{}` returned {}", observation.name, render_value(&observation.output))
        };
        Self {
            tool_calls: vec![call],
            observation: Some(observation),
            ..Self::new(TurnRole::Tool, Some(agent.into()), content)
        }
    }

    /// Expand the turn into the messages a model sees.
    pub fn to_messages(&self) -> Vec<Message> {
        match self.role {
            TurnRole::User => vec![Message::user(&self.content)],
            TurnRole::Assistant => vec![Message::assistant(&self.content)],
            TurnRole::System => vec![Message::system(&self.content)],
            TurnRole::Tool => {
                let mut messages = Vec::with_capacity(2);
                for call in &self.tool_calls {
                    messages.push(Message {
                        role: Role::Assistant,
                        content: format!("Calling tool `{}`", call.name),
                        tool_call: Some(call.clone()),
                        tool_result: None,
                    });
                }
                match &self.observation {
                    Some(observation) => {
                        let mut message = Message::tool(&observation.name, observation.output.clone());
                        message.content = self.content.clone();
                        if let Some(result) = message.tool_result.as_mut() {
                            result.tool_call_id = self.tool_calls.first().and_then(|c| c.id.clone());
                        }
                        messages.push(message);
                    }
                    None => messages.push(Message::system(&self.content)),
                }
                messages
            }
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
