use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PeargentError, Result};
use crate::llm::{LanguageModel, ModelBinding, ModelCompletion};
use crate::message::Message;
use crate::tool::{ParameterSchema, ToolDescription};

const SELECT_TOOL: &str = "select_agent";

/// What the router is allowed to see about a delegate: its name and public description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub description: String,
}

/// A roster member picked by the router. `index` is the member's position in the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRef {
    pub index: usize,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Agent(AgentRef),
    NeedsClarification(String),
    NoMatch,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
enum RouterDirective {
    Delegate { agent: String },
    Clarify { question: String },
    Decline,
}

/// Dispatcher that picks exactly one roster member per request, or declines.
pub struct RoutingAgent {
    name: String,
    description: String,
    persona: String,
    binding: ModelBinding,
    model: Arc<dyn LanguageModel>,
    declared: Option<Vec<String>>,
    roster: Vec<RosterEntry>,
}

impl std::fmt::Debug for RoutingAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingAgent")
            .field("name", &self.name)
            .field("binding", &self.binding)
            .field("roster", &self.roster)
            .finish()
    }
}

impl RoutingAgent {
    pub fn new(name: impl Into<String>, binding: ModelBinding, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            persona: "You route each request to the single best specialist.".to_string(),
            binding,
            model,
            declared: None,
            roster: Vec::new(),
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

    /// Pin the agent names this router expects; the pool refuses a different roster.
    pub fn with_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared = Some(agents.into_iter().map(Into::into).collect());
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

    pub fn binding(&self) -> &ModelBinding {
        &self.binding
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub(crate) fn bind_roster(&mut self, roster: Vec<RosterEntry>) -> Result<()> {
        if let Some(declared) = &self.declared {
            let expected: BTreeSet<&str> = declared.iter().map(String::as_str).collect();
            let actual: BTreeSet<&str> = roster.iter().map(|e| e.name.as_str()).collect();
            if expected != actual || declared.len() != roster.len() {
                return Err(PeargentError::Config(format!(
                    "router `{}` expects agents {:?} but the pool has {:?}",
                    self.name, declared, actual
                )));
            }
        }
        self.roster = roster;
        Ok(())
    }

    /// Route against the roster bound at pool construction.
    pub async fn route(&self, request: &str) -> Result<Selection> {
        self.route_with(request, &self.roster).await
    }

    /// Ask the model to choose among `roster`. Names that do not match exactly are `NoMatch`.
    pub async fn route_with(&self, request: &str, roster: &[RosterEntry]) -> Result<Selection> {
        if roster.is_empty() {
            return Ok(Selection::NoMatch);
        }
        let messages = vec![
            Message::system(self.system_prompt(roster)),
            Message::user(request),
        ];
        let select = ToolDescription {
            name: SELECT_TOOL.to_string(),
            description: "Delegate the request to the named agent.".to_string(),
            parameters: ParameterSchema::new().param::<String>("agent"),
        };
        let completion = self.model.complete_chat(&messages, &[select]).await?;
        Ok(interpret(completion, roster))
    }

    fn system_prompt(&self, roster: &[RosterEntry]) -> String {
        let mut prompt = String::new();
        prompt.push_str(&self.persona);
        prompt.push_str("\n\nAgents you can delegate to:\n");
        for entry in roster {
            prompt.push_str(&format!("- {}: {}\n", entry.name, entry.description));
        }
        prompt.push_str("\nReply with JSON in one of these formats:\n");
        prompt.push_str("- {\"decision\":\"delegate\",\"agent\":\"<exact agent name>\"}\n");
        prompt.push_str("- {\"decision\":\"clarify\",\"question\":\"<question for the user>\"}\n");
        prompt.push_str("- {\"decision\":\"decline\"}\n");
        prompt
    }
}

fn interpret(completion: ModelCompletion, roster: &[RosterEntry]) -> Selection {
    if let Some(call) = completion.tool_calls.first() {
        if call.name != SELECT_TOOL {
            return Selection::NoMatch;
        }
        return match call.arguments.get("agent").and_then(|v| v.as_str()) {
            Some(name) => lookup(name, roster),
            None => Selection::NoMatch,
        };
    }

    let Some(content) = completion.content else {
        return Selection::NoMatch;
    };
    match serde_json::from_str::<RouterDirective>(&content) {
        Ok(RouterDirective::Delegate { agent }) => lookup(&agent, roster),
        Ok(RouterDirective::Clarify { question }) => Selection::NeedsClarification(question),
        Ok(RouterDirective::Decline) => Selection::NoMatch,
        Err(_) => lookup(&content, roster),
    }
}

fn lookup(name: &str, roster: &[RosterEntry]) -> Selection {
    roster
        .iter()
        .position(|entry| entry.name == name)
        .map(|index| {
            Selection::Agent(AgentRef {
                index,
                name: roster[index].name.clone(),
            })
        })
        .unwrap_or(Selection::NoMatch)
}
