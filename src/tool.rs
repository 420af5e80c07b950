use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::{PeargentError, Result};
use crate::retry::RetryPolicy;

/// Primitive types a tool parameter may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    /// Parses a type name, either the JSON Schema spelling or the short
    /// `str`/`int`/`float`/`bool`/`list`/`dict` annotations older bundles carry.
    pub fn from_type_name(name: &str) -> Option<ParamType> {
        match name.trim() {
            "string" | "str" => Some(ParamType::String),
            "integer" | "int" => Some(ParamType::Integer),
            "number" | "float" => Some(ParamType::Number),
            "boolean" | "bool" => Some(ParamType::Boolean),
            "array" | "list" => Some(ParamType::Array),
            "object" | "dict" => Some(ParamType::Object),
            _ => None,
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

/// Rust types that map onto a tool parameter type.
///
/// `Option<T>` marks the parameter optional, everything else is required.
pub trait ToolParam {
    const TYPE: ParamType;
    const REQUIRED: bool = true;
}

macro_rules! tool_param {
    ($kind:ident => $($ty:ty),+) => {
        $(impl ToolParam for $ty {
            const TYPE: ParamType = ParamType::$kind;
        })+
    };
}

tool_param!(String => String);
tool_param!(Integer => i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);
tool_param!(Number => f32, f64);
tool_param!(Boolean => bool);
tool_param!(Object => Map<String, Value>);

impl<T> ToolParam for Vec<T> {
    const TYPE: ParamType = ParamType::Array;
}

impl<T: ToolParam> ToolParam for Option<T> {
    const TYPE: ParamType = T::TYPE;
    const REQUIRED: bool = false;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Ordered parameter list of a tool. Arguments are matched by name, never by position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSchema {
    params: Vec<Parameter>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter whose type and optionality come from the Rust type `T`.
    pub fn param<T: ToolParam>(self, name: impl Into<String>) -> Self {
        self.with(name, T::TYPE, T::REQUIRED)
    }

    pub fn required(self, name: impl Into<String>, kind: ParamType) -> Self {
        self.with(name, kind, true)
    }

    pub fn optional(self, name: impl Into<String>, kind: ParamType) -> Self {
        self.with(name, kind, false)
    }

    fn with(mut self, name: impl Into<String>, kind: ParamType, required: bool) -> Self {
        self.params.push(Parameter {
            name: name.into(),
            kind,
            required,
        });
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub(crate) fn check_unique(&self, tool: &str) -> Result<()> {
        for (idx, param) in self.params.iter().enumerate() {
            if self.params[..idx].iter().any(|p| p.name == param.name) {
                return Err(PeargentError::Protocol(format!(
                    "tool `{tool}` declares parameter `{}` twice",
                    param.name
                )));
            }
        }
        Ok(())
    }

    /// Check `args` against the schema and return the accepted argument object.
    pub fn validate(&self, tool: &str, args: &Value) -> Result<Map<String, Value>> {
        let reject = |reason: String| PeargentError::ToolArgument {
            tool: tool.to_string(),
            reason,
        };

        let object = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => return Err(reject(format!("expected an argument object, got `{other}`"))),
        };

        if let Some(unknown) = object.keys().find(|key| self.get(key).is_none()) {
            return Err(reject(format!("unknown parameter `{unknown}`")));
        }

        let mut accepted = Map::new();
        for param in &self.params {
            match object.get(&param.name) {
                None | Some(Value::Null) => {
                    if param.required {
                        return Err(reject(format!(
                            "missing required parameter `{}`",
                            param.name
                        )));
                    }
                }
                Some(value) => {
                    if !param.kind.accepts(value) {
                        return Err(reject(format!(
                            "parameter `{}` expects {}, got `{value}`",
                            param.name,
                            param.kind.as_str()
                        )));
                    }
                    accepted.insert(param.name.clone(), value.clone());
                }
            }
        }
        Ok(accepted)
    }

    /// JSON-Schema rendering handed to model backends.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.params {
            properties.insert(param.name.clone(), json!({ "type": param.kind.as_str() }));
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::default()
    }

    /// Run the tool. `input` is always an object that passed schema validation.
    async fn call(&self, input: Value) -> Result<Value>;
}

/// Static description of a tool, frozen when the tool is registered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: ParameterSchema,
}

impl ToolDescription {
    pub fn of(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters(),
        }
    }
}

/// What to hand back to the agent once a tool has failed for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Raise,
    ReturnError,
    ReturnNone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub max_retries: u32,
    /// Seconds between attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default)]
    pub retry_backoff: bool,
    /// Per-attempt timeout in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub on_error: OnError,
}

fn default_retry_delay() -> f64 {
    1.0
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay: default_retry_delay(),
            retry_backoff: false,
            timeout: None,
            on_error: OnError::Raise,
        }
    }
}

impl ToolPolicy {
    pub fn with_retries(mut self, max_retries: u32, retry_delay: f64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_backoff(mut self, backoff: bool) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, seconds(self.retry_delay))
            .with_exponential_backoff(self.retry_backoff)
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(seconds)
    }

    /// Reject values that cannot be turned into sane durations.
    pub fn validate(&self, tool: &str) -> Result<()> {
        let reject = |reason: String| PeargentError::Config(format!("tool `{tool}`: {reason}"));
        if !(self.retry_delay.is_finite() && (0.0..=MAX_RETRY_DELAY_SECS).contains(&self.retry_delay)) {
            return Err(reject(format!(
                "retry_delay must be between 0 and {MAX_RETRY_DELAY_SECS}s, got {}",
                self.retry_delay
            )));
        }
        if let Some(timeout) = self.timeout {
            if !(timeout.is_finite() && timeout > 0.0 && timeout <= MAX_TIMEOUT_SECS) {
                return Err(reject(format!(
                    "timeout must be in (0, {MAX_TIMEOUT_SECS}]s, got {timeout}"
                )));
            }
        }
        Ok(())
    }
}

const MAX_RETRY_DELAY_SECS: f64 = 3600.0;
const MAX_TIMEOUT_SECS: f64 = 86_400.0;

/// Seconds to a duration, clamping instead of panicking on out-of-range input.
fn seconds(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

#[derive(Clone)]
struct ToolEntry {
    description: ToolDescription,
    policy: ToolPolicy,
    tool: Arc<dyn Tool>,
}

/// Ordered, name-unique set of tools owned by one agent.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    entries: Vec<ToolEntry>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> Result<()> {
        self.register_arc(Arc::new(tool), ToolPolicy::default())
    }

    pub fn register_with_policy<T: Tool + 'static>(&mut self, tool: T, policy: ToolPolicy) -> Result<()> {
        self.register_arc(Arc::new(tool), policy)
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>, policy: ToolPolicy) -> Result<()> {
        let description = ToolDescription::of(tool.as_ref());
        self.insert(description, policy, tool)
    }

    /// Register a callable under a description that was fixed elsewhere (e.g. a pear).
    pub(crate) fn insert(
        &mut self,
        description: ToolDescription,
        policy: ToolPolicy,
        tool: Arc<dyn Tool>,
    ) -> Result<()> {
        if self.index.contains_key(&description.name) {
            return Err(PeargentError::DuplicateTool(description.name));
        }
        policy.validate(&description.name)?;
        description.parameters.check_unique(&description.name)?;
        self.index.insert(description.name.clone(), self.entries.len());
        self.entries.push(ToolEntry {
            description,
            policy,
            tool,
        });
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.description.name.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptions in registration order.
    pub fn describe(&self) -> Vec<ToolDescription> {
        self.entries
            .iter()
            .map(|entry| entry.description.clone())
            .collect()
    }

    pub fn policy(&self, name: &str) -> Option<&ToolPolicy> {
        self.entry(name).map(|entry| &entry.policy)
    }

    fn entry(&self, name: &str) -> Option<&ToolEntry> {
        self.index.get(name).map(|&idx| &self.entries[idx])
    }

    /// Validate `input` against the tool's schema, then invoke it under its policy.
    ///
    /// Argument errors are returned before the tool body runs and are never retried.
    pub async fn call(&self, name: &str, input: Value) -> Result<Value> {
        let entry = self
            .entry(name)
            .ok_or_else(|| PeargentError::ToolNotFound(name.to_string()))?;
        let args = Value::Object(entry.description.parameters.validate(name, &input)?);

        let timeout = entry.policy.timeout_duration();
        let outcome = entry
            .policy
            .retry_policy()
            .retry(
                name,
                |attempt| {
                    let tool = Arc::clone(&entry.tool);
                    let args = args.clone();
                    async move {
                        debug!(tool = name, attempt, "invoking tool");
                        invoke_once(tool.as_ref(), name, args, timeout).await
                    }
                },
                |err| {
                    matches!(
                        err,
                        PeargentError::ToolExecution { .. } | PeargentError::ToolTimeout { .. }
                    )
                },
            )
            .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(err) => match entry.policy.on_error {
                OnError::Raise => Err(err),
                OnError::ReturnError => {
                    warn!(tool = name, error = %err, "tool failed, returning error payload");
                    Ok(json!({ "error": err.to_string() }))
                }
                OnError::ReturnNone => {
                    warn!(tool = name, error = %err, "tool failed, returning null");
                    Ok(Value::Null)
                }
            },
        }
    }
}

async fn invoke_once(
    tool: &dyn Tool,
    name: &str,
    args: Value,
    timeout: Option<Duration>,
) -> Result<Value> {
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, tool.call(args))
            .await
            .map_err(|_| PeargentError::ToolTimeout {
                name: name.to_string(),
                seconds: limit.as_secs_f64(),
            })?,
        None => tool.call(args).await,
    };
    result.map_err(|err| match err {
        err @ (PeargentError::ToolExecution { .. } | PeargentError::ToolTimeout { .. }) => err,
        other => PeargentError::ToolExecution {
            name: name.to_string(),
            message: other.to_string(),
        },
    })
}

type ToolFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// A tool backed by an async closure.
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: ParameterSchema,
    func: Arc<ToolFn>,
}

impl FunctionTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ParameterSchema,
        func: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            func: Arc::new(move |input| Box::pin(func(input))),
        }
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .finish()
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> ParameterSchema {
        self.parameters.clone()
    }

    async fn call(&self, input: Value) -> Result<Value> {
        (self.func)(input).await
    }
}

/// Maps tool names back to live callables when a pear is loaded.
pub trait ToolResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>>;
}

impl<F> ToolResolver for F
where
    F: Fn(&str) -> Option<Arc<dyn Tool>> + Send + Sync,
{
    fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self(name)
    }
}

/// Host-side collection of tool implementations, looked up by name.
#[derive(Default, Clone)]
pub struct ToolCatalog {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Tool + 'static>(&mut self, tool: T) {
        self.insert_arc(Arc::new(tool));
    }

    pub fn insert_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.insert(tool);
        self
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl ToolResolver for ToolCatalog {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }
}
