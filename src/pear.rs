//! Portable `.pear` bundles.
//!
//! A pear freezes a pool (or a single agent) into a versioned JSON document:
//!
//! ```json
//! {"format": "pear", "version": 1, "type": "pool", "data": {...}}
//! ```
//!
//! Tool bodies never cross the boundary. A bundle names each tool and pins its
//! parameter schema; the host re-binds the callables through a [`ToolResolver`]
//! and the model backends through a [`ModelProvider`] when loading.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::agent::Agent;
use crate::context::{ContextPolicy, ContextStrategy};
use crate::error::{PeargentError, Result};
use crate::history::{HistoryConfig, HistoryStore, InMemoryHistory};
use crate::llm::{ModelBinding, ModelProvider};
use crate::pool::{Pool, DEFAULT_MAX_ITER};
use crate::router::RoutingAgent;
use crate::tool::{
    ParamType, ParameterSchema, Tool, ToolDescription, ToolPolicy, ToolRegistry, ToolResolver,
};

pub const PEAR_FORMAT: &str = "pear";
/// Newest bundle version this build reads and the one it writes.
pub const PEAR_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PearDocument {
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(flatten)]
    pub body: PearBody,
}

fn default_format() -> String {
    PEAR_FORMAT.to_string()
}

fn default_version() -> u32 {
    PEAR_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PearBody {
    Pool(PoolSnapshot),
    Agent(AgentSnapshot),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub agents: Vec<AgentSnapshot>,
    pub router: RouterSnapshot,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSnapshot {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub persona: String,
    pub model: ModelBinding,
    #[serde(default)]
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub persona: String,
    pub model: ModelBinding,
    #[serde(default)]
    pub tools: Vec<ToolRef>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub auto_manage_context: bool,
    #[serde(default = "default_context_messages")]
    pub max_context_messages: usize,
    #[serde(default)]
    pub context_strategy: ContextStrategy,
}

fn default_max_iter() -> usize {
    DEFAULT_MAX_ITER
}

fn default_context_messages() -> usize {
    ContextPolicy::default().max_messages
}

/// A tool reference: name, description, pinned schema and call policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: ParameterSchema,
    /// Older bundles pin parameters as a `name -> type name` map instead.
    #[serde(default, skip_serializing)]
    pub input_parameters: BTreeMap<String, String>,
    #[serde(flatten)]
    pub policy: ToolPolicy,
}

impl ToolRef {
    /// Checks the live tool against the pinned parameters and returns the
    /// schema to register it under.
    fn pinned_schema(&self, tool: &dyn Tool) -> Result<ParameterSchema> {
        let live = tool.parameters();
        let drifted = || {
            PeargentError::MalformedBundle(format!(
                "tool `{}` no longer matches the parameters pinned in the pear",
                self.name
            ))
        };

        if self.input_parameters.is_empty() || !self.parameters.is_empty() {
            return if live == self.parameters {
                Ok(self.parameters.clone())
            } else {
                Err(drifted())
            };
        }

        if live.len() != self.input_parameters.len() {
            return Err(drifted());
        }
        for (name, type_name) in &self.input_parameters {
            let kind = ParamType::from_type_name(type_name).ok_or_else(|| {
                PeargentError::MalformedBundle(format!(
                    "tool `{}` parameter `{name}` has unknown type `{type_name}`",
                    self.name
                ))
            })?;
            match live.get(name) {
                Some(param) if param.kind == kind => {}
                _ => return Err(drifted()),
            }
        }
        Ok(live)
    }
}

impl AgentSnapshot {
    pub fn from_agent(agent: &Agent) -> Self {
        let tools = agent
            .tools()
            .describe()
            .into_iter()
            .map(|description| ToolRef {
                policy: agent
                    .tools()
                    .policy(&description.name)
                    .cloned()
                    .unwrap_or_default(),
                name: description.name,
                description: description.description,
                parameters: description.parameters,
                input_parameters: BTreeMap::new(),
            })
            .collect();
        let context = agent.context_policy();

        Self {
            name: agent.name().to_string(),
            description: agent.description().to_string(),
            persona: agent.persona().to_string(),
            model: agent.binding().clone(),
            tools,
            max_retries: agent.max_retries(),
            auto_manage_context: context.auto_manage,
            max_context_messages: context.max_messages,
            context_strategy: context.strategy,
        }
    }
}

impl PoolSnapshot {
    pub fn from_pool(pool: &Pool) -> Self {
        let router = pool.router();
        Self {
            agents: pool
                .agents()
                .iter()
                .map(|agent| AgentSnapshot::from_agent(agent))
                .collect(),
            router: RouterSnapshot {
                name: router.name().to_string(),
                description: router.description().to_string(),
                persona: router.persona().to_string(),
                model: router.binding().clone(),
                agents: router.roster().iter().map(|entry| entry.name.clone()).collect(),
            },
            max_iter: pool.max_iter(),
            history: pool.history_config().cloned(),
        }
    }
}

impl PearDocument {
    pub fn new(body: PearBody) -> Self {
        Self {
            format: default_format(),
            version: PEAR_VERSION,
            body,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a document, checking the envelope before the body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: Value = serde_json::from_slice(bytes)
            .map_err(|err| PeargentError::MalformedBundle(format!("not valid JSON: {err}")))?;
        let envelope = raw
            .as_object()
            .ok_or_else(|| PeargentError::MalformedBundle("document is not a JSON object".into()))?;

        if let Some(format) = envelope.get("format") {
            if format.as_str() != Some(PEAR_FORMAT) {
                return Err(PeargentError::MalformedBundle(format!(
                    "unexpected format marker {format}"
                )));
            }
        }
        let version = match envelope.get("version") {
            None => PEAR_VERSION,
            Some(value) => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    PeargentError::MalformedBundle(format!("invalid version {value}"))
                })?,
        };
        if version == 0 {
            return Err(PeargentError::MalformedBundle("version 0 is not a pear version".into()));
        }
        if version > PEAR_VERSION {
            return Err(PeargentError::UnsupportedBundleVersion {
                found: version,
                supported: PEAR_VERSION,
            });
        }

        serde_json::from_value(raw).map_err(|err| PeargentError::MalformedBundle(err.to_string()))
    }
}

pub fn serialize(pool: &Pool) -> Result<Vec<u8>> {
    PearDocument::new(PearBody::Pool(PoolSnapshot::from_pool(pool))).to_bytes()
}

pub fn serialize_agent(agent: &Agent) -> Result<Vec<u8>> {
    PearDocument::new(PearBody::Agent(AgentSnapshot::from_agent(agent))).to_bytes()
}

/// Short form of [`PearLoader::load_pool`].
pub async fn deserialize(
    bytes: &[u8],
    tools: &dyn ToolResolver,
    models: &dyn ModelProvider,
) -> Result<Pool> {
    build_pool(PearDocument::from_bytes(bytes)?, tools, models, None).await
}

pub async fn write_pear(path: impl AsRef<Path>, pool: &Pool) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::write(path, serialize(pool)?).await?;
    info!(path = %path.display(), agents = pool.agents().len(), "pear written");
    Ok(())
}

pub async fn read_pear(
    path: impl AsRef<Path>,
    tools: &dyn ToolResolver,
    models: &dyn ModelProvider,
) -> Result<Pool> {
    let bytes = tokio::fs::read(path.as_ref()).await?;
    deserialize(&bytes, tools, models).await
}

/// Rebuilds pools and agents from pears using host-supplied tools and models.
pub struct PearLoader {
    tools: Arc<dyn ToolResolver>,
    models: Arc<dyn ModelProvider>,
    history: Option<Arc<dyn HistoryStore>>,
}

impl PearLoader {
    pub fn new<R, M>(tools: R, models: M) -> Self
    where
        R: ToolResolver + 'static,
        M: ModelProvider + 'static,
    {
        Self {
            tools: Arc::new(tools),
            models: Arc::new(models),
            history: None,
        }
    }

    /// Use `store` instead of whatever history the bundle describes.
    pub fn with_history(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    pub async fn load_pool(&self, bytes: &[u8]) -> Result<Pool> {
        build_pool(
            PearDocument::from_bytes(bytes)?,
            self.tools.as_ref(),
            self.models.as_ref(),
            self.history.clone(),
        )
        .await
    }

    pub fn load_agent(&self, bytes: &[u8]) -> Result<Agent> {
        match PearDocument::from_bytes(bytes)?.body {
            PearBody::Agent(snapshot) => build_agent(snapshot, self.tools.as_ref(), self.models.as_ref()),
            PearBody::Pool(_) => Err(PeargentError::MalformedBundle(
                "expected an agent pear, found a pool".into(),
            )),
        }
    }
}

async fn build_pool(
    document: PearDocument,
    tools: &dyn ToolResolver,
    models: &dyn ModelProvider,
    history_override: Option<Arc<dyn HistoryStore>>,
) -> Result<Pool> {
    let PearBody::Pool(snapshot) = document.body else {
        return Err(PeargentError::MalformedBundle(
            "expected a pool pear, found an agent".into(),
        ));
    };

    let mut seen = HashSet::new();
    for agent in &snapshot.agents {
        if !seen.insert(agent.name.as_str()) {
            return Err(PeargentError::MalformedBundle(format!(
                "agent `{}` appears twice",
                agent.name
            )));
        }
    }

    let agents = snapshot
        .agents
        .into_iter()
        .map(|agent| build_agent(agent, tools, models))
        .collect::<Result<Vec<_>>>()?;

    let router_snapshot = snapshot.router;
    let mut router = RoutingAgent::new(
        router_snapshot.name,
        router_snapshot.model.clone(),
        models.model_for(&router_snapshot.model)?,
    )
    .with_description(router_snapshot.description)
    .with_persona(router_snapshot.persona);
    if !router_snapshot.agents.is_empty() {
        router = router.with_agents(router_snapshot.agents);
    }

    // Validate the roster before a configured store touches the filesystem.
    let placeholder: Arc<dyn HistoryStore> = Arc::new(InMemoryHistory::new());
    let mut pool = Pool::new(agents, router, snapshot.max_iter, placeholder).map_err(|err| match err {
        PeargentError::Config(reason) => PeargentError::MalformedBundle(reason),
        other => other,
    })?;
    match (history_override, &snapshot.history) {
        (Some(store), _) => pool.replace_history(store),
        (None, Some(config)) => pool.replace_history(config.open().await?),
        (None, None) => {}
    }
    debug!(agents = pool.agents().len(), max_iter = pool.max_iter(), "pool loaded from pear");

    Ok(match snapshot.history {
        Some(config) => pool.with_history_config(config),
        None => pool,
    })
}

fn build_agent(snapshot: AgentSnapshot, tools: &dyn ToolResolver, models: &dyn ModelProvider) -> Result<Agent> {
    let mut registry = ToolRegistry::new();
    for tool_ref in snapshot.tools {
        let tool = tools
            .resolve(&tool_ref.name)
            .ok_or_else(|| PeargentError::ToolNotFound(tool_ref.name.clone()))?;
        if tool.name() != tool_ref.name {
            return Err(PeargentError::MalformedBundle(format!(
                "resolver returned `{}` for tool `{}`",
                tool.name(),
                tool_ref.name
            )));
        }
        let parameters = tool_ref.pinned_schema(tool.as_ref())?;

        let description = ToolDescription {
            name: tool_ref.name,
            description: tool_ref.description,
            parameters,
        };
        registry
            .insert(description, tool_ref.policy, tool)
            .map_err(|err| PeargentError::MalformedBundle(err.to_string()))?;
    }

    let model = models.model_for(&snapshot.model)?;
    let context = ContextPolicy {
        auto_manage: snapshot.auto_manage_context,
        max_messages: snapshot.max_context_messages,
        strategy: snapshot.context_strategy,
    };

    Ok(Agent::new(snapshot.name, snapshot.model, model)
        .with_description(snapshot.description)
        .with_persona(snapshot.persona)
        .with_tools(registry)
        .with_max_retries(snapshot.max_retries)
        .with_context(context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::llm::{LanguageModel, StubModel};
    use crate::tool::{FunctionTool, OnError, ToolCatalog};

    fn search_tool() -> FunctionTool {
        FunctionTool::new(
            "search_web",
            "Searches the web.",
            ParameterSchema::new().param::<String>("query"),
            |input| async move { Ok(json!(format!("hits for {}", input["query"]))) },
        )
    }

    fn stub_provider(_: &ModelBinding) -> Result<Arc<dyn LanguageModel>> {
        Ok(StubModel::new(vec!["Research_Analyst".into()]))
    }

    fn sample_pool() -> Pool {
        let mut tools = ToolRegistry::new();
        tools
            .register_with_policy(
                search_tool(),
                ToolPolicy::default()
                    .with_retries(2, 0.5)
                    .with_on_error(OnError::ReturnError),
            )
            .unwrap();
        let binding = ModelBinding::new("GroqModel", "llama-3.3-70b-versatile");
        let agent = Agent::new("Research_Analyst", binding.clone(), StubModel::new(vec![]))
            .with_description("Conducts deep research.")
            .with_persona("You are a senior research analyst.")
            .with_tools(tools)
            .with_context(ContextPolicy::managed(8, ContextStrategy::Summarize));
        let router = RoutingAgent::new("Orchestrator", binding, StubModel::new(vec![]))
            .with_persona("You are the Master Orchestrator.");
        Pool::new(vec![agent], router, 10, Arc::new(InMemoryHistory::new()))
            .unwrap()
            .with_history_config(HistoryConfig::session_buffer())
    }

    #[test]
    fn serializes_envelope_and_tool_policy() {
        let bytes = serialize(&sample_pool()).unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(raw["format"], "pear");
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["type"], "pool");
        assert_eq!(raw["data"]["max_iter"], 10);
        assert_eq!(raw["data"]["router"]["agents"], json!(["Research_Analyst"]));
        let tool = &raw["data"]["agents"][0]["tools"][0];
        assert_eq!(tool["name"], "search_web");
        assert_eq!(tool["max_retries"], 2);
        assert_eq!(tool["on_error"], "return_error");
        assert_eq!(tool["parameters"][0], json!({"name": "query", "type": "string", "required": true}));
        assert!(tool.get("source_code").is_none());
    }

    #[tokio::test]
    async fn round_trips_through_catalog() {
        let original = sample_pool();
        let bytes = serialize(&original).unwrap();
        let catalog = ToolCatalog::new().with(search_tool());

        let loaded = deserialize(&bytes, &catalog, &stub_provider).await.unwrap();

        assert_eq!(serialize(&loaded).unwrap(), bytes);
        let agent = loaded.agent("Research_Analyst").unwrap();
        assert_eq!(agent.tools().policy("search_web").unwrap().max_retries, 2);
        assert_eq!(agent.context_policy().strategy, ContextStrategy::Summarize);
    }

    #[tokio::test]
    async fn rejects_newer_versions_and_bad_documents() {
        let catalog = ToolCatalog::new();
        let newer = json!({"format": "pear", "version": 2, "type": "pool", "data": {}});
        let err = deserialize(newer.to_string().as_bytes(), &catalog, &stub_provider)
            .await
            .unwrap_err();
        assert!(matches!(err, PeargentError::UnsupportedBundleVersion { found: 2, supported: 1 }));

        for bad in [
            "not json".to_string(),
            json!({"version": 0, "type": "pool", "data": {}}).to_string(),
            json!({"type": "workflow", "data": {}}).to_string(),
            json!({"type": "pool", "data": {"agents": []}}).to_string(),
        ] {
            let err = deserialize(bad.as_bytes(), &catalog, &stub_provider)
                .await
                .unwrap_err();
            assert!(matches!(err, PeargentError::MalformedBundle(_)), "{bad}: {err:?}");
        }
    }

    #[tokio::test]
    async fn missing_version_reads_as_current() {
        let mut raw: Value = serde_json::from_slice(&serialize(&sample_pool()).unwrap()).unwrap();
        raw.as_object_mut().unwrap().remove("version");
        raw.as_object_mut().unwrap().remove("format");
        let catalog = ToolCatalog::new().with(search_tool());

        let pool = deserialize(raw.to_string().as_bytes(), &catalog, &stub_provider)
            .await
            .unwrap();
        assert_eq!(pool.max_iter(), 10);
    }

    #[tokio::test]
    async fn unresolved_or_drifted_tools_fail_the_load() {
        let bytes = serialize(&sample_pool()).unwrap();

        let err = deserialize(&bytes, &ToolCatalog::new(), &stub_provider)
            .await
            .unwrap_err();
        assert!(matches!(err, PeargentError::ToolNotFound(name) if name == "search_web"));

        let drifted = FunctionTool::new(
            "search_web",
            "Searches the web.",
            ParameterSchema::new().param::<String>("query").param::<i64>("limit"),
            |_| async { Ok(Value::Null) },
        );
        let err = deserialize(&bytes, &ToolCatalog::new().with(drifted), &stub_provider)
            .await
            .unwrap_err();
        assert!(matches!(err, PeargentError::MalformedBundle(_)));
    }

    #[tokio::test]
    async fn out_of_range_tool_policy_is_malformed() {
        let catalog = ToolCatalog::new().with(search_tool());
        for (field, value) in [("timeout", json!(1e300)), ("timeout", json!(0)), ("retry_delay", json!(1e300))] {
            let mut raw: Value = serde_json::from_slice(&serialize(&sample_pool()).unwrap()).unwrap();
            raw["data"]["agents"][0]["tools"][0][field] = value.clone();

            let err = deserialize(raw.to_string().as_bytes(), &catalog, &stub_provider)
                .await
                .unwrap_err();
            assert!(matches!(err, PeargentError::MalformedBundle(_)), "{field}={value}: {err:?}");
        }
    }

    #[tokio::test]
    async fn input_parameter_maps_pin_the_schema() {
        let mut raw: Value = serde_json::from_slice(&serialize(&sample_pool()).unwrap()).unwrap();
        let tool = raw["data"]["agents"][0]["tools"][0].as_object_mut().unwrap();
        tool.remove("parameters");
        tool.insert("input_parameters".into(), json!({"query": "str"}));
        let catalog = ToolCatalog::new().with(search_tool());

        let pool = deserialize(raw.to_string().as_bytes(), &catalog, &stub_provider)
            .await
            .unwrap();
        let described = pool.agents()[0].tools().describe();
        assert_eq!(described[0].parameters, search_tool().parameters());

        for pinned in [json!({"query": "int"}), json!({"query": "str", "limit": "int"}), json!({"query": "tuple"})] {
            raw["data"]["agents"][0]["tools"][0]["input_parameters"] = pinned.clone();
            let err = deserialize(raw.to_string().as_bytes(), &catalog, &stub_provider)
                .await
                .unwrap_err();
            assert!(matches!(err, PeargentError::MalformedBundle(_)), "{pinned}: {err:?}");
        }
    }

    #[cfg(feature = "persistence")]
    #[tokio::test]
    async fn rejected_pools_never_open_their_history_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("history.db");
        let url = format!("sqlite://{}?mode=rwc", db.display());
        let mut raw: Value = serde_json::from_slice(&serialize(&sample_pool()).unwrap()).unwrap();
        raw["data"]["history"] = serde_json::to_value(HistoryConfig::sqlite(&url)).unwrap();
        raw["data"]["max_iter"] = json!(0);
        let catalog = ToolCatalog::new().with(search_tool());

        let err = deserialize(raw.to_string().as_bytes(), &catalog, &stub_provider)
            .await
            .unwrap_err();
        assert!(matches!(err, PeargentError::MalformedBundle(_)), "{err:?}");
        assert!(!db.exists());

        raw["data"]["max_iter"] = json!(3);
        let pool = deserialize(raw.to_string().as_bytes(), &catalog, &stub_provider)
            .await
            .unwrap();
        assert_eq!(pool.history_config(), Some(&HistoryConfig::sqlite(&url)));
        assert!(db.exists());
    }

    #[tokio::test]
    async fn agent_pears_load_through_loader() {
        let pool = sample_pool();
        let bytes = serialize_agent(&pool.agents()[0]).unwrap();
        let loader = PearLoader::new(ToolCatalog::new().with(search_tool()), stub_provider);

        let agent = loader.load_agent(&bytes).unwrap();
        assert_eq!(agent.name(), "Research_Analyst");
        assert_eq!(agent.tools().names(), vec!["search_web".to_string()]);

        let err = loader.load_pool(&bytes).await.unwrap_err();
        assert!(matches!(err, PeargentError::MalformedBundle(_)));
    }

    #[tokio::test]
    async fn write_and_read_pear_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("research.pear");
        let pool = sample_pool();

        write_pear(&path, &pool).await.unwrap();
        let loaded = read_pear(&path, &ToolCatalog::new().with(search_tool()), &stub_provider)
            .await
            .unwrap();

        assert_eq!(loaded.router().name(), "Orchestrator");
        assert_eq!(loaded.history_config(), Some(&HistoryConfig::session_buffer()));
    }
}
