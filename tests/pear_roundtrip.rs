//! A pool frozen into a pear and thawed again routes exactly like the original.

use std::sync::Arc;

use peargent::pear::{self, PearDocument};
use peargent::{
    Agent, FunctionTool, HistoryConfig, InMemoryHistory, LanguageModel, ModelBinding,
    ParameterSchema, PearLoader, PeargentError, Pool, PoolResponse, Result, RoutingAgent,
    Selection, StubModel, Tool, ToolCatalog, ToolRegistry,
};
use serde_json::json;

const REQUEST: &str = "Draft a launch email for the new release";

fn tool(name: &str) -> FunctionTool {
    FunctionTool::new(
        name,
        format!("The {name} tool."),
        ParameterSchema::new()
            .param::<String>("subject")
            .param::<Option<i64>>("limit"),
        |input| async move { Ok(json!({ "echo": input })) },
    )
}

/// Every backend answers the router the same way, so routing is reproducible.
fn deterministic_models(binding: &ModelBinding) -> Result<Arc<dyn LanguageModel>> {
    let script = match binding.model_name.as_str() {
        "router" => vec![r#"{"decision":"delegate","agent":"Creative_Director"}"#.to_string()],
        _ => vec![r#"{"action":"respond","content":"Here is your draft."}"#.to_string()],
    };
    Ok(StubModel::new(script))
}

fn agent(name: &str, description: &str, tools: &[&str]) -> Agent {
    let mut registry = ToolRegistry::new();
    for tool_name in tools {
        registry.register(tool(tool_name)).unwrap();
    }
    let binding = ModelBinding::new("stub", "worker");
    let model = deterministic_models(&binding).unwrap();
    Agent::new(name, binding, model)
        .with_description(description)
        .with_persona(format!("You are the {name}."))
        .with_tools(registry)
}

fn original_pool() -> Pool {
    let agents = vec![
        agent("Research_Analyst", "Conducts deep research.", &["search_web"]),
        agent("Lead_Developer", "Writes and reviews code.", &["run_tests", "read_file"]),
        agent("Creative_Director", "Writes marketing copy and emails.", &["send_email"]),
    ];
    let router_binding = ModelBinding::new("stub", "router");
    let router = RoutingAgent::new(
        "Orchestrator",
        router_binding.clone(),
        deterministic_models(&router_binding).unwrap(),
    )
    .with_persona("You are the Master Orchestrator.")
    .with_agents(["Research_Analyst", "Lead_Developer", "Creative_Director"]);

    Pool::new(agents, router, 10, Arc::new(InMemoryHistory::new()))
        .unwrap()
        .with_history_config(HistoryConfig::session_buffer())
}

fn catalog() -> ToolCatalog {
    ["search_web", "run_tests", "read_file", "send_email"]
        .into_iter()
        .fold(ToolCatalog::new(), |catalog, name| catalog.with(tool(name)))
}

#[tokio::test]
async fn round_trip_preserves_routing_and_tool_contracts() {
    let original = original_pool();
    let bytes = pear::serialize(&original).unwrap();

    let loaded = pear::deserialize(&bytes, &catalog(), &deterministic_models)
        .await
        .unwrap();

    let before = original.router().route(REQUEST).await.unwrap();
    let after = loaded.router().route(REQUEST).await.unwrap();
    assert_eq!(before, after);
    assert!(matches!(after, Selection::Agent(ref agent) if agent.name == "Creative_Director"));

    for (left, right) in original.agents().iter().zip(loaded.agents()) {
        assert_eq!(left.name(), right.name());
        assert_eq!(left.persona(), right.persona());
        assert_eq!(left.tools().describe(), right.tools().describe());
    }
    assert_eq!(loaded.max_iter(), 10);
}

#[tokio::test]
async fn loaded_pool_answers_requests() {
    let bytes = pear::serialize(&original_pool()).unwrap();
    let loader = PearLoader::new(catalog(), deterministic_models)
        .with_history(Arc::new(InMemoryHistory::new()));

    let pool = loader.load_pool(&bytes).await.unwrap();
    let response = pool.run(REQUEST, "launch").await.unwrap();

    assert!(matches!(
        response,
        PoolResponse::Answer { ref agent, .. } if agent == "Creative_Director"
    ));
}

#[tokio::test]
async fn legacy_documents_without_envelope_fields_load() {
    let bytes = pear::serialize(&original_pool()).unwrap();
    let mut document = PearDocument::from_bytes(&bytes).unwrap();
    assert_eq!(document.version, peargent::PEAR_VERSION);

    let mut raw = serde_json::to_value(&document).unwrap();
    let envelope = raw.as_object_mut().unwrap();
    envelope.remove("format");
    envelope.remove("version");
    let legacy = serde_json::to_vec(&raw).unwrap();

    document = PearDocument::from_bytes(&legacy).unwrap();
    assert_eq!(document.version, 1);
    assert!(pear::deserialize(&legacy, &catalog(), &deterministic_models).await.is_ok());
}

#[tokio::test]
async fn failed_loads_never_yield_a_pool() {
    let mut raw: serde_json::Value =
        serde_json::from_slice(&pear::serialize(&original_pool()).unwrap()).unwrap();
    raw["data"]["router"]["agents"] = json!(["Research_Analyst", "Ghost"]);

    let err = pear::deserialize(raw.to_string().as_bytes(), &catalog(), &deterministic_models)
        .await
        .unwrap_err();
    assert!(matches!(err, PeargentError::MalformedBundle(_)));

    raw["version"] = json!(7);
    let err = pear::deserialize(raw.to_string().as_bytes(), &catalog(), &deterministic_models)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PeargentError::UnsupportedBundleVersion { found: 7, .. }
    ));
}

#[tokio::test]
async fn documents_in_the_original_shape_load_and_answer() {
    let document = json!({
        "type": "pool",
        "data": {
            "type": "pool",
            "agents": [{
                "name": "Creative_Director",
                "description": "Writes marketing copy and emails.",
                "model": {"type": "stub", "model_name": "worker"},
                "tools": [{
                    "name": "send_email",
                    "description": "Sends an email.",
                    "source_code": "def send_email(subject: str, limit: int):\n    return subject",
                    "input_parameters": {"subject": "str", "limit": "int"},
                    "max_retries": 2,
                    "retry_delay": 0.5,
                    "retry_backoff": true,
                    "on_error": "return_error"
                }],
                "tracing": false,
                "auto_manage_context": true,
                "max_context_messages": 12,
                "context_strategy": "smart"
            }],
            "router": {
                "name": "Orchestrator",
                "model": {"type": "stub", "model_name": "router"},
                "agents": ["Creative_Director"]
            },
            "max_iter": 4,
            "history": {"type": "history", "store_type": "SessionBufferHistoryStore"}
        }
    });

    let pool = pear::deserialize(document.to_string().as_bytes(), &catalog(), &deterministic_models)
        .await
        .unwrap();

    assert_eq!(pool.max_iter(), 4);
    assert_eq!(pool.history_config(), Some(&HistoryConfig::session_buffer()));
    let agent = pool.agent("Creative_Director").unwrap();
    assert_eq!(agent.persona(), "");
    assert_eq!(agent.tools().describe()[0].parameters, tool("send_email").parameters());
    let policy = agent.tools().policy("send_email").unwrap();
    assert_eq!(policy.max_retries, 2);
    assert!(policy.retry_backoff);

    let response = pool.run(REQUEST, "legacy").await.unwrap();
    assert_eq!(response.content(), "Here is your draft.");
}
