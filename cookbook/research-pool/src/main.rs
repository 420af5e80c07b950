//! A two-agent research pool driven by scripted models.
//!
//! Runs one request end to end, prints the transcript, writes the pool to
//! `research.pear` and loads it back.

use std::sync::Arc;

use peargent::pear::{read_pear, write_pear};
use peargent::{
    init_tracing, Agent, FunctionTool, LanguageModel, ModelBinding, ParameterSchema, PeargentError,
    PoolResponse, Result, RoutingAgent, RuntimeConfig, StubModel, ToolCatalog, ToolRegistry,
};
use serde_json::json;
use tracing::info;

fn search_web() -> FunctionTool {
    FunctionTool::new(
        "search_web",
        "Searches the web for information about a given query.",
        ParameterSchema::new().param::<String>("query"),
        |input| async move {
            let query = input["query"].as_str().unwrap_or_default().to_string();
            Ok(json!(format!("Top result for '{query}': Rust 1.0 shipped in May 2015.")))
        },
    )
}

fn word_count() -> FunctionTool {
    FunctionTool::new(
        "word_count",
        "Counts the words in a draft.",
        ParameterSchema::new().param::<String>("text"),
        |input| async move {
            let text = input["text"].as_str().unwrap_or_default();
            Ok(json!(text.split_whitespace().count()))
        },
    )
}

fn catalog() -> ToolCatalog {
    ToolCatalog::new().with(search_web()).with(word_count())
}

fn scripted(binding: &ModelBinding) -> Result<Arc<dyn LanguageModel>> {
    let script: Vec<&str> = match binding.model_name.as_str() {
        "router" => vec!["Research_Analyst"],
        "analyst" => vec![
            r#"{"action":"call_tool","name":"search_web","arguments":{"query":"rust release date"}}"#,
            r#"{"action":"respond","content":"Rust 1.0 was released in May 2015."}"#,
        ],
        "editor" => vec![r#"{"action":"respond","content":"Looks good to me."}"#],
        other => {
            return Err(PeargentError::Config(format!("no scripted model for `{other}`")));
        }
    };
    Ok(StubModel::new(script.into_iter().map(String::from).collect()))
}

fn binding(model_name: &str) -> ModelBinding {
    ModelBinding::new("stub", model_name)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = RuntimeConfig::from_env()?;
    init_tracing(&config.logging)?;

    let tool_policy = config.default_tool_policy();
    let mut analyst_tools = ToolRegistry::new();
    analyst_tools.register_with_policy(search_web(), tool_policy.clone())?;
    let mut editor_tools = ToolRegistry::new();
    editor_tools.register_with_policy(word_count(), tool_policy)?;

    let analyst_binding = binding("analyst");
    let analyst = Agent::new("Research_Analyst", analyst_binding.clone(), scripted(&analyst_binding)?)
        .with_description("Conducts deep research and data analysis.")
        .with_persona("You are a senior research analyst. Cite what you find.")
        .with_tools(analyst_tools);
    let editor_binding = binding("editor");
    let editor = Agent::new("Chief_Editor", editor_binding.clone(), scripted(&editor_binding)?)
        .with_description("Edits drafts for clarity and length.")
        .with_persona("You are the chief editor of a technical magazine.")
        .with_tools(editor_tools);
    let router_binding = binding("router");
    let router = RoutingAgent::new("Orchestrator", router_binding.clone(), scripted(&router_binding)?)
        .with_persona("You are the Master Orchestrator.");

    let pool = config
        .pool_builder()
        .agents([analyst, editor])
        .router(router)
        .build()
        .await?;

    let session_id = pool.create_session();
    match pool.run("When was Rust 1.0 released?", &session_id).await? {
        PoolResponse::Answer {
            agent,
            content,
            iterations,
            ..
        } => info!(%agent, iterations, "{content}"),
        PoolResponse::Clarification { question, .. } => info!("router needs more detail: {question}"),
    }

    for turn in pool.transcript(&session_id).await? {
        println!("[{:?}] {}", turn.role, turn.content);
    }

    write_pear("research.pear", &pool).await?;
    let reloaded = read_pear("research.pear", &catalog(), &scripted).await?;
    info!(
        agents = reloaded.agents().len(),
        max_iter = reloaded.max_iter(),
        "research.pear reloaded"
    );

    Ok(())
}
