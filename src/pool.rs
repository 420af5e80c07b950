//! The pool orchestration loop.
//!
//! A request moves through `Routing → Delegated ⇄ AwaitingTool → Responding`
//! and ends in `Done` or `Failed`. Every completed tool round costs one unit of
//! `max_iter`; a tool request arriving once the budget is spent fails the
//! request instead of running the tool.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::{Agent, TurnResult};
use crate::error::{PeargentError, Result};
use crate::history::{HistoryConfig, HistoryStore, InMemoryHistory, SessionLocks};
use crate::message::{ToolCall, ToolObservation, Turn};
use crate::router::{RosterEntry, RoutingAgent, Selection};

pub const DEFAULT_MAX_ITER: usize = 5;

/// Caller-side cancellation for one request.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

/// What a successful request hands back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolResponse {
    Answer {
        session_id: String,
        agent: String,
        content: String,
        iterations: usize,
    },
    Clarification {
        session_id: String,
        question: String,
    },
}

impl PoolResponse {
    pub fn session_id(&self) -> &str {
        match self {
            PoolResponse::Answer { session_id, .. } | PoolResponse::Clarification { session_id, .. } => {
                session_id
            }
        }
    }

    pub fn content(&self) -> &str {
        match self {
            PoolResponse::Answer { content, .. } => content,
            PoolResponse::Clarification { question, .. } => question,
        }
    }
}

#[derive(Debug)]
enum PoolState {
    Routing,
    Delegated,
    AwaitingTool(ToolCall),
    Responding(String),
    Done(PoolResponse),
    Failed(PeargentError),
}

/// A roster of agents, one router, an iteration budget and a history store.
///
/// Agents, tools and the router are immutable once the pool is built, so one
/// pool can serve many requests concurrently behind an `Arc`.
pub struct Pool {
    agents: Vec<Arc<Agent>>,
    router: RoutingAgent,
    max_iter: usize,
    history: Arc<dyn HistoryStore>,
    history_config: Option<HistoryConfig>,
    locks: SessionLocks,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("agents", &self.agents)
            .field("router", &self.router)
            .field("max_iter", &self.max_iter)
            .field("history_config", &self.history_config)
            .finish()
    }
}

impl Pool {
    pub fn new(
        agents: Vec<Agent>,
        mut router: RoutingAgent,
        max_iter: usize,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self> {
        if max_iter == 0 {
            return Err(PeargentError::Config("max_iter must be at least 1".into()));
        }
        if agents.is_empty() {
            return Err(PeargentError::Config("a pool needs at least one agent".into()));
        }
        for (idx, agent) in agents.iter().enumerate() {
            if agents[..idx].iter().any(|other| other.name() == agent.name()) {
                return Err(PeargentError::Config(format!(
                    "agent name `{}` is used twice",
                    agent.name()
                )));
            }
        }

        let roster = agents
            .iter()
            .map(|agent| RosterEntry {
                name: agent.name().to_string(),
                description: agent.description().to_string(),
            })
            .collect();
        router.bind_roster(roster)?;

        Ok(Self {
            agents: agents.into_iter().map(Arc::new).collect(),
            router,
            max_iter,
            history,
            history_config: None,
            locks: SessionLocks::new(),
        })
    }

    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    /// Record how the history store was configured so pears can carry it.
    pub fn with_history_config(mut self, config: HistoryConfig) -> Self {
        self.history_config = Some(config);
        self
    }

    pub(crate) fn replace_history(&mut self, history: Arc<dyn HistoryStore>) {
        self.history = history;
    }

    pub fn agents(&self) -> &[Arc<Agent>] {
        &self.agents
    }

    pub fn agent(&self, name: &str) -> Option<&Arc<Agent>> {
        self.agents.iter().find(|agent| agent.name() == name)
    }

    pub fn router(&self) -> &RoutingAgent {
        &self.router
    }

    pub fn max_iter(&self) -> usize {
        self.max_iter
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn history_config(&self) -> Option<&HistoryConfig> {
        self.history_config.as_ref()
    }

    pub fn create_session(&self) -> String {
        self.history.create_session()
    }

    pub async fn transcript(&self, session_id: &str) -> Result<Vec<Turn>> {
        self.history.read(session_id).await
    }

    pub async fn run(&self, request: &str, session_id: &str) -> Result<PoolResponse> {
        self.run_with(request, session_id, RunControl::default()).await
    }

    /// Drive one request to a final answer, a clarification, or a typed failure.
    #[instrument(name = "pool.run", skip_all, fields(session_id = %session_id))]
    pub async fn run_with(
        &self,
        request: &str,
        session_id: &str,
        control: RunControl,
    ) -> Result<PoolResponse> {
        let mut run = RequestRun {
            pool: self,
            session_id,
            request,
            control,
            conversation: Vec::new(),
            agent: None,
            iterations: 0,
        };

        let _writer = run
            .guarded(async { Ok(self.locks.acquire(session_id).await) })
            .await?;
        run.conversation = self.history.read(session_id).await?;

        let mut state = PoolState::Routing;
        loop {
            state = match state {
                PoolState::Routing => run.route().await,
                PoolState::Delegated => run.delegate().await,
                PoolState::AwaitingTool(call) => run.invoke(call).await,
                PoolState::Responding(answer) => run.respond(answer).await,
                PoolState::Done(response) => return Ok(response),
                PoolState::Failed(err) => return Err(err),
            };
        }
    }
}

/// Mutable state of one in-flight request.
struct RequestRun<'a> {
    pool: &'a Pool,
    session_id: &'a str,
    request: &'a str,
    control: RunControl,
    conversation: Vec<Turn>,
    agent: Option<Arc<Agent>>,
    iterations: usize,
}

impl RequestRun<'_> {
    async fn route(&mut self) -> PoolState {
        let selection = match self.guarded(self.pool.router.route(self.request)).await {
            Ok(selection) => selection,
            Err(err) => {
                if let Err(err) = self.persist(Turn::request(self.request, None)).await {
                    return PoolState::Failed(err);
                }
                return self.fail(err).await;
            }
        };

        match selection {
            Selection::Agent(agent_ref) => {
                info!(agent = %agent_ref.name, "request routed");
                if let Err(err) = self
                    .persist(Turn::request(self.request, Some(agent_ref.name.clone())))
                    .await
                {
                    return PoolState::Failed(err);
                }
                self.agent = Some(Arc::clone(&self.pool.agents[agent_ref.index]));
                PoolState::Delegated
            }
            Selection::NeedsClarification(question) => {
                info!("router asked for clarification");
                for turn in [
                    Turn::request(self.request, None),
                    Turn::clarification(question.clone()),
                ] {
                    if let Err(err) = self.persist(turn).await {
                        return PoolState::Failed(err);
                    }
                }
                PoolState::Done(PoolResponse::Clarification {
                    session_id: self.session_id.to_string(),
                    question,
                })
            }
            Selection::NoMatch => {
                warn!("router found no matching agent");
                if let Err(err) = self.persist(Turn::request(self.request, None)).await {
                    return PoolState::Failed(err);
                }
                self.fail(PeargentError::NoMatchingAgent {
                    session_id: self.session_id.to_string(),
                })
                .await
            }
        }
    }

    async fn delegate(&mut self) -> PoolState {
        let Some(agent) = self.agent.clone() else {
            return PoolState::Failed(PeargentError::Protocol(
                "delegation without a routed agent".into(),
            ));
        };

        match self.guarded(agent.run_turn(&self.conversation)).await {
            Ok(TurnResult::FinalAnswer(answer)) => PoolState::Responding(answer),
            Ok(TurnResult::ToolRequest(call)) => {
                if self.iterations >= self.pool.max_iter {
                    warn!(
                        agent = %agent.name(),
                        tool = %call.name,
                        max_iter = self.pool.max_iter,
                        "iteration budget exhausted"
                    );
                    return self
                        .fail(PeargentError::IterationBudgetExceeded {
                            session_id: self.session_id.to_string(),
                            max_iter: self.pool.max_iter,
                        })
                        .await;
                }
                PoolState::AwaitingTool(call)
            }
            Err(err) => self.fail(err).await,
        }
    }

    async fn invoke(&mut self, call: ToolCall) -> PoolState {
        let Some(agent) = self.agent.clone() else {
            return PoolState::Failed(PeargentError::Protocol(
                "tool call without a routed agent".into(),
            ));
        };

        debug!(agent = %agent.name(), tool = %call.name, "invoking tool");
        let observation = match self.guarded(agent.call_tool(&call)).await {
            Ok(output) => ToolObservation {
                name: call.name.clone(),
                output,
                is_error: false,
            },
            Err(err) if err.is_recoverable() => {
                warn!(agent = %agent.name(), tool = %call.name, error = %err, "tool round failed");
                ToolObservation {
                    name: call.name.clone(),
                    output: json!(err.to_string()),
                    is_error: true,
                }
            }
            Err(err) => return self.fail(err).await,
        };

        self.iterations += 1;
        match self
            .persist(Turn::tool_exchange(agent.name(), call, observation))
            .await
        {
            Ok(()) => PoolState::Delegated,
            Err(err) => PoolState::Failed(err),
        }
    }

    async fn respond(&mut self, answer: String) -> PoolState {
        let Some(agent) = self.agent.clone() else {
            return PoolState::Failed(PeargentError::Protocol(
                "answer without a routed agent".into(),
            ));
        };

        if let Err(err) = self.persist(Turn::answer(agent.name(), answer.clone())).await {
            return PoolState::Failed(err);
        }
        info!(agent = %agent.name(), iterations = self.iterations, "request answered");
        PoolState::Done(PoolResponse::Answer {
            session_id: self.session_id.to_string(),
            agent: agent.name().to_string(),
            content: answer,
            iterations: self.iterations,
        })
    }

    async fn persist(&mut self, turn: Turn) -> Result<()> {
        self.pool.history.append(self.session_id, &turn).await?;
        self.conversation.push(turn);
        Ok(())
    }

    /// Best-effort notice so the partial transcript explains how it ended.
    async fn fail(&mut self, err: PeargentError) -> PoolState {
        if let Err(store_err) = self.persist(Turn::notice(err.to_string())).await {
            warn!(error = %store_err, "could not persist failure notice");
        }
        PoolState::Failed(err)
    }

    /// Race `fut` against the caller's cancellation token and deadline.
    async fn guarded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let cancelled = || PeargentError::Cancelled {
            session_id: self.session_id.to_string(),
        };
        if self.control.cancel.is_cancelled() {
            return Err(cancelled());
        }
        let deadline = async {
            match self.control.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.control.cancel.cancelled() => Err(cancelled()),
            _ = deadline => Err(cancelled()),
            result = fut => result,
        }
    }
}

/// Builder that can open the history store from a [`HistoryConfig`].
#[derive(Default)]
pub struct PoolBuilder {
    agents: Vec<Agent>,
    router: Option<RoutingAgent>,
    max_iter: Option<usize>,
    history: Option<Arc<dyn HistoryStore>>,
    history_config: Option<HistoryConfig>,
}

impl PoolBuilder {
    pub fn agent(mut self, agent: Agent) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn agents(mut self, agents: impl IntoIterator<Item = Agent>) -> Self {
        self.agents.extend(agents);
        self
    }

    pub fn router(mut self, router: RoutingAgent) -> Self {
        self.router = Some(router);
        self
    }

    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = Some(max_iter);
        self
    }

    pub fn history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn history_config(mut self, config: HistoryConfig) -> Self {
        self.history_config = Some(config);
        self
    }

    pub async fn build(self) -> Result<Pool> {
        let router = self
            .router
            .ok_or_else(|| PeargentError::Config("a pool needs a router".into()))?;
        let history = match (self.history, &self.history_config) {
            (Some(history), _) => history,
            (None, Some(config)) => config.open().await?,
            (None, None) => Arc::new(InMemoryHistory::new()),
        };
        let pool = Pool::new(
            self.agents,
            router,
            self.max_iter.unwrap_or(DEFAULT_MAX_ITER),
            history,
        )?;
        Ok(match self.history_config {
            Some(config) => pool.with_history_config(config),
            None => pool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelBinding, StubModel};
    use crate::message::TurnRole;
    use crate::tool::{FunctionTool, ParameterSchema, ToolRegistry};

    fn binding() -> ModelBinding {
        ModelBinding::new("stub", "stub-model")
    }

    fn slow_tool() -> FunctionTool {
        FunctionTool::new("slow", "Sleeps for a long time", ParameterSchema::new(), |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!("late"))
        })
    }

    fn pool_with(agent_script: Vec<&str>, router_script: Vec<&str>, max_iter: usize) -> Pool {
        let mut tools = ToolRegistry::new();
        tools.register(slow_tool()).unwrap();
        let agent = Agent::new(
            "A",
            binding(),
            StubModel::new(agent_script.into_iter().map(String::from).collect()),
        )
        .with_description("Does slow things")
        .with_tools(tools);
        let router = RoutingAgent::new(
            "router",
            binding(),
            StubModel::new(router_script.into_iter().map(String::from).collect()),
        );
        Pool::new(vec![agent], router, max_iter, Arc::new(InMemoryHistory::new())).unwrap()
    }

    #[test]
    fn rejects_invalid_construction() {
        let router = || RoutingAgent::new("r", binding(), StubModel::new(vec![]));
        let agent = || Agent::new("A", binding(), StubModel::new(vec![]));

        let zero = Pool::new(vec![agent()], router(), 0, Arc::new(InMemoryHistory::new()));
        assert!(matches!(zero, Err(PeargentError::Config(_))));

        let twins = Pool::new(vec![agent(), agent()], router(), 3, Arc::new(InMemoryHistory::new()));
        assert!(matches!(twins, Err(PeargentError::Config(_))));

        let empty = Pool::new(Vec::new(), router(), 3, Arc::new(InMemoryHistory::new()));
        assert!(empty.is_err());
    }

    #[tokio::test]
    async fn clarification_is_returned_not_failed() {
        let pool = pool_with(vec![], vec![r#"{"decision":"clarify","question":"Which file?"}"#], 3);

        let response = pool.run("open it", "s1").await.unwrap();

        assert_eq!(
            response,
            PoolResponse::Clarification {
                session_id: "s1".into(),
                question: "Which file?".into()
            }
        );
        let transcript = pool.transcript("s1").await.unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].role, TurnRole::Assistant);
        assert_eq!(transcript[1].agent, None);
    }

    #[tokio::test]
    async fn cancellation_during_tool_keeps_partial_transcript() {
        let pool = pool_with(
            vec![r#"{"action":"call_tool","name":"slow","arguments":{}}"#],
            vec!["A"],
            3,
        );
        let control = RunControl::new();
        let cancel = control.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = pool.run_with("do the slow thing", "s1", control).await.unwrap_err();

        assert!(matches!(err, PeargentError::Cancelled { ref session_id } if session_id == "s1"));
        let transcript = pool.transcript("s1").await.unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].agent.as_deref(), Some("A"));
        assert_eq!(transcript[1].role, TurnRole::System);
    }

    #[tokio::test]
    async fn deadline_cancels_request() {
        let pool = pool_with(
            vec![r#"{"action":"call_tool","name":"slow","arguments":{}}"#],
            vec!["A"],
            3,
        );

        let err = pool
            .run_with("slow", "s2", RunControl::new().with_timeout(Duration::from_millis(20)))
            .await
            .unwrap_err();

        assert!(matches!(err, PeargentError::Cancelled { .. }));
        assert_eq!(err.session_id(), Some("s2"));
    }

    #[tokio::test]
    async fn already_cancelled_token_fails_before_routing() {
        let pool = pool_with(vec![], vec!["A"], 3);
        let control = RunControl::new();
        control.cancel.cancel();

        let err = pool.run_with("anything", "s3", control).await.unwrap_err();

        assert!(matches!(err, PeargentError::Cancelled { .. }));
        assert!(pool.transcript("s3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn builder_opens_history_from_config() {
        let pool = Pool::builder()
            .agent(Agent::new("A", binding(), StubModel::new(vec![r#"{"action":"respond","content":"hi"}"#.into()])))
            .router(RoutingAgent::new("r", binding(), StubModel::new(vec!["A".into()])))
            .history_config(HistoryConfig::session_buffer())
            .build()
            .await
            .unwrap();

        assert_eq!(pool.max_iter(), DEFAULT_MAX_ITER);
        assert_eq!(pool.history_config(), Some(&HistoryConfig::session_buffer()));
        let response = pool.run("hello", "s").await.unwrap();
        assert_eq!(response.content(), "hi");
    }
}
