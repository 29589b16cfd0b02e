//! Query orchestrator: one in-flight agent turn per session.
//!
//! `run_query` validates and registers the turn synchronously, then hands the
//! rest to a background task: it makes sure the session's plugins are running,
//! reports acceptance, translates runtime output into [`QueryEvent`]s, persists
//! the turn, releases plugin references and always finishes with `Done`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use plexus_core::{QueryEvent, QueryId, SessionId, SessionStatus};
use plexus_plugins::PluginManager;
use plexus_runtime::{AgentRuntime, QueryRequest, RuntimeError};
use plexus_store::{NewMessage, SessionStore, SessionUpdate};

use crate::error::OrchestratorError;
use crate::expiry::is_session_expired;
use crate::hub::EventHub;
use crate::translate::Translator;

/// Returned when a query is accepted; the turn itself runs in the background.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAccepted {
    pub query_id: QueryId,
    pub resumed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryState {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<QueryId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_servers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

struct ActiveQuery {
    query_id: QueryId,
    cancel: CancellationToken,
    tool_servers: Vec<String>,
    started_at: DateTime<Utc>,
}

pub struct QueryOrchestrator {
    store: SessionStore,
    plugins: Arc<PluginManager>,
    runtime: Arc<dyn AgentRuntime>,
    hub: Arc<EventHub>,
    active: Arc<DashMap<SessionId, ActiveQuery>>,
    working_directory: Option<PathBuf>,
}

impl QueryOrchestrator {
    pub fn new(
        store: SessionStore,
        plugins: Arc<PluginManager>,
        runtime: Arc<dyn AgentRuntime>,
        hub: Arc<EventHub>,
    ) -> Self {
        Self {
            store,
            plugins,
            runtime,
            hub,
            active: Arc::new(DashMap::new()),
            working_directory: None,
        }
    }

    pub fn with_working_directory(mut self, dir: Option<PathBuf>) -> Self {
        self.working_directory = dir;
        self
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    /// Register the turn, then hand plugin startup and the runtime call to a
    /// background task. The caller waits only for acceptance; dropping the
    /// caller never strands the registration or its plugin references.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn run_query(
        &self,
        session_id: &SessionId,
        message: &str,
    ) -> Result<QueryAccepted, OrchestratorError> {
        let meta = self.store.get_session(session_id).map_err(|e| {
            if e.is_not_found() {
                OrchestratorError::NotFound(session_id.clone())
            } else {
                OrchestratorError::Store(e)
            }
        })?;

        let query_id = QueryId::new();
        let cancel = CancellationToken::new();
        match self.active.entry(session_id.clone()) {
            Entry::Occupied(_) => return Err(OrchestratorError::Conflict(session_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(ActiveQuery {
                    query_id: query_id.clone(),
                    cancel: cancel.clone(),
                    tool_servers: Vec::new(),
                    started_at: Utc::now(),
                });
            }
        }

        let turn = Turn {
            session_id: session_id.clone(),
            query_id: query_id.clone(),
            store: self.store.clone(),
            plugins: self.plugins.clone(),
            runtime: self.runtime.clone(),
            hub: self.hub.clone(),
            active: self.active.clone(),
            cancel,
        };
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let span = info_span!("query", session_id = %session_id, query_id = %query_id);
        tokio::spawn(
            turn.run(
                Admission {
                    plugins: meta.plugins.clone(),
                    resume: meta.resume_id().map(str::to_string),
                    prompt: message.to_string(),
                    cwd: self.working_directory.clone(),
                },
                accepted_tx,
            )
            .instrument(span),
        );

        accepted_rx
            .await
            .unwrap_or_else(|_| Err(OrchestratorError::Aborted(session_id.clone())))
    }

    /// Cancel the session's in-flight query. False if there is none.
    pub fn stop_query(&self, session_id: &SessionId) -> bool {
        match self.active.get(session_id) {
            Some(query) => {
                info!(session_id = %session_id, query_id = %query.query_id, "stopping query");
                query.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight query. Returns how many were signalled.
    pub fn stop_all(&self) -> usize {
        let mut count = 0;
        for query in self.active.iter() {
            query.cancel.cancel();
            count += 1;
        }
        count
    }

    /// Wait until no query is in flight, up to `within`. True when idle.
    pub async fn wait_idle(&self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while !self.active.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }

    pub fn state(&self, session_id: &SessionId) -> QueryState {
        match self.active.get(session_id) {
            Some(query) => QueryState {
                running: true,
                query_id: Some(query.query_id.clone()),
                tool_servers: query.tool_servers.clone(),
                started_at: Some(query.started_at),
            },
            None => QueryState {
                running: false,
                query_id: None,
                tool_servers: Vec::new(),
                started_at: None,
            },
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// What `run_query` read from the session before handing off.
struct Admission {
    plugins: Vec<String>,
    resume: Option<String>,
    prompt: String,
    cwd: Option<PathBuf>,
}

/// Everything the background task needs for one turn.
struct Turn {
    session_id: SessionId,
    query_id: QueryId,
    store: SessionStore,
    plugins: Arc<PluginManager>,
    runtime: Arc<dyn AgentRuntime>,
    hub: Arc<EventHub>,
    active: Arc<DashMap<SessionId, ActiveQuery>>,
    cancel: CancellationToken,
}

type Accepted = oneshot::Sender<Result<QueryAccepted, OrchestratorError>>;

impl Turn {
    async fn run(self, admission: Admission, accepted: Accepted) {
        let resumed = admission.resume.is_some();
        let request = match self.admit(admission).await {
            Ok(request) => request,
            Err(e) => {
                self.plugins.release_servers_for_session(&self.session_id).await;
                self.active
                    .remove_if(&self.session_id, |_, q| q.query_id == self.query_id);
                let _ = accepted.send(Err(e));
                return;
            }
        };

        info!(resumed, tool_servers = request.tool_servers.len(), "query accepted");
        self.hub.publish(QueryEvent::ProcessingStarted {
            session_id: self.session_id.clone(),
            query_id: self.query_id.clone(),
            resumed,
        });
        let _ = accepted.send(Ok(QueryAccepted {
            query_id: self.query_id.clone(),
            resumed,
        }));

        let mut translator = Translator::new(self.session_id.clone());
        let mut cancelled = false;

        match self.runtime.query(request, self.cancel.clone()).await {
            Ok(mut stream) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(message) => {
                            for event in translator.translate(&message) {
                                self.hub.publish(event);
                            }
                        }
                        Err(RuntimeError::Cancelled) => {
                            cancelled = true;
                            break;
                        }
                        Err(e) => {
                            let event = translator.fail(e.to_string());
                            self.hub.publish(event);
                        }
                    }
                }
            }
            Err(e) => {
                let event = translator.fail(e.to_string());
                self.hub.publish(event);
            }
        }

        self.finish(&translator, cancelled).await;
    }

    /// Start the session's plugins, then mark it running and record the
    /// user message. Plugins that fail to start are skipped.
    async fn admit(&self, admission: Admission) -> Result<QueryRequest, OrchestratorError> {
        let Admission {
            plugins,
            resume,
            prompt,
            cwd,
        } = admission;
        let report = self
            .plugins
            .start_servers_for_session(&self.session_id, &plugins)
            .await;
        for (plugin, reason) in &report.failed {
            warn!(plugin = %plugin, reason = %reason, "continuing without plugin");
        }
        let tool_servers = self.plugins.get_tool_server_configs(&plugins);
        let workers = self.plugins.get_dispatch_adapters(&plugins);
        if let Some(mut entry) = self.active.get_mut(&self.session_id) {
            entry.tool_servers = tool_servers.iter().map(|t| t.name.clone()).collect();
        }

        self.store
            .update_metadata(&self.session_id, SessionUpdate::status(SessionStatus::Running))?;
        self.store
            .append_message(&self.session_id, NewMessage::user(prompt.as_str()))?;

        Ok(QueryRequest {
            prompt,
            resume,
            cwd,
            tool_servers,
            workers,
        })
    }

    async fn finish(&self, translator: &Translator, cancelled: bool) {
        self.persist(translator);

        let expired = translator.errors().iter().any(|e| is_session_expired(e));
        let status = if expired {
            SessionStatus::Expired
        } else {
            SessionStatus::Idle
        };
        let mut update = SessionUpdate::status(status);
        update.last_activity_at = Some(Utc::now().to_rfc3339());
        match self.store.get_session(&self.session_id) {
            Ok(meta) => update.turn_count = Some(meta.turn_count + 1),
            Err(e) => warn!(session_id = %self.session_id, error = %e, "session vanished during query"),
        }
        if !expired {
            if let Some(remote) = translator.remote_session_id() {
                update.remote_session_id = Some(Some(remote.to_string()));
            }
        }
        if let Err(e) = self.store.update_metadata(&self.session_id, update) {
            warn!(session_id = %self.session_id, error = %e, "failed to record query outcome");
        }

        self.plugins.release_servers_for_session(&self.session_id).await;
        self.active
            .remove_if(&self.session_id, |_, q| q.query_id == self.query_id);

        info!(
            session_id = %self.session_id,
            query_id = %self.query_id,
            status = status.as_str(),
            cancelled,
            errors = translator.errors().len(),
            "query finished"
        );
        self.hub.publish(QueryEvent::StatusChanged {
            session_id: self.session_id.clone(),
            status: status.as_str().to_string(),
        });
        self.hub.publish(QueryEvent::Done {
            session_id: self.session_id.clone(),
        });
    }

    fn persist(&self, translator: &Translator) {
        let text = translator.text();
        if !text.trim().is_empty() {
            if let Err(e) = self
                .store
                .append_message(&self.session_id, NewMessage::assistant(text))
            {
                warn!(session_id = %self.session_id, error = %e, "failed to persist assistant message");
            }
        }
        for tool in translator.tools() {
            let message = NewMessage::tool(tool.name.clone(), tool.input.clone(), tool.result.clone());
            if let Err(e) = self.store.append_message(&self.session_id, message) {
                warn!(session_id = %self.session_id, tool = %tool.name, error = %e, "failed to persist tool message");
            }
        }
        debug!(session_id = %self.session_id, tools = translator.tools().len(), "turn persisted");
    }
}
