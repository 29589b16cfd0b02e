//! Lifecycle manager: at most one live process per plugin, shared by every
//! session that references it and stopped when the last reference goes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use plexus_core::{PluginEvent, SessionId, ToolDefinition, ToolServerConfig, WorkerDispatch};

use crate::dispatch::DispatchAdapter;
use crate::error::{PluginError, SupervisorError};
use crate::ledger::{Ledger, LedgerEntry};
use crate::record::{Capability, PluginRecord};
use crate::supervisor::{ExitReport, LaunchSpec, Launched, Launcher, PluginProcess};

const EVENT_CAPACITY: usize = 256;
const INVOKE_SESSION_PREFIX: &str = "__invoke__";

/// Outcome of starting a batch of plugins. Failures never abort the others.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl StartReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn collect(results: Vec<(String, Result<(), PluginError>)>) -> Self {
        let mut report = Self::default();
        for (name, result) in results {
            match result {
                Ok(()) => report.started.push(name),
                Err(e) => report.failed.push((name, e.to_string())),
            }
        }
        report
    }
}

struct LiveProcess {
    process: Arc<dyn PluginProcess>,
    /// Distinguishes this process from a later one under the same name, so
    /// a stale exit report cannot tear down its successor.
    generation: u64,
}

#[derive(Default)]
struct ManagerState {
    roster: BTreeMap<String, PluginRecord>,
    live: HashMap<String, LiveProcess>,
    refs: HashMap<String, HashSet<SessionId>>,
    /// Started at boot; release never stops these.
    pinned: HashSet<String>,
}

impl ManagerState {
    fn is_wanted(&self, name: &str) -> bool {
        self.pinned.contains(name) || self.refs.get(name).is_some_and(|s| !s.is_empty())
    }
}

pub struct PluginManager {
    me: Weak<Self>,
    state: Mutex<ManagerState>,
    spawn_guards: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    adapters: DashMap<String, Arc<DispatchAdapter>>,
    launcher: Arc<dyn Launcher>,
    ledger: Arc<dyn Ledger>,
    events: Mutex<broadcast::Sender<PluginEvent>>,
    generation: AtomicU64,
    dispatch_timeout: Duration,
}

impl PluginManager {
    pub fn new(
        records: Vec<PluginRecord>,
        launcher: Arc<dyn Launcher>,
        ledger: Arc<dyn Ledger>,
        dispatch_timeout: Duration,
    ) -> Arc<Self> {
        let roster = records.into_iter().map(|r| (r.name.clone(), r)).collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(ManagerState {
                roster,
                ..Default::default()
            }),
            spawn_guards: DashMap::new(),
            adapters: DashMap::new(),
            launcher,
            ledger,
            events: Mutex::new(events),
            generation: AtomicU64::new(0),
            dispatch_timeout,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.lock().subscribe()
    }

    fn emit(&self, event: PluginEvent) {
        let _ = self.events.lock().send(event);
    }

    pub fn plugins(&self) -> Vec<PluginRecord> {
        self.state.lock().roster.values().cloned().collect()
    }

    pub fn plugin(&self, name: &str) -> Option<PluginRecord> {
        self.state.lock().roster.get(name).cloned()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state.lock().live.contains_key(name)
    }

    pub fn is_pinned(&self, name: &str) -> bool {
        self.state.lock().pinned.contains(name)
    }

    pub fn reference_count(&self, name: &str) -> usize {
        self.state.lock().refs.get(name).map_or(0, HashSet::len)
    }

    fn live_process(&self, name: &str) -> Option<Arc<dyn PluginProcess>> {
        self.state.lock().live.get(name).map(|l| l.process.clone())
    }

    fn spawn_guard(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.spawn_guards.entry(name.to_string()).or_default().clone()
    }

    /// Start every standalone plugin concurrently and pin the survivors.
    #[instrument(skip(self))]
    pub async fn initialize_roster(&self) -> StartReport {
        let names: Vec<String> = self
            .state
            .lock()
            .roster
            .values()
            .filter(|r| r.standalone)
            .map(|r| r.name.clone())
            .collect();
        let results = join_all(names.into_iter().map(|name| async move {
            let result = self.pin_and_start(&name).await;
            (name, result)
        }))
        .await;
        let report = StartReport::collect(results);
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "standalone plugins initialized"
        );
        report
    }

    async fn pin_and_start(&self, name: &str) -> Result<(), PluginError> {
        let guard = self.spawn_guard(name);
        let _held = guard.lock().await;
        {
            let mut state = self.state.lock();
            check_launchable(&state, name)?;
            state.pinned.insert(name.to_string());
            if state.live.contains_key(name) {
                return Ok(());
            }
        }
        let result = self.bring_up(name).await;
        if result.is_err() {
            self.state.lock().pinned.remove(name);
        }
        result
    }

    /// Reference `names` from `session`, starting whatever is not running.
    #[instrument(skip(self, names), fields(session_id = %session))]
    pub async fn start_servers_for_session(&self, session: &SessionId, names: &[String]) -> StartReport {
        let mut unique: Vec<&String> = Vec::with_capacity(names.len());
        for name in names {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        let results = join_all(unique.into_iter().map(|name| async move {
            let result = self.acquire(session, name).await;
            (name.clone(), result)
        }))
        .await;
        StartReport::collect(results)
    }

    async fn acquire(&self, session: &SessionId, name: &str) -> Result<(), PluginError> {
        let guard = self.spawn_guard(name);
        let _held = guard.lock().await;
        {
            let mut state = self.state.lock();
            check_launchable(&state, name)?;
            state
                .refs
                .entry(name.to_string())
                .or_default()
                .insert(session.clone());
            if state.live.contains_key(name) {
                return Ok(());
            }
        }

        let result = self.bring_up(name).await;
        if result.is_err() {
            let mut state = self.state.lock();
            if let Some(set) = state.refs.get_mut(name) {
                set.remove(session);
                if set.is_empty() {
                    state.refs.remove(name);
                }
            }
        }
        result
    }

    /// Launch (or adopt) the process for `name`. Caller holds the spawn
    /// guard and has checked that nothing is live.
    async fn bring_up(&self, name: &str) -> Result<(), PluginError> {
        let spec = self
            .state
            .lock()
            .roster
            .get(name)
            .map(PluginRecord::launch_spec)
            .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))?;

        let Launched { process, exit } = match self.launch_or_reconnect(&spec).await {
            Ok(launched) => launched,
            Err(e) => {
                let message = e.to_string();
                error!(plugin = name, error = %message, kind = e.error_kind(), "plugin failed to start");
                if let Some(rec) = self.state.lock().roster.get_mut(name) {
                    rec.mark_failed(message.clone());
                }
                self.emit(PluginEvent::Error {
                    plugin: name.to_string(),
                    message,
                });
                return Err(e.into());
            }
        };

        if let Some(pid) = process.pid() {
            let entry = LedgerEntry { pid, port: process.port() };
            if let Err(e) = self.ledger.write(name, entry) {
                warn!(plugin = name, error = %e, "failed to record pid file");
            }
        }

        let tools = match process.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(plugin = name, error = %e, "tool catalog unavailable, continuing with none");
                Vec::new()
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let kept = {
            let mut state = self.state.lock();
            if state.is_wanted(name) {
                if let Some(rec) = state.roster.get_mut(name) {
                    rec.mark_connected(process.port(), process.pid(), tools.clone());
                }
                state.live.insert(
                    name.to_string(),
                    LiveProcess {
                        process: process.clone(),
                        generation,
                    },
                );
                true
            } else {
                false
            }
        };

        if !kept {
            info!(plugin = name, "every session released during startup, stopping");
            self.ledger.remove(name);
            process.stop().await;
            return Ok(());
        }

        info!(
            plugin = name,
            port = process.port(),
            pid = ?process.pid(),
            reconnected = process.adopted(),
            tools = tools.len(),
            "plugin connected"
        );
        self.emit(PluginEvent::Started {
            plugin: name.to_string(),
            port: process.port(),
            pid: process.pid(),
            reconnected: process.adopted(),
        });
        self.emit(PluginEvent::ToolsUpdated {
            plugin: name.to_string(),
            tools,
        });
        self.watch_exit(name, generation, exit);
        Ok(())
    }

    /// Prefer a live process recorded in the ledger; otherwise discard the
    /// entry and spawn fresh. A pid that does not answer the handshake is
    /// never signalled: it may have been reused by an unrelated process.
    async fn launch_or_reconnect(&self, spec: &LaunchSpec) -> Result<Launched, SupervisorError> {
        if let Some(entry) = self.ledger.read(&spec.name) {
            if self.ledger.is_alive(entry.pid) {
                match self.launcher.connect(&spec.name, &entry).await {
                    Ok(launched) => return Ok(launched),
                    Err(e) => {
                        warn!(plugin = %spec.name, pid = entry.pid, error = %e, "ledger pid unresponsive, discarding entry");
                    }
                }
            }
            self.ledger.remove(&spec.name);
        }
        self.launcher.spawn(spec).await
    }

    fn watch_exit(&self, name: &str, generation: u64, exit: oneshot::Receiver<ExitReport>) {
        let manager = self.me.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let Ok(report) = exit.await else {
                return;
            };
            if let Some(manager) = manager.upgrade() {
                manager.handle_exit(&name, generation, report).await;
            }
        });
    }

    async fn handle_exit(&self, name: &str, generation: u64, report: ExitReport) {
        let process = {
            let mut state = self.state.lock();
            if state.live.get(name).map(|l| l.generation) != Some(generation) {
                return;
            }
            let Some(live) = state.live.remove(name) else {
                return;
            };
            state.refs.remove(name);
            if let Some(rec) = state.roster.get_mut(name) {
                rec.mark_failed(report.describe());
            }
            live.process
        };
        self.adapters.remove(name);
        self.ledger.remove(name);
        error!(plugin = name, code = ?report.code, stderr = %report.stderr_tail.trim(), "plugin exited unexpectedly");
        process.stop().await;
        self.emit(PluginEvent::Error {
            plugin: name.to_string(),
            message: report.describe(),
        });
    }

    /// Drop `session` from every reference set and stop what nobody uses.
    /// Unknown sessions are a no-op. The stops run on their own task, so
    /// they complete even if the caller is dropped midway.
    #[instrument(skip(self), fields(session_id = %session))]
    pub async fn release_servers_for_session(&self, session: &SessionId) {
        let emptied = self.detach_session(session);
        if emptied.is_empty() {
            return;
        }
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        let stops = tokio::spawn(async move { manager.stop_unwanted(emptied).await });
        if let Err(e) = stops.await {
            error!(error = %e, "plugin stop task failed");
        }
    }

    /// Remove `session` from every reference set. Returns the unpinned
    /// names it was the last reference of.
    fn detach_session(&self, session: &SessionId) -> Vec<String> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut emptied = Vec::new();
        state.refs.retain(|name, set| {
            if set.remove(session) && set.is_empty() {
                emptied.push(name.clone());
            }
            !set.is_empty()
        });
        emptied.retain(|name| !state.pinned.contains(name));
        emptied
    }

    /// Stop each of `names` that is still unreferenced, holding its spawn
    /// guard so a concurrent start waits for the old process to exit.
    async fn stop_unwanted(&self, names: Vec<String>) {
        join_all(names.into_iter().map(|name| async move {
            let guard = self.spawn_guard(&name);
            let _held = guard.lock().await;
            let process = {
                let mut state = self.state.lock();
                if state.is_wanted(&name) {
                    return;
                }
                let Some(live) = state.live.remove(&name) else {
                    return;
                };
                if let Some(rec) = state.roster.get_mut(&name) {
                    rec.mark_stopped();
                }
                live.process
            };
            self.adapters.remove(&name);
            self.ledger.remove(&name);
            process.stop().await;
            debug!(plugin = %name, "plugin stopped");
            self.emit(PluginEvent::Stopped { plugin: name });
        }))
        .await;
    }

    async fn stop_all_of(&self, processes: Vec<(String, Arc<dyn PluginProcess>)>) {
        join_all(processes.into_iter().map(|(name, process)| async move {
            process.stop().await;
            debug!(plugin = %name, "plugin stopped");
            self.emit(PluginEvent::Stopped { plugin: name });
        }))
        .await;
    }

    /// Tool-server configs for the connected plugins among `names` that
    /// serve tools.
    pub fn get_tool_server_configs(&self, names: &[String]) -> Vec<ToolServerConfig> {
        let state = self.state.lock();
        names
            .iter()
            .filter(|name| state.roster.get(*name).is_some_and(PluginRecord::serves_tools))
            .filter_map(|name| {
                let live = state.live.get(name)?;
                Some(ToolServerConfig::http(name.clone(), live.process.endpoint()))
            })
            .collect()
    }

    /// Dispatch adapters for the connected worker plugins among `names`.
    pub fn get_dispatch_adapters(&self, names: &[String]) -> Vec<Arc<dyn WorkerDispatch>> {
        let state = self.state.lock();
        let mut adapters: Vec<Arc<dyn WorkerDispatch>> = Vec::new();
        for name in names {
            let is_worker = state
                .roster
                .get(name)
                .is_some_and(|r| r.has_capability(Capability::Worker));
            let Some(live) = state.live.get(name).filter(|_| is_worker) else {
                continue;
            };
            let adapter = self
                .adapters
                .entry(name.clone())
                .or_insert_with(|| {
                    Arc::new(DispatchAdapter::new(live.process.clone(), self.dispatch_timeout))
                })
                .clone();
            adapters.push(adapter);
        }
        adapters
    }

    /// Call one tool, starting the plugin under a throwaway session if it
    /// is not running. The call runs on its own task and the temporary
    /// reference is always released, even if the caller goes away.
    #[instrument(skip(self, arguments))]
    pub async fn invoke_tool(&self, name: &str, tool: &str, arguments: Value) -> Result<Value, PluginError> {
        let manager = self
            .me
            .upgrade()
            .ok_or_else(|| PluginError::NotRunning(name.to_string()))?;
        let (plugin, tool) = (name.to_string(), tool.to_string());
        let call = tokio::spawn(
            async move {
                let session = SessionId::from_raw(format!("{INVOKE_SESSION_PREFIX}{}", Uuid::now_v7()));
                let outcome = match manager.acquire(&session, &plugin).await {
                    Ok(()) => match manager.live_process(&plugin) {
                        Some(process) => process.call_tool(&tool, arguments).await.map_err(PluginError::from),
                        None => Err(PluginError::NotRunning(plugin.clone())),
                    },
                    Err(e) => Err(e),
                };
                manager.release_servers_for_session(&session).await;
                outcome
            }
            .in_current_span(),
        );
        match call.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(plugin = name, error = %e, "tool invocation task failed");
                Err(PluginError::NotRunning(name.to_string()))
            }
        }
    }

    /// Re-fetch a live plugin's catalog and publish it.
    pub async fn refresh_tools(&self, name: &str) -> Result<Vec<ToolDefinition>, PluginError> {
        let process = self
            .live_process(name)
            .ok_or_else(|| PluginError::NotRunning(name.to_string()))?;
        let tools = process.list_tools().await?;
        if let Some(rec) = self.state.lock().roster.get_mut(name) {
            rec.tools = tools.clone();
        }
        self.emit(PluginEvent::ToolsUpdated {
            plugin: name.to_string(),
            tools: tools.clone(),
        });
        Ok(tools)
    }

    /// Stop every live process, clear all tables and close the event
    /// channel for existing subscribers.
    pub async fn shutdown(&self) {
        let processes: Vec<(String, Arc<dyn PluginProcess>)> = {
            let mut state = self.state.lock();
            state.refs.clear();
            state.pinned.clear();
            let live: Vec<_> = state.live.drain().map(|(n, l)| (n, l.process)).collect();
            for (name, _) in &live {
                if let Some(rec) = state.roster.get_mut(name) {
                    rec.mark_stopped();
                }
            }
            live
        };
        self.adapters.clear();
        self.spawn_guards.clear();
        let count = processes.len();
        for (name, _) in &processes {
            self.ledger.remove(name);
        }
        self.stop_all_of(processes).await;

        let (fresh, _) = broadcast::channel(EVENT_CAPACITY);
        *self.events.lock() = fresh;
        info!(stopped = count, "plugin manager shut down");
    }
}

fn check_launchable(state: &ManagerState, name: &str) -> Result<(), PluginError> {
    let record = state
        .roster
        .get(name)
        .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))?;
    match &record.manifest_error {
        Some(reason) => Err(PluginError::Unavailable {
            plugin: name.to_string(),
            reason: reason.clone(),
        }),
        None => Ok(()),
    }
}
