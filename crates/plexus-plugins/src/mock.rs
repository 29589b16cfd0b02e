//! In-process doubles for the launcher, its processes and the ledger, for
//! exercising the lifecycle manager without real subprocesses.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use plexus_core::{ToolDefinition, TransportError};

use crate::error::SupervisorError;
use crate::ledger::{Ledger, LedgerEntry};
use crate::supervisor::{ExitReport, LaunchSpec, Launched, Launcher, PluginProcess};
use crate::transport::endpoint_for_port;

/// A process that answers every call from memory and records what it saw.
pub struct MockProcess {
    name: String,
    port: u16,
    pid: Option<u32>,
    endpoint: String,
    adopted: bool,
    tools: Mutex<Vec<ToolDefinition>>,
    fail_list_tools: AtomicBool,
    requests: Mutex<Vec<(String, Value)>>,
    tool_calls: Mutex<Vec<(String, Value)>>,
    stop_count: AtomicUsize,
    stop_delay: Duration,
    exited: AtomicBool,
}

impl MockProcess {
    pub fn new(name: &str, port: u16, tools: Vec<ToolDefinition>) -> Self {
        Self {
            name: name.to_string(),
            port,
            pid: None,
            endpoint: endpoint_for_port(port),
            adopted: false,
            tools: Mutex::new(tools),
            fail_list_tools: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            tool_calls: Mutex::new(Vec::new()),
            stop_count: AtomicUsize::new(0),
            stop_delay: Duration::ZERO,
            exited: AtomicBool::new(false),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn adopted(mut self) -> Self {
        self.adopted = true;
        self
    }

    /// `stop` takes this long before the process counts as exited.
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    pub fn set_tools(&self, tools: Vec<ToolDefinition>) {
        *self.tools.lock() = tools;
    }

    pub fn fail_list_tools(&self, fail: bool) {
        self.fail_list_tools.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().clone()
    }

    pub fn tool_calls(&self) -> Vec<(String, Value)> {
        self.tool_calls.lock().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_count.load(Ordering::SeqCst) > 0
    }

    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// True once a `stop` call has run to completion.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PluginProcess for MockProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn adopted(&self) -> bool {
        self.adopted
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, TransportError> {
        if self.fail_list_tools.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout {
                method: "tools/list".into(),
                timeout: Duration::from_secs(30),
            });
        }
        Ok(self.tools.lock().clone())
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, TransportError> {
        self.tool_calls.lock().push((tool.to_string(), arguments));
        Ok(json!({ "content": [{ "type": "text", "text": format!("{tool} ok") }] }))
    }

    async fn request(&self, method: &str, params: Value, _timeout: Duration) -> Result<Value, TransportError> {
        self.requests.lock().push((method.to_string(), params));
        Ok(json!({ "ok": true, "method": method }))
    }

    async fn stop(&self) {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.exited.store(true, Ordering::SeqCst);
    }
}

/// Launcher that hands out [`MockProcess`]es on sequential ports and pids.
pub struct MockLauncher {
    next_port: AtomicU16,
    next_pid: AtomicU32,
    delay: Mutex<Duration>,
    stop_delay: Mutex<Duration>,
    failing: Mutex<HashMap<String, String>>,
    tools: Mutex<HashMap<String, Vec<ToolDefinition>>>,
    reconnectable: Mutex<HashSet<u32>>,
    spawns: Mutex<Vec<String>>,
    connects: Mutex<Vec<String>>,
    crash_senders: Mutex<HashMap<String, oneshot::Sender<ExitReport>>>,
    processes: Mutex<HashMap<String, Arc<MockProcess>>>,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            next_port: AtomicU16::new(50_000),
            next_pid: AtomicU32::new(10_000),
            delay: Mutex::new(Duration::ZERO),
            stop_delay: Mutex::new(Duration::ZERO),
            failing: Mutex::new(HashMap::new()),
            tools: Mutex::new(HashMap::new()),
            reconnectable: Mutex::new(HashSet::new()),
            spawns: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
            crash_senders: Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Every spawn sleeps this long before returning.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Processes handed out from now on take this long to stop.
    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock() = delay;
    }

    pub fn fail(&self, name: &str, message: &str) {
        self.failing.lock().insert(name.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, name: &str) {
        self.failing.lock().remove(name);
    }

    pub fn set_tools(&self, name: &str, tools: Vec<ToolDefinition>) {
        self.tools.lock().insert(name.to_string(), tools);
    }

    /// `connect` succeeds for this pid.
    pub fn accept_reconnect(&self, pid: u32) {
        self.reconnectable.lock().insert(pid);
    }

    pub fn spawn_count(&self, name: &str) -> usize {
        self.spawns.lock().iter().filter(|n| *n == name).count()
    }

    pub fn total_spawns(&self) -> usize {
        self.spawns.lock().len()
    }

    pub fn connect_count(&self, name: &str) -> usize {
        self.connects.lock().iter().filter(|n| *n == name).count()
    }

    /// Latest process handed out for `name`.
    pub fn process(&self, name: &str) -> Option<Arc<MockProcess>> {
        self.processes.lock().get(name).cloned()
    }

    /// Simulate the latest process for `name` dying. False if there is
    /// nothing left to crash.
    pub fn crash(&self, name: &str, code: Option<i32>) -> bool {
        let Some(tx) = self.crash_senders.lock().remove(name) else {
            return false;
        };
        tx.send(ExitReport {
            code,
            stderr_tail: format!("{name} crashed\n"),
        })
        .is_ok()
    }

    fn hand_out(&self, name: &str, process: MockProcess) -> Launched {
        let process = Arc::new(process.with_stop_delay(*self.stop_delay.lock()));
        let (tx, rx) = oneshot::channel();
        self.crash_senders.lock().insert(name.to_string(), tx);
        self.processes.lock().insert(name.to_string(), process.clone());
        Launched { process, exit: rx }
    }

    fn catalog(&self, name: &str) -> Vec<ToolDefinition> {
        self.tools.lock().get(name).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Launched, SupervisorError> {
        self.spawns.lock().push(spec.name.clone());
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.failing.lock().get(&spec.name).cloned() {
            return Err(SupervisorError::Launch {
                plugin: spec.name.clone(),
                command: spec.command.clone(),
                message,
            });
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let process = MockProcess::new(&spec.name, port, self.catalog(&spec.name)).with_pid(pid);
        Ok(self.hand_out(&spec.name, process))
    }

    async fn connect(&self, name: &str, entry: &LedgerEntry) -> Result<Launched, SupervisorError> {
        self.connects.lock().push(name.to_string());
        if !self.reconnectable.lock().contains(&entry.pid) {
            return Err(SupervisorError::Reconnect {
                plugin: name.to_string(),
                pid: entry.pid,
                message: "connection refused".into(),
            });
        }
        let process = MockProcess::new(name, entry.port, self.catalog(name))
            .with_pid(entry.pid)
            .adopted();
        Ok(self.hand_out(name, process))
    }
}

/// Ledger kept in memory; a pid is alive only when marked so.
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<String, LedgerEntry>>,
    alive: Mutex<HashSet<u32>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_alive(&self, pid: u32, alive: bool) {
        let mut set = self.alive.lock();
        if alive {
            set.insert(pid);
        } else {
            set.remove(&pid);
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Ledger for MemoryLedger {
    fn read(&self, name: &str) -> Option<LedgerEntry> {
        self.entries.lock().get(name).copied()
    }

    fn write(&self, name: &str, entry: LedgerEntry) -> std::io::Result<()> {
        self.entries.lock().insert(name.to_string(), entry);
        Ok(())
    }

    fn remove(&self, name: &str) {
        self.entries.lock().remove(name);
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().contains(&pid)
    }

    fn cleanup_all(&self) -> usize {
        let alive = self.alive.lock().clone();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| alive.contains(&e.pid));
        before - entries.len()
    }

    fn shutdown_all(&self) -> usize {
        let mut alive = self.alive.lock();
        let mut entries = self.entries.lock();
        let signalled = entries.values().filter(|e| alive.remove(&e.pid)).count();
        entries.clear();
        signalled
    }
}
