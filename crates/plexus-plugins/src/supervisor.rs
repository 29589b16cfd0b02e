use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use plexus_core::{ToolDefinition, TransportError};

use crate::error::SupervisorError;
use crate::ledger::{pid_alive, send_signal, terminate_pid, LedgerEntry};
use crate::manifest::PORT_PLACEHOLDER;
use crate::ports::PortAllocator;
use crate::stderr::{drain_into, SharedTail, TailBuffer};
use crate::transport::{JsonRpcClient, RpcTimeouts};

/// Exit code a plugin uses to report that its port was already bound.
pub const EXIT_PORT_IN_USE: i32 = 2;

#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub work_dir: PathBuf,
}

/// How a supervised process ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitReport {
    /// `None` when killed by a signal or when the pid simply vanished.
    pub code: Option<i32>,
    pub stderr_tail: String,
}

impl ExitReport {
    pub fn describe(&self) -> String {
        let mut msg = match self.code {
            Some(code) => format!("process exited with code {code}"),
            None => "process exited unexpectedly".to_string(),
        };
        let tail = self.stderr_tail.trim();
        if !tail.is_empty() {
            msg.push_str("; stderr: ");
            msg.push_str(tail);
        }
        msg
    }
}

/// A started plugin and the channel that fires if it exits on its own.
pub struct Launched {
    pub process: Arc<dyn PluginProcess>,
    pub exit: oneshot::Receiver<ExitReport>,
}

/// A live plugin process bound to its JSON-RPC endpoint.
#[async_trait]
pub trait PluginProcess: Send + Sync {
    fn name(&self) -> &str;
    fn port(&self) -> u16;
    fn pid(&self) -> Option<u32>;
    fn endpoint(&self) -> &str;
    /// True when reconnected through the ledger rather than spawned.
    fn adopted(&self) -> bool;
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, TransportError>;
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, TransportError>;
    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, TransportError>;
    /// Terminate and give the port back. Idempotent.
    async fn stop(&self);
}

/// Starts plugin processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Launched, SupervisorError>;
    /// Adopt a process left running by a previous host.
    async fn connect(&self, name: &str, entry: &LedgerEntry) -> Result<Launched, SupervisorError>;
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub settle_window: Duration,
    pub max_attempts: u32,
    pub timeouts: RpcTimeouts,
    pub stop_grace: Duration,
    pub stderr_limit: usize,
    pub liveness_poll: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            settle_window: Duration::from_millis(500),
            max_attempts: 10,
            timeouts: RpcTimeouts::default(),
            stop_grace: Duration::from_secs(5),
            stderr_limit: 8 * 1024,
            liveness_poll: Duration::from_secs(2),
        }
    }
}

/// Replace every `${PORT}` in `args` with `port`.
pub fn substitute_port(args: &[String], port: u16) -> Vec<String> {
    let port = port.to_string();
    args.iter()
        .map(|a| a.replace(PORT_PLACEHOLDER, &port))
        .collect()
}

fn client_info() -> Value {
    json!({ "name": "plexus", "version": env!("CARGO_PKG_VERSION") })
}

/// Spawns plugin processes on leased ports and retries past collisions.
pub struct Supervisor {
    config: SupervisorConfig,
    ports: Arc<Mutex<PortAllocator>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, ports: Arc<Mutex<PortAllocator>>) -> Self {
        Self { config, ports }
    }

    pub fn ports(&self) -> &Arc<Mutex<PortAllocator>> {
        &self.ports
    }

    fn launch(
        &self,
        spec: &LaunchSpec,
        args: &[String],
    ) -> Result<(ChildMonitor, oneshot::Receiver<ExitReport>), SupervisorError> {
        let child = tokio::process::Command::new(&spec.command)
            .args(args)
            .envs(&spec.env)
            .current_dir(&spec.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SupervisorError::Launch {
                plugin: spec.name.clone(),
                command: spec.command.clone(),
                message: e.to_string(),
            })?;
        Ok(ChildMonitor::start(&spec.name, child, self.config.stderr_limit))
    }
}

#[async_trait]
impl Launcher for Supervisor {
    #[instrument(skip(self, spec), fields(plugin = %spec.name))]
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Launched, SupervisorError> {
        for attempt in 1..=self.config.max_attempts {
            let port = self.ports.lock().allocate()?;
            let args = substitute_port(&spec.args, port);
            debug!(attempt, port, "launching plugin");

            let (monitor, exit) = match self.launch(spec, &args) {
                Ok(started) => started,
                Err(e) => {
                    self.ports.lock().release(port);
                    return Err(e);
                }
            };

            if let Some(code) = monitor.wait_exit(self.config.settle_window).await {
                if code == Some(EXIT_PORT_IN_USE) {
                    warn!(attempt, port, "port collision, retrying");
                    self.ports.lock().mark_dead(port);
                    continue;
                }
                self.ports.lock().release(port);
                return Err(SupervisorError::Handshake {
                    plugin: spec.name.clone(),
                    port,
                    message: ExitReport { code, stderr_tail: String::new() }.describe(),
                    stderr: monitor.stderr(),
                });
            }

            let client = JsonRpcClient::for_port(port, self.config.timeouts);
            match client.initialize(client_info()).await {
                Ok(_) => {
                    info!(port, pid = ?monitor.pid, attempt, "plugin started");
                    let process = SpawnedProcess {
                        name: spec.name.clone(),
                        port,
                        client,
                        monitor,
                        ports: self.ports.clone(),
                        stop_grace: self.config.stop_grace,
                        stopped: AtomicBool::new(false),
                    };
                    return Ok(Launched {
                        process: Arc::new(process),
                        exit,
                    });
                }
                Err(e) => {
                    let code = monitor.terminate(self.config.stop_grace).await;
                    if code == Some(EXIT_PORT_IN_USE) {
                        warn!(attempt, port, "port collision during handshake, retrying");
                        self.ports.lock().mark_dead(port);
                        continue;
                    }
                    self.ports.lock().release(port);
                    return Err(SupervisorError::Handshake {
                        plugin: spec.name.clone(),
                        port,
                        message: e.to_string(),
                        stderr: monitor.stderr(),
                    });
                }
            }
        }

        Err(SupervisorError::PortCollisions {
            plugin: spec.name.clone(),
            attempts: self.config.max_attempts,
        })
    }

    #[instrument(skip(self, entry), fields(plugin = name, pid = entry.pid, port = entry.port))]
    async fn connect(&self, name: &str, entry: &LedgerEntry) -> Result<Launched, SupervisorError> {
        let reconnect_err = |message: String| SupervisorError::Reconnect {
            plugin: name.to_string(),
            pid: entry.pid,
            message,
        };

        if !self.ports.lock().claim(entry.port) {
            return Err(reconnect_err(format!("port {} cannot be claimed", entry.port)));
        }
        let client = JsonRpcClient::for_port(entry.port, self.config.timeouts);
        if let Err(e) = client.initialize(client_info()).await {
            self.ports.lock().release(entry.port);
            return Err(reconnect_err(e.to_string()));
        }

        let watch = CancellationToken::new();
        let exit = watch_pid(entry.pid, self.config.liveness_poll, watch.clone());
        info!("reconnected to running plugin");
        let process = AdoptedProcess {
            name: name.to_string(),
            pid: entry.pid,
            port: entry.port,
            client,
            ports: self.ports.clone(),
            stop_grace: self.config.stop_grace,
            stopped: AtomicBool::new(false),
            watch,
        };
        Ok(Launched {
            process: Arc::new(process),
            exit,
        })
    }
}

/// Owns a spawned child: reaps it, captures its stderr tail and publishes
/// its exit code.
struct ChildMonitor {
    pid: Option<u32>,
    exited: watch::Receiver<Option<Option<i32>>>,
    kill: CancellationToken,
    stderr: SharedTail,
}

impl ChildMonitor {
    fn start(
        plugin: &str,
        mut child: tokio::process::Child,
        stderr_limit: usize,
    ) -> (Self, oneshot::Receiver<ExitReport>) {
        let pid = child.id();
        let tail: SharedTail = Arc::new(Mutex::new(TailBuffer::new(stderr_limit)));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(drain_into(pipe, tail.clone())));
        if let Some(stdout) = child.stdout.take() {
            let plugin = plugin.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(plugin = %plugin, %line, "plugin stdout");
                }
            });
        }

        let (exited_tx, exited) = watch::channel(None);
        let (report_tx, report_rx) = oneshot::channel();
        let kill = CancellationToken::new();
        let kill_signal = kill.clone();
        let report_tail = tail.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                () = kill_signal.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|s| s.code());
            if let Some(task) = stderr_task {
                let _ = tokio::time::timeout(Duration::from_millis(250), task).await;
            }
            let _ = exited_tx.send(Some(code));
            let _ = report_tx.send(ExitReport {
                code,
                stderr_tail: report_tail.lock().contents(),
            });
        });

        (
            Self {
                pid,
                exited,
                kill,
                stderr: tail,
            },
            report_rx,
        )
    }

    fn stderr(&self) -> String {
        self.stderr.lock().contents()
    }

    fn exit_code(&self) -> Option<Option<i32>> {
        *self.exited.borrow()
    }

    /// The exit code if the child exits within `within`.
    async fn wait_exit(&self, within: Duration) -> Option<Option<i32>> {
        let mut rx = self.exited.clone();
        let state = match tokio::time::timeout(within, rx.wait_for(Option::is_some)).await {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => self.exit_code(),
            Err(_) => None,
        };
        state
    }

    /// SIGTERM, then SIGKILL after `grace`. Returns the exit code.
    async fn terminate(&self, grace: Duration) -> Option<i32> {
        if let Some(code) = self.exit_code() {
            return code;
        }
        if let Some(pid) = self.pid {
            send_signal(pid, libc::SIGTERM);
        }
        if let Some(code) = self.wait_exit(grace).await {
            return code;
        }
        warn!(pid = ?self.pid, "plugin ignored SIGTERM, killing");
        self.kill.cancel();
        self.wait_exit(Duration::from_secs(5)).await.flatten()
    }
}

struct SpawnedProcess {
    name: String,
    port: u16,
    client: JsonRpcClient,
    monitor: ChildMonitor,
    ports: Arc<Mutex<PortAllocator>>,
    stop_grace: Duration,
    stopped: AtomicBool,
}

#[async_trait]
impl PluginProcess for SpawnedProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn pid(&self) -> Option<u32> {
        self.monitor.pid
    }

    fn endpoint(&self) -> &str {
        self.client.endpoint()
    }

    fn adopted(&self) -> bool {
        false
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, TransportError> {
        self.client.list_tools().await
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, TransportError> {
        self.client.call_tool(tool, arguments).await
    }

    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, TransportError> {
        self.client.request(method, params, timeout).await
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let code = self.monitor.terminate(self.stop_grace).await;
        self.ports.lock().release(self.port);
        debug!(plugin = %self.name, port = self.port, ?code, "plugin process stopped");
    }
}

/// A process from a previous host run, known only by pid and port.
struct AdoptedProcess {
    name: String,
    pid: u32,
    port: u16,
    client: JsonRpcClient,
    ports: Arc<Mutex<PortAllocator>>,
    stop_grace: Duration,
    stopped: AtomicBool,
    watch: CancellationToken,
}

#[async_trait]
impl PluginProcess for AdoptedProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn endpoint(&self) -> &str {
        self.client.endpoint()
    }

    fn adopted(&self) -> bool {
        true
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, TransportError> {
        self.client.list_tools().await
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, TransportError> {
        self.client.call_tool(tool, arguments).await
    }

    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, TransportError> {
        self.client.request(method, params, timeout).await
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.watch.cancel();
        terminate_pid(self.pid, self.stop_grace).await;
        self.ports.lock().release(self.port);
        debug!(plugin = %self.name, pid = self.pid, "adopted plugin stopped");
    }
}

/// Poll an adopted pid; fires once if it disappears before `stop` cancels
/// the watch.
fn watch_pid(pid: u32, poll: Duration, stop: CancellationToken) -> oneshot::Receiver<ExitReport> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        loop {
            tokio::select! {
                () = stop.cancelled() => return,
                _ = ticker.tick() => {
                    if !pid_alive(pid) {
                        let _ = tx.send(ExitReport { code: None, stderr_tail: String::new() });
                        return;
                    }
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            settle_window: Duration::from_millis(200),
            stop_grace: Duration::from_millis(500),
            liveness_poll: Duration::from_millis(50),
            timeouts: RpcTimeouts {
                handshake: Duration::from_secs(2),
                list_tools: Duration::from_secs(2),
                call_tool: Duration::from_secs(2),
            },
            ..Default::default()
        }
    }

    fn supervisor(range: std::ops::RangeInclusive<u16>) -> Supervisor {
        Supervisor::new(config(), Arc::new(Mutex::new(PortAllocator::new(range))))
    }

    fn sh(name: &str, script: &str) -> LaunchSpec {
        LaunchSpec {
            name: name.to_string(),
            command: "sh".to_string(),
            args: vec!["-c".into(), script.into(), "sh".into(), "${PORT}".into()],
            env: BTreeMap::new(),
            work_dir: std::env::temp_dir(),
        }
    }

    async fn plugin_endpoint() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(|request: &Request| {
                let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
                ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0", "id": body["id"], "result": {"tools": [{"name": "echo"}]}
                }))
            })
            .mount(&server)
            .await;
        server
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn substitutes_every_placeholder() {
        let args: Vec<String> = ["run", "server.js", "--port", "${PORT}", "--metrics=${PORT}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            substitute_port(&args, 50_007),
            vec!["run", "server.js", "--port", "50007", "--metrics=50007"]
        );
    }

    #[test]
    fn exit_report_description() {
        let report = ExitReport {
            code: Some(1),
            stderr_tail: "boom\n".into(),
        };
        assert_eq!(report.describe(), "process exited with code 1; stderr: boom");
        let vanished = ExitReport {
            code: None,
            stderr_tail: String::new(),
        };
        assert_eq!(vanished.describe(), "process exited unexpectedly");
    }

    #[tokio::test]
    async fn every_attempt_colliding_names_the_ceiling() {
        let sup = supervisor(50_000..=50_100);
        let err = match sup.spawn(&sh("notes", "exit 2")).await {
            Err(e) => e,
            Ok(_) => panic!("spawn should fail"),
        };
        assert!(
            matches!(err, SupervisorError::PortCollisions { attempts: 10, .. }),
            "got {err}"
        );
        assert!(err.to_string().contains("10 attempts"));

        let ports = sup.ports().lock();
        assert_eq!((50_000..50_010).filter(|p| ports.is_dead(*p)).count(), 10);
        assert!(!ports.is_leased(50_010));
    }

    #[tokio::test]
    async fn one_collision_then_success_on_next_port() {
        let server = plugin_endpoint().await;
        let good = server.address().port();
        let bad = good - 1;
        let sup = supervisor(bad..=good);
        let script = format!("if [ \"$1\" = \"{bad}\" ]; then exit 2; fi; exec sleep 30");

        let launched = sup.spawn(&sh("notes", &script)).await.unwrap();
        let process = launched.process;
        assert_eq!(process.port(), good);
        assert!(process.pid().is_some());
        assert!(!process.adopted());
        assert!(sup.ports().lock().is_dead(bad));
        assert!(sup.ports().lock().is_leased(good));

        let tools = process.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "echo");

        process.stop().await;
        process.stop().await;
        assert!(!sup.ports().lock().is_leased(good));
        assert!(!sup.ports().lock().is_dead(good));
    }

    #[tokio::test]
    async fn handshake_failure_reports_stderr_and_frees_port() {
        let port = free_port();
        let sup = supervisor(port..=port);
        let err = match sup
            .spawn(&sh("calendar", "echo 'missing API key' >&2; exec sleep 30"))
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("spawn should fail"),
        };
        match &err {
            SupervisorError::Handshake { port: p, stderr, .. } => {
                assert_eq!(*p, port);
                assert!(stderr.contains("missing API key"), "stderr: {stderr}");
            }
            other => panic!("unexpected: {other}"),
        }
        let ports = sup.ports().lock();
        assert!(!ports.is_leased(port));
        assert!(!ports.is_dead(port));
    }

    #[tokio::test]
    async fn early_generic_exit_is_not_retried() {
        let sup = supervisor(50_200..=50_210);
        let err = match sup.spawn(&sh("notes", "exit 1")).await {
            Err(e) => e,
            Ok(_) => panic!("spawn should fail"),
        };
        assert!(err.to_string().contains("code 1"), "got {err}");
        let ports = sup.ports().lock();
        assert!(!ports.is_dead(50_200));
        assert_eq!(ports.available(), 11);
    }

    #[tokio::test]
    async fn missing_binary_is_launch_error() {
        let sup = supervisor(50_300..=50_301);
        let spec = LaunchSpec {
            command: "/nonexistent/plexus-plugin".into(),
            ..sh("ghost", "")
        };
        let err = match sup.spawn(&spec).await {
            Err(e) => e,
            Ok(_) => panic!("spawn should fail"),
        };
        assert_eq!(err.error_kind(), "launch");
        assert_eq!(sup.ports().lock().available(), 2);
    }

    #[tokio::test]
    async fn crash_fires_exit_report() {
        let server = plugin_endpoint().await;
        let port = server.address().port();
        let sup = supervisor(port..=port);
        let launched = sup
            .spawn(&sh("notes", "echo dying >&2; exec sleep 30"))
            .await
            .unwrap();
        let pid = launched.process.pid().unwrap();
        send_signal(pid, libc::SIGKILL);

        let report = tokio::time::timeout(Duration::from_secs(5), launched.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.code, None);
        assert!(report.stderr_tail.contains("dying"));
        launched.process.stop().await;
        assert!(!sup.ports().lock().is_leased(port));
    }

    #[tokio::test]
    async fn connect_adopts_live_process() {
        let server = plugin_endpoint().await;
        let port = server.address().port();
        let sup = supervisor(port..=port);
        let mut sleeper = tokio::process::Command::new("sh")
            .args(["-c", "exec sleep 30"])
            .spawn()
            .unwrap();
        let pid = sleeper.id().unwrap();

        let launched = sup
            .connect("notes", &LedgerEntry { pid, port })
            .await
            .unwrap();
        assert!(launched.process.adopted());
        assert_eq!(launched.process.pid(), Some(pid));
        assert!(sup.ports().lock().is_leased(port));

        let reaper = tokio::spawn(async move { sleeper.wait().await });
        launched.process.stop().await;
        assert!(!sup.ports().lock().is_leased(port));
        tokio::time::timeout(Duration::from_secs(5), reaper)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn adopted_process_death_is_detected() {
        let server = plugin_endpoint().await;
        let port = server.address().port();
        let sup = supervisor(port..=port);
        let mut sleeper = tokio::process::Command::new("sh")
            .args(["-c", "exec sleep 30"])
            .spawn()
            .unwrap();
        let pid = sleeper.id().unwrap();
        let launched = sup.connect("notes", &LedgerEntry { pid, port }).await.unwrap();

        sleeper.kill().await.unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), launched.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.code, None);
    }

    #[tokio::test]
    async fn connect_failure_releases_claim() {
        let port = free_port();
        let sup = supervisor(port..=port);
        let err = match sup
            .connect("notes", &LedgerEntry { pid: std::process::id(), port })
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("connect should fail"),
        };
        assert_eq!(err.error_kind(), "reconnect");
        assert!(!sup.ports().lock().is_leased(port));
    }
}
