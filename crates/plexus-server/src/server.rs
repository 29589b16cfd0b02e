use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::http::{build_router, AppState};
use crate::orchestrator::QueryOrchestrator;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 7420,
        }
    }
}

/// Bind and serve in the background. Port 0 picks a free port; the bound
/// one is reported on the handle.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<QueryOrchestrator>,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(AppState::new(orchestrator));
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "plexus server listening");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "http server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr,
        port: addr.port(),
        shutdown,
        server,
    })
}

/// Keeps the server task alive; `stop` closes the listener and waits for
/// in-flight requests.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "http server task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::EventHub;
    use plexus_plugins::mock::{MemoryLedger, MockLauncher};
    use plexus_plugins::{Capability, PluginManager, PluginRecord};
    use plexus_runtime::{MockReply, MockRuntime};
    use plexus_store::{Database, SessionStore};
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn serve(replies: Vec<MockReply>) -> (ServerHandle, Arc<QueryOrchestrator>) {
        let store = SessionStore::new(Database::in_memory().unwrap());
        let plugins = PluginManager::new(
            vec![
                PluginRecord::new("notes", "node", vec!["${PORT}".into()], vec![Capability::Tools]),
                PluginRecord::invalid("broken", "/plugins/broken".into(), "args never mention ${PORT}"),
            ],
            Arc::new(MockLauncher::new()),
            Arc::new(MemoryLedger::new()),
            Duration::from_secs(5),
        );
        let orchestrator = Arc::new(QueryOrchestrator::new(
            store,
            plugins,
            Arc::new(MockRuntime::new(replies)),
            Arc::new(EventHub::default()),
        ));
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config, orchestrator.clone()).await.unwrap();
        (handle, orchestrator)
    }

    fn url(handle: &ServerHandle, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", handle.port)
    }

    #[tokio::test]
    async fn serves_health() {
        let (handle, _) = serve(vec![]).await;
        assert!(handle.port > 0);
        let resp = reqwest::get(url(&handle, "/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["plugins"]["known"], 2);
        handle.stop().await;
    }

    #[tokio::test]
    async fn session_lifecycle_over_http() {
        let (handle, orchestrator) = serve(vec![MockReply::text("r-1", "Hi from the agent")]).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(url(&handle, "/api/sessions"))
            .json(&json!({"name": "Release notes", "plugins": ["notes"]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let created: Value = resp.json().await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        assert!(id.ends_with("-release-notes"));

        let resp = client
            .post(url(&handle, &format!("/api/sessions/{id}/query")))
            .json(&json!({"message": "hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let accepted: Value = resp.json().await.unwrap();
        assert_eq!(accepted["resumed"], false);

        assert!(orchestrator.wait_idle(Duration::from_secs(5)).await);
        let detail: Value = client
            .get(url(&handle, &format!("/api/sessions/{id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(detail["session"]["turn_count"], 1);
        assert_eq!(detail["messages"][1]["content"], "Hi from the agent");
        assert_eq!(detail["query"]["running"], false);

        let list: Value = reqwest::get(url(&handle, "/api/sessions"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["sessions"].as_array().unwrap().len(), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn query_errors_map_to_status_codes() {
        let (handle, orchestrator) = serve(vec![MockReply::Hang(vec![])]).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(url(&handle, "/api/sessions/2026-01-01-ghost/query"))
            .json(&json!({"message": "hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "not_found");

        let id = orchestrator.store().create_session("busy", &[]).unwrap().id;
        let query = url(&handle, &format!("/api/sessions/{id}/query"));
        let first = client.post(&query).json(&json!({"message": "one"})).send().await.unwrap();
        assert_eq!(first.status(), 202);
        let second = client.post(&query).json(&json!({"message": "two"})).send().await.unwrap();
        assert_eq!(second.status(), 409);

        let empty = client.post(&query).json(&json!({"message": "  "})).send().await.unwrap();
        assert_eq!(empty.status(), 400);

        let stopped: Value = client
            .post(url(&handle, &format!("/api/sessions/{id}/stop")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stopped["stopped"], true);
        assert!(orchestrator.wait_idle(Duration::from_secs(5)).await);
        handle.stop().await;
    }

    #[tokio::test]
    async fn plugins_listed_and_tools_invoked() {
        let (handle, orchestrator) = serve(vec![]).await;
        let client = reqwest::Client::new();

        let body: Value = reqwest::get(url(&handle, "/api/plugins"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let plugins = body["plugins"].as_array().unwrap();
        let broken = plugins.iter().find(|p| p["name"] == "broken").unwrap();
        assert_eq!(broken["status"], "error");

        let result: Value = client
            .post(url(&handle, "/api/plugins/notes/tools/search"))
            .json(&json!({"q": "plexus"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "search ok");
        assert!(!orchestrator.plugins().is_running("notes"));

        let resp = client
            .post(url(&handle, "/api/plugins/ghost/tools/search"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        handle.stop().await;
    }

    #[tokio::test]
    async fn session_events_stream_over_sse() {
        let (handle, orchestrator) = serve(vec![MockReply::text("r-1", "streamed")]).await;
        let id = orchestrator.store().create_session("stream", &[]).unwrap().id;

        let mut resp = reqwest::get(url(&handle, &format!("/api/sessions/{id}/events")))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(orchestrator.hub().subscriber_count(&id), 1);

        orchestrator.run_query(&id, "go").await.unwrap();
        let mut body = String::new();
        while !body.contains("event: done") {
            let chunk = tokio::time::timeout(Duration::from_secs(5), resp.chunk())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            body.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(body.contains("event: processing_started"));
        assert!(body.contains("event: text_delta"));
        drop(resp);
        drop(handle);
    }
}
