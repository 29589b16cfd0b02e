use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, ORIGIN};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use plexus_core::{ToolDefinition, TransportError};

pub const PROTOCOL_VERSION: &str = "2025-06-18";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";
const SESSION_HEADER: &str = "mcp-session-id";

/// `http://127.0.0.1:<port>/mcp`
pub fn endpoint_for_port(port: u16) -> String {
    format!("http://127.0.0.1:{port}/mcp")
}

/// Per-call deadlines.
#[derive(Clone, Copy, Debug)]
pub struct RpcTimeouts {
    pub handshake: Duration,
    pub list_tools: Duration,
    pub call_tool: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            list_tools: Duration::from_secs(30),
            call_tool: Duration::from_secs(120),
        }
    }
}

/// JSON-RPC 2.0 over HTTP POST to a single plugin endpoint.
pub struct JsonRpcClient {
    http: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
    timeouts: RpcTimeouts,
    session: Mutex<Option<String>>,
}

impl JsonRpcClient {
    pub fn new(endpoint: impl Into<String>, timeouts: RpcTimeouts) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
            timeouts,
            session: Mutex::new(None),
        }
    }

    pub fn for_port(port: u16, timeouts: RpcTimeouts) -> Self {
        Self::new(endpoint_for_port(port), timeouts)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn timeouts(&self) -> RpcTimeouts {
        self.timeouts
    }

    /// `initialize` followed by `notifications/initialized`, both under the
    /// handshake deadline.
    #[instrument(skip(self, client_info), fields(endpoint = %self.endpoint))]
    pub async fn initialize(&self, client_info: Value) -> Result<Value, TransportError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": client_info,
        });
        let handshake = async {
            let result = self.round_trip("initialize", params).await?;
            self.notify("notifications/initialized", json!({})).await?;
            Ok(result)
        };
        with_deadline("initialize", self.timeouts.handshake, handshake).await
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, TransportError> {
        let result = self
            .request("tools/list", json!({}), self.timeouts.list_tools)
            .await?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(tools).map_err(|e| TransportError::Malformed {
            method: "tools/list".into(),
            message: e.to_string(),
        })
    }

    /// Run a tool. A result flagged `isError` becomes `ToolExecution`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError> {
        self.call_tool_with_timeout(name, arguments, self.timeouts.call_tool)
            .await
    }

    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let result = self
            .request(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
                timeout,
            )
            .await?;
        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(TransportError::ToolExecution {
                tool: name.to_string(),
                content: result.get("content").cloned().unwrap_or(Value::Null),
            });
        }
        Ok(result)
    }

    /// Generic round trip with its own deadline.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        with_deadline(method, timeout, self.round_trip(method, params)).await
    }

    async fn round_trip(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        debug!(method, id, "rpc request");

        let resp = self.post(method, &body).await?;
        if let Some(session) = resp.headers().get(SESSION_HEADER) {
            if let Ok(s) = session.to_str() {
                *self.session.lock() = Some(s.to_string());
            }
        }
        let is_sse = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let text = resp.text().await.map_err(|e| network(method, &e))?;

        let envelope = if is_sse {
            sse_message(&text, id).ok_or_else(|| TransportError::Malformed {
                method: method.to_string(),
                message: "event stream carried no response".into(),
            })?
        } else {
            let value: Value = serde_json::from_str(&text).map_err(|e| TransportError::Malformed {
                method: method.to_string(),
                message: e.to_string(),
            })?;
            check_id(method, &value, id)?;
            value
        };
        unwrap_envelope(method, envelope)
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let body = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.post(method, &body).await.map(|_| ())
    }

    async fn post(&self, method: &str, body: &Value) -> Result<reqwest::Response, TransportError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .headers(self.headers())
            .json(body)
            .send()
            .await
            .map_err(|e| network(method, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                method: method.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(PROTOCOL_HEADER, HeaderValue::from_static(PROTOCOL_VERSION));
        headers.insert(ORIGIN, HeaderValue::from_static("http://localhost"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        if let Some(session) = self.session.lock().as_deref() {
            if let Ok(v) = HeaderValue::from_str(session) {
                headers.insert(SESSION_HEADER, v);
            }
        }
        headers
    }
}

/// Bound a call by `timeout`; the inner future is dropped when it fires.
async fn with_deadline<F>(method: &str, timeout: Duration, fut: F) -> Result<Value, TransportError>
where
    F: std::future::Future<Output = Result<Value, TransportError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            method: method.to_string(),
            timeout,
        }),
    }
}

fn network(method: &str, e: &reqwest::Error) -> TransportError {
    TransportError::Network {
        method: method.to_string(),
        message: e.to_string(),
    }
}

/// A null or absent id is allowed; JSON-RPC uses it for errors raised
/// before the request id could be read.
fn check_id(method: &str, envelope: &Value, id: u64) -> Result<(), TransportError> {
    match envelope.get("id") {
        None | Some(Value::Null) => Ok(()),
        Some(got) if got.as_u64() == Some(id) => Ok(()),
        Some(got) => Err(TransportError::Malformed {
            method: method.to_string(),
            message: format!("response id {got} does not match request id {id}"),
        }),
    }
}

fn unwrap_envelope(method: &str, envelope: Value) -> Result<Value, TransportError> {
    if let Some(err) = envelope.get("error") {
        return Err(TransportError::Rpc {
            method: method.to_string(),
            code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            data: err.get("data").cloned(),
        });
    }
    envelope
        .get("result")
        .cloned()
        .ok_or_else(|| TransportError::Malformed {
            method: method.to_string(),
            message: "response has neither result nor error".into(),
        })
}

/// Pick the JSON-RPC response for `id` out of an SSE body. Falls back to the
/// last parseable data event when none carries a matching id.
fn sse_message(body: &str, id: u64) -> Option<Value> {
    let mut fallback = None;
    for event in body.split("\n\n") {
        let data: Vec<&str> = event
            .lines()
            .filter_map(|l| l.strip_prefix("data:"))
            .map(str::trim_start)
            .collect();
        if data.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(&data.join("\n")) else {
            continue;
        };
        if value.get("id").and_then(Value::as_u64) == Some(id) {
            return Some(value);
        }
        if value.get("result").is_some() || value.get("error").is_some() {
            fallback = Some(value);
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn client(server: &MockServer) -> JsonRpcClient {
        JsonRpcClient::new(format!("{}/mcp", server.uri()), RpcTimeouts::default())
    }

    /// Echo the request id back inside a fixed result.
    struct EchoId {
        result: Value,
        delay: Duration,
    }

    fn echo(result: Value) -> EchoId {
        EchoId {
            result,
            delay: Duration::ZERO,
        }
    }

    impl Respond for EchoId {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
            ResponseTemplate::new(200)
                .set_body_json(json!({"jsonrpc": "2.0", "id": body["id"], "result": self.result}))
                .set_delay(self.delay)
        }
    }

    #[tokio::test]
    async fn initialize_sends_request_then_notification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("MCP-Protocol-Version", PROTOCOL_VERSION))
            .and(header("Origin", "http://localhost"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(echo(json!({"serverInfo": {"name": "notes"}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let result = client(&server).initialize(json!({"name": "plexus"})).await.unwrap();
        assert_eq!(result["serverInfo"]["name"], "notes");
    }

    #[tokio::test]
    async fn request_ids_increase() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(echo(json!({})))
            .mount(&server)
            .await;

        let c = client(&server);
        c.request("ping", json!({}), Duration::from_secs(5)).await.unwrap();
        c.request("ping", json!({}), Duration::from_secs(5)).await.unwrap();

        let ids: Vec<u64> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| serde_json::from_slice::<Value>(&r.body).unwrap()["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn list_tools_parses_catalog() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(echo(json!({"tools": [
                {"name": "search", "inputSchema": {"type": "object"}},
                {"name": "append", "description": "Append a note"}
            ]})))
            .mount(&server)
            .await;

        let tools = client(&server).list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[1].description.as_deref(), Some("Append a note"));
    }

    #[tokio::test]
    async fn call_tool_is_error_maps_to_tool_execution() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call", "params": {"name": "search"}})))
            .respond_with(echo(json!({
                "isError": true,
                "content": [{"type": "text", "text": "index missing"}]
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .call_tool("search", json!({"q": "x"}))
            .await
            .unwrap_err();
        match err {
            TransportError::ToolExecution { tool, content } => {
                assert_eq!(tool, "search");
                assert_eq!(content[0]["text"], "index missing");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn call_tool_returns_result_verbatim() {
        let server = MockServer::start().await;
        let result = json!({"content": [{"type": "text", "text": "ok"}], "structuredContent": {"n": 3}});
        Mock::given(method("POST"))
            .respond_with(echo(result.clone()))
            .mount(&server)
            .await;
        assert_eq!(client(&server).call_tool("count", json!({})).await.unwrap(), result);
    }

    #[tokio::test]
    async fn rpc_error_object() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "error": {"code": -32601, "message": "Method not found"}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .request("jobs/list", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rpc { code: -32601, .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn mismatched_response_id_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 41, "result": {"tools": []}
            })))
            .mount(&server)
            .await;

        let err = client(&server).list_tools().await.unwrap_err();
        match err {
            TransportError::Malformed { message, .. } => {
                assert!(message.contains("41"), "got {message}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn null_id_error_is_still_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": null,
                "error": {"code": -32700, "message": "Parse error"}
            })))
            .mount(&server)
            .await;

        let err = client(&server).list_tools().await.unwrap_err();
        assert!(matches!(err, TransportError::Rpc { code: -32700, .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn non_success_status_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = client(&server).list_tools().await.unwrap_err();
        match err {
            TransportError::Http { status, body, .. } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(EchoId {
                result: json!({}),
                delay: Duration::from_millis(500),
            })
            .mount(&server)
            .await;

        let err = client(&server)
            .request("tools/list", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");
    }

    #[tokio::test]
    async fn event_stream_body_is_accepted() {
        let server = MockServer::start().await;
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[{\"name\":\"sse_tool\"}]}}\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let tools = client(&server).list_tools().await.unwrap();
        assert_eq!(tools[0].name, "sse_tool");
    }

    #[tokio::test]
    async fn session_header_is_echoed_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Mcp-Session-Id", "abc123")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("Mcp-Session-Id", "abc123"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).initialize(json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let c = JsonRpcClient::for_port(port, RpcTimeouts::default());
        let err = c.list_tools().await.unwrap_err();
        assert_eq!(err.error_kind(), "network");
    }

    #[test]
    fn sse_picks_matching_id() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\n\n";
        let msg = sse_message(body, 7).unwrap();
        assert_eq!(msg["result"]["ok"], true);
        assert!(sse_message("event: ping\n\n", 1).is_none());
    }
}
