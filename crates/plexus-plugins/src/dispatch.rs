use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use plexus_core::{TransportError, WorkerDispatch};

use crate::supervisor::PluginProcess;

/// Forwards job operations to one worker plugin's own endpoint.
pub struct DispatchAdapter {
    process: Arc<dyn PluginProcess>,
    timeout: Duration,
}

impl DispatchAdapter {
    pub fn new(process: Arc<dyn PluginProcess>, timeout: Duration) -> Self {
        Self { process, timeout }
    }

    pub fn endpoint(&self) -> &str {
        self.process.endpoint()
    }

    async fn job_call(&self, method: &str, job_id: &str) -> Result<Value, TransportError> {
        self.process
            .request(method, json!({ "jobId": job_id }), self.timeout)
            .await
    }
}

#[async_trait]
impl WorkerDispatch for DispatchAdapter {
    fn plugin(&self) -> &str {
        self.process.name()
    }

    async fn dispatch(&self, job: Value) -> Result<Value, TransportError> {
        self.process.request("jobs/dispatch", job, self.timeout).await
    }

    async fn list(&self) -> Result<Value, TransportError> {
        self.process.request("jobs/list", json!({}), self.timeout).await
    }

    async fn status(&self, job_id: &str) -> Result<Value, TransportError> {
        self.job_call("jobs/status", job_id).await
    }

    async fn result(&self, job_id: &str) -> Result<Value, TransportError> {
        self.job_call("jobs/result", job_id).await
    }

    async fn cancel(&self, job_id: &str) -> Result<Value, TransportError> {
        self.job_call("jobs/cancel", job_id).await
    }

    async fn delete(&self, job_id: &str) -> Result<Value, TransportError> {
        self.job_call("jobs/delete", job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProcess;

    #[tokio::test]
    async fn forwards_job_methods() {
        let process = Arc::new(MockProcess::new("jobs", 50_004, vec![]));
        let adapter = DispatchAdapter::new(process.clone(), Duration::from_secs(1));
        assert_eq!(adapter.plugin(), "jobs");
        assert_eq!(adapter.endpoint(), "http://127.0.0.1:50004/mcp");

        adapter.dispatch(json!({"kind": "render"})).await.unwrap();
        adapter.list().await.unwrap();
        adapter.status("j-1").await.unwrap();
        adapter.result("j-1").await.unwrap();
        adapter.cancel("j-1").await.unwrap();
        adapter.delete("j-1").await.unwrap();

        let calls = process.requests();
        let methods: Vec<&str> = calls.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(
            methods,
            vec!["jobs/dispatch", "jobs/list", "jobs/status", "jobs/result", "jobs/cancel", "jobs/delete"]
        );
        assert_eq!(calls[0].1, json!({"kind": "render"}));
        assert_eq!(calls[2].1, json!({"jobId": "j-1"}));
    }
}
