//! A deterministic in-process client for tests: replays a fixed list of
//! responses and records every request it receives.

use parking_lot::Mutex;
use std::collections::VecDeque;

use wl_domain::{Error, Result};

use crate::{GenerateRequest, LlmClient, LlmResponse};

pub struct ScriptedClient {
    steps: Mutex<VecDeque<LlmResponse>>,
    requests: Mutex<Vec<GenerateRequest>>,
    /// Error message to return once the script is exhausted; `None`
    /// repeats an empty text response instead.
    exhausted_error: Option<String>,
}

impl ScriptedClient {
    pub fn new(steps: Vec<LlmResponse>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            exhausted_error: Some("scripted client exhausted".into()),
        }
    }

    /// Exhaustion yields `LlmResponse::text_only("Done.")` instead of an
    /// error — useful for loop-limit tests.
    pub fn looping(steps: Vec<LlmResponse>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            exhausted_error: None,
        }
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining_steps(&self) -> usize {
        self.steps.lock().len()
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedClient {
    async fn generate(&self, req: GenerateRequest) -> Result<LlmResponse> {
        self.requests.lock().push(req);
        match self.steps.lock().pop_front() {
            Some(step) => Ok(step),
            None => match &self.exhausted_error {
                Some(message) => Err(Error::llm(message.clone())),
                None => Ok(LlmResponse::text_only("Done.")),
            },
        }
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

/// A client that fails a fixed number of times before delegating to a
/// script — used to exercise retry paths.
pub struct FlakyClient {
    failures_left: Mutex<usize>,
    error_message: String,
    inner: ScriptedClient,
}

impl FlakyClient {
    pub fn new(failures: usize, error_message: impl Into<String>, steps: Vec<LlmResponse>) -> Self {
        Self {
            failures_left: Mutex::new(failures),
            error_message: error_message.into(),
            inner: ScriptedClient::new(steps),
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for FlakyClient {
    async fn generate(&self, req: GenerateRequest) -> Result<LlmResponse> {
        {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(Error::llm(self.error_message.clone()));
            }
        }
        self.inner.generate(req).await
    }

    fn provider_id(&self) -> &str {
        "flaky"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_steps_in_order_then_errors() {
        let client = ScriptedClient::new(vec![
            LlmResponse::text_only("one"),
            LlmResponse::with_tool_call("call_1", "run_sql", serde_json::json!({"sql": "SELECT 1"})),
        ]);

        let first = client.generate(GenerateRequest::default()).await.unwrap();
        assert_eq!(first.text, "one");
        let second = client.generate(GenerateRequest::default()).await.unwrap();
        assert_eq!(second.tool_calls[0].tool_name, "run_sql");
        assert!(client.generate(GenerateRequest::default()).await.is_err());
        assert_eq!(client.requests().len(), 3);
    }

    #[tokio::test]
    async fn flaky_client_recovers_after_failures() {
        let client = FlakyClient::new(2, "429 rate limited", vec![LlmResponse::text_only("ok")]);
        assert!(client.generate(GenerateRequest::default()).await.is_err());
        assert!(client.generate(GenerateRequest::default()).await.is_err());
        let response = client.generate(GenerateRequest::default()).await.unwrap();
        assert_eq!(response.text, "ok");
    }
}
