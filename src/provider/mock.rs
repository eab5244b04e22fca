use std::sync::Mutex;

use async_trait::async_trait;

use super::{ProviderClient, SendRequest, SendResult};

/// A scripted `ProviderClient` for tests: each call to `send` pops the
/// next result off a queue. Also records every request it was called
/// with, so tests can assert on provider-call counts (P5: retry bound).
pub struct MockProviderClient {
    script: Mutex<Vec<SendResult>>,
    requests: Mutex<Vec<SendRequest>>,
}

impl MockProviderClient {
    /// Responses are returned in the given order; a recipient exhausting
    /// the script receives `Accepted` with a generated id.
    pub fn new(script: Vec<SendResult>) -> Self {
        Self {
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always_accept() -> Self {
        Self::new(Vec::new())
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    async fn send(&self, request: SendRequest) -> SendResult {
        self.requests.lock().unwrap().push(request);

        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            let n = self.requests.lock().unwrap().len();
            return SendResult::Accepted {
                provider_message_id: format!("mock_msg_{n}"),
                http_status: 202,
            };
        }
        script.remove(0)
    }
}
