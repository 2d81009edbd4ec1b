use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::api::{ApiRequest, ApiResponse, ApiTransport, HttpMethod, TransportError};

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: HttpMethod,
    pub path: String,
    pub body: Option<Value>,
    pub bearer_token: Option<String>,
}

type Reply = Result<ApiResponse, TransportError>;

/// Transport double keyed by request path. One-shot replies are consumed in
/// order; the sticky reply answers once they run out.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    sticky: Mutex<HashMap<String, Reply>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn respond(&self, path: &str, reply: Reply) {
        self.queued
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn respond_always(&self, path: &str, reply: Reply) {
        self.sticky.lock().unwrap().insert(path.to_string(), reply);
    }

    pub fn delay(&self, path: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(path.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.path == path)
            .count()
    }
}

#[async_trait]
impl ApiTransport for ScriptedTransport {
    async fn request(
        &self,
        request: &ApiRequest,
        bearer_token: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method,
            path: request.path.clone(),
            body: request.body.clone(),
            bearer_token: bearer_token.map(ToString::to_string),
        });

        let delay = self.delays.lock().unwrap().get(&request.path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&request.path)
            .and_then(VecDeque::pop_front);
        if let Some(reply) = queued {
            return reply;
        }
        self.sticky
            .lock()
            .unwrap()
            .get(&request.path)
            .cloned()
            .unwrap_or_else(|| {
                Err(TransportError::Request {
                    message: format!("no scripted reply for {}", request.path),
                })
            })
    }
}

pub(crate) fn token_grant(token: &str, expires_at: DateTime<Utc>) -> Value {
    json!({
        "token": token,
        "tokenExpirationDate": expires_at.to_rfc3339(),
    })
}
