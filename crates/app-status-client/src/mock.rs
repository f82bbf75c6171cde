//! Mock AppStatusApi for unit testing
//!
//! This module provides a scripted implementation of `AppStatusApi` so the
//! token manager, publisher and controller reconciler can be tested without a
//! running API server. Replies are consumed in FIFO order; when a queue is
//! empty the mock answers with a fresh token or `200 {}`.

use crate::error::ClientError;
use crate::models::{ApiResponse, Credentials, StatusUpdateRequest};
use crate::status_api::AppStatusApi;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Scripted reply of the token endpoint
#[derive(Debug, Clone)]
pub enum TokenReply {
    /// Issue this token
    Token(String),
    /// Reject the credentials
    Rejected,
    /// Fail at the transport level
    Unavailable,
}

/// Scripted reply of the app-status endpoint
#[derive(Debug, Clone)]
pub enum StatusReply {
    /// Answer with this status code and body
    Response(u16, String),
    /// Fail at the transport level
    NetworkError,
}

/// Mock AppStatusApi for testing
#[derive(Debug, Clone)]
pub struct MockAppStatusApi {
    base_url: String,
    ping_ok: Arc<Mutex<bool>>,
    token_replies: Arc<Mutex<VecDeque<TokenReply>>>,
    status_replies: Arc<Mutex<VecDeque<StatusReply>>>,
    auth_calls: Arc<Mutex<u32>>,
    sent: Arc<Mutex<Vec<(String, StatusUpdateRequest)>>>,
}

impl MockAppStatusApi {
    /// Create a new mock client that accepts everything
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ping_ok: Arc::new(Mutex::new(true)),
            token_replies: Arc::new(Mutex::new(VecDeque::new())),
            status_replies: Arc::new(Mutex::new(VecDeque::new())),
            auth_calls: Arc::new(Mutex::new(0)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Control the result of `ping`
    pub fn set_ping(&self, ok: bool) {
        *self.ping_ok.lock().unwrap() = ok;
    }

    /// Queue a token endpoint reply (for test setup)
    pub fn push_token_reply(&self, reply: TokenReply) {
        self.token_replies.lock().unwrap().push_back(reply);
    }

    /// Queue an app-status endpoint reply (for test setup)
    pub fn push_status_reply(&self, reply: StatusReply) {
        self.status_replies.lock().unwrap().push_back(reply);
    }

    /// Number of token requests made so far
    pub fn auth_calls(&self) -> u32 {
        *self.auth_calls.lock().unwrap()
    }

    /// Every status update sent, in order
    pub fn sent_requests(&self) -> Vec<StatusUpdateRequest> {
        self.sent.lock().unwrap().iter().map(|(_, req)| req.clone()).collect()
    }

    /// Token used for each status update, in order
    pub fn sent_tokens(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(token, _)| token.clone()).collect()
    }

    /// `(app_instance_id, status)` pairs sent, in order
    pub fn sent_statuses(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, req)| (req.app_instance_id.clone(), req.status.to_string()))
            .collect()
    }
}

#[async_trait::async_trait]
impl AppStatusApi for MockAppStatusApi {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn ping(&self) -> Result<bool, ClientError> {
        Ok(*self.ping_ok.lock().unwrap())
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<String, ClientError> {
        let call = {
            let mut calls = self.auth_calls.lock().unwrap();
            *calls += 1;
            *calls
        };

        match self.token_replies.lock().unwrap().pop_front() {
            Some(TokenReply::Token(token)) => Ok(token),
            Some(TokenReply::Rejected) => Err(ClientError::Authentication(
                "token endpoint rejected credentials: 400".to_string(),
            )),
            Some(TokenReply::Unavailable) => {
                Err(ClientError::Unavailable("connection refused".to_string()))
            }
            None => Ok(format!("mock-token-{}", call)),
        }
    }

    async fn send_status(
        &self,
        token: &str,
        request: &StatusUpdateRequest,
    ) -> Result<ApiResponse, ClientError> {
        self.sent
            .lock()
            .unwrap()
            .push((token.to_string(), request.clone()));

        match self.status_replies.lock().unwrap().pop_front() {
            Some(StatusReply::Response(status, body)) => Ok(ApiResponse::new(status, body)),
            Some(StatusReply::NetworkError) => {
                Err(ClientError::Unavailable("connection reset by peer".to_string()))
            }
            None => Ok(ApiResponse::new(200, "{}")),
        }
    }
}
