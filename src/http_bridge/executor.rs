use crate::http_bridge::wire::{response_body, HttpCallRequest, HttpCallResponse};
use crate::http_bridge::BridgeError;
use reqwest::redirect::Policy;
use reqwest::Client;
use std::time::Duration;

/// Performs the downstream HTTP calls. Redirects are never followed so the
/// 3xx reply itself is reported.
#[derive(Clone)]
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    pub fn new(timeout: Duration) -> Result<Self, BridgeError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    pub async fn execute(&self, request: &HttpCallRequest) -> Result<HttpCallResponse, BridgeError> {
        let builder = if request.sends_body() {
            self.client
                .request(request.method.clone(), request.url.clone())
                .json(&request.body)
        } else {
            self.client
                .request(request.method.clone(), request.url_with_query())
        };

        let response = builder
            .send()
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;

        Ok(HttpCallResponse {
            id: request.id.clone(),
            status,
            body: response_body(status, &bytes),
        })
    }
}
