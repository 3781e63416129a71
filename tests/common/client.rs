//! HTTP client for end-to-end tests
//!
//! Wraps reqwest with one method per scheduler endpoint.
//! When API routes or request formats change, update only this file.

use super::constants::*;
use reqwest::Response;
use serde_json::json;
use std::time::Duration;

pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    // ========================================================================
    // Aggregation Endpoint
    // ========================================================================

    /// POST /aggregate for an application, optionally scoped to a template
    pub async fn aggregate(&self, application_id: &str, template_id: Option<&str>) -> Response {
        let body = match template_id {
            Some(template_id) => json!({
                "applicationID": application_id,
                "applicationTemplateID": template_id,
            }),
            None => json!({ "applicationID": application_id }),
        };
        self.client
            .post(format!("{}/aggregate", self.base_url))
            .json(&body)
            .send()
            .await
            .expect("Aggregate request failed")
    }

    /// POST /aggregate with an arbitrary JSON body
    /// POST /aggregate for a template on its own
    pub async fn aggregate_template(&self, template_id: &str) -> Response {
        self.client
            .post(format!("{}/aggregate", self.base_url))
            .json(&json!({ "applicationTemplateID": template_id }))
            .send()
            .await
            .expect("Aggregate request failed")
    }

    pub async fn aggregate_raw(&self, body: &str) -> Response {
        self.client
            .post(format!("{}/aggregate", self.base_url))
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .expect("Aggregate request failed")
    }

    // ========================================================================
    // Health Endpoints
    // ========================================================================

    pub async fn healthz(&self) -> Response {
        self.client
            .get(format!("{}/healthz", self.base_url))
            .send()
            .await
            .expect("Healthz request failed")
    }

    pub async fn readyz(&self) -> Response {
        self.client
            .get(format!("{}/readyz", self.base_url))
            .send()
            .await
            .expect("Readyz request failed")
    }

    /// GET / (uptime and build hash)
    pub async fn get_status(&self) -> Response {
        self.client
            .get(format!("{}/", self.base_url))
            .send()
            .await
            .expect("Status request failed")
    }
}
