//! Aeris forecast client: an on-demand client-credentials OAuth2 fetch,
//! not a ticking uploader (spec.md §4.6's table note).

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

const DEFAULT_ENDPOINT: &str = "https://api.aerisapi.com";
const TOKEN_PATH: &str = "/oauth2/token";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct AerisClient {
    http: Client,
    endpoint: String,
    client_id: String,
    client_secret: String,
}

impl AerisClient {
    pub fn new(client_id: String, client_secret: String, endpoint: Option<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            client_id,
            client_secret,
        }
    }

    async fn access_token(&self) -> Result<String, String> {
        let response = self
            .http
            .post(format!("{}{TOKEN_PATH}", self.endpoint))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?
            .json::<TokenResponse>()
            .await
            .map_err(|e| e.to_string())?;
        Ok(response.access_token)
    }

    /// Fetches the current forecast for `station_id`. Called on demand
    /// by whatever surface needs it; the engine does not poll this
    /// itself.
    pub async fn forecast(&self, station_id: &str) -> Result<serde_json::Value, String> {
        let token = self.access_token().await?;
        self.http
            .get(format!("{}/forecasts/{station_id}", self.endpoint))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?
            .json::<serde_json::Value>()
            .await
            .map_err(|e| e.to_string())
    }
}
