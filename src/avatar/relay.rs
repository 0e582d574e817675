use super::AvatarError;
use crate::config::ApiConfig;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// Short-lived TURN relay credentials for the avatar peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[async_trait::async_trait]
pub trait RelayTokenSource: Send + Sync {
    async fn fetch_relay_credentials(&self) -> Result<IceServer, AvatarError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RelayTokenResponse {
    urls: Vec<String>,
    username: String,
    password: String,
}

impl RelayTokenResponse {
    fn into_ice_server(self) -> Result<IceServer, AvatarError> {
        let url = self
            .urls
            .into_iter()
            .next()
            .ok_or_else(|| AvatarError::Provisioning("relay token carried no URLs".to_string()))?;
        Ok(IceServer {
            urls: vec![url],
            username: self.username,
            credential: self.password,
        })
    }
}

/// Fetches relay credentials from the regional avatar token endpoint.
pub struct AzureRelayTokenSource {
    client: Client,
    url: String,
    key: SecretString,
}

impl AzureRelayTokenSource {
    pub fn new(api: &ApiConfig) -> Self {
        Self {
            client: Client::new(),
            url: format!(
                "https://{}.tts.speech.microsoft.com/cognitiveservices/avatar/relay/token/v1",
                api.speech_region
            ),
            key: SecretString::from(api.speech_key().to_string()),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait::async_trait]
impl RelayTokenSource for AzureRelayTokenSource {
    async fn fetch_relay_credentials(&self) -> Result<IceServer, AvatarError> {
        log::debug!("Fetching avatar relay token");
        let response = self
            .client
            .get(&self.url)
            .header("Ocp-Apim-Subscription-Key", self.key.expose_secret())
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(AvatarError::Provisioning(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let token: RelayTokenResponse = response
            .json()
            .await
            .map_err(|e| AvatarError::Provisioning(format!("invalid relay token: {}", e)))?;
        token.into_ice_server()
    }
}
