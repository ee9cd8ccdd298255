use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{Directory, MessageHistory};
use crate::crypto::EncryptedMessage;
use crate::error::{ChatError, ChatResult};

#[derive(Serialize)]
struct PublishKeyRequest<'a> {
    user_id: &'a str,
    public_key: &'a str,
}

#[derive(Deserialize)]
struct PublicKeyResponse {
    public_key: Option<String>,
}

#[derive(Deserialize)]
struct StoredMessage {
    from: String,
    ciphertext: String,
    timestamp: i64,
}

/// Key directory and message history served by the Infomundi web API
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: Url,
    access_token: Option<String>,
}

impl HttpDirectory {
    pub fn new(
        base_url: &str,
        access_token: Option<String>,
        timeout: Duration,
    ) -> ChatResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ChatError::Config(format!("Invalid API URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::Config(format!("API URL cannot be a base: {}", base_url)));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            access_token,
        })
    }

    /// Base URL with `segments` appended; each segment is percent-encoded
    fn endpoint(&self, segments: &[&str]) -> ChatResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Config("API URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn publish_public_key(&self, user_id: &str, public_jwk: &str) -> ChatResult<()> {
        let url = self.endpoint(&["api", "user", "public_key"])?;
        let response = self
            .authorize(self.client.post(url))
            .json(&PublishKeyRequest {
                user_id,
                public_key: public_jwk,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ChatError::Transport(format!(
                "Key publish rejected with {}",
                response.status()
            )));
        }

        tracing::info!(user_id, "Public key published to directory");
        Ok(())
    }

    async fn fetch_public_key(&self, user_id: &str) -> ChatResult<Option<String>> {
        let url = self.endpoint(&["api", "user", user_id, "public_key"])?;
        let response = self.authorize(self.client.get(url)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ChatError::Transport(format!(
                "Key lookup for {} failed with {}",
                user_id,
                response.status()
            )));
        }

        let body: PublicKeyResponse = response.json().await?;
        Ok(body.public_key.filter(|key| !key.is_empty()))
    }
}

#[async_trait]
impl MessageHistory for HttpDirectory {
    async fn fetch_messages(&self, peer_id: &str) -> ChatResult<Vec<EncryptedMessage>> {
        let url = self.endpoint(&["api", "chat", peer_id, "messages"])?;
        let response = self.authorize(self.client.get(url)).send().await?;

        if !response.status().is_success() {
            return Err(ChatError::Transport(format!(
                "History fetch for {} failed with {}",
                peer_id,
                response.status()
            )));
        }

        let messages: Vec<StoredMessage> = response.json().await?;
        tracing::debug!(peer_id, count = messages.len(), "Fetched message history");

        Ok(messages
            .into_iter()
            .map(|m| EncryptedMessage {
                ciphertext: m.ciphertext,
                sender: m.from,
                timestamp: m.timestamp,
            })
            .collect())
    }
}
