//! Bluesky platform implementation (AT Protocol XRPC)

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    check_response, format_hashtags, http_client, map_transport_error, source_name, truncate,
    Platform, PublishedPost,
};
use crate::config::{BlueskyConfig, HttpConfig};
use crate::error::{FanoutError, PlatformError, Result};
use crate::types::{now_millis, PlatformKind, PostContent};

pub const MAX_POST_LENGTH: usize = 300;
const MAX_HASHTAGS: usize = 3;
const FOOTER: &str = "\n\nℹ️ Automatic summary - full credit to the original";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
    did: String,
}

#[derive(Debug, Deserialize)]
struct CreatedRecord {
    uri: String,
}

pub struct BlueskyPlatform {
    client: reqwest::Client,
    service: String,
    handle: String,
    app_password: String,
    session: Mutex<Option<Session>>,
}

impl BlueskyPlatform {
    pub fn new(config: &BlueskyConfig, http: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(http)?,
            service: config.service.trim_end_matches('/').to_string(),
            handle: config.handle.clone(),
            app_password: config.app_password.clone(),
            session: Mutex::new(None),
        })
    }

    fn xrpc_url(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.service, method)
    }

    async fn create_session(&self) -> Result<Session> {
        debug!(handle = %self.handle, "Creating Bluesky session");

        let response = self
            .client
            .post(self.xrpc_url("com.atproto.server.createSession"))
            .json(&json!({
                "identifier": self.handle,
                "password": self.app_password,
            }))
            .send()
            .await
            .map_err(|e| map_transport_error(PlatformKind::Bluesky, e))?;

        // createSession answers 401 for bad credentials, 400 for unknown accounts
        let response = check_response(PlatformKind::Bluesky, response)
            .await
            .map_err(|e| match e {
                PlatformError::Validation(msg) => PlatformError::Authentication(msg),
                other => other,
            })?;

        let session: Session = response
            .json()
            .await
            .map_err(|e| map_transport_error(PlatformKind::Bluesky, e))?;
        Ok(session)
    }

    async fn current_session(&self) -> Result<Session> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.create_session().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn create_record(&self, session: &Session, text: &str) -> Result<CreatedRecord> {
        let created_at = now_millis().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let payload = json!({
            "repo": session.did,
            "collection": "app.bsky.feed.post",
            "record": {
                "$type": "app.bsky.feed.post",
                "text": text,
                "createdAt": created_at,
            },
        });

        let response = self
            .client
            .post(self.xrpc_url("com.atproto.repo.createRecord"))
            .bearer_auth(&session.access_jwt)
            .json(&payload)
            .send()
            .await
            .map_err(|e| map_transport_error(PlatformKind::Bluesky, e))?;
        let response = check_response(PlatformKind::Bluesky, response).await?;
        let record = response
            .json()
            .await
            .map_err(|e| map_transport_error(PlatformKind::Bluesky, e))?;
        Ok(record)
    }

    fn post_url(&self, uri: &str) -> String {
        let rkey = uri.rsplit('/').next().unwrap_or(uri);
        format!("https://bsky.app/profile/{}/post/{}", self.handle, rkey)
    }
}

#[async_trait]
impl Platform for BlueskyPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Bluesky
    }

    async fn authenticate(&self) -> Result<()> {
        if !self.is_configured() {
            return Err(PlatformError::NotConfigured(
                "bluesky handle and app_password are required".to_string(),
            )
            .into());
        }
        let session = self.create_session().await?;
        info!(handle = %self.handle, did = %session.did, "Bluesky authenticated");
        *self.session.lock().await = Some(session);
        Ok(())
    }

    async fn publish(&self, content: &PostContent) -> Result<PublishedPost> {
        let text = self.format_content(content);
        self.validate_content(&text)?;

        let session = self.current_session().await?;
        let record = match self.create_record(&session, &text).await {
            // access tokens are short lived; refresh once and try again
            Err(FanoutError::Platform(PlatformError::Authentication(_))) => {
                debug!("Bluesky session rejected, creating a new one");
                *self.session.lock().await = None;
                let session = self.current_session().await?;
                self.create_record(&session, &text).await?
            }
            other => other?,
        };

        Ok(PublishedPost {
            post_url: Some(self.post_url(&record.uri)),
            post_id: record.uri,
        })
    }

    fn format_content(&self, content: &PostContent) -> String {
        let hashtags: Vec<String> = content.hashtags.iter().take(MAX_HASHTAGS).cloned().collect();

        let source_part = content
            .url
            .as_deref()
            .and_then(source_name)
            .map(|name| format!("\n📰 Via: {}", name))
            .unwrap_or_default();
        let url_part = content
            .url
            .as_ref()
            .map(|url| format!("\n🔗 {}", url))
            .unwrap_or_default();
        let hashtags_part = if hashtags.is_empty() {
            String::new()
        } else {
            format!("\n{}", format_hashtags(&hashtags, "#"))
        };

        let reserved = [&source_part, &url_part, &hashtags_part]
            .iter()
            .map(|s| s.chars().count())
            .sum::<usize>()
            + FOOTER.chars().count();
        let available = MAX_POST_LENGTH.saturating_sub(reserved + 10);
        let main_text = truncate(&content.description, available, "...");

        let post = format!(
            "{}{}{}{}{}",
            main_text, source_part, url_part, hashtags_part, FOOTER
        );
        truncate(&post, MAX_POST_LENGTH, "...")
    }

    fn character_limit(&self) -> Option<usize> {
        Some(MAX_POST_LENGTH)
    }

    fn is_configured(&self) -> bool {
        !self.handle.is_empty() && !self.app_password.is_empty()
    }
}
