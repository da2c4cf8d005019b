//! Twitter/X platform implementation (API v2, OAuth 2.0 user token)

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use super::{
    check_response, format_hashtags, http_client, map_transport_error, truncate, Platform,
    PublishedPost,
};
use crate::config::{HttpConfig, TwitterConfig};
use crate::error::{PlatformError, Result};
use crate::types::{PlatformKind, PostContent};

const API_BASE_URL: &str = "https://api.twitter.com/2";
pub const MAX_TWEET_LENGTH: usize = 280;
const MAX_HASHTAGS: usize = 3;

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct User {
    username: String,
}

#[derive(Debug, Deserialize)]
struct Tweet {
    id: String,
}

pub struct TwitterPlatform {
    client: reqwest::Client,
    access_token: String,
    authenticated: AtomicBool,
}

impl TwitterPlatform {
    pub fn new(config: &TwitterConfig, http: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(http)?,
            access_token: config.access_token.clone(),
            authenticated: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Platform for TwitterPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Twitter
    }

    async fn authenticate(&self) -> Result<()> {
        if !self.is_configured() {
            return Err(
                PlatformError::NotConfigured("twitter access_token is required".to_string()).into(),
            );
        }

        let response = self
            .client
            .get(format!("{}/users/me", API_BASE_URL))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| map_transport_error(PlatformKind::Twitter, e))?;
        let response = check_response(PlatformKind::Twitter, response).await?;
        let user: DataEnvelope<User> = response
            .json()
            .await
            .map_err(|e| map_transport_error(PlatformKind::Twitter, e))?;

        self.authenticated.store(true, Ordering::SeqCst);
        info!(username = %user.data.username, "Twitter authenticated");
        Ok(())
    }

    async fn publish(&self, content: &PostContent) -> Result<PublishedPost> {
        if !self.authenticated.load(Ordering::SeqCst) {
            self.authenticate().await?;
        }

        let text = self.format_content(content);
        self.validate_content(&text)?;

        let response = self
            .client
            .post(format!("{}/tweets", API_BASE_URL))
            .bearer_auth(&self.access_token)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| map_transport_error(PlatformKind::Twitter, e))?;
        let response = check_response(PlatformKind::Twitter, response).await?;
        let tweet: DataEnvelope<Tweet> = response
            .json()
            .await
            .map_err(|e| map_transport_error(PlatformKind::Twitter, e))?;

        Ok(PublishedPost {
            post_url: Some(format!("https://twitter.com/i/web/status/{}", tweet.data.id)),
            post_id: tweet.data.id,
        })
    }

    fn format_content(&self, content: &PostContent) -> String {
        let hashtags: Vec<String> = content.hashtags.iter().take(MAX_HASHTAGS).cloned().collect();

        let url_part = content
            .url
            .as_ref()
            .map(|url| format!(" {}", url))
            .unwrap_or_default();
        let hashtags_part = if hashtags.is_empty() {
            String::new()
        } else {
            format!(" {}", format_hashtags(&hashtags, "#"))
        };

        let reserved = url_part.chars().count() + hashtags_part.chars().count();
        let available = MAX_TWEET_LENGTH.saturating_sub(reserved + 5);
        let main_text = truncate(&content.description, available, "...");

        truncate(
            &format!("{}{}{}", main_text, url_part, hashtags_part),
            MAX_TWEET_LENGTH,
            "...",
        )
    }

    fn character_limit(&self) -> Option<usize> {
        Some(MAX_TWEET_LENGTH)
    }

    fn is_configured(&self) -> bool {
        !self.access_token.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(token: &str) -> TwitterPlatform {
        TwitterPlatform::new(
            &TwitterConfig {
                enabled: true,
                access_token: token.to_string(),
            },
            &HttpConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_format_content_layout() {
        let content = PostContent {
            title: "Title".to_string(),
            description: "Tokio 2.0 released".to_string(),
            url: Some("https://tokio.rs/blog".to_string()),
            hashtags: vec!["rust".into(), "async".into()],
            category: None,
        };
        assert_eq!(
            platform("t").format_content(&content),
            "Tokio 2.0 released https://tokio.rs/blog #rust #async"
        );
    }

    #[test]
    fn test_long_description_keeps_url_and_tags() {
        let content = PostContent {
            title: String::new(),
            description: "a".repeat(600),
            url: Some("https://example.com/article".to_string()),
            hashtags: vec!["news".into()],
            category: None,
        };
        let text = platform("t").format_content(&content);

        assert!(text.chars().count() <= MAX_TWEET_LENGTH);
        assert!(text.ends_with(" https://example.com/article #news"));
        assert!(text.contains("..."));
    }

    #[test]
    fn test_tweet_response_parses() {
        let tweet: DataEnvelope<Tweet> =
            serde_json::from_str(r#"{"data":{"id":"1790","text":"hello"}}"#).unwrap();
        assert_eq!(tweet.data.id, "1790");
    }

    #[test]
    fn test_configuration_requires_token() {
        assert!(platform("token").is_configured());
        assert!(!platform("").is_configured());
    }
}
