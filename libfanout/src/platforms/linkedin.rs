//! LinkedIn platform implementation (v2 UGC posts)

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{
    check_response, format_hashtags, http_client, map_transport_error, source_name, truncate,
    Platform, PublishedPost,
};
use crate::config::{HttpConfig, LinkedInConfig};
use crate::error::{PlatformError, Result};
use crate::types::{PlatformKind, PostContent};

const API_BASE_URL: &str = "https://api.linkedin.com/v2";
pub const MAX_POST_LENGTH: usize = 3000;

pub struct LinkedInPlatform {
    client: reqwest::Client,
    access_token: String,
    author_urn: String,
}

impl LinkedInPlatform {
    pub fn new(config: &LinkedInConfig, http: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(http)?,
            access_token: config.access_token.clone(),
            author_urn: config.author_urn.clone(),
        })
    }

    fn payload(&self, text: &str) -> Value {
        json!({
            "author": self.author_urn,
            "lifecycleState": "PUBLISHED",
            "specificContent": {
                "com.linkedin.ugc.ShareContent": {
                    "shareCommentary": { "text": text },
                    "shareMediaCategory": "NONE",
                },
            },
            "visibility": {
                "com.linkedin.ugc.MemberNetworkVisibility": "PUBLIC",
            },
        })
    }
}

#[async_trait]
impl Platform for LinkedInPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Linkedin
    }

    /// A `w_member_social` token cannot read the profile, so the token is
    /// only checked for presence; a bad token surfaces on the first post.
    async fn authenticate(&self) -> Result<()> {
        if !self.is_configured() {
            return Err(PlatformError::NotConfigured(
                "linkedin access_token and author_urn are required".to_string(),
            )
            .into());
        }
        info!(author = %self.author_urn, "LinkedIn credentials present");
        Ok(())
    }

    async fn publish(&self, content: &PostContent) -> Result<PublishedPost> {
        let text = self.format_content(content);
        self.validate_content(&text)?;

        let response = self
            .client
            .post(format!("{}/ugcPosts", API_BASE_URL))
            .bearer_auth(&self.access_token)
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(&self.payload(&text))
            .send()
            .await
            .map_err(|e| map_transport_error(PlatformKind::Linkedin, e))?;
        let response = check_response(PlatformKind::Linkedin, response).await?;

        let post_id = response
            .headers()
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                PlatformError::Posting("LinkedIn response carried no post id".to_string())
            })?;

        Ok(PublishedPost {
            post_url: Some(format!("https://www.linkedin.com/feed/update/{}", post_id)),
            post_id,
        })
    }

    fn format_content(&self, content: &PostContent) -> String {
        let mut parts = Vec::new();

        if !content.title.is_empty() {
            parts.push(format!("📰 {}\n", content.title));
        }
        if !content.description.is_empty() {
            parts.push(content.description.clone());
        }
        if let Some(url) = &content.url {
            if let Some(source) = source_name(url) {
                parts.push(format!("\n\n📰 Source: {}", source));
            }
            parts.push(format!("🔗 Read the full article: {}", url));
        }
        if !content.hashtags.is_empty() {
            parts.push(format!("\n\n{}", format_hashtags(&content.hashtags, "#")));
        }
        parts.push("\n\nℹ️ Automatic summary - full credit to the original".to_string());

        truncate(&parts.join("\n"), MAX_POST_LENGTH, "...")
    }

    fn character_limit(&self) -> Option<usize> {
        Some(MAX_POST_LENGTH)
    }

    fn is_configured(&self) -> bool {
        !self.access_token.is_empty() && !self.author_urn.is_empty()
    }
}
