//! Telegram platform implementation (Bot API)

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use super::{
    check_response, escape_html, format_hashtags, http_client, map_transport_error, truncate,
    Platform, PublishedPost,
};
use crate::config::{HttpConfig, TelegramConfig};
use crate::error::{PlatformError, Result};
use crate::types::{PlatformKind, PostContent};

const API_BASE_URL: &str = "https://api.telegram.org";
pub const MAX_MESSAGE_LENGTH: usize = 4096;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
}

pub struct TelegramPlatform {
    client: reqwest::Client,
    bot_token: String,
    channel_id: String,
    authenticated: AtomicBool,
}

impl TelegramPlatform {
    pub fn new(config: &TelegramConfig, http: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(http)?,
            bot_token: config.bot_token.clone(),
            channel_id: config.channel_id.clone(),
            authenticated: AtomicBool::new(false),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", API_BASE_URL, self.bot_token, method)
    }

    /// Public link for a message; only `@username` channels have one
    fn message_url(&self, message_id: i64) -> Option<String> {
        self.channel_id
            .strip_prefix('@')
            .map(|channel| format!("https://t.me/{}/{}", channel, message_id))
    }
}

fn unwrap_api<T>(response: ApiResponse<T>, context: &str) -> std::result::Result<T, PlatformError> {
    match (response.ok, response.result) {
        (true, Some(result)) => Ok(result),
        _ => Err(PlatformError::Posting(format!(
            "Telegram {} failed: {}",
            context,
            response.description.unwrap_or_else(|| "unknown error".to_string())
        ))),
    }
}

#[async_trait]
impl Platform for TelegramPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Telegram
    }

    async fn authenticate(&self) -> Result<()> {
        if !self.is_configured() {
            return Err(PlatformError::NotConfigured(
                "telegram bot_token and channel_id are required".to_string(),
            )
            .into());
        }

        let response = self
            .client
            .get(self.method_url("getMe"))
            .send()
            .await
            .map_err(|e| map_transport_error(PlatformKind::Telegram, e))?;
        let response = check_response(PlatformKind::Telegram, response).await?;
        let body: ApiResponse<BotUser> = response
            .json()
            .await
            .map_err(|e| map_transport_error(PlatformKind::Telegram, e))?;
        let bot = unwrap_api(body, "getMe")
            .map_err(|e| PlatformError::Authentication(e.to_string()))?;

        self.authenticated.store(true, Ordering::SeqCst);
        info!(
            bot = bot.username.as_deref().unwrap_or("unknown"),
            "Telegram authenticated"
        );
        Ok(())
    }

    async fn publish(&self, content: &PostContent) -> Result<PublishedPost> {
        if !self.authenticated.load(Ordering::SeqCst) {
            self.authenticate().await?;
        }

        let text = self.format_content(content);
        self.validate_content(&text)?;

        let payload = json!({
            "chat_id": self.channel_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": false,
        });

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| map_transport_error(PlatformKind::Telegram, e))?;
        let response = check_response(PlatformKind::Telegram, response).await?;
        let body: ApiResponse<Message> = response
            .json()
            .await
            .map_err(|e| map_transport_error(PlatformKind::Telegram, e))?;
        let message = unwrap_api(body, "sendMessage")?;

        debug!(message_id = message.message_id, "Telegram message sent");
        Ok(PublishedPost {
            post_id: message.message_id.to_string(),
            post_url: self.message_url(message.message_id),
        })
    }

    fn format_content(&self, content: &PostContent) -> String {
        let mut parts = Vec::new();

        if !content.title.is_empty() {
            parts.push(format!("<b>📰 {}</b>\n", escape_html(&content.title)));
        }
        if !content.description.is_empty() {
            parts.push(format!("{}\n", escape_html(&content.description)));
        }
        if let Some(category) = &content.category {
            parts.push(format!("\n📂 <i>{}</i>", escape_html(category)));
        }
        if !content.hashtags.is_empty() {
            parts.push(format!("\n\n{}", format_hashtags(&content.hashtags, "#")));
        }
        if let Some(url) = &content.url {
            parts.push(format!("\n\n🔗 <a href='{}'>Read more</a>", escape_html(url)));
        }

        truncate(&parts.join("\n"), MAX_MESSAGE_LENGTH, "\n\n[truncated]")
    }

    fn character_limit(&self) -> Option<usize> {
        Some(MAX_MESSAGE_LENGTH)
    }

    fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.channel_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(channel_id: &str) -> TelegramPlatform {
        TelegramPlatform::new(
            &TelegramConfig {
                enabled: true,
                bot_token: "123:abc".to_string(),
                channel_id: channel_id.to_string(),
            },
            &HttpConfig::default(),
        )
        .unwrap()
    }

    fn content() -> PostContent {
        PostContent {
            title: "Rust <2024> edition".to_string(),
            description: "Async closures & more".to_string(),
            url: Some("https://blog.rust-lang.org/2025/02/20".to_string()),
            hashtags: vec!["rust".to_string(), "#release".to_string()],
            category: Some("Languages".to_string()),
        }
    }

    #[test]
    fn test_format_content_escapes_html() {
        let text = platform("@news").format_content(&content());

        assert!(text.starts_with("<b>📰 Rust &lt;2024&gt; edition</b>"));
        assert!(text.contains("Async closures &amp; more"));
        assert!(text.contains("<i>Languages</i>"));
        assert!(text.contains("#rust #release"));
        assert!(text.contains("<a href='https://blog.rust-lang.org/2025/02/20'>Read more</a>"));
    }

    #[test]
    fn test_format_content_respects_limit() {
        let mut long = content();
        long.description = "x".repeat(10_000);
        let platform = platform("@news");

        let text = platform.format_content(&long);
        assert_eq!(text.chars().count(), MAX_MESSAGE_LENGTH);
        assert!(platform.validate_content(&text).is_ok());
    }

    #[test]
    fn test_message_url_only_for_public_channels() {
        assert_eq!(
            platform("@news").message_url(42).as_deref(),
            Some("https://t.me/news/42")
        );
        assert_eq!(platform("-100123456789").message_url(42), None);
    }

    #[test]
    fn test_unwrap_api_error_description() {
        let response: ApiResponse<Message> = serde_json::from_str(
            r#"{"ok":false,"description":"Bad Request: chat not found"}"#,
        )
        .unwrap();
        let err = unwrap_api(response, "sendMessage").unwrap_err();
        assert!(err.to_string().contains("chat not found"));
    }

    #[tokio::test]
    async fn test_unconfigured_authenticate_fails() {
        let platform = platform("");
        assert!(!platform.is_configured());
        assert!(platform.authenticate().await.is_err());
    }
}
