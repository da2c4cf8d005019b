//! Platform abstraction and implementations
//!
//! Each adapter formats a [`PostContent`] for its destination, publishes it
//! and classifies failures into [`PlatformError`] so the dispatcher can tell
//! transient problems (retried) from permanent ones.
//!
//! # Examples
//!
//! ```no_run
//! use libfanout::platforms::{Platform, telegram::TelegramPlatform};
//! use libfanout::config::{HttpConfig, TelegramConfig};
//! use libfanout::types::ContentItem;
//!
//! # async fn example() -> libfanout::error::Result<()> {
//! let config = TelegramConfig {
//!     enabled: true,
//!     bot_token: "123:abc".to_string(),
//!     channel_id: "@fanout_news".to_string(),
//! };
//! let platform = TelegramPlatform::new(&config, &HttpConfig::default())?;
//!
//! if platform.is_configured() {
//!     platform.authenticate().await?;
//!     let item = ContentItem::new("1", "Title", "Summary").with_url("https://example.com/a");
//!     let published = platform.publish(&item.post_content()).await?;
//!     println!("Published: {:?}", published.post_url);
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{Config, HttpConfig};
use crate::error::{PlatformError, Result};
use crate::types::{PlatformKind, PostContent};

pub mod bluesky;
pub mod linkedin;
pub mod telegram;
pub mod twitter;

// Mock platform is available for all builds (not just tests) to support integration tests
pub mod mock;

/// Identifier and public link of a published post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPost {
    pub post_id: String,
    pub post_url: Option<String>,
}

/// Platform trait for unified social media platform interactions
///
/// Adapters are shared between the worker and direct callers, so every
/// method takes `&self`; session state lives behind interior mutability.
#[async_trait]
pub trait Platform: Send + Sync {
    fn kind(&self) -> PlatformKind;

    /// Lowercase platform identifier used in logs
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Verify credentials with the platform
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Authentication` when the credentials are
    /// rejected and `PlatformError::Network` when the platform is unreachable.
    async fn authenticate(&self) -> Result<()>;

    /// Publish content and return the platform's post identifier
    ///
    /// Adapters authenticate lazily if needed. Failures are classified:
    /// - `Network`, `RateLimit`, `Posting` are transient
    /// - `Authentication`, `Validation` are permanent
    async fn publish(&self, content: &PostContent) -> Result<PublishedPost>;

    /// Render the text that would be posted
    fn format_content(&self, content: &PostContent) -> String;

    /// Check formatted text against the platform's rules
    fn validate_content(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(PlatformError::Validation("Content cannot be empty".to_string()).into());
        }
        if let Some(limit) = self.character_limit() {
            let length = text.chars().count();
            if length > limit {
                return Err(PlatformError::Validation(format!(
                    "Content exceeds {} character limit (got {} characters)",
                    limit, length
                ))
                .into());
            }
        }
        Ok(())
    }

    fn character_limit(&self) -> Option<usize>;

    /// Whether the credentials needed to publish are present
    fn is_configured(&self) -> bool;
}

/// Lookup table from platform to adapter
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    adapters: BTreeMap<PlatformKind, Arc<dyn Platform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind, replacing any previous one
    pub fn register(&mut self, platform: Arc<dyn Platform>) {
        self.adapters.insert(platform.kind(), platform);
    }

    pub fn with(mut self, platform: impl Platform + 'static) -> Self {
        self.register(Arc::new(platform));
        self
    }

    pub fn get(&self, kind: PlatformKind) -> Option<Arc<dyn Platform>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<PlatformKind> {
        self.adapters.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Build and authenticate adapters for every enabled platform
///
/// A platform that fails to construct or authenticate is logged and left
/// out; its selected items then fail with `NotConfigured`.
pub async fn create_platforms(config: &Config) -> Result<PlatformRegistry> {
    let mut candidates: Vec<Arc<dyn Platform>> = Vec::new();

    if let Some(telegram) = config.telegram.as_ref().filter(|c| c.enabled) {
        info!("Creating Telegram platform client");
        candidates.push(Arc::new(telegram::TelegramPlatform::new(telegram, &config.http)?));
    }
    if let Some(bluesky) = config.bluesky.as_ref().filter(|c| c.enabled) {
        info!("Creating Bluesky platform client");
        candidates.push(Arc::new(bluesky::BlueskyPlatform::new(bluesky, &config.http)?));
    }
    if let Some(twitter) = config.twitter.as_ref().filter(|c| c.enabled) {
        info!("Creating Twitter platform client");
        candidates.push(Arc::new(twitter::TwitterPlatform::new(twitter, &config.http)?));
    }
    if let Some(linkedin) = config.linkedin.as_ref().filter(|c| c.enabled) {
        info!("Creating LinkedIn platform client");
        candidates.push(Arc::new(linkedin::LinkedInPlatform::new(linkedin, &config.http)?));
    }

    let mut registry = PlatformRegistry::new();
    for platform in candidates {
        if !platform.is_configured() {
            warn!(platform = platform.name(), "Platform enabled but missing credentials, skipping");
            continue;
        }
        match platform.authenticate().await {
            Ok(()) => registry.register(platform),
            Err(e) => warn!(platform = platform.name(), error = %e, "Authentication failed, skipping platform"),
        }
    }

    info!(platforms = ?registry.kinds(), "Platform adapters ready");
    Ok(registry)
}

/// Shared HTTP client with the configured request timeout
pub(crate) fn http_client(config: &HttpConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(concat!("fanout/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| PlatformError::Network(format!("Failed to build HTTP client: {}", e)).into())
}

/// Classify a non-success HTTP response
///
/// Client errors will not succeed on retry, so apart from rate limiting and
/// request timeouts they are permanent. Server errors are retried.
pub(crate) fn map_http_status(platform: PlatformKind, status: u16, body: &str) -> PlatformError {
    let detail = format!("{} returned HTTP {}: {}", platform, status, truncate(body, 300, "..."));
    match status {
        401 | 403 => PlatformError::Authentication(detail),
        408 => PlatformError::Network(detail),
        429 => PlatformError::RateLimit(detail),
        400..=499 => PlatformError::Validation(detail),
        _ => PlatformError::Posting(detail),
    }
}

/// Classify a transport failure (timeout, DNS, refused connection)
pub(crate) fn map_transport_error(platform: PlatformKind, error: reqwest::Error) -> PlatformError {
    if error.is_decode() {
        return PlatformError::Posting(format!("{} sent an unreadable response: {}", platform, error));
    }
    PlatformError::Network(format!("Request to {} failed: {}", platform, error))
}

/// Turn an HTTP response into its body, or a classified error
pub(crate) async fn check_response(
    platform: PlatformKind,
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(map_http_status(platform, status.as_u16(), &body))
}

/// Truncate to at most `max_chars` characters, ending with `suffix` when cut
pub fn truncate(text: &str, max_chars: usize, suffix: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(suffix.chars().count());
    let head: String = text.chars().take(keep).collect();
    format!("{}{}", head.trim_end(), suffix)
}

/// Render hashtags as `#tag #other`, tolerating tags that already carry `#`
pub fn format_hashtags(hashtags: &[String], prefix: &str) -> String {
    hashtags
        .iter()
        .map(|tag| tag.trim().trim_start_matches('#'))
        .filter(|tag| !tag.is_empty())
        .map(|tag| format!("{}{}", prefix, tag))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Human readable source for attribution: `https://www.techcrunch.com/x` -> `Techcrunch.com`
pub fn source_name(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let host = host.strip_prefix("www.").unwrap_or(host);

    let parts: Vec<&str> = host.split('.').collect();
    let name = if parts.len() >= 2 {
        format!("{}.{}", capitalize(parts[0]), parts[parts.len() - 1])
    } else {
        capitalize(host)
    };
    Some(name)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockPlatform;

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("short", 10, "..."), "short");
        assert_eq!(truncate("hello world", 8, "..."), "hello...");

        let cut = truncate("ñandú ñandú ñandú", 10, "…");
        assert_eq!(cut.chars().count(), 10);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn test_format_hashtags() {
        let tags = vec!["#rust".to_string(), "async".to_string(), " ".to_string()];
        assert_eq!(format_hashtags(&tags, "#"), "#rust #async");
        assert_eq!(format_hashtags(&[], "#"), "");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<b>"AT&T" 'x'</b>"#),
            "&lt;b&gt;&quot;AT&amp;T&quot; &#39;x&#39;&lt;/b&gt;"
        );
    }

    #[test]
    fn test_source_name() {
        assert_eq!(
            source_name("https://www.techcrunch.com/2024/01/story").as_deref(),
            Some("Techcrunch.com")
        );
        assert_eq!(
            source_name("https://blog.example.org/post").as_deref(),
            Some("Blog.org")
        );
        assert_eq!(source_name("not a url"), None);
    }

    #[test]
    fn test_http_status_mapping() {
        let tg = PlatformKind::Telegram;
        assert!(matches!(map_http_status(tg, 401, ""), PlatformError::Authentication(_)));
        assert!(matches!(map_http_status(tg, 403, ""), PlatformError::Authentication(_)));
        assert!(matches!(map_http_status(tg, 400, ""), PlatformError::Validation(_)));
        assert!(matches!(map_http_status(tg, 422, ""), PlatformError::Validation(_)));
        assert!(matches!(map_http_status(tg, 429, ""), PlatformError::RateLimit(_)));

        let server = map_http_status(tg, 503, "maintenance");
        assert!(matches!(server, PlatformError::Posting(_)));
        assert!(server.is_transient());
        assert!(server.to_string().contains("maintenance"));
    }

    #[test]
    fn test_other_client_errors_are_permanent() {
        let tg = PlatformKind::Telegram;
        for status in [404, 405, 409, 410] {
            let error = map_http_status(tg, status, "Bad Request: chat not found");
            assert!(matches!(error, PlatformError::Validation(_)), "HTTP {}", status);
            assert!(!error.is_transient(), "HTTP {}", status);
        }

        assert!(map_http_status(tg, 408, "").is_transient());
        assert!(map_http_status(tg, 500, "").is_transient());
        assert!(map_http_status(tg, 502, "").is_transient());
    }

    #[test]
    fn test_default_validation() {
        let platform = MockPlatform::with_limit(PlatformKind::Twitter, 5);
        assert!(platform.validate_content("12345").is_ok());
        assert!(platform.validate_content("123456").is_err());
        assert!(platform.validate_content("  ").is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = PlatformRegistry::new()
            .with(MockPlatform::success(PlatformKind::Twitter))
            .with(MockPlatform::success(PlatformKind::Telegram));

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.kinds(),
            vec![PlatformKind::Telegram, PlatformKind::Twitter]
        );
        assert!(registry.get(PlatformKind::Bluesky).is_none());
        assert_eq!(
            registry.get(PlatformKind::Twitter).unwrap().kind(),
            PlatformKind::Twitter
        );
    }

    #[tokio::test]
    async fn test_create_platforms_skips_unconfigured() {
        let mut config = Config::default_config();
        config.telegram = Some(crate::config::TelegramConfig {
            enabled: true,
            bot_token: String::new(),
            channel_id: String::new(),
        });

        let registry = create_platforms(&config).await.unwrap();
        assert!(registry.is_empty());
    }
}
