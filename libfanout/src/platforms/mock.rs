//! Mock platform implementation for testing
//!
//! This module provides a configurable mock platform that can simulate
//! successes, transient and permanent failures, scripted sequences of
//! outcomes and latency. Tests keep an `Arc<MockPlatform>`, register a
//! clone, and inspect the call counters afterwards.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::{Platform, PublishedPost};
use crate::types::{PlatformKind, PostContent};

/// What a single `publish` call does
#[derive(Debug, Clone, PartialEq)]
pub enum MockOutcome {
    Success,
    Fail(PlatformError),
}

/// Configuration for mock platform behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub kind: PlatformKind,

    /// Outcomes consumed one per publish call, front first
    pub script: Vec<MockOutcome>,

    /// Outcome once the script is used up
    pub fallback: MockOutcome,

    /// Whether authentication should succeed
    pub auth_succeeds: bool,

    /// Delay before completing publish (simulates network latency)
    pub delay: Duration,

    pub character_limit: Option<usize>,

    pub is_configured: bool,
}

impl MockConfig {
    pub fn new(kind: PlatformKind) -> Self {
        Self {
            kind,
            script: Vec::new(),
            fallback: MockOutcome::Success,
            auth_succeeds: true,
            delay: Duration::ZERO,
            character_limit: None,
            is_configured: true,
        }
    }
}

/// Mock platform for testing
pub struct MockPlatform {
    config: MockConfig,
    script: Mutex<VecDeque<MockOutcome>>,
    auth_calls: AtomicUsize,
    publish_calls: AtomicUsize,
    published: Mutex<Vec<String>>,
}

impl MockPlatform {
    pub fn new(config: MockConfig) -> Self {
        Self {
            script: Mutex::new(config.script.iter().cloned().collect()),
            config,
            auth_calls: AtomicUsize::new(0),
            publish_calls: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock platform that always succeeds
    pub fn success(kind: PlatformKind) -> Self {
        Self::new(MockConfig::new(kind))
    }

    /// Create a mock platform that always fails with `error`
    pub fn failing(kind: PlatformKind, error: PlatformError) -> Self {
        Self::new(MockConfig {
            fallback: MockOutcome::Fail(error),
            ..MockConfig::new(kind)
        })
    }

    /// Always fails with a network error (retried by the dispatcher)
    pub fn transient_failure(kind: PlatformKind, message: &str) -> Self {
        Self::failing(kind, PlatformError::Network(message.to_string()))
    }

    /// Always fails with an authentication error (never retried)
    pub fn permanent_failure(kind: PlatformKind, message: &str) -> Self {
        Self::failing(kind, PlatformError::Authentication(message.to_string()))
    }

    /// Play `outcomes` in order, then succeed
    pub fn scripted(kind: PlatformKind, outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        Self::new(MockConfig {
            script: outcomes.into_iter().collect(),
            ..MockConfig::new(kind)
        })
    }

    /// Create a mock platform with a delay
    pub fn with_delay(kind: PlatformKind, delay: Duration) -> Self {
        Self::new(MockConfig {
            delay,
            ..MockConfig::new(kind)
        })
    }

    /// Create a mock platform with a character limit
    pub fn with_limit(kind: PlatformKind, limit: usize) -> Self {
        Self::new(MockConfig {
            character_limit: Some(limit),
            ..MockConfig::new(kind)
        })
    }

    /// Create a mock platform that is not configured
    pub fn not_configured(kind: PlatformKind) -> Self {
        Self::new(MockConfig {
            is_configured: false,
            ..MockConfig::new(kind)
        })
    }

    pub fn auth_call_count(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn publish_call_count(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    /// Text of every successful publish, in order
    pub fn published_content(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_outcome(&self) -> MockOutcome {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.config.fallback.clone())
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn kind(&self) -> PlatformKind {
        self.config.kind
    }

    async fn authenticate(&self) -> Result<()> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);

        if self.config.auth_succeeds {
            Ok(())
        } else {
            Err(PlatformError::Authentication("Mock authentication failed".to_string()).into())
        }
    }

    async fn publish(&self, content: &PostContent) -> Result<PublishedPost> {
        let call = self.publish_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        let text = self.format_content(content);
        self.validate_content(&text)?;

        match self.next_outcome() {
            MockOutcome::Success => {
                self.published
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(text);
                let post_id = format!("{}:mock-{}", self.config.kind, uuid::Uuid::new_v4());
                Ok(PublishedPost {
                    post_url: Some(format!("https://mock.invalid/{}/{}", self.config.kind, call)),
                    post_id,
                })
            }
            MockOutcome::Fail(error) => Err(error.into()),
        }
    }

    fn format_content(&self, content: &PostContent) -> String {
        match &content.url {
            Some(url) => format!("{}\n{}", content.title, url),
            None => content.title.clone(),
        }
    }

    fn character_limit(&self) -> Option<usize> {
        self.config.character_limit
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured
    }
}
