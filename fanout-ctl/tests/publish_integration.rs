//! Integration tests for fanout-ctl publish

use assert_cmd::Command;
use libfanout::store::ContentStore;
use libfanout::{ContentItem, Database, ItemId, Phase, PlatformKind, PublicationStatus};
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const CREDENTIAL_VARS: [&str; 8] = [
    "FANOUT_DB_PATH",
    "TELEGRAM_BOT_TOKEN",
    "TELEGRAM_CHANNEL_ID",
    "BLUESKY_HANDLE",
    "BLUESKY_APP_PASSWORD",
    "TWITTER_ACCESS_TOKEN",
    "LINKEDIN_ACCESS_TOKEN",
    "LINKEDIN_AUTHOR_URN",
];

fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

/// No platform has credentials, so every attempt fails as not configured
async fn setup_test_env(item: ContentItem) -> (TempDir, String, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("fanout.db");

    fs::write(
        &config_path,
        format!(
            "[database]\npath = \"{}\"\n\n[publisher]\npacing_delay_ms = 0\n",
            escape_path_for_toml(&db_path.to_string_lossy())
        ),
    )
    .unwrap();

    let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
    db.insert(&item).await.unwrap();
    db.close().await;

    (
        temp_dir,
        config_path.to_string_lossy().to_string(),
        db_path.to_string_lossy().to_string(),
    )
}

fn ctl(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("fanout-ctl").unwrap();
    cmd.env("FANOUT_CONFIG", config_path);
    for var in CREDENTIAL_VARS {
        cmd.env_remove(var);
    }
    cmd
}

async fn load(db_path: &str, id: &str) -> ContentItem {
    let db = Database::new(db_path).await.unwrap();
    let item = db.load(&ItemId::from(id)).await.unwrap().unwrap();
    db.close().await;
    item
}

#[tokio::test]
async fn test_publish_without_adapters_fails_every_platform() {
    let (_temp_dir, config_path, db_path) = setup_test_env(
        ContentItem::new("news-1", "Title", "Summary")
            .with_platforms([PlatformKind::Telegram, PlatformKind::Bluesky]),
    )
    .await;

    ctl(&config_path)
        .args(["publish", "news-1"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("Attempted: telegram, bluesky"))
        .stdout(predicate::str::contains("not configured"));

    let item = load(&db_path, "news-1").await;
    assert_eq!(item.phase, Phase::Failed);
    assert_eq!(item.platform_results.len(), 2);
}

#[tokio::test]
async fn test_publish_limited_to_one_platform() {
    let (_temp_dir, config_path, db_path) = setup_test_env(
        ContentItem::new("news-1", "Title", "Summary")
            .with_platforms([PlatformKind::Telegram, PlatformKind::Bluesky]),
    )
    .await;

    ctl(&config_path)
        .args(["publish", "news-1", "--platform", "bluesky"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Attempted: bluesky"));

    let item = load(&db_path, "news-1").await;
    assert!(!item.platform_results.contains_key(&PlatformKind::Telegram));
    assert_eq!(
        item.platform_results[&PlatformKind::Bluesky].status,
        PublicationStatus::Failed
    );
    assert_eq!(item.phase, Phase::Publishing);
}

#[tokio::test]
async fn test_publish_skips_curating_items() {
    let (_temp_dir, config_path, db_path) = setup_test_env(
        ContentItem::new("draft", "Title", "Summary")
            .with_platforms([PlatformKind::Telegram])
            .with_phase(Phase::Processing),
    )
    .await;

    ctl(&config_path)
        .args(["publish", "draft"])
        .assert()
        .failure()
        .code(3);

    assert!(load(&db_path, "draft").await.platform_results.is_empty());
}

#[tokio::test]
async fn test_publish_unknown_item() {
    let (_temp_dir, config_path, _db_path) = setup_test_env(ContentItem::new("a", "t", "s")).await;

    ctl(&config_path)
        .args(["publish", "missing"])
        .assert()
        .failure()
        .code(3);
}
