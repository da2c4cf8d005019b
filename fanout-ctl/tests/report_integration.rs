//! Integration tests for fanout-ctl report and select

use assert_cmd::Command;
use libfanout::store::ContentStore;
use libfanout::{ContentItem, Database, ItemId, Phase, PlatformKind, PublicationStatus};
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

async fn setup_test_env() -> (TempDir, String, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("fanout.db");

    fs::write(
        &config_path,
        format!(
            "[database]\npath = \"{}\"\n",
            escape_path_for_toml(&db_path.to_string_lossy())
        ),
    )
    .unwrap();

    let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
    db.insert(
        &ContentItem::new("news-1", "Title", "Summary")
            .with_platforms([PlatformKind::Telegram, PlatformKind::Bluesky]),
    )
    .await
    .unwrap();
    db.close().await;

    (
        temp_dir,
        config_path.to_string_lossy().to_string(),
        db_path.to_string_lossy().to_string(),
    )
}

fn ctl(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("fanout-ctl").unwrap();
    cmd.env("FANOUT_CONFIG", config_path).env_remove("FANOUT_DB_PATH");
    cmd
}

async fn load(db_path: &str) -> ContentItem {
    let db = Database::new(db_path).await.unwrap();
    let item = db.load(&ItemId::from("news-1")).await.unwrap().unwrap();
    db.close().await;
    item
}

#[tokio::test]
async fn test_report_success_then_resend_is_idempotent() {
    let (_temp_dir, config_path, db_path) = setup_test_env().await;
    let args = [
        "report",
        "news-1",
        "telegram",
        "--status",
        "success",
        "--post-id",
        "42",
        "--post-url",
        "https://t.me/news/42",
    ];

    ctl(&config_path)
        .args(args)
        .assert()
        .success()
        .stdout(predicate::str::contains("news-1 | publishing | 1 attempt\n"));
    let first = load(&db_path).await;

    ctl(&config_path).args(args).assert().success();
    let second = load(&db_path).await;

    assert_eq!(second.attempt_count, 1);
    assert_eq!(second.published_at, first.published_at);
    assert_eq!(
        second.platform_results[&PlatformKind::Telegram],
        first.platform_results[&PlatformKind::Telegram]
    );
}

#[tokio::test]
async fn test_late_failure_does_not_undo_success() {
    let (_temp_dir, config_path, db_path) = setup_test_env().await;

    ctl(&config_path)
        .args(["report", "news-1", "bluesky", "--status", "success", "--post-id", "at://1"])
        .assert()
        .success();
    ctl(&config_path)
        .args(["report", "news-1", "bluesky", "--status", "failed", "--error", "timeout"])
        .assert()
        .success();

    let item = load(&db_path).await;
    assert_eq!(
        item.platform_results[&PlatformKind::Bluesky].status,
        PublicationStatus::Success
    );
}

#[tokio::test]
async fn test_report_for_unselected_platform_is_rejected() {
    let (_temp_dir, config_path, _db_path) = setup_test_env().await;

    ctl(&config_path)
        .args(["report", "news-1", "linkedin", "--status", "failed"])
        .assert()
        .failure()
        .code(3);
}

#[tokio::test]
async fn test_report_success_requires_post_id() {
    let (_temp_dir, config_path, _db_path) = setup_test_env().await;

    ctl(&config_path)
        .args(["report", "news-1", "telegram", "--status", "success"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("--post-id"));
}

#[tokio::test]
async fn test_select_drops_platform_and_recomputes_phase() {
    let (_temp_dir, config_path, db_path) = setup_test_env().await;

    ctl(&config_path)
        .args(["report", "news-1", "telegram", "--status", "success", "--post-id", "1"])
        .assert()
        .success();
    ctl(&config_path)
        .args(["select", "news-1", "telegram"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fully_published"));

    let item = load(&db_path).await;
    assert_eq!(item.phase, Phase::FullyPublished);
    assert_eq!(
        item.selected_platforms.into_iter().collect::<Vec<_>>(),
        vec![PlatformKind::Telegram]
    );
}

#[tokio::test]
async fn test_select_rejects_unknown_platform() {
    let (_temp_dir, config_path, _db_path) = setup_test_env().await;

    ctl(&config_path)
        .args(["select", "news-1", "myspace"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Unknown platform"));
}
