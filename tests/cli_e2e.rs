//! End-to-end CLI tests for the webmirror binary.

mod support;

use assert_cmd::Command;
use predicates::prelude::*;
use support::socket_guard::start_mock_server_or_skip;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

/// Binary run inside `dir` with no user config in reach.
fn webmirror(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("webmirror").unwrap();
    cmd.current_dir(dir.path())
        .env("XDG_CONFIG_HOME", dir.path().join("xdg"))
        .env("HOME", dir.path())
        .env_remove("RUST_LOG")
        .write_stdin("");
    cmd
}

/// Test that --help displays usage information and exits with code 0.
#[test]
fn test_binary_help_displays_usage() {
    let dir = TempDir::new().unwrap();
    webmirror(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Mirror web pages"));
}

/// Test that --version displays version and exits with code 0.
#[test]
fn test_binary_version_displays_version() {
    let dir = TempDir::new().unwrap();
    webmirror(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("webmirror"));
}

/// Test that invalid flags cause non-zero exit.
#[test]
fn test_binary_invalid_flag_returns_error() {
    let dir = TempDir::new().unwrap();
    webmirror(&dir)
        .arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_binary_out_of_range_timeout_rejected() {
    let dir = TempDir::new().unwrap();
    webmirror(&dir).args(["--timeout", "0"]).assert().failure();
}

#[test]
fn test_binary_without_seeds_prints_empty_json_summary() {
    let dir = TempDir::new().unwrap();
    webmirror(&dir)
        .args(["--json", "-q"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""submitted": 0"#))
        .stdout(predicate::str::contains(r#""localised": 0"#));
    assert!(dir.path().join("mirror/webmirror.db").is_file());
}

#[test]
fn test_binary_rejects_unknown_config_key() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("bad.conf");
    std::fs::write(&config, "max_depth = 1\nfollow_everything = true\n").unwrap();

    webmirror(&dir)
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));
}

#[test]
fn test_binary_missing_explicit_config_is_error() {
    let dir = TempDir::new().unwrap();
    webmirror(&dir)
        .args(["--config", "does-not-exist.conf"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_binary_reads_default_config_file() {
    let dir = TempDir::new().unwrap();
    let config_dir = dir.path().join("xdg/webmirror");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.toml"),
        "database = \"store/pages.db\"\n",
    )
    .unwrap();

    webmirror(&dir).args(["--json", "-q"]).assert().success();

    assert!(dir.path().join("store/pages.db").is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_mirrors_seed_and_reports_json() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/start"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(r#"<a href="/next">next</a>"#, "text/html"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/next"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("<p>end</p>", "text/html"),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let seed = format!("{}/start", server.uri());
    let mut cmd = webmirror(&dir);
    let output = tokio::task::spawn_blocking(move || {
        cmd.args(["--json", "-q", "--depth", "1", seed.as_str()]).output()
    })
    .await
    .unwrap()
    .unwrap();

    assert!(output.status.success(), "{output:?}");
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["fetched"], 2);
    assert_eq!(summary["localised"], 1);
    let start = std::fs::read_to_string(dir.path().join("mirror/html/start.html")).unwrap();
    assert!(start.contains(r#"href="next.html""#), "{start}");
}
