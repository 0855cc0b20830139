mod common;

use assert_cmd::Command;
use common::{free_port, TestProject};
use predicates::prelude::*;

fn stackwarden() -> Command {
    let mut cmd = Command::cargo_bin("stackwarden").unwrap();
    cmd.env_remove("STACKWARDEN_CONFIG");
    cmd
}

#[test]
fn help_lists_commands() {
    stackwarden()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("install"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("containers"));
}

#[test]
fn validate_accepts_valid_config() {
    let project = TestProject::new(
        r#"
[project]
name = "atlas"

[services.api]
command = "api-server"
health_port = 4000

[services.worker]
command = "worker"
start_order = 10

[infra.db]
port = 5432
"#,
    );

    stackwarden()
        .args(["validate", "-f", project.config_arg()])
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid (2 services, 1 infra)"));
}

#[test]
fn validate_rejects_empty_command() {
    let project = TestProject::new(
        r#"
[project]
name = "atlas"

[services.api]
command = ""
"#,
    );

    stackwarden()
        .args(["-f", project.config_arg(), "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("empty command"));
}

#[test]
fn validate_suggests_component_service() {
    let project = TestProject::new(
        r#"
[project]
name = "atlas"

[services.search]
command = "search-server"

[provision.optional_component]
name = "search"
repo = "https://example.invalid/search.git"
dir = "search"
services = ["serch"]
"#,
    );

    stackwarden()
        .args(["validate", "-f", project.config_arg()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("did you mean `search`"));
}

#[test]
fn missing_config_file_is_an_error() {
    stackwarden()
        .args(["validate", "-f", "/definitely/not/here/stackwarden.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn status_json_reports_probe_results() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let db_port = listener.local_addr().unwrap().port();
    let api_port = free_port();
    let project = TestProject::new(&format!(
        r#"
[project]
name = "atlas"

[services.api]
command = "api-server"
health_port = {api_port}

[infra.db]
port = {db_port}

[health]
probe_timeout = "500ms"
"#
    ));

    let output = stackwarden()
        .args(["status", "--json", "-f", project.config_arg()])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["all_healthy"], false);
    let state = |id: &str| {
        report["records"]
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["id"] == id)
            .map(|r| r["state"].as_str().unwrap().to_string())
    };
    assert_eq!(state("db").as_deref(), Some("healthy"));
    assert_eq!(state("api").as_deref(), Some("unhealthy"));
    drop(listener);
}

#[test]
fn completions_mention_binary() {
    stackwarden()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stackwarden"));
}
