use crate::common::*;
use std::time::Duration;
use tokio::process::Command;

#[tokio::test]
async fn start_then_interrupt_releases_port() {
    let port = free_port();
    let project = TestProject::new(&format!(
        r#"
[project]
name = "test-start-stop"

[services.web]
command = "python3"
args = ["-m", "http.server", "{port}"]
health_port = {port}
"#
    ));

    let mut child = Command::new(env!("CARGO_BIN_EXE_stackwarden"))
        .args(["-f", project.config_arg(), "start"])
        .kill_on_drop(true)
        .spawn()
        .expect("failed to start stackwarden");

    assert!(
        wait_for_port(port, Duration::from_secs(15)).await,
        "service never opened its port"
    );

    #[cfg(unix)]
    interrupt(&child);
    let status = tokio::time::timeout(Duration::from_secs(15), child.wait())
        .await
        .expect("stackwarden did not exit after SIGINT")
        .unwrap();
    assert!(status.success());
    assert!(
        wait_for_port_release(port, Duration::from_secs(5)).await,
        "service port still held after shutdown"
    );
}
