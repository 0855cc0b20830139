use crate::common::*;
use std::collections::HashSet;
use std::time::Duration;

use stackwarden::config::model::{ServiceDefinition, SupervisorConfig};
use stackwarden::orchestrator::supervisor::{ProcessSupervisor, SupervisorEvent};

#[tokio::test]
async fn start_all_evicts_stale_listener() {
    let port = free_port();
    let dir = tempfile::TempDir::new().unwrap();

    // A leftover from a previous run holding the service's port.
    let mut stale = tokio::process::Command::new("python3")
        .args(["-m", "http.server", &port.to_string()])
        .kill_on_drop(true)
        .spawn()
        .expect("python3 is required");
    assert!(wait_for_port(port, Duration::from_secs(10)).await);

    let mut web = ServiceDefinition::new(
        "web",
        "python3",
        &["-m", "http.server", &port.to_string()],
        dir.path(),
        0,
    );
    web.health_port = Some(port);
    let supervisor = ProcessSupervisor::builder(vec![web], SupervisorConfig::default()).build();
    let mut events = supervisor.subscribe();

    supervisor.start_all(&HashSet::new()).await.unwrap();

    let mut reclaimed = false;
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::Reclaimed(r) = event {
            reclaimed |= r.port == port && Some(r.pid) == stale.id();
        }
    }
    assert!(reclaimed, "stale listener was not reclaimed");
    let _ = tokio::time::timeout(Duration::from_secs(5), stale.wait()).await;

    assert!(wait_for_port(port, Duration::from_secs(10)).await);
    supervisor.stop_all().await;
}
