use std::sync::Arc;
use std::time::Duration;

use stackwarden::config::model::{ServiceDefinition, SupervisorConfig};
use stackwarden::orchestrator::supervisor::{ProcessStatus, ProcessSupervisor, SupervisorEvent};

#[tokio::test]
async fn crashing_service_is_restarted_until_the_limit() {
    let dir = tempfile::TempDir::new().unwrap();
    let crasher = ServiceDefinition::new("crasher", "sh", &["-c", "echo started; exit 1"], dir.path(), 0);
    let supervisor = ProcessSupervisor::builder(
        vec![crasher],
        SupervisorConfig {
            max_restarts: 3,
            initial_delay: Duration::from_millis(100),
            ..SupervisorConfig::default()
        },
    )
    .reclaimer(Arc::new(stackwarden::orchestrator::ports::SystemReclaimer::default()))
    .build();
    let mut events = supervisor.subscribe();

    supervisor.start("crasher").await.unwrap();

    let mut spawns = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while spawns < 4 {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("restarts did not happen in time")
            .unwrap();
        if matches!(event, SupervisorEvent::Spawned { .. }) {
            spawns += 1;
        }
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    let record = supervisor.get_status("crasher").unwrap();
    assert_eq!(record.status, ProcessStatus::Crashed);
    assert_eq!(record.restart_count, 3);
    supervisor.stop_all().await;
}
