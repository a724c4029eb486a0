//! Tests for the enclave lifecycle manager.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{local_image, ExitMode, ScriptedHost};
use vme_runner::enclave::{
    EnclaveManager, EnclaveState, ManagerConfig, ResourceConfig, ResourceLedger,
};
use vme_runner::error::RunnerError;

fn manager_with(host: Arc<ScriptedHost>, grace: Duration) -> EnclaveManager {
    let ledger = ResourceLedger::new(ResourceConfig {
        cpu_capacity: 4,
        memory_capacity_mb: 2048,
    });
    EnclaveManager::new(
        host,
        ledger,
        ManagerConfig {
            terminate_grace: grace,
            drain_timeout: Duration::from_millis(200),
        },
    )
}

fn manager(host: Arc<ScriptedHost>) -> EnclaveManager {
    manager_with(host, Duration::from_secs(2))
}

#[tokio::test]
async fn test_natural_exit_captures_output() {
    let host = Arc::new(ScriptedHost::new(ExitMode::Exit(0)).with_output("hello\n", "warn\n"));
    let mgr = manager(host.clone());

    let instance = mgr.launch(local_image(), 2, 512).await.unwrap();
    let outcome = instance
        .wait_for_completion(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stdout_lossy(), "hello\n");
    assert_eq!(outcome.stderr_lossy(), "warn\n");
    assert_eq!(instance.state(), EnclaveState::Terminated);

    let stats = mgr.stats();
    assert_eq!(stats.launched, 1);
    assert_eq!(stats.terminated, 1);
    assert_eq!(stats.active, None);
    assert_eq!(mgr.ledger().reserved_cpus(), 0);
    assert_eq!(mgr.ledger().reserved_memory_mb(), 0);
}

#[tokio::test]
async fn test_instance_reports_reservation() {
    let host = Arc::new(ScriptedHost::new(ExitMode::UntilTerminated));
    let mgr = manager(host);

    let instance = mgr.launch(local_image(), 2, 512).await.unwrap();
    assert_eq!(instance.state(), EnclaveState::Running);
    assert_eq!(instance.cpu_count(), 2);
    assert_eq!(instance.memory_mb(), 512);
    assert_eq!(mgr.ledger().reserved_cpus(), 2);
    assert_eq!(mgr.stats().active.as_deref(), Some(instance.id()));

    instance.terminate().await.unwrap();
    assert_eq!(mgr.ledger().reserved_cpus(), 0);
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let host = Arc::new(ScriptedHost::new(ExitMode::UntilTerminated));
    let mgr = manager(host.clone());

    let instance = mgr.launch(local_image(), 1, 256).await.unwrap();
    instance.terminate().await.unwrap();
    instance.terminate().await.unwrap();

    assert_eq!(instance.state(), EnclaveState::Terminated);
    assert_eq!(host.terminates(), 1);
    assert_eq!(mgr.stats().terminated, 1);
}

#[tokio::test]
async fn test_wait_timeout_leaves_instance_running() {
    let host = Arc::new(ScriptedHost::new(ExitMode::UntilTerminated));
    let mgr = manager(host);

    let instance = mgr.launch(local_image(), 1, 256).await.unwrap();
    let result = instance
        .wait_for_completion(Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(RunnerError::Timeout(_))));
    assert_eq!(instance.state(), EnclaveState::Running);

    instance.terminate().await.unwrap();
    assert_eq!(instance.state(), EnclaveState::Terminated);
    assert_eq!(mgr.stats().terminated, 1);
}

#[tokio::test]
async fn test_unresponsive_enclave_is_abandoned_after_grace() {
    let host = Arc::new(ScriptedHost::new(ExitMode::Hang));
    let mgr = manager_with(host.clone(), Duration::from_millis(100));

    let instance = mgr.launch(local_image(), 1, 256).await.unwrap();
    instance.terminate().await.unwrap();

    assert_eq!(instance.state(), EnclaveState::Terminated);
    // Once from terminate, once more when the supervisor gives up on it.
    assert_eq!(host.terminates(), 2);
    assert_eq!(mgr.ledger().reserved_cpus(), 0);
    assert_eq!(mgr.stats().active, None);
}

#[tokio::test]
async fn test_terminate_races_with_wait() {
    let host = Arc::new(ScriptedHost::new(ExitMode::UntilTerminated).with_output("partial", ""));
    let mgr = manager(host);

    let instance = mgr.launch(local_image(), 1, 256).await.unwrap();
    let (waited, terminated) = tokio::join!(
        instance.wait_for_completion(Duration::from_secs(5)),
        instance.terminate()
    );

    terminated.unwrap();
    let outcome = waited.unwrap();
    assert_eq!(outcome.exit_code, None);
    assert_eq!(outcome.stdout_lossy(), "partial");
    assert_eq!(mgr.stats().terminated, 1);
}

#[tokio::test]
async fn test_watch_observes_terminated_once() {
    let host = Arc::new(ScriptedHost::new(ExitMode::UntilTerminated));
    let mgr = manager(host);

    let instance = mgr.launch(local_image(), 1, 256).await.unwrap();
    let mut rx = instance.watch();
    assert_eq!(*rx.borrow_and_update(), EnclaveState::Running);

    instance.terminate().await.unwrap();
    assert_eq!(*rx.borrow(), EnclaveState::Terminated);
    assert_eq!(mgr.stats().terminated, 1);
}

#[tokio::test]
async fn test_second_launch_while_active_fails() {
    let host = Arc::new(ScriptedHost::new(ExitMode::UntilTerminated));
    let mgr = manager(host.clone());

    let first = mgr.launch(local_image(), 1, 256).await.unwrap();
    let second = mgr.launch(local_image(), 1, 256).await;
    assert!(matches!(second, Err(RunnerError::LaunchFailed(_))));
    assert_eq!(mgr.ledger().reserved_cpus(), 1);

    first.terminate().await.unwrap();
    let third = mgr.launch(local_image(), 1, 256).await.unwrap();
    third.terminate().await.unwrap();
    assert_eq!(mgr.stats().launched, 2);
    assert_eq!(mgr.stats().terminated, 2);
}

#[tokio::test]
async fn test_exhausted_reservation_releases_slot() {
    let host = Arc::new(ScriptedHost::new(ExitMode::Exit(0)));
    let mgr = manager(host.clone());

    let result = mgr.launch(local_image(), 8, 256).await;
    assert!(matches!(result, Err(RunnerError::ResourceExhausted { .. })));
    assert_eq!(mgr.stats().active, None);
    assert_eq!(mgr.stats().launched, 0);
    assert_eq!(common::hosted_ids(&host), 0);

    let instance = mgr.launch(local_image(), 4, 2048).await.unwrap();
    instance
        .wait_for_completion(Duration::from_secs(5))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_run_releases_everything() {
    let host = Arc::new(ScriptedHost::failing());
    let mgr = manager(host);

    let result = mgr.launch(local_image(), 2, 512).await;
    assert!(matches!(result, Err(RunnerError::LaunchFailed(_))));
    assert_eq!(mgr.ledger().reserved_cpus(), 0);
    assert_eq!(mgr.ledger().reserved_memory_mb(), 0);
    assert_eq!(mgr.stats().active, None);
}

#[tokio::test]
async fn test_dropped_handle_abandons_enclave() {
    let host = Arc::new(ScriptedHost::new(ExitMode::UntilTerminated));
    let mgr = manager(host.clone());

    let instance = mgr.launch(local_image(), 2, 512).await.unwrap();
    drop(instance);

    tokio::time::timeout(Duration::from_secs(5), async {
        while mgr.stats().terminated == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(host.terminates(), 1);
    assert_eq!(mgr.ledger().reserved_cpus(), 0);
    assert_eq!(mgr.stats().active, None);
}

#[tokio::test]
async fn test_describe_and_terminate_all_delegate_to_host() {
    let host = Arc::new(ScriptedHost::new(ExitMode::UntilTerminated));
    let mgr = manager(host.clone());

    let instance = mgr.launch(local_image(), 1, 256).await.unwrap();
    assert_eq!(mgr.describe().await.unwrap().len(), 1);

    mgr.terminate_all().await.unwrap();
    let outcome = instance
        .wait_for_completion(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, None);
    assert_eq!(host.terminate_alls(), 1);
    assert!(mgr.describe().await.unwrap().is_empty());
}
