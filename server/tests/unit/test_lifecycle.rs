//! Deployment lifecycle tests against the in-memory store and a fake orchestrator

use std::time::Duration;

use dockyard::deploy::events::LifecycleEvent;
use dockyard::deploy::lifecycle::deploy_task_key;
use dockyard::deploy::LifecycleOptions;
use dockyard::errors::DockyardError;
use dockyard::models::deployment::{
    Deployment, DeploymentConfig, DeploymentOperation, DeploymentStatus, LogSeverity,
};

use crate::common::{request, tunnel_config, Harness, DEPLOY, RESTART, STOP, WORKER_TEMPLATE};

async fn next_event(
    subscription: &mut dockyard::deploy::events::Subscription,
) -> LifecycleEvent {
    tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_deploy_reaches_running() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", false).await;

    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert!(!deployment.tunnel_active);
    assert!(deployment.tunnel_url.is_none());
    assert_eq!(h.orchestrator.calls(), vec!["deploy:shop"]);

    let compose = h.orchestrator.deployed_compose("shop").unwrap();
    assert!(compose.contains("nginx"));
    assert!(!compose.contains("newt"));
}

#[tokio::test]
async fn test_deploy_with_tunnel_injects_agent() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", true).await;

    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert!(deployment.tunnel_active);
    assert_eq!(
        deployment.tunnel_url.as_deref(),
        Some("https://shop.tunnel.example.com")
    );

    let compose = h.orchestrator.deployed_compose("shop").unwrap();
    assert!(compose.contains("NEWT_ID=newt-123"));
    assert!(compose.contains("app_network"));

    let info = h.lifecycle.tunnel_info(&deployment.id).await.unwrap();
    assert!(info.tunnel_active);
    assert_eq!(info.agent.map(|a| a.state), Some("running".to_string()));
}

#[tokio::test]
async fn test_tunnel_url_survives_stop() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", true).await;

    let stopped = h
        .lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Stop)
        .await
        .unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Stopped);
    assert_eq!(stopped.tunnel_url, deployment.tunnel_url);

    let info = h.lifecycle.tunnel_info(&deployment.id).await.unwrap();
    assert!(info.agent.is_none());
    assert_eq!(info.tunnel_url, deployment.tunnel_url);
}

#[tokio::test]
async fn test_failed_deploy_records_error_log() {
    let h = Harness::new();
    h.orchestrator.fail_on(DEPLOY);
    let deployment = h.deploy("web", "shop", false).await;

    assert_eq!(deployment.status, DeploymentStatus::Failed);
    let logs = h.lifecycle.deployment_logs(&deployment.id).await.unwrap();
    let last = logs.last().unwrap();
    assert_eq!(last.level, LogSeverity::Error);
    assert!(last.message.starts_with("Deployment failed:"), "{}", last.message);
}

#[tokio::test]
async fn test_unknown_template_fails_deployment() {
    let h = Harness::new();
    let deployment = h.deploy("missing", "shop", false).await;

    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(h.orchestrator.calls().is_empty());
}

#[tokio::test]
async fn test_start_from_failed_redeploys() {
    let h = Harness::new();
    h.orchestrator.fail_on(DEPLOY);
    let deployment = h.deploy("web", "shop", false).await;
    assert_eq!(deployment.status, DeploymentStatus::Failed);

    h.orchestrator.recover(DEPLOY);
    let started = h
        .lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Start)
        .await
        .unwrap();
    assert_eq!(started.status, DeploymentStatus::Deploying);

    let settled = h.settle(&deployment.id).await;
    assert_eq!(settled.status, DeploymentStatus::Running);
    assert_eq!(h.orchestrator.calls(), vec!["deploy:shop", "deploy:shop"]);
}

#[tokio::test]
async fn test_stop_then_start_resumes() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", false).await;

    h.lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Stop)
        .await
        .unwrap();
    assert_eq!(h.status(&deployment.id).await, DeploymentStatus::Stopped);

    h.lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Start)
        .await
        .unwrap();
    let settled = h.settle(&deployment.id).await;

    assert_eq!(settled.status, DeploymentStatus::Running);
    assert_eq!(
        h.orchestrator.calls(),
        vec!["deploy:shop", "stop:shop", "start:shop"]
    );
}

#[tokio::test]
async fn test_restart_keeps_running() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", false).await;

    let restarted = h
        .lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Restart)
        .await
        .unwrap();
    assert_eq!(restarted.status, DeploymentStatus::Running);
    assert_eq!(h.orchestrator.calls().last().unwrap(), "restart:shop");
}

#[tokio::test]
async fn test_restart_failure_marks_failed() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", false).await;
    h.orchestrator.fail_on(RESTART);

    let err = h
        .lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Restart)
        .await
        .unwrap_err();
    assert!(matches!(err, DockyardError::OrchestrationFailure(_)));
    assert_eq!(h.status(&deployment.id).await, DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_stop_failure_marks_failed() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", false).await;
    h.orchestrator.fail_on(STOP);

    let result = h
        .lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Stop)
        .await;
    assert!(result.is_err());
    assert_eq!(h.status(&deployment.id).await, DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_invalid_transitions_leave_status() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", false).await;

    let err = h
        .lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Start)
        .await
        .unwrap_err();
    assert!(matches!(err, DockyardError::InvalidTransition { .. }));

    let err = h.lifecycle.delete_deployment(&deployment.id).await.unwrap_err();
    assert!(matches!(
        err,
        DockyardError::InvalidTransition {
            current: DeploymentStatus::Running,
            ..
        }
    ));

    assert_eq!(h.status(&deployment.id).await, DeploymentStatus::Running);
    assert_eq!(h.orchestrator.calls(), vec!["deploy:shop"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stops_only_one_wins() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", false).await;

    let (a, b) = tokio::join!(
        h.lifecycle
            .transition_deployment(&deployment.id, DeploymentOperation::Stop),
        h.lifecycle
            .transition_deployment(&deployment.id, DeploymentOperation::Stop),
    );

    let results = [a, b];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    for result in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(
            result,
            DockyardError::Conflict(_) | DockyardError::InvalidTransition { .. }
        ));
    }

    let stops = h
        .orchestrator
        .calls()
        .iter()
        .filter(|c| c.starts_with("stop:"))
        .count();
    assert_eq!(stops, 1);
    assert_eq!(h.status(&deployment.id).await, DeploymentStatus::Stopped);
}

#[tokio::test]
async fn test_stop_while_deploying_cancels_deploy() {
    let h = Harness::new();
    h.orchestrator.set_deploy_delay(Duration::from_secs(30));
    let deployment = h
        .lifecycle
        .create_deployment(request("web", "shop", false))
        .await
        .unwrap();

    // wait for the background task to claim the record
    for _ in 0..100 {
        if h.status(&deployment.id).await == DeploymentStatus::Deploying {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stopped = h
        .lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Stop)
        .await
        .unwrap();

    assert_eq!(stopped.status, DeploymentStatus::Stopped);
    assert!(!h.tasks.is_running(&deploy_task_key(&deployment.id)));
    assert_eq!(h.orchestrator.calls(), vec!["stop:shop"]);
}

#[tokio::test]
async fn test_pending_without_auto_start() {
    let h = Harness::new();
    let mut req = request("web", "shop", false);
    req.auto_start = false;
    let deployment = h.lifecycle.create_deployment(req).await.unwrap();

    assert_eq!(deployment.status, DeploymentStatus::Pending);
    assert!(!h.tasks.is_running(&deploy_task_key(&deployment.id)));
    assert!(h.orchestrator.calls().is_empty());

    h.lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Deploy)
        .await
        .unwrap();
    assert_eq!(h.settle(&deployment.id).await.status, DeploymentStatus::Running);
}

#[tokio::test]
async fn test_status_events_in_order() {
    let h = Harness::new();
    let mut req = request("web", "shop", false);
    req.auto_start = false;
    let deployment = h.lifecycle.create_deployment(req).await.unwrap();

    let mut subscription = h.lifecycle.subscribe(&deployment.id);
    h.lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Deploy)
        .await
        .unwrap();

    let mut transitions = Vec::new();
    while transitions.len() < 2 {
        if let LifecycleEvent::StatusChanged { from, to, .. } = next_event(&mut subscription).await
        {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (DeploymentStatus::Pending, DeploymentStatus::Deploying),
            (DeploymentStatus::Deploying, DeploymentStatus::Running),
        ]
    );
}

#[tokio::test]
async fn test_logs_keep_append_order() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", false).await;
    h.lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Stop)
        .await
        .unwrap();

    let logs = h.lifecycle.deployment_logs(&deployment.id).await.unwrap();
    let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(
        messages,
        vec![
            "Deployment created from template web",
            "Starting deployment process",
            "Deployment completed successfully",
            "Deployment stopped",
        ]
    );
    assert!(logs.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[tokio::test]
async fn test_delete_stopped_deployment() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", false).await;
    h.lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Stop)
        .await
        .unwrap();

    let mut subscription = h.lifecycle.subscribe(&deployment.id);
    h.lifecycle.delete_deployment(&deployment.id).await.unwrap();

    assert!(matches!(
        h.lifecycle.get_deployment(&deployment.id).await,
        Err(DockyardError::NotFound(_))
    ));
    assert_eq!(h.orchestrator.calls().last().unwrap(), "remove:shop");
    assert_eq!(
        next_event(&mut subscription).await,
        LifecycleEvent::Deleted {
            deployment_id: deployment.id.clone()
        }
    );

    // the stack name is free again
    let again = h.deploy("web", "shop", false).await;
    assert_eq!(again.status, DeploymentStatus::Running);
}

#[tokio::test]
async fn test_duplicate_stack_name_conflicts() {
    let h = Harness::new();
    h.deploy("web", "shop", false).await;

    let err = h
        .lifecycle
        .create_deployment(request("worker", "shop", false))
        .await
        .unwrap_err();
    assert!(matches!(err, DockyardError::Conflict(_)));
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let h = Harness::new();

    let err = h
        .lifecycle
        .create_deployment(request("web", "-bad name", false))
        .await
        .unwrap_err();
    assert!(matches!(err, DockyardError::ValidationError(_)));

    let mut req = request("web", "shop", true);
    if let Some(tunnel) = req.tunnel.as_mut() {
        tunnel.secret.clear();
    }
    let err = h.lifecycle.create_deployment(req).await.unwrap_err();
    assert!(matches!(err, DockyardError::ValidationError(_)));

    assert!(h.lifecycle.list_deployments(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_filters_by_status() {
    let h = Harness::new();
    let running = h.deploy("web", "shop", false).await;
    h.orchestrator.fail_on(DEPLOY);
    let failed = h.deploy("worker", "jobs", false).await;

    let all = h.lifecycle.list_deployments(None).await.unwrap();
    assert_eq!(all.len(), 2);

    let only_failed = h
        .lifecycle
        .list_deployments(Some(DeploymentStatus::Failed))
        .await
        .unwrap();
    assert_eq!(only_failed.len(), 1);
    assert_eq!(only_failed[0].id, failed.id);

    let found = h.lifecycle.find_by_stack_name("shop").await.unwrap();
    assert_eq!(found.map(|d| d.id), Some(running.id));
}

#[tokio::test]
async fn test_recover_interrupted_deploy() {
    let h = Harness::new();
    let mut deployment = Deployment::new("stale", "web", "stale", DeploymentConfig::default());
    deployment.status = DeploymentStatus::Deploying;
    h.store.insert_deployment(deployment).await.unwrap();

    h.lifecycle.recover_interrupted().await.unwrap();

    assert_eq!(h.status("stale").await, DeploymentStatus::Failed);
    let logs = h.lifecycle.deployment_logs("stale").await.unwrap();
    assert_eq!(logs.last().unwrap().level, LogSeverity::Error);
}

#[tokio::test]
async fn test_deploy_keeps_compose_source() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", true).await;

    let kept = deployment.compose_source.unwrap();
    assert_eq!(Some(kept), h.orchestrator.deployed_compose("shop"));
}

#[tokio::test]
async fn test_start_from_failed_uses_kept_compose() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", false).await;
    h.orchestrator.fail_on(RESTART);
    h.lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Restart)
        .await
        .unwrap_err();
    assert_eq!(h.status(&deployment.id).await, DeploymentStatus::Failed);

    // the template moved on after the stack was deployed
    h.templates.insert("web", WORKER_TEMPLATE);
    h.lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Start)
        .await
        .unwrap();
    assert_eq!(h.settle(&deployment.id).await.status, DeploymentStatus::Running);

    let compose = h.orchestrator.deployed_compose("shop").unwrap();
    assert!(compose.contains("nginx"), "{}", compose);
    assert!(!compose.contains("busybox"));
}

#[tokio::test]
async fn test_start_rejected_while_earlier_deploy_runs() {
    let h = Harness::new();
    h.orchestrator.fail_on(DEPLOY);
    let deployment = h.deploy("web", "shop", false).await;
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    h.orchestrator.recover(DEPLOY);

    let key = deploy_task_key(&deployment.id);
    h.tasks
        .spawn(key.clone(), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        })
        .unwrap();

    let err = h
        .lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Start)
        .await
        .unwrap_err();
    assert!(matches!(err, DockyardError::Conflict(_)));
    assert_eq!(h.status(&deployment.id).await, DeploymentStatus::Failed);
    assert_eq!(h.orchestrator.calls(), vec!["deploy:shop"]);

    h.tasks.cancel(&key);
    h.lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Start)
        .await
        .unwrap();
    assert_eq!(h.settle(&deployment.id).await.status, DeploymentStatus::Running);
}

#[tokio::test]
async fn test_failure_reason_logged_before_status() {
    let h = Harness::new();
    h.orchestrator.fail_on(DEPLOY);
    let mut req = request("web", "shop", false);
    req.auto_start = false;
    let deployment = h.lifecycle.create_deployment(req).await.unwrap();

    let mut subscription = h.lifecycle.subscribe(&deployment.id);
    h.lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Deploy)
        .await
        .unwrap();

    let mut saw_error_log = false;
    loop {
        match next_event(&mut subscription).await {
            LifecycleEvent::Log(entry) if entry.level == LogSeverity::Error => {
                saw_error_log = true;
            }
            LifecycleEvent::StatusChanged {
                to: DeploymentStatus::Failed,
                ..
            } => break,
            _ => {}
        }
    }
    assert!(saw_error_log);
}

#[tokio::test]
async fn test_deploy_timeout_marks_failed() {
    let h = Harness::with_options(LifecycleOptions {
        operation_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    h.orchestrator.set_deploy_delay(Duration::from_secs(1));

    let deployment = h.deploy("web", "shop", false).await;

    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.compose_source.is_none());
    assert!(h.orchestrator.deployed_compose("shop").is_none());
    let logs = h.lifecycle.deployment_logs(&deployment.id).await.unwrap();
    let last = logs.last().unwrap();
    assert_eq!(last.level, LogSeverity::Error);
    assert!(last.message.contains("deploy timed out after 50ms"), "{}", last.message);
}

#[tokio::test]
async fn test_operation_locks_are_released() {
    let h = Harness::new();
    let deployment = h.deploy("web", "shop", false).await;

    for operation in [
        DeploymentOperation::Restart,
        DeploymentOperation::Stop,
        DeploymentOperation::Start,
    ] {
        h.lifecycle
            .transition_deployment(&deployment.id, operation)
            .await
            .unwrap();
        h.settle(&deployment.id).await;
    }
    // rejected operations release their lock too
    h.lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Start)
        .await
        .unwrap_err();
    assert_eq!(h.lifecycle.locked_count(), 0);

    h.lifecycle
        .transition_deployment(&deployment.id, DeploymentOperation::Stop)
        .await
        .unwrap();
    h.lifecycle.delete_deployment(&deployment.id).await.unwrap();
    assert_eq!(h.lifecycle.locked_count(), 0);
}

#[tokio::test]
async fn test_global_tunnel_config() {
    let h = Harness::new();
    let mut req = request("web", "shop", false);
    req.use_global_tunnel = true;

    let err = h.lifecycle.create_deployment(req.clone()).await.unwrap_err();
    assert!(matches!(err, DockyardError::ValidationError(_)));

    let mut incomplete = tunnel_config();
    incomplete.secret.clear();
    assert!(h.lifecycle.set_global_tunnel_config(incomplete).await.is_err());
    assert!(h.lifecycle.global_tunnel_config().await.unwrap().is_none());

    h.lifecycle
        .set_global_tunnel_config(tunnel_config())
        .await
        .unwrap();
    let deployment = h.lifecycle.create_deployment(req).await.unwrap();
    let deployment = h.settle(&deployment.id).await;

    assert!(deployment.tunnel_active);
    assert_eq!(deployment.config.tunnel, Some(tunnel_config()));
    let compose = h.orchestrator.deployed_compose("shop").unwrap();
    assert!(compose.contains("NEWT_ID=newt-123"));

    let status = h.lifecycle.tunnel_status().await.unwrap();
    assert!(status.configured);
    assert_eq!(status.total, 1);
    assert_eq!(status.active, 1);
    assert_eq!(status.deployments[0].stack_name, "shop");
}
