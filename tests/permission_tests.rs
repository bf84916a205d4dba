mod common;

use common::*;
use deploy_gate::gate::IdStrategy;
use deploy_gate::prelude::*;

const JOB: &str = "team/app";

fn secured() -> StaticAccessControl {
    StaticAccessControl::default()
}

#[tokio::test]
async fn test_outsider_cannot_submit() {
    let h = Harness::with_access(secured()).await;
    h.accept_deploys(0).await;

    let step = DeployStep::new("Release?").with_submitter("alice");
    let (gate, context) = h.open(step).await;

    let err = gate
        .submit_for_deploy(&user("mallory"), deploy_params())
        .await
        .unwrap_err();
    match err {
        GateError::PermissionDenied(message) => assert!(message.contains("alice")),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(gate.outcome().await, None);
    assert_eq!(context.resume_count(), 0);
}

#[tokio::test]
async fn test_outsider_cannot_abort() {
    let h = Harness::with_access(secured()).await;
    let step = DeployStep::new("Release?").with_submitter("alice");
    let (gate, context) = h.open(step).await;

    let err = gate.abort(&user("mallory"), None, true).await.unwrap_err();
    match err {
        GateError::PermissionDenied(message) => {
            assert!(message.contains("'alice'"));
            assert!(message.contains("cancel"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(gate.state().await, GateState::Pending);
    assert_eq!(context.resume_count(), 0);
}

#[tokio::test]
async fn test_listed_submitter_settles_case_insensitively() {
    let h = Harness::with_access(secured()).await;
    h.accept_deploys(1).await;

    let step = DeployStep::new("Release?").with_submitter("bob, Alice");
    let (gate, _context) = h.open(step).await;

    let state = gate
        .submit_for_deploy(&user("alice"), deploy_params())
        .await
        .unwrap();
    assert_eq!(state, GateState::Submitted);
}

#[tokio::test]
async fn test_group_member_settles() {
    let h = Harness::with_access(secured()).await;
    let step = DeployStep::new("Release?").with_submitter("release-managers");
    let (gate, context) = h.open(step).await;

    let manager = Principal::new("carol").with_authorities(["Release-Managers"]);
    assert_eq!(
        gate.abort(&manager, None, true).await.unwrap(),
        GateState::Aborted
    );
    resumed_failure(&context).await;
}

#[tokio::test]
async fn test_case_sensitive_users() {
    let access = StaticAccessControl {
        user_id_strategy: IdStrategy::CaseSensitive,
        ..secured()
    };
    let h = Harness::with_access(access).await;
    let step = DeployStep::new("Release?").with_submitter("Alice");
    let (gate, _context) = h.open(step).await;

    assert!(matches!(
        gate.pre_submission_check(&user("alice")).await,
        Err(GateError::PermissionDenied(_))
    ));
    assert!(gate.pre_submission_check(&user("Alice")).await.is_ok());
}

#[tokio::test]
async fn test_cancel_grant_allows_abort_only() {
    let h = Harness::with_access(secured().grant_cancel(JOB, "ops")).await;
    h.accept_deploys(0).await;

    let step = DeployStep::new("Release?").with_submitter("alice");
    let (gate, context) = h.open(step).await;

    let ops = user("ops");
    assert!(matches!(
        gate.submit_for_deploy(&ops, deploy_params()).await,
        Err(GateError::PermissionDenied(_))
    ));
    assert_eq!(gate.abort(&ops, None, true).await.unwrap(), GateState::Aborted);
    resumed_failure(&context).await;
}

#[tokio::test]
async fn test_build_grant_without_submitter() {
    let h = Harness::with_access(secured().grant_build(JOB, "dev")).await;
    let (gate, _context) = h.open(DeployStep::new("Release?")).await;

    assert!(gate.pre_submission_check(&user("dev")).await.is_ok());

    let err = gate.pre_submission_check(&user("guest")).await.unwrap_err();
    match err {
        GateError::PermissionDenied(message) => {
            assert_eq!(message, "You need to have Job/Build permissions to submit this.")
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_wildcard_grant_applies_to_every_job() {
    let h = Harness::with_access(secured().grant_build("*", "dev")).await;
    let (gate, _context) = h.open(DeployStep::new("Release?")).await;
    assert!(gate.pre_submission_check(&user("dev")).await.is_ok());
}

#[tokio::test]
async fn test_admin_overrides_submitter() {
    let h = Harness::with_access(secured().with_admin("root")).await;
    let step = DeployStep::new("Release?").with_submitter("alice");
    let (gate, _context) = h.open(step).await;

    assert!(gate.pre_submission_check(&user("root")).await.is_ok());
}

#[tokio::test]
async fn test_unsecured_allows_anyone() {
    let h = Harness::new().await;
    let step = DeployStep::new("Release?").with_submitter("alice");
    let (gate, _context) = h.open(step).await;

    assert!(gate.pre_submission_check(&user("anyone")).await.is_ok());
}

#[tokio::test]
async fn test_system_stop_bypasses_checks() {
    let h = Harness::with_access(secured()).await;
    let step = DeployStep::new("Release?").with_submitter("alice");
    let (gate, context) = h.open(step).await;

    gate.stop("aborted by engine").await.unwrap();
    let failure = resumed_failure(&context).await;
    assert_eq!(failure.cause.short_description(), "Stopped: aborted by engine");
}

#[tokio::test]
async fn test_confirm_needs_no_permission() {
    let h = Harness::with_access(secured().grant_build(JOB, "alice")).await;
    h.accept_deploys(1).await;

    let (gate, _context) = h.open(DeployStep::new("Release?")).await;
    gate.submit_for_deploy(&user("alice"), deploy_params())
        .await
        .unwrap();

    let state = gate
        .confirm_success(&user("deploy-bot"), None)
        .await
        .unwrap();
    assert_eq!(state, GateState::Deployed);
}

#[tokio::test]
async fn test_in_flight_failure_needs_deployer() {
    let access = secured()
        .grant_cancel(JOB, "ops")
        .with_deployer("deploy-bots");
    let h = Harness::with_access(access).await;
    h.accept_deploys(1).await;

    let step = DeployStep::new("Release?").with_submitter("alice");
    let (gate, context) = h.open(step).await;
    gate.submit_for_deploy(&user("alice"), deploy_params())
        .await
        .unwrap();

    let ops = user("ops");
    assert!(matches!(
        gate.abort(&ops, None, true).await,
        Err(GateError::ReleaseInFlight(_))
    ));
    let err = gate.report_failure(&ops, None).await.unwrap_err();
    match err {
        GateError::PermissionDenied(message) => assert!(message.contains("deployment system")),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(matches!(
        gate.report_failure(&user("alice"), None).await,
        Err(GateError::PermissionDenied(_))
    ));
    assert_eq!(gate.state().await, GateState::Submitted);
    assert_eq!(context.resume_count(), 0);

    let bot = Principal::new("ci").with_authorities(["deploy-bots"]);
    assert_eq!(
        gate.report_failure(&bot, None).await.unwrap(),
        GateState::Aborted
    );
    resumed_failure(&context).await;
}
