use std::sync::Arc;
use std::time::Duration;

use copyforge::config::Config;
use copyforge::http::ApiClient;
use copyforge::subscription::{SubscribeError, SubscriptionFlow};
use httpmock::{
    Method::{GET, POST},
    MockServer,
};
use serde_json::json;

fn flow_for(base_url: &str) -> SubscriptionFlow {
    let cfg = Config {
        token: Some("tok".into()),
        api_url: base_url.to_string(),
        credits_path: "/user/credits".into(),
        user_agent: "copyforge-tests".into(),
        timeout_secs: 5,
    };
    SubscriptionFlow::new(Arc::new(ApiClient::new(cfg).unwrap()))
        .with_poll_interval(Duration::from_millis(20))
}

#[tokio::test]
async fn confirm_then_poll_until_active() {
    let server = MockServer::start_async().await;
    let confirm = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/billing/paypal/confirm")
                .json_body(json!({ "subscription_id": "sub-1" }));
            then.status(200)
                .json_body(json!({ "status": "APPROVAL_PENDING" }));
        })
        .await;
    let poll = server
        .mock_async(|when, then| {
            when.method(GET).path("/billing/subscriptions/sub-1");
            then.status(200).json_body(json!({
                "status": "ACTIVE",
                "plan_id": "plan-pro",
                "next_billing_at": "2026-09-25T00:00:00Z"
            }));
        })
        .await;

    let flow = flow_for(&server.base_url()).with_poll_attempts(3);
    let status = flow.confirm_paypal("sub-1").await.unwrap();

    assert!(status.state.is_active());
    assert_eq!(status.plan_id.as_deref(), Some("plan-pro"));
    assert_eq!(
        status.next_billing_at.as_deref(),
        Some("2026-09-25T00:00:00Z")
    );
    assert_eq!(confirm.hits_async().await, 1);
    assert_eq!(poll.hits_async().await, 1);
    assert!(!flow.in_flight());
}

#[tokio::test]
async fn active_confirm_response_skips_polling() {
    let server = MockServer::start_async().await;
    let _confirm = server
        .mock_async(|when, then| {
            when.method(POST).path("/billing/paypal/confirm");
            then.status(200).json_body(json!({ "status": "ACTIVE" }));
        })
        .await;
    let poll = server
        .mock_async(|when, then| {
            when.method(GET).path("/billing/subscriptions/sub-2");
            then.status(200).json_body(json!({ "status": "ACTIVE" }));
        })
        .await;

    let flow = flow_for(&server.base_url());
    let status = flow.confirm_paypal("sub-2").await.unwrap();

    assert!(status.state.is_active());
    assert_eq!(poll.hits_async().await, 0);
}

#[tokio::test]
async fn still_pending_exhausts_poll_budget() {
    let server = MockServer::start_async().await;
    let _confirm = server
        .mock_async(|when, then| {
            when.method(POST).path("/billing/paypal/confirm");
            then.status(200).json_body(json!({}));
        })
        .await;
    let poll = server
        .mock_async(|when, then| {
            when.method(GET).path("/billing/subscriptions/sub-3");
            then.status(200).json_body(json!({ "status": "PENDING" }));
        })
        .await;

    let flow = flow_for(&server.base_url()).with_poll_attempts(2);
    let err = flow.confirm_paypal("sub-3").await.unwrap_err();

    assert!(matches!(
        err,
        SubscribeError::StillPending { attempts: 2 }
    ));
    assert_eq!(poll.hits_async().await, 2);
    assert!(!flow.in_flight());
}

#[tokio::test]
async fn rejected_confirm_surfaces_server_message() {
    let server = MockServer::start_async().await;
    let _confirm = server
        .mock_async(|when, then| {
            when.method(POST).path("/billing/paypal/confirm");
            then.status(422).json_body(json!({ "message": "bad plan" }));
        })
        .await;

    let flow = flow_for(&server.base_url());
    match flow.confirm_paypal("sub-4").await.unwrap_err() {
        SubscribeError::Rejected(msg) => assert_eq!(msg, "bad plan"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!flow.in_flight());
}

#[tokio::test]
async fn dead_state_rejects_during_poll() {
    let server = MockServer::start_async().await;
    let _confirm = server
        .mock_async(|when, then| {
            when.method(POST).path("/billing/paypal/confirm");
            then.status(200).json_body(json!({ "status": "PENDING" }));
        })
        .await;
    let _poll = server
        .mock_async(|when, then| {
            when.method(GET).path("/billing/subscriptions/sub-5");
            then.status(200).json_body(json!({ "status": "CANCELLED" }));
        })
        .await;

    let flow = flow_for(&server.base_url()).with_poll_attempts(4);
    match flow.confirm_paypal("sub-5").await.unwrap_err() {
        SubscribeError::Rejected(msg) => assert!(msg.contains("Cancelled")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn missing_subscription_keeps_polling() {
    let server = MockServer::start_async().await;
    let _confirm = server
        .mock_async(|when, then| {
            when.method(POST).path("/billing/paypal/confirm");
            then.status(200).json_body(json!({}));
        })
        .await;
    let poll = server
        .mock_async(|when, then| {
            when.method(GET).path("/billing/subscriptions/sub-6");
            then.status(404).json_body(json!({ "message": "not found" }));
        })
        .await;

    // A 404 means the record has not landed yet, not a rejection.
    let flow = flow_for(&server.base_url()).with_poll_attempts(2);
    let err = flow.confirm_paypal("sub-6").await.unwrap_err();

    assert!(matches!(err, SubscribeError::StillPending { .. }));
    assert_eq!(poll.hits_async().await, 2);
}

#[tokio::test]
async fn single_status_read_maps_missing_to_none() {
    let server = MockServer::start_async().await;
    let found = server
        .mock_async(|when, then| {
            when.method(GET).path("/billing/subscriptions/sub-7");
            then.status(200)
                .json_body(json!({ "status": "ACTIVE", "plan_id": "plan-lite" }));
        })
        .await;
    let _missing = server
        .mock_async(|when, then| {
            when.method(GET).path("/billing/subscriptions/sub-gone");
            then.status(404).json_body(json!({ "message": "not found" }));
        })
        .await;

    let flow = flow_for(&server.base_url());

    let status = flow.status("sub-7").await.unwrap().unwrap();
    assert!(status.state.is_active());
    assert_eq!(status.plan_id.as_deref(), Some("plan-lite"));
    assert_eq!(found.hits_async().await, 1);

    assert!(flow.status("sub-gone").await.unwrap().is_none());
}

#[tokio::test]
async fn second_confirm_fails_fast_while_first_in_flight() {
    let server = MockServer::start_async().await;
    let _confirm = server
        .mock_async(|when, then| {
            when.method(POST).path("/billing/paypal/confirm");
            then.status(200)
                .delay(Duration::from_millis(400))
                .json_body(json!({ "status": "ACTIVE" }));
        })
        .await;

    let flow = Arc::new(flow_for(&server.base_url()));
    let first = {
        let flow = Arc::clone(&flow);
        tokio::spawn(async move { flow.confirm_paypal("sub-slow").await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(flow.in_flight());
    let second = flow.confirm_paypal("sub-slow").await;
    assert!(matches!(second, Err(SubscribeError::AlreadyInFlight)));

    let first = first.await.unwrap().unwrap();
    assert!(first.state.is_active());
    assert!(!flow.in_flight());
}
