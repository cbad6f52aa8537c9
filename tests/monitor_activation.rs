use std::sync::Arc;
use std::time::Duration;

use copyforge::config::Config;
use copyforge::credits::CreditsMonitor;
use copyforge::http::ApiClient;
use httpmock::{
    Method::{GET, POST},
    MockServer,
};
use serde_json::json;

fn client_with(base_url: &str, token: Option<&str>) -> Arc<ApiClient> {
    let cfg = Config {
        token: token.map(str::to_string),
        api_url: base_url.to_string(),
        credits_path: "/user/credits".into(),
        user_agent: "copyforge-tests".into(),
        timeout_secs: 5,
    };
    Arc::new(ApiClient::new(cfg).unwrap())
}

async fn wait_for_hits(mock: &httpmock::Mock<'_>, want: usize) {
    for _ in 0..100 {
        if mock.hits_async().await >= want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn double_activation_observes_each_call_once() {
    let server = MockServer::start_async().await;
    let credits = server
        .mock_async(|when, then| {
            when.method(GET).path("/user/credits");
            then.status(200)
                .json_body(json!({ "trial_remaining": 1, "real_remaining": 0 }));
        })
        .await;
    let _tool = server
        .mock_async(|when, then| {
            when.method(POST).path("/tools/ad/generate");
            then.status(200).json_body(json!({ "type": "success" }));
        })
        .await;

    let client = client_with(&server.base_url(), Some("tok"));
    let monitor = CreditsMonitor::new(Arc::clone(&client));
    monitor.activate();
    monitor.activate();
    assert!(monitor.is_active());

    client
        .post_json("/tools/ad/generate", &json!({}))
        .await
        .unwrap();

    // One pre-refresh and one post-refresh, not two of each.
    wait_for_hits(&credits, 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(credits.hits_async().await, 2);
}

#[tokio::test]
async fn deactivation_restores_plain_dispatch() {
    let server = MockServer::start_async().await;
    let credits = server
        .mock_async(|when, then| {
            when.method(GET).path("/user/credits");
            then.status(200).json_body(json!({}));
        })
        .await;
    let _tool = server
        .mock_async(|when, then| {
            when.method(POST).path("/tools/ad/generate");
            then.status(402).body("no");
        })
        .await;

    let client = client_with(&server.base_url(), Some("tok"));
    let monitor = CreditsMonitor::new(Arc::clone(&client));
    monitor.activate();
    monitor.deactivate();
    assert!(!monitor.is_active());

    let resp = client
        .post_json("/tools/ad/generate", &json!({}))
        .await
        .unwrap();
    assert_eq!(resp.status.as_u16(), 402);

    // No refresh was scheduled and the 402 was not classified.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(credits.hits_async().await, 0);
    assert!(!monitor.gate().visible);
}

#[tokio::test]
async fn deactivate_without_activate_is_a_noop() {
    let server = MockServer::start_async().await;
    let client = client_with(&server.base_url(), Some("tok"));
    let monitor = CreditsMonitor::new(Arc::clone(&client));

    assert!(!monitor.is_active());
    monitor.deactivate();
    assert!(!monitor.is_active());

    monitor.activate();
    assert!(monitor.is_active());
}

#[tokio::test]
async fn start_without_token_skips_initial_fetch() {
    let server = MockServer::start_async().await;
    let credits = server
        .mock_async(|when, then| {
            when.method(GET).path("/user/credits");
            then.status(200)
                .json_body(json!({ "trial_remaining": 4, "real_remaining": 1 }));
        })
        .await;

    let client = client_with(&server.base_url(), None);
    let monitor = CreditsMonitor::new(Arc::clone(&client));
    monitor.start().await;

    assert!(monitor.is_active());
    assert_eq!(credits.hits_async().await, 0);
    assert_eq!(monitor.credits().trial_remaining, 0);
}

#[tokio::test]
async fn start_with_token_fetches_balances() {
    let server = MockServer::start_async().await;
    let credits = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/user/credits")
                .header("authorization", "Bearer tok");
            then.status(200)
                .json_body(json!({ "trial_remaining": 4, "real_remaining": 1 }));
        })
        .await;

    let client = client_with(&server.base_url(), Some("tok"));
    let monitor = CreditsMonitor::new(Arc::clone(&client));
    monitor.start().await;

    assert_eq!(credits.hits_async().await, 1);
    let balance = monitor.credits();
    assert_eq!(balance.trial_remaining, 4);
    assert_eq!(balance.real_remaining, 1);
    assert!(balance.is_free_trial);
}
