//! Webhook dispatch behavior, against a mock HTTP endpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use watchpost::Color;
use watchpost::actors::alert::AlertHandle;
use watchpost::actors::board::BoardHandle;
use watchpost::config::NotifyTarget;
use watchpost::notify::{Notification, NotificationKind, Notifier, NotifyError, WebhookDispatcher};

use crate::helpers::{engine_with, report, rule_with, test_board, webhook_recipient};

fn webhook_notification(url: &str) -> Notification {
    Notification {
        host: "db1".to_string(),
        test: "cpu".to_string(),
        color: Color::Red,
        cookie: 7,
        kind: NotificationKind::Problem,
        message: "load 48".to_string(),
        target: NotifyTarget::Webhook {
            url: url.to_string(),
        },
    }
}

#[tokio::test]
async fn webhook_posts_the_notification_payload() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(serde_json::json!({
            "host": "db1",
            "test": "cpu",
            "color": "red",
            "cookie": 7,
            "kind": "problem",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dispatcher = WebhookDispatcher::new();
    let notification = webhook_notification(&format!("{}/hook", mock_server.uri()));
    dispatcher.send(&notification).await.unwrap();
}

#[tokio::test]
async fn rejected_webhook_is_a_delivery_failure() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let dispatcher = WebhookDispatcher::new();
    let notification = webhook_notification(&format!("{}/hook", mock_server.uri()));

    let err = dispatcher.send(&notification).await.unwrap_err();
    assert!(matches!(err, NotifyError::Rejected { status: 500 }));
}

#[tokio::test]
async fn unreachable_webhook_is_a_delivery_failure() {
    let dispatcher = WebhookDispatcher::new();
    // nothing listens on this port
    let notification = webhook_notification("http://127.0.0.1:9/hook");

    let err = dispatcher.send(&notification).await.unwrap_err();
    assert!(matches!(err, NotifyError::Http(_)));
}

#[tokio::test]
async fn one_failing_recipient_does_not_block_the_other() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/good"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let board = BoardHandle::spawn(test_board(&["db1"]), None);
    let engine = engine_with(vec![rule_with(
        None,
        vec![
            webhook_recipient(&format!("{}/bad", mock_server.uri()), 30),
            webhook_recipient(&format!("{}/good", mock_server.uri()), 30),
        ],
    )]);
    let alerts = AlertHandle::spawn(
        engine,
        Arc::new(WebhookDispatcher::new()),
        board.subscribe(),
        None,
    );

    board
        .update(report("db1", "cpu", Color::Red, "load 48"))
        .await
        .unwrap();
    time::sleep(Duration::from_millis(200)).await;

    // mock expectations verify on drop: /good received its POST even
    // though /bad answered 503
    alerts.shutdown().await;
    board.shutdown().await;
}
