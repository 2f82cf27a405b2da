//! The full actor pipeline: ingestion -> board -> broadcast -> alerts.

use std::time::Duration;

use tokio::time;

use watchpost::Color;
use watchpost::actors::alert::AlertHandle;
use watchpost::actors::board::BoardHandle;
use watchpost::alert::AlertState;
use watchpost::notify::NotificationKind;

use crate::helpers::{
    RecordingNotifier, engine_with, log_recipient, report, rule_with, test_board,
};

async fn settle() {
    time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn status_report_flows_through_to_a_page() {
    let board = BoardHandle::spawn(test_board(&["db1"]), None);
    let notifier = RecordingNotifier::new();
    let engine = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 30)])]);
    let alerts = AlertHandle::spawn(engine, notifier.clone(), board.subscribe(), None);

    board
        .update(report("db1", "cpu", Color::Red, "load 48"))
        .await
        .unwrap();
    settle().await;

    let alert = alerts.get_alert("db1", "cpu").await.unwrap();
    assert_eq!(alert.state, AlertState::Paging);

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::Problem);
    assert_eq!(sent[0].host, "db1");

    alerts.shutdown().await;
    board.shutdown().await;
}

#[tokio::test]
async fn refresh_reports_do_not_repage() {
    let board = BoardHandle::spawn(test_board(&["db1"]), None);
    let notifier = RecordingNotifier::new();
    let engine = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 30)])]);
    let alerts = AlertHandle::spawn(engine, notifier.clone(), board.subscribe(), None);

    for _ in 0..5 {
        board
            .update(report("db1", "cpu", Color::Red, "load 48"))
            .await
            .unwrap();
    }
    settle().await;

    // one transition, one page - the four refreshes were color-stable
    assert_eq!(notifier.sent().len(), 1);

    alerts.shutdown().await;
    board.shutdown().await;
}

#[tokio::test]
async fn recovery_flows_through_to_the_all_clear() {
    let board = BoardHandle::spawn(test_board(&["db1"]), None);
    let notifier = RecordingNotifier::new();
    let engine = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 30)])]);
    let alerts = AlertHandle::spawn(engine, notifier.clone(), board.subscribe(), None);

    board
        .update(report("db1", "cpu", Color::Red, "load 48"))
        .await
        .unwrap();
    settle().await;
    board
        .update(report("db1", "cpu", Color::Green, "load 0.3"))
        .await
        .unwrap();
    settle().await;

    assert!(alerts.get_alert("db1", "cpu").await.is_none());

    let sent = notifier.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].kind, NotificationKind::Recovery);
    assert_eq!(sent[1].color, Color::Green);

    alerts.shutdown().await;
    board.shutdown().await;
}

#[tokio::test]
async fn updates_for_different_hosts_are_independent() {
    let board = BoardHandle::spawn(test_board(&["db1", "web1"]), None);
    let notifier = RecordingNotifier::new();
    let engine = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 30)])]);
    let alerts = AlertHandle::spawn(engine, notifier.clone(), board.subscribe(), None);

    // interleave updates from concurrent submitters
    let b1 = board.clone();
    let b2 = board.clone();
    let writer1 = tokio::spawn(async move {
        for _ in 0..10 {
            b1.update(report("db1", "cpu", Color::Red, "load 48")).await.unwrap();
        }
    });
    let writer2 = tokio::spawn(async move {
        for _ in 0..10 {
            b2.update(report("web1", "http", Color::Yellow, "slow")).await.unwrap();
        }
    });
    writer1.await.unwrap();
    writer2.await.unwrap();
    settle().await;

    // exactly one alert per pair, each paged once
    assert!(alerts.get_alert("db1", "cpu").await.is_some());
    assert!(alerts.get_alert("web1", "http").await.is_some());
    assert_eq!(notifier.sent().len(), 2);

    alerts.shutdown().await;
    board.shutdown().await;
}
