//! Restart behavior: checkpoints must reproduce the exact alert and
//! locator state.

use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::time;

use watchpost::Color;
use watchpost::actors::alert::{AlertCheckpoint, AlertHandle};
use watchpost::actors::board::BoardHandle;
use watchpost::alert::AlertState;
use watchpost::checkpoint;
use watchpost::locator::{Locator, LocatorMode, ServiceType, Stickiness};
use watchpost::notify::NotificationKind;

use crate::helpers::{
    RecordingNotifier, engine_with, log_recipient, report, rule_with, t0, test_board,
};

#[test]
fn alert_checkpoint_round_trips_every_field() {
    let mut engine = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 10)])]);
    let mut board = test_board(&["db1", "web1", "mail1"]);

    // three alerts in three different states
    for (host, color) in [("db1", Color::Red), ("web1", Color::Yellow), ("mail1", Color::Red)] {
        let transition = board
            .update(&report(host, "cpu", color, "broken"), t0())
            .unwrap()
            .unwrap();
        engine.handle_transition(&transition, t0());
    }
    engine.acknowledge("web1", "cpu", t0() + Duration::minutes(45));

    let saved = engine.save();

    let mut restored = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 10)])]);
    restored.load(&saved).unwrap();

    for host in ["db1", "web1", "mail1"] {
        let before = engine.get(host, "cpu").unwrap();
        let after = restored.get(host, "cpu").unwrap();
        assert_eq!(before.state, after.state);
        assert_eq!(before.cookie, after.cookie);
        assert_eq!(before.next_alert, after.next_alert);
    }

    // a restart must not re-send "new problem" pages
    assert!(restored.check_timers(t0() + Duration::seconds(30)).is_empty());

    // but a pending reminder that came due while the daemon was down
    // fires on the first check
    let due = restored.check_timers(t0() + Duration::minutes(60));
    assert!(!due.is_empty());
    assert!(due.iter().all(|n| n.kind == NotificationKind::Reminder));
}

#[test]
fn recovered_alert_survives_restart_and_sends_the_all_clear() {
    let mut engine = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 10)])]);
    let mut board = test_board(&["db1"]);

    let transition = board
        .update(&report("db1", "cpu", Color::Red, "broken"), t0())
        .unwrap()
        .unwrap();
    engine.handle_transition(&transition, t0());

    // simulate a crash after the recovery was observed but before the
    // notification went out: hand-edit the state to Recovered
    let saved = engine
        .save()
        .replace("|paging|", "|recovered|");

    let mut restored = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 10)])]);
    restored.load(&saved).unwrap();
    assert_eq!(
        restored.get("db1", "cpu").unwrap().state,
        AlertState::Recovered
    );

    let sent = restored.check_timers(t0() + Duration::minutes(1));
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::Recovery);
    assert!(restored.get("db1", "cpu").is_none());
}

#[tokio::test]
async fn alert_actor_writes_and_reloads_its_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alerts.chk");

    // first life: page and checkpoint
    {
        let board = BoardHandle::spawn(test_board(&["db1"]), None);
        let notifier = RecordingNotifier::new();
        let engine = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 30)])]);
        let alerts = AlertHandle::spawn(
            engine,
            notifier,
            board.subscribe(),
            Some(AlertCheckpoint {
                path: path.clone(),
                interval: StdDuration::from_secs(3600),
            }),
        );

        board
            .update(report("db1", "cpu", Color::Red, "load 48"))
            .await
            .unwrap();
        time::sleep(StdDuration::from_millis(30)).await;
        alerts.save_now().await;
        alerts.shutdown().await;
        board.shutdown().await;
    }

    // second life: the alert is back, still paging, same cookie
    let saved = checkpoint::read_if_exists(&path).unwrap().unwrap();
    let mut engine = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 30)])]);
    engine.load(&saved).unwrap();

    let alert = engine.get("db1", "cpu").unwrap();
    assert_eq!(alert.state, AlertState::Paging);
    assert_eq!(alert.cookie, 1);
}

#[test]
fn locator_checkpoint_restores_the_directory() {
    let mut locator = Locator::new(LocatorMode::Distributed);
    locator.register("hub-1", ServiceType::Client, 3, Stickiness::Sticky);
    locator.register("hub-2", ServiceType::Client, 2, Stickiness::Roaming);
    locator.assign("db1", ServiceType::Client).unwrap();
    locator.assign("web1", ServiceType::Client).unwrap();

    let servers = locator.save_servers();
    let hosts = locator.save_hosts();

    let mut restored = Locator::new(LocatorMode::Distributed);
    restored.load_servers(&servers).unwrap();
    restored.load_hosts(&hosts).unwrap();

    for host in ["db1", "web1"] {
        assert_eq!(
            restored.query(host, ServiceType::Client),
            locator.query(host, ServiceType::Client)
        );
    }

    // registrations kept their weights, so rebalancing continues as before
    let before: Vec<_> = locator
        .servers(ServiceType::Client)
        .map(|s| (s.name.clone(), s.conf_weight))
        .collect();
    let after: Vec<_> = restored
        .servers(ServiceType::Client)
        .map(|s| (s.name.clone(), s.conf_weight))
        .collect();
    assert_eq!(before, after);
}

#[test]
fn checkpoint_files_tolerate_a_missing_first_start() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("never-written.chk");
    assert!(checkpoint::read_if_exists(&missing).unwrap().is_none());
}
