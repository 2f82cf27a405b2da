//! End-to-end escalation scenarios driven with explicit clocks.

use chrono::Duration;
use pretty_assertions::assert_eq;

use watchpost::Color;
use watchpost::alert::AlertState;
use watchpost::notify::NotificationKind;

use crate::helpers::{engine_with, log_recipient, report, rule_with, t0, test_board};

fn minutes(m: i64) -> Duration {
    Duration::minutes(m)
}

/// The reference scenario: red at t=0 pages; acked for 30 minutes; a
/// late report after ack expiry resumes escalation at the 35-minute
/// step; recovery at t=40 sends one all-clear and retires the alert.
#[test]
fn red_ack_expiry_recovery_walkthrough() {
    let mut board = test_board(&["db1"]);
    let first_step = rule_with(None, vec![log_recipient("oncall", 10)]);
    let second_step = rule_with(Some(30), vec![log_recipient("manager", 10)]);
    let mut engine = engine_with(vec![first_step, second_step]);

    // t=0: red report, no prior alert
    let transition = board
        .update(&report("db1", "cpu", Color::Red, "load 48"), t0())
        .unwrap()
        .expect("green-to-red must transition");
    let sent = engine.handle_transition(&transition, t0());

    let alert = engine.get("db1", "cpu").unwrap();
    assert_eq!(alert.state, AlertState::Paging);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::Problem);
    assert_eq!(sent[0].target.address(), "oncall");

    // t=0: acknowledged for 30 minutes
    board
        .acknowledge("db1", "cpu", t0() + minutes(30), "on it", "oncall")
        .unwrap();
    engine.acknowledge("db1", "cpu", t0() + minutes(30));
    assert_eq!(engine.get("db1", "cpu").unwrap().state, AlertState::Acked);

    // reminders stay suppressed while the ack holds
    for m in [10, 20, 29] {
        assert!(engine.check_timers(t0() + minutes(m)).is_empty());
    }

    // t=35: a red report arrives; color-stable, so no transition, but the
    // ack has expired and escalation resumes at the 35-minute step
    let refresh = board
        .update(&report("db1", "cpu", Color::Red, "load 51"), t0() + minutes(35))
        .unwrap();
    assert!(refresh.is_none());

    let sent = engine.check_timers(t0() + minutes(35));
    assert_eq!(engine.get("db1", "cpu").unwrap().state, AlertState::Paging);
    let recipients: Vec<_> = sent.iter().map(|n| n.target.address()).collect();
    assert_eq!(recipients, vec!["oncall", "manager"]);
    for n in &sent {
        assert_eq!(n.kind, NotificationKind::Reminder);
    }

    // t=40: green report recovers the problem
    let transition = board
        .update(&report("db1", "cpu", Color::Green, "load 0.4"), t0() + minutes(40))
        .unwrap()
        .expect("red-to-green must transition");
    let sent = engine.handle_transition(&transition, t0() + minutes(40));

    let recoveries: Vec<_> = sent
        .iter()
        .filter(|n| n.kind == NotificationKind::Recovery)
        .collect();
    assert_eq!(recoveries.len(), sent.len());
    assert!(!recoveries.is_empty());
    assert!(engine.get("db1", "cpu").is_none());

    // nothing lingers afterwards
    assert!(engine.check_timers(t0() + minutes(60)).is_empty());
}

/// Staleness idempotence: the record's color is the color of the most
/// recent update, or purple once the validity interval has elapsed.
#[test]
fn staleness_forces_purple_and_pages() {
    let mut board = test_board(&["web1"]);
    let mut engine = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 30)])]);

    board
        .update(&report("web1", "disk", Color::Green, "71%"), t0())
        .unwrap();

    // repeated sweeps before the deadline change nothing
    for m in [5, 15, 29] {
        assert!(board.sweep(t0() + minutes(m)).is_empty());
    }

    let transitions = board.sweep(t0() + minutes(31));
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].new_color, Color::Purple);

    // purple is worse than red for paging purposes
    let sent = engine.handle_transition(&transitions[0], t0() + minutes(31));
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].color, Color::Purple);

    // a fresh report recovers both the record and the alert
    let transition = board
        .update(&report("web1", "disk", Color::Green, "71%"), t0() + minutes(45))
        .unwrap()
        .unwrap();
    assert_eq!(transition.old_color, Color::Purple);
    engine.handle_transition(&transition, t0() + minutes(45));
    assert!(engine.is_empty());
}

/// Escalation monotonicity: reminders track the configured interval with
/// no skipped and no duplicated step, even across an ack window.
#[test]
fn reminder_count_matches_elapsed_steps() {
    let mut engine = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 15)])]);
    let mut board = test_board(&["db1"]);

    let transition = board
        .update(&report("db1", "cpu", Color::Yellow, "load 9"), t0())
        .unwrap()
        .unwrap();
    engine.handle_transition(&transition, t0());

    let mut reminders = 0;
    for m in 1..=65 {
        reminders += engine.check_timers(t0() + minutes(m)).len();
    }
    // 65 minutes with a 15-minute interval: reminders at 15/30/45/60
    assert_eq!(reminders, 4);
}

/// A yellow-to-red severity bump keeps the same alert instance; only a
/// full recovery and reoccurrence mints a new cookie.
#[test]
fn severity_bump_keeps_cookie_flap_does_not() {
    let mut board = test_board(&["db1"]);
    let mut engine = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 30)])]);

    let up = board
        .update(&report("db1", "cpu", Color::Yellow, "load 9"), t0())
        .unwrap()
        .unwrap();
    engine.handle_transition(&up, t0());
    let first_cookie = engine.get("db1", "cpu").unwrap().cookie;

    let worse = board
        .update(&report("db1", "cpu", Color::Red, "load 40"), t0() + minutes(1))
        .unwrap()
        .unwrap();
    engine.handle_transition(&worse, t0() + minutes(1));
    assert_eq!(engine.get("db1", "cpu").unwrap().cookie, first_cookie);

    let down = board
        .update(&report("db1", "cpu", Color::Green, "ok"), t0() + minutes(2))
        .unwrap()
        .unwrap();
    engine.handle_transition(&down, t0() + minutes(2));

    let again = board
        .update(&report("db1", "cpu", Color::Red, "load 40"), t0() + minutes(3))
        .unwrap()
        .unwrap();
    engine.handle_transition(&again, t0() + minutes(3));
    assert_ne!(engine.get("db1", "cpu").unwrap().cookie, first_cookie);
}
