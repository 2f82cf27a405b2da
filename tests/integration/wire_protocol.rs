//! Wire-level tests against a real TCP listener.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use watchpost::Color;
use watchpost::actors::alert::AlertHandle;
use watchpost::actors::board::BoardHandle;
use watchpost::actors::locator::LocatorHandle;
use watchpost::board::Board;
use watchpost::locator::{Locator, LocatorMode};
use watchpost::server::{ServerContext, run_listener};

use crate::helpers::{RecordingNotifier, engine_with, log_recipient, rule_with};

struct TestServer {
    addr: SocketAddr,
    ctx: ServerContext,
}

async fn spawn_server() -> TestServer {
    let board = BoardHandle::spawn(Board::new([], 30, true), None);
    let notifier = RecordingNotifier::new();
    let engine = engine_with(vec![rule_with(None, vec![log_recipient("oncall", 30)])]);
    let alerts = AlertHandle::spawn(engine, notifier, board.subscribe(), None);
    let locator = LocatorHandle::spawn(Locator::new(LocatorMode::Distributed), None);

    let ctx = ServerContext {
        board,
        alert: Some(alerts),
        locator: Some(locator),
        read_timeout: Duration::from_secs(2),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_listener(listener, ctx.clone()));

    TestServer { addr, ctx }
}

/// One-shot exchange: send a message, close the write side, read the
/// whole response.
async fn exchange(addr: SocketAddr, message: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(message.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response.trim_end().to_string()
}

#[tokio::test]
async fn status_then_query_round_trip() {
    let server = spawn_server().await;

    assert_eq!(exchange(server.addr, "status web1.cpu red load 48").await, "");
    time::sleep(Duration::from_millis(30)).await;

    let response = exchange(server.addr, "query web1.cpu").await;
    assert_eq!(response, "red load 48");

    let view = server.ctx.board.query("web1", "cpu").await.unwrap();
    assert_eq!(view.color, Color::Red);
}

#[tokio::test]
async fn malformed_message_keeps_the_connection_open() {
    let server = spawn_server().await;

    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // first message is garbage: terse rejection, connection survives
    write_half.write_all(b"frobnicate web1\n\n").await.unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("ERROR"));

    // the same connection still accepts a valid submission and query
    write_half
        .write_all(b"status web1.disk yellow 85% full\n\nquery web1.disk\n\n")
        .await
        .unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line.trim_end(), "yellow 85% full");
}

#[tokio::test]
async fn combo_submits_a_batch() {
    let server = spawn_server().await;

    exchange(
        server.addr,
        "combo\nstatus web1.cpu green ok\nstatus web1.disk yellow 85% full\nstatus db1.conn red down",
    )
    .await;
    time::sleep(Duration::from_millis(30)).await;

    assert_eq!(exchange(server.addr, "query web1.disk").await, "yellow 85% full");
    assert_eq!(exchange(server.addr, "query db1.conn").await, "red down");
}

#[tokio::test]
async fn ack_command_acknowledges_both_board_and_alert() {
    let server = spawn_server().await;

    exchange(server.addr, "status db1.cpu red load 48").await;
    time::sleep(Duration::from_millis(30)).await;

    let response = exchange(server.addr, "ack db1.cpu 30 oncall looking into it").await;
    assert_eq!(response, "OK");
    time::sleep(Duration::from_millis(30)).await;

    let view = server.ctx.board.query("db1", "cpu").await.unwrap();
    assert!(view.acked);

    let alert = server
        .ctx
        .alert
        .as_ref()
        .unwrap()
        .get_alert("db1", "cpu")
        .await
        .unwrap();
    assert_eq!(alert.state, watchpost::alert::AlertState::Acked);
}

#[tokio::test]
async fn board_dump_lists_all_records() {
    let server = spawn_server().await;

    exchange(server.addr, "status web1.cpu green ok").await;
    exchange(server.addr, "status db1.conn red down").await;
    time::sleep(Duration::from_millis(30)).await;

    let dump = exchange(server.addr, "board").await;
    assert!(dump.contains("db1|conn|red|"));
    assert!(dump.contains("web1|cpu|green|"));
}

#[tokio::test]
async fn client_payload_is_stored() {
    let server = spawn_server().await;

    exchange(server.addr, "client db1.linux\n[df]\n/dev/sda1 72%").await;
    time::sleep(Duration::from_millis(30)).await;

    // stored but not a status record
    let snapshot = server.ctx.board.snapshot().await.unwrap();
    assert!(snapshot.rows.is_empty());
}

#[tokio::test]
async fn locator_protocol_over_the_wire() {
    let server = spawn_server().await;

    assert_eq!(
        exchange(server.addr, "locator register|hub-1|graph|2|1").await,
        "OK"
    );
    assert_eq!(
        exchange(server.addr, "locator query|graph|web1").await,
        "*|hub-1"
    );
    // second query: the sticky assignment is pinned now
    assert_eq!(
        exchange(server.addr, "locator query|graph|web1").await,
        "!|hub-1"
    );
    assert_eq!(
        exchange(server.addr, "locator serverdown|hub-1|graph").await,
        "OK"
    );
    assert_eq!(exchange(server.addr, "locator query|graph|web1").await, "?");
    assert_eq!(
        exchange(server.addr, "locator serverup|hub-1|graph").await,
        "OK"
    );
    assert_eq!(
        exchange(server.addr, "locator query|graph|web1").await,
        "!|hub-1"
    );
}

#[tokio::test]
async fn ping_reports_the_version() {
    let server = spawn_server().await;
    let response = exchange(server.addr, "ping").await;
    assert!(response.starts_with("watchpost "));
}

#[tokio::test]
async fn commafied_hostnames_arrive_intact() {
    let server = spawn_server().await;

    exchange(server.addr, "status www,example,com.http red connection refused").await;
    time::sleep(Duration::from_millis(30)).await;

    let view = server.ctx.board.query("www.example.com", "http").await.unwrap();
    assert_eq!(view.color, Color::Red);
}
