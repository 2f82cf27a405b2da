//! The TCP front door.
//!
//! One worker task per inbound connection. Messages are newline-oriented
//! and separated by a blank line (or end of stream); responses for
//! query-type messages go back on the same connection. A malformed
//! message gets a terse rejection and the connection stays open; a stalled
//! client runs into the read timeout and is dropped.

use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, instrument, trace, warn};

use crate::actors::alert::AlertHandle;
use crate::actors::board::BoardHandle;
use crate::actors::locator::{self, LocatorHandle};
use crate::proto::{self, Message};

/// Everything a connection worker needs.
#[derive(Clone)]
pub struct ServerContext {
    pub board: BoardHandle,
    pub alert: Option<AlertHandle>,
    pub locator: Option<LocatorHandle>,
    pub read_timeout: Duration,
}

/// Accept loop. Runs until the listener fails fatally.
pub async fn run_listener(listener: TcpListener, ctx: ServerContext) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                trace!("connection from {peer}");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &ctx).await {
                        debug!("connection from {peer} ended: {e}");
                    }
                });
            }
            Err(e) => {
                // transient accept failures (fd exhaustion etc.) must not
                // kill the daemon
                warn!("accept failed: {e}");
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[instrument(skip_all)]
async fn handle_connection(stream: TcpStream, ctx: &ServerContext) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut chunk = String::new();

    loop {
        let mut line = String::new();
        let read = time::timeout(ctx.read_timeout, reader.read_line(&mut line)).await;

        match read {
            // client too slow: close the connection
            Err(_) => {
                trace!("read timeout, closing connection");
                break;
            }

            Ok(Err(e)) => return Err(e),

            // end of stream: handle whatever is pending, then close
            Ok(Ok(0)) => {
                if !chunk.trim().is_empty() {
                    let response = process_message(&chunk, ctx).await;
                    respond(&mut write_half, response).await?;
                }
                break;
            }

            Ok(Ok(_)) => {
                if line.trim().is_empty() {
                    if !chunk.trim().is_empty() {
                        let response = process_message(&chunk, ctx).await;
                        respond(&mut write_half, response).await?;
                        chunk.clear();
                    }
                } else {
                    chunk.push_str(&line);
                }
            }
        }
    }

    Ok(())
}

async fn respond(write_half: &mut OwnedWriteHalf, response: Option<String>) -> std::io::Result<()> {
    if let Some(mut response) = response {
        if !response.ends_with('\n') {
            response.push('\n');
        }
        write_half.write_all(response.as_bytes()).await?;
        write_half.flush().await?;
    }
    Ok(())
}

/// Parse and dispatch one message. `None` means "no response" (plain
/// status submissions are not acknowledged on the wire).
pub async fn process_message(raw: &str, ctx: &ServerContext) -> Option<String> {
    match proto::parse_message(raw) {
        Ok(message) => dispatch_message(message, ctx).await,
        Err(e) => {
            debug!("rejecting message: {e}");
            Some(format!("ERROR {e}"))
        }
    }
}

async fn dispatch_message(message: Message, ctx: &ServerContext) -> Option<String> {
    match message {
        Message::Status(report) => match ctx.board.update(report).await {
            Ok(()) => None,
            Err(e) => Some(format!("ERROR {e}")),
        },

        Message::Combo(reports) => {
            let mut first_error = None;
            for report in reports {
                if let Err(e) = ctx.board.update(report).await {
                    debug!("combo member rejected: {e}");
                    first_error.get_or_insert_with(|| format!("ERROR {e}"));
                }
            }
            first_error
        }

        Message::Client { host, os, payload } => {
            match ctx.board.client_data(&host, &os, &payload).await {
                Ok(()) => None,
                Err(e) => Some(format!("ERROR {e}")),
            }
        }

        Message::Ack {
            host,
            test,
            minutes,
            message,
            author,
        } => {
            match ctx
                .board
                .acknowledge(&host, &test, minutes, &message, &author)
                .await
            {
                Ok(()) => {
                    if let Some(alert) = &ctx.alert {
                        let until = Utc::now() + chrono::Duration::minutes(minutes as i64);
                        alert.acknowledge(&host, &test, until).await;
                    }
                    Some("OK".to_string())
                }
                Err(e) => Some(format!("ERROR {e}")),
            }
        }

        Message::Drop { host, test } => {
            ctx.board.drop(&host, test.as_deref()).await;
            if let Some(alert) = &ctx.alert {
                alert.drop(&host, test.as_deref()).await;
            }
            Some("OK".to_string())
        }

        Message::Notes { host, text } => match ctx.board.notes(&host, &text).await {
            Ok(()) => Some("OK".to_string()),
            Err(e) => Some(format!("ERROR {e}")),
        },

        Message::Query { host, test } => match ctx.board.query(&host, &test).await {
            Some(view) => Some(format!("{} {}", view.color, view.text)),
            None => Some(format!("ERROR unknown test '{test}' for host '{host}'")),
        },

        Message::Board => {
            let snapshot = ctx.board.snapshot().await?;
            let mut out = String::new();
            for row in snapshot.rows {
                out.push_str(&format!(
                    "{}|{}|{}|{}|{}|{}\n",
                    row.host,
                    row.test,
                    row.color,
                    row.last_change.timestamp(),
                    if row.acked { 1 } else { 0 },
                    row.text,
                ));
            }
            Some(out)
        }

        Message::Locator(request) => match &ctx.locator {
            Some(handle) => Some(locator::handle_request(handle, request).await),
            None => Some("ERROR no locator configured".to_string()),
        },

        Message::Ping => Some(format!("watchpost {}", env!("CARGO_PKG_VERSION"))),
    }
}
