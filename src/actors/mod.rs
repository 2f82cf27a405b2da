//! Actor-based daemon core
//!
//! Each shared structure - the status board, the active-alert set and the
//! locator directory - is owned by exactly one async task. Connection
//! workers and background ticks talk to them through channels, so the
//! exclusive-access discipline is the actor mailbox and no lock is ever
//! held across transport I/O.
//!
//! ## Architecture Overview
//!
//! ```text
//!    TCP listener (one worker per connection)
//!         |  parsed messages
//!         v
//!   +-------------+   ownership check   +--------------+
//!   | BoardActor  | ------------------> | LocatorActor |
//!   | (status     |                     | (directory)  |
//!   |  board)     |                     +--------------+
//!   +------+------+
//!          | broadcast: Transition
//!          v
//!   +-------------+      Notifier hook      +---------------------+
//!   | AlertActor  | ----------------------> | webhook / log sink  |
//!   | (escalation)|   (spawned, off-loop)   +---------------------+
//!   +-------------+
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: each actor has an mpsc command channel for control
//!    messages
//! 2. **Events**: the board publishes color transitions on a broadcast
//!    channel for fan-out
//! 3. **Request/Response**: oneshot channels for synchronous queries
//!
//! Background work (the purple sweep, escalation timers, checkpoint
//! snapshots) runs on the actors' own interval ticks, never inline with
//! connection handling, so a slow notification channel cannot stall
//! ingestion.

pub mod alert;
pub mod board;
pub mod locator;
pub mod messages;
