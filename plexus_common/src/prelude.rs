//! Prelude module for common re-exports.
//!
//! ```rust
//! use plexus_common::prelude::*;
//! ```

// ─── Addressing ─────────────────────────────────────────────────────
pub use crate::address::{Address, AddressError, MatchPolicy};
pub use crate::interface::{AccessMode, DataMode};

// ─── Messages & Queues ──────────────────────────────────────────────
pub use crate::message::{Header, Message, MsgSelector, MsgType, Timestamp, match_message};
pub use crate::queue::{Discipline, MessageQueue, PushOutcome, QueueError, QueueHandle, QueueId};

// ─── Wire ───────────────────────────────────────────────────────────
pub use crate::wire::{Payload, ProtocolError};

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel, ServerSection};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE};
