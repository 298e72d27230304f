//! Plexus Common Library
//!
//! Shared types for the Plexus device server: addressing, the message
//! envelope, per-consumer queues, the network wire codec and
//! configuration loading.
//!
//! # Module Structure
//!
//! - [`address`] - Device addresses and the address-matching policy
//! - [`interface`] - Interface codes, subtypes and access modes
//! - [`message`] - Message header, envelope and the match predicate
//! - [`queue`] - Bounded overwrite / FIFO message queues
//! - [`wire`] - Big-endian frame and payload codec
//! - [`config`] - Configuration loading traits and types
//! - [`consts`] - Protocol limits and defaults
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use plexus_common::prelude::*;
//!
//! let addr: Address = "laser:0".parse().unwrap();
//! let queue = QueueHandle::new(DEFAULT_QUEUE_CAPACITY, Discipline::Fifo);
//! let msg = Message::new(Header::new(addr, MsgType::Data, 1), Payload::Empty);
//! queue.push(msg).unwrap();
//! assert_eq!(queue.len(), 1);
//! ```

pub mod address;
pub mod config;
pub mod consts;
pub mod interface;
pub mod message;
pub mod prelude;
pub mod queue;
pub mod wire;
