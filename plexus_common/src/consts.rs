//! System-wide constants for the Plexus workspace.
//!
//! Single source of truth for all numeric limits and protocol defaults.
//! Imported by both crates; values are never redefined locally.

use static_assertions::const_assert;

/// Default TCP port the server listens on.
pub const DEFAULT_PORT: u16 = 6665;

/// Largest frame (header + payload) the server will send or receive.
pub const MAX_MESSAGE_SIZE: usize = 8192;

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 26;

/// Largest payload that fits in a single frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - FRAME_HEADER_LEN;

/// Default bound of every message queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Length of the identification banner sent on connect (NUL padded).
pub const IDENT_LEN: usize = 32;

/// Banner prefix; the crate version is appended.
pub const IDENT_PREFIX: &str = "Plexus v";

/// Length of the fixed driver-name field in device-access replies.
pub const DRIVER_NAME_LEN: usize = 32;

/// Maximum number of addresses returned by a device-list request.
pub const MAX_DEVICES: usize = 256;

/// Maximum sonar ranges / poses in one message.
pub const MAX_SONAR_SAMPLES: usize = 32;

/// Maximum laser ranges in one scan.
pub const MAX_LASER_SAMPLES: usize = 401;

/// Maximum number of digital I/O lines in one message.
pub const MAX_DIO_LINES: u8 = 32;

const_assert!(FRAME_HEADER_LEN < MAX_MESSAGE_SIZE);
// A full laser scan must fit: 8 bytes of fixed fields + 3 bytes per sample.
const_assert!(8 + MAX_LASER_SAMPLES * 3 <= MAX_PAYLOAD_SIZE);
// A full device list must fit: count + 10 bytes per address.
const_assert!(2 + MAX_DEVICES * 10 <= MAX_PAYLOAD_SIZE);
