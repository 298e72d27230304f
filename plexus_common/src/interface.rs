//! Interface codes, names, and per-interface message subtypes.
//!
//! An interface is a typed capability (position, laser, power, ...) with a
//! fixed message layout. Codes are carried on the wire in every address;
//! names are used in configuration files (`"laser:0"`).

use std::fmt;

/// The server itself (device list, device access, data delivery).
pub const PLAYER: u16 = 1;
/// Power subsystem.
pub const POWER: u16 = 2;
/// Gripper.
pub const GRIPPER: u16 = 3;
/// Mobile base odometry and velocity control.
pub const POSITION: u16 = 4;
/// Fixed range-finder array.
pub const SONAR: u16 = 5;
/// Scanning range-finder.
pub const LASER: u16 = 6;
/// Pan-tilt-zoom unit.
pub const PTZ: u16 = 8;
/// Digital I/O.
pub const DIO: u16 = 20;
/// Analog I/O.
pub const AIO: u16 = 21;
/// Uninterpreted byte blobs.
pub const OPAQUE: u16 = 51;

const NAMES: &[(u16, &str)] = &[
    (PLAYER, "player"),
    (POWER, "power"),
    (GRIPPER, "gripper"),
    (POSITION, "position"),
    (SONAR, "sonar"),
    (LASER, "laser"),
    (PTZ, "ptz"),
    (DIO, "dio"),
    (AIO, "aio"),
    (OPAQUE, "opaque"),
];

/// Look up an interface code by its configuration name.
pub fn code_of(name: &str) -> Option<u16> {
    NAMES
        .iter()
        .find(|(_, n)| n.eq_ignore_ascii_case(name))
        .map(|(code, _)| *code)
}

/// Look up the configuration name of an interface code.
pub fn name_of(code: u16) -> Option<&'static str> {
    NAMES.iter().find(|(c, _)| *c == code).map(|(_, n)| *n)
}

/// Subtypes of the `player` interface.
pub mod player {
    /// List every bound device address.
    pub const DEVLIST: u8 = 1;
    /// Name of the driver behind one device.
    pub const DRIVERINFO: u8 = 2;
    /// Open / close a device (subscribe / unsubscribe).
    pub const DEV: u8 = 3;
    /// Ask for one round of data (pull modes).
    pub const DATA: u8 = 4;
    /// Change the session's data delivery mode.
    pub const DATAMODE: u8 = 5;
    /// Change the push frequency. Not supported; always refused.
    pub const DATAFREQ: u8 = 6;
}

/// Subtypes shared by the `power` interface.
pub mod power {
    /// Periodic charge reading.
    pub const DATA_STATE: u8 = 1;
}

/// Subtypes of the `position` interface.
pub mod position {
    /// Odometry / velocity state.
    pub const DATA_STATE: u8 = 1;
    /// Velocity / position command.
    pub const CMD_STATE: u8 = 1;
    /// Geometry request.
    pub const GET_GEOM: u8 = 1;
    /// Motor power on/off.
    pub const MOTOR_POWER: u8 = 2;
    /// Reset odometry.
    pub const RESET_ODOM: u8 = 4;
}

/// Subtypes of the `sonar` interface.
pub mod sonar {
    /// Range readings.
    pub const DATA_RANGES: u8 = 1;
    /// Transducer poses.
    pub const GET_GEOM: u8 = 1;
    /// Sonar power on/off.
    pub const POWER: u8 = 2;
}

/// Subtypes of the `laser` interface.
pub mod laser {
    /// One scan.
    pub const DATA_SCAN: u8 = 1;
}

/// Subtypes of the `dio` interface.
pub mod dio {
    /// Input bits.
    pub const DATA_VALUES: u8 = 1;
    /// Output bits.
    pub const CMD_VALUES: u8 = 1;
}

/// Access mode requested when opening a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read (receive data).
    Read,
    /// Write (send commands).
    Write,
    /// Read and write.
    All,
    /// Close (unsubscribe).
    Close,
    /// Returned by the server when access could not be granted.
    Error,
}

impl AccessMode {
    /// Wire byte for this mode.
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Read => b'r',
            Self::Write => b'w',
            Self::All => b'a',
            Self::Close => b'c',
            Self::Error => b'e',
        }
    }

    /// Parse a wire byte. Returns `None` for unknown values.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'r' => Some(Self::Read),
            b'w' => Some(Self::Write),
            b'a' => Some(Self::All),
            b'c' => Some(Self::Close),
            b'e' => Some(Self::Error),
            _ => None,
        }
    }

    /// True for modes that open a subscription.
    pub const fn opens(self) -> bool {
        matches!(self, Self::Read | Self::Write | Self::All)
    }

    /// Data from the device is delivered.
    pub const fn reads(self) -> bool {
        matches!(self, Self::Read | Self::All)
    }

    /// Commands to the device are accepted.
    pub const fn writes(self) -> bool {
        matches!(self, Self::Write | Self::All)
    }
}

/// When a session's queued data is written to the client.
///
/// Every mode except `PushAsync` ends each round of data with a SYNCH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataMode {
    /// Every round carries the latest data of every readable device.
    PushAll,
    /// Like `PushAll`, but a round is only sent when the client asks.
    PullAll,
    /// Every round carries only data not sent before.
    #[default]
    PushNew,
    /// Like `PushNew`, but a round is only sent when the client asks.
    PullNew,
    /// Data is written as it arrives, without rounds.
    PushAsync,
}

impl DataMode {
    /// Wire code for this mode.
    pub const fn code(self) -> u32 {
        match self {
            Self::PushAll => 0,
            Self::PullAll => 1,
            Self::PushNew => 2,
            Self::PullNew => 3,
            Self::PushAsync => 4,
        }
    }

    /// Parse a wire code. Returns `None` for unknown values.
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::PushAll),
            1 => Some(Self::PullAll),
            2 => Some(Self::PushNew),
            3 => Some(Self::PullNew),
            4 => Some(Self::PushAsync),
            _ => None,
        }
    }

    /// Rounds are sent only on a client's DATA request.
    pub const fn is_pull(self) -> bool {
        matches!(self, Self::PullAll | Self::PullNew)
    }

    /// Rounds repeat the latest value of every device.
    pub const fn sends_all(self) -> bool {
        matches!(self, Self::PushAll | Self::PullAll)
    }

    /// Rounds end with a SYNCH frame.
    pub const fn synchs(self) -> bool {
        !matches!(self, Self::PushAsync)
    }
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PushAll => "push-all",
            Self::PullAll => "pull-all",
            Self::PushNew => "push-new",
            Self::PullNew => "pull-new",
            Self::PushAsync => "push-async",
        };
        f.write_str(name)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_byte() as char)
    }
}
