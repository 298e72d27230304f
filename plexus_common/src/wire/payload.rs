//! Typed payloads and their fixed per-interface layouts.
//!
//! The layout of a payload is a pure function of the frame's
//! `(interface, type, subtype)` key; see [`Layout::for_key`]. Variable
//! arrays are always preceded by an element count, validated against both
//! its bound and the bytes actually present before the array is read.

use super::ProtocolError;
use super::cursor::{Reader, Writer};
use super::frame::{ADDRESS_LEN, read_address, write_address};
use crate::address::Address;
use crate::consts::{
    DRIVER_NAME_LEN, MAX_DEVICES, MAX_DIO_LINES, MAX_LASER_SAMPLES, MAX_PAYLOAD_SIZE,
    MAX_SONAR_SAMPLES,
};
use crate::interface::{self, AccessMode, DataMode, DIO, LASER, OPAQUE, PLAYER, POSITION, POWER, SONAR};
use crate::message::MsgType;

/// Device-access request / reply body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAccess {
    pub addr: Address,
    pub access: AccessMode,
    /// Name of the driver behind the device (replies only).
    pub driver_name: String,
}

/// Driver-info request / reply body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub addr: Address,
    /// Name of the driver behind the device (replies only).
    pub driver_name: String,
}

/// Battery charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerData {
    /// Decivolts.
    pub charge: u16,
}

/// Odometry and velocity (mm, mm/s, degrees, degrees/s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PositionData {
    pub x: i32,
    pub y: i32,
    pub yaw: i32,
    pub xspeed: i32,
    pub yspeed: i32,
    pub yawspeed: i32,
    /// Non-zero when the motors are stalled.
    pub stall: u8,
}

/// Position / velocity setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PositionCmd {
    pub x: i32,
    pub y: i32,
    pub yaw: i32,
    pub xspeed: i32,
    pub yspeed: i32,
    pub yawspeed: i32,
}

/// Robot footprint: pose of the centre (mm, mm, deg) and size (mm).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PositionGeom {
    pub pose: [i16; 3],
    pub size: [u16; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SonarData {
    /// Ranges in mm, one per transducer.
    pub ranges: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SonarGeom {
    /// Transducer poses (mm, mm, deg).
    pub poses: Vec<[i16; 3]>,
}

/// One laser scan. `ranges` and `intensity` always have equal length.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LaserData {
    /// Start angle, hundredths of a degree.
    pub min_angle: i16,
    /// End angle, hundredths of a degree.
    pub max_angle: i16,
    /// Angular resolution, hundredths of a degree.
    pub resolution: u16,
    pub ranges: Vec<i16>,
    pub intensity: Vec<u8>,
}

/// Digital I/O lines packed into one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DioValues {
    /// Number of valid lines (bits) in `bits`.
    pub count: u8,
    pub bits: u32,
}

/// Message body. Owned, so every queue receives its own copy.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Empty,
    DeviceList(Vec<Address>),
    DeviceAccess(DeviceAccess),
    DriverInfo(DriverInfo),
    DataMode(DataMode),
    Power(PowerData),
    PositionData(PositionData),
    PositionCmd(PositionCmd),
    PositionGeom(PositionGeom),
    /// Single on/off byte (motor power, sonar power).
    Toggle(u8),
    SonarData(SonarData),
    SonarGeom(SonarGeom),
    LaserData(LaserData),
    Dio(DioValues),
    /// Uninterpreted bytes.
    Opaque(Vec<u8>),
}

/// Layout tag: which [`Payload`] variant a key carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Empty,
    DeviceList,
    DeviceAccess,
    DriverInfo,
    DataMode,
    Power,
    PositionData,
    PositionCmd,
    PositionGeom,
    Toggle,
    SonarData,
    SonarGeom,
    LaserData,
    Dio,
    Opaque,
}

impl Layout {
    /// Layout for a key.
    ///
    /// RESP_NACK and SYNCH may always carry an empty body; `empty_body`
    /// selects that case.
    pub fn for_key(interf: u16, msg_type: MsgType, subtype: u8, empty_body: bool) -> Option<Self> {
        use MsgType::{Cmd, Data, Req, RespAck, RespNack, Synch};
        use interface::{player, position, sonar};

        if empty_body && matches!(msg_type, RespNack | Synch) {
            return Some(Self::Empty);
        }

        let layout = match (interf, msg_type, subtype) {
            (OPAQUE, _, _) => Self::Opaque,

            (PLAYER, Req, player::DEVLIST) => Self::Empty,
            (PLAYER, RespAck, player::DEVLIST) => Self::DeviceList,
            (PLAYER, Req | RespAck, player::DRIVERINFO) => Self::DriverInfo,
            (PLAYER, Req | RespAck | RespNack, player::DEV) => Self::DeviceAccess,
            (PLAYER, Req | RespAck, player::DATA) => Self::Empty,
            (PLAYER, Req, player::DATAMODE) => Self::DataMode,
            (PLAYER, RespAck, player::DATAMODE) => Self::Empty,
            (PLAYER, Synch, _) => Self::Empty,

            (POWER, Data, interface::power::DATA_STATE) => Self::Power,

            (POSITION, Data, position::DATA_STATE) => Self::PositionData,
            (POSITION, Cmd, position::CMD_STATE) => Self::PositionCmd,
            (POSITION, Req, position::GET_GEOM) => Self::Empty,
            (POSITION, RespAck, position::GET_GEOM) => Self::PositionGeom,
            (POSITION, Req, position::MOTOR_POWER) => Self::Toggle,
            (POSITION, RespAck, position::MOTOR_POWER) => Self::Empty,
            (POSITION, Req | RespAck, position::RESET_ODOM) => Self::Empty,

            (SONAR, Data, sonar::DATA_RANGES) => Self::SonarData,
            (SONAR, Req, sonar::GET_GEOM) => Self::Empty,
            (SONAR, RespAck, sonar::GET_GEOM) => Self::SonarGeom,
            (SONAR, Req, sonar::POWER) => Self::Toggle,
            (SONAR, RespAck, sonar::POWER) => Self::Empty,

            (LASER, Data, interface::laser::DATA_SCAN) => Self::LaserData,

            (DIO, Data, interface::dio::DATA_VALUES) => Self::Dio,
            (DIO, Cmd, interface::dio::CMD_VALUES) => Self::Dio,

            _ => return None,
        };
        Some(layout)
    }
}

impl Payload {
    /// Layout tag of this value.
    pub fn layout(&self) -> Layout {
        match self {
            Self::Empty => Layout::Empty,
            Self::DeviceList(_) => Layout::DeviceList,
            Self::DeviceAccess(_) => Layout::DeviceAccess,
            Self::DriverInfo(_) => Layout::DriverInfo,
            Self::DataMode(_) => Layout::DataMode,
            Self::Power(_) => Layout::Power,
            Self::PositionData(_) => Layout::PositionData,
            Self::PositionCmd(_) => Layout::PositionCmd,
            Self::PositionGeom(_) => Layout::PositionGeom,
            Self::Toggle(_) => Layout::Toggle,
            Self::SonarData(_) => Layout::SonarData,
            Self::SonarGeom(_) => Layout::SonarGeom,
            Self::LaserData(_) => Layout::LaserData,
            Self::Dio(_) => Layout::Dio,
            Self::Opaque(_) => Layout::Opaque,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Exact encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::DeviceList(list) => 2 + list.len() * ADDRESS_LEN,
            Self::DeviceAccess(_) => ADDRESS_LEN + 1 + DRIVER_NAME_LEN,
            Self::DriverInfo(_) => ADDRESS_LEN + DRIVER_NAME_LEN,
            Self::DataMode(_) => 4,
            Self::Power(_) => 2,
            Self::PositionData(_) => 6 * 4 + 1,
            Self::PositionCmd(_) => 6 * 4,
            Self::PositionGeom(_) => 3 * 2 + 2 * 2,
            Self::Toggle(_) => 1,
            Self::SonarData(d) => 2 + d.ranges.len() * 2,
            Self::SonarGeom(g) => 2 + g.poses.len() * 6,
            Self::LaserData(l) => 8 + l.ranges.len() * 3,
            Self::Dio(_) => 1 + 4,
            Self::Opaque(b) => 4 + b.len(),
        }
    }

    /// Append the body. Array bounds are checked so that every encoded
    /// body also decodes.
    pub fn write(&self, w: &mut Writer) -> Result<(), ProtocolError> {
        match self {
            Self::Empty => {}
            Self::DeviceList(list) => {
                check_count(list.len(), MAX_DEVICES)?;
                w.put_u16(list.len() as u16);
                for addr in list {
                    write_address(w, addr);
                }
            }
            Self::DeviceAccess(d) => {
                write_address(w, &d.addr);
                w.put_u8(d.access.as_byte());
                w.put_fixed_str(&d.driver_name, DRIVER_NAME_LEN);
            }
            Self::DriverInfo(d) => {
                write_address(w, &d.addr);
                w.put_fixed_str(&d.driver_name, DRIVER_NAME_LEN);
            }
            Self::DataMode(mode) => w.put_u32(mode.code()),
            Self::Power(p) => w.put_u16(p.charge),
            Self::PositionData(p) => {
                for v in [p.x, p.y, p.yaw, p.xspeed, p.yspeed, p.yawspeed] {
                    w.put_i32(v);
                }
                w.put_u8(p.stall);
            }
            Self::PositionCmd(c) => {
                for v in [c.x, c.y, c.yaw, c.xspeed, c.yspeed, c.yawspeed] {
                    w.put_i32(v);
                }
            }
            Self::PositionGeom(g) => {
                for v in g.pose {
                    w.put_i16(v);
                }
                for v in g.size {
                    w.put_u16(v);
                }
            }
            Self::Toggle(v) => w.put_u8(*v),
            Self::SonarData(d) => {
                check_count(d.ranges.len(), MAX_SONAR_SAMPLES)?;
                w.put_u16(d.ranges.len() as u16);
                for &r in &d.ranges {
                    w.put_u16(r);
                }
            }
            Self::SonarGeom(g) => {
                check_count(g.poses.len(), MAX_SONAR_SAMPLES)?;
                w.put_u16(g.poses.len() as u16);
                for pose in &g.poses {
                    for &v in pose {
                        w.put_i16(v);
                    }
                }
            }
            Self::LaserData(l) => {
                check_count(l.ranges.len(), MAX_LASER_SAMPLES)?;
                if l.intensity.len() != l.ranges.len() {
                    return Err(ProtocolError::LengthMismatch {
                        declared: l.ranges.len(),
                        actual: l.intensity.len(),
                    });
                }
                w.put_i16(l.min_angle);
                w.put_i16(l.max_angle);
                w.put_u16(l.resolution);
                w.put_u16(l.ranges.len() as u16);
                for &r in &l.ranges {
                    w.put_i16(r);
                }
                w.put_bytes(&l.intensity);
            }
            Self::Dio(d) => {
                if d.count > MAX_DIO_LINES {
                    return Err(ProtocolError::CountOutOfRange {
                        count: d.count as usize,
                        max: MAX_DIO_LINES as usize,
                    });
                }
                w.put_u8(d.count);
                w.put_u32(d.bits);
            }
            Self::Opaque(bytes) => {
                check_count(bytes.len(), MAX_PAYLOAD_SIZE - 4)?;
                w.put_u32(bytes.len() as u32);
                w.put_bytes(bytes);
            }
        }
        Ok(())
    }

    /// Decode a body of the given layout. The whole body must be consumed.
    pub fn read(layout: Layout, body: &[u8]) -> Result<Self, ProtocolError> {
        if let Some(size) = fixed_size(layout)
            && body.len() != size
        {
            return Err(ProtocolError::LengthMismatch {
                declared: size,
                actual: body.len(),
            });
        }

        let mut r = Reader::new(body);
        let payload = match layout {
            Layout::Empty => Self::Empty,
            Layout::DeviceList => {
                let count = r.u16()? as usize;
                r.expect_elements(count, ADDRESS_LEN, MAX_DEVICES)?;
                let list = (0..count)
                    .map(|_| read_address(&mut r))
                    .collect::<Result<Vec<_>, _>>()?;
                Self::DeviceList(list)
            }
            Layout::DeviceAccess => {
                let addr = read_address(&mut r)?;
                let raw = r.u8()?;
                let access = AccessMode::from_byte(raw).ok_or(ProtocolError::InvalidValue {
                    field: "access",
                    value: raw as u32,
                })?;
                let driver_name = r.fixed_str(DRIVER_NAME_LEN)?;
                Self::DeviceAccess(DeviceAccess {
                    addr,
                    access,
                    driver_name,
                })
            }
            Layout::DriverInfo => Self::DriverInfo(DriverInfo {
                addr: read_address(&mut r)?,
                driver_name: r.fixed_str(DRIVER_NAME_LEN)?,
            }),
            Layout::DataMode => {
                let raw = r.u32()?;
                let mode = DataMode::from_code(raw).ok_or(ProtocolError::InvalidValue {
                    field: "datamode",
                    value: raw,
                })?;
                Self::DataMode(mode)
            }
            Layout::Power => Self::Power(PowerData { charge: r.u16()? }),
            Layout::PositionData => Self::PositionData(PositionData {
                x: r.i32()?,
                y: r.i32()?,
                yaw: r.i32()?,
                xspeed: r.i32()?,
                yspeed: r.i32()?,
                yawspeed: r.i32()?,
                stall: r.u8()?,
            }),
            Layout::PositionCmd => Self::PositionCmd(PositionCmd {
                x: r.i32()?,
                y: r.i32()?,
                yaw: r.i32()?,
                xspeed: r.i32()?,
                yspeed: r.i32()?,
                yawspeed: r.i32()?,
            }),
            Layout::PositionGeom => Self::PositionGeom(PositionGeom {
                pose: [r.i16()?, r.i16()?, r.i16()?],
                size: [r.u16()?, r.u16()?],
            }),
            Layout::Toggle => Self::Toggle(r.u8()?),
            Layout::SonarData => {
                let count = r.u16()? as usize;
                r.expect_elements(count, 2, MAX_SONAR_SAMPLES)?;
                let ranges = (0..count).map(|_| r.u16()).collect::<Result<_, _>>()?;
                Self::SonarData(SonarData { ranges })
            }
            Layout::SonarGeom => {
                let count = r.u16()? as usize;
                r.expect_elements(count, 6, MAX_SONAR_SAMPLES)?;
                let poses = (0..count)
                    .map(|_| -> Result<[i16; 3], ProtocolError> {
                        Ok([r.i16()?, r.i16()?, r.i16()?])
                    })
                    .collect::<Result<_, _>>()?;
                Self::SonarGeom(SonarGeom { poses })
            }
            Layout::LaserData => {
                let min_angle = r.i16()?;
                let max_angle = r.i16()?;
                let resolution = r.u16()?;
                let count = r.u16()? as usize;
                r.expect_elements(count, 3, MAX_LASER_SAMPLES)?;
                let ranges = (0..count).map(|_| r.i16()).collect::<Result<_, _>>()?;
                let intensity = r.bytes(count)?.to_vec();
                Self::LaserData(LaserData {
                    min_angle,
                    max_angle,
                    resolution,
                    ranges,
                    intensity,
                })
            }
            Layout::Dio => {
                let count = r.u8()?;
                if count > MAX_DIO_LINES {
                    return Err(ProtocolError::CountOutOfRange {
                        count: count as usize,
                        max: MAX_DIO_LINES as usize,
                    });
                }
                Self::Dio(DioValues {
                    count,
                    bits: r.u32()?,
                })
            }
            Layout::Opaque => {
                let count = r.u32()? as usize;
                r.expect_elements(count, 1, MAX_PAYLOAD_SIZE - 4)?;
                Self::Opaque(r.bytes(count)?.to_vec())
            }
        };
        r.finish()?;
        Ok(payload)
    }
}

fn check_count(count: usize, max: usize) -> Result<(), ProtocolError> {
    if count > max {
        return Err(ProtocolError::CountOutOfRange { count, max });
    }
    Ok(())
}

fn fixed_size(layout: Layout) -> Option<usize> {
    match layout {
        Layout::Empty => Some(0),
        Layout::DeviceAccess => Some(ADDRESS_LEN + 1 + DRIVER_NAME_LEN),
        Layout::DriverInfo => Some(ADDRESS_LEN + DRIVER_NAME_LEN),
        Layout::DataMode => Some(4),
        Layout::Power => Some(2),
        Layout::PositionData => Some(25),
        Layout::PositionCmd => Some(24),
        Layout::PositionGeom => Some(10),
        Layout::Toggle => Some(1),
        Layout::Dio => Some(5),
        Layout::DeviceList
        | Layout::SonarData
        | Layout::SonarGeom
        | Layout::LaserData
        | Layout::Opaque => None,
    }
}
