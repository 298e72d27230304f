//! Dummy driver.
//!
//! Publishes canned data for every address it provides, at a fixed rate,
//! without touching any hardware. Position commands are integrated into
//! the published odometry so clients can see their commands take effect.

use plexus_common::address::Address;
use plexus_common::interface::{self, DIO, LASER, POSITION, POWER, SONAR, position, sonar};
use plexus_common::message::{Message, MsgType};
use plexus_common::wire::Payload;
use plexus_common::wire::payload::{
    DioValues, LaserData, PositionCmd, PositionData, PositionGeom, PowerData, SonarData, SonarGeom,
};
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::driver::{Driver, DriverContext, DriverError, DriverSpec};

/// Default publish rate in Hz.
pub const DEFAULT_RATE_HZ: f64 = 10.0;

const SONAR_COUNT: usize = 16;
const LASER_SAMPLES: usize = 181;

/// `pos + speed * ms / 1000` without overflow.
fn travel(pos: i32, speed: i32, ms: i64) -> i64 {
    i64::from(pos).saturating_add(i64::from(speed).saturating_mul(ms) / 1000)
}

fn saturate(v: i64) -> i32 {
    v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Canned-data driver.
pub struct DummyDriver {
    period: Duration,
    tick: u64,
    odometry: PositionData,
    /// Latest position command.
    command: PositionCmd,
    motors: bool,
    sonar_on: bool,
    /// Latest digital output command, echoed back as input.
    dio: DioValues,
}

impl DummyDriver {
    /// Create a dummy publishing at `rate_hz`.
    pub fn new(rate_hz: f64) -> Result<Self, DriverError> {
        if !(rate_hz > 0.0 && rate_hz <= 1000.0) {
            return Err(DriverError::Config(format!(
                "rate must be in (0, 1000] Hz, got {rate_hz}"
            )));
        }
        let period = Duration::try_from_secs_f64(1.0 / rate_hz)
            .map_err(|e| DriverError::Config(format!("rate {rate_hz} Hz: {e}")))?;
        Ok(Self {
            period,
            tick: 0,
            odometry: PositionData::default(),
            command: PositionCmd::default(),
            motors: false,
            sonar_on: true,
            dio: DioValues { count: 8, bits: 0 },
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn integrate(&mut self) {
        if !self.motors {
            self.odometry.xspeed = 0;
            self.odometry.yspeed = 0;
            self.odometry.yawspeed = 0;
            return;
        }
        let ms = i64::try_from(self.period.as_millis()).unwrap_or(i64::MAX);
        let cmd = self.command;
        self.odometry.xspeed = cmd.xspeed;
        self.odometry.yspeed = cmd.yspeed;
        self.odometry.yawspeed = cmd.yawspeed;
        self.odometry.x = saturate(travel(self.odometry.x, cmd.xspeed, ms));
        self.odometry.y = saturate(travel(self.odometry.y, cmd.yspeed, ms));
        // rem_euclid(360) always fits in i32.
        self.odometry.yaw = travel(self.odometry.yaw, cmd.yawspeed, ms).rem_euclid(360) as i32;
    }

    /// Canned data for one address, if its interface publishes any.
    fn sample(&self, addr: &Address) -> Option<(u8, Payload)> {
        let wobble = (self.tick % 10) as u16;
        match addr.interf {
            POWER => Some((
                interface::power::DATA_STATE,
                Payload::Power(PowerData {
                    charge: 130 - wobble,
                }),
            )),
            POSITION => Some((position::DATA_STATE, Payload::PositionData(self.odometry))),
            SONAR if self.sonar_on => Some((
                sonar::DATA_RANGES,
                Payload::SonarData(SonarData {
                    ranges: (0..SONAR_COUNT as u16)
                        .map(|i| 1000 + 50 * i + 10 * wobble)
                        .collect(),
                }),
            )),
            LASER => Some((
                interface::laser::DATA_SCAN,
                Payload::LaserData(LaserData {
                    min_angle: -9000,
                    max_angle: 9000,
                    resolution: 100,
                    ranges: (0..LASER_SAMPLES as i16)
                        .map(|i| 2000 + (i % 30) * 10 + wobble as i16)
                        .collect(),
                    intensity: vec![0; LASER_SAMPLES],
                }),
            )),
            DIO => Some((interface::dio::DATA_VALUES, Payload::Dio(self.dio))),
            _ => None,
        }
    }

    fn publish_all(&mut self, ctx: &DriverContext) {
        self.tick += 1;
        self.integrate();
        for addr in ctx.addresses() {
            let Some((subtype, payload)) = self.sample(addr) else {
                continue;
            };
            // Full lossless subscriber queues are the subscriber's problem.
            if let Err(e) = ctx.publish(addr, MsgType::Data, subtype, payload) {
                debug!(driver = ctx.name(), addr = %addr, "Publish: {}", e);
            }
        }
    }

    fn sonar_geometry() -> SonarGeom {
        SonarGeom {
            poses: (0..SONAR_COUNT as i16)
                .map(|i| {
                    let yaw = i * (360 / SONAR_COUNT as i16);
                    [0, 0, yaw]
                })
                .collect(),
        }
    }
}

impl Driver for DummyDriver {
    fn name(&self) -> &str {
        "dummy"
    }

    fn setup(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        self.tick = 0;
        self.odometry = PositionData::default();
        self.command = PositionCmd::default();
        info!(
            driver = ctx.name(),
            devices = ctx.addresses().len(),
            period_ms = self.period.as_millis() as u64,
            "Dummy driver set up"
        );
        Ok(())
    }

    fn shutdown(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        info!(driver = ctx.name(), ticks = self.tick, "Dummy driver shut down");
        Ok(())
    }

    fn run(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        while !ctx.is_cancelled() {
            self.process_messages(ctx)?;
            self.publish_all(ctx);
            if !ctx.sleep(self.period) {
                break;
            }
        }
        Ok(())
    }

    fn process_message(&mut self, ctx: &DriverContext, msg: &Message) -> Result<bool, DriverError> {
        let h = &msg.header;
        trace!(driver = ctx.name(), addr = %h.addr, msg_type = %h.msg_type, "Message");

        match (h.addr.interf, h.msg_type, h.subtype, &msg.payload) {
            (POSITION, MsgType::Cmd, position::CMD_STATE, Payload::PositionCmd(cmd)) => {
                self.command = *cmd;
                Ok(true)
            }
            (DIO, MsgType::Cmd, interface::dio::CMD_VALUES, Payload::Dio(values)) => {
                self.dio = *values;
                Ok(true)
            }
            (POSITION, MsgType::Req, position::GET_GEOM, _) => {
                ctx.respond(
                    msg,
                    MsgType::RespAck,
                    Payload::PositionGeom(PositionGeom {
                        pose: [0, 0, 0],
                        size: [500, 400],
                    }),
                );
                Ok(true)
            }
            (POSITION, MsgType::Req, position::MOTOR_POWER, Payload::Toggle(on)) => {
                self.motors = *on != 0;
                debug!(driver = ctx.name(), motors = self.motors, "Motor power");
                ctx.respond(msg, MsgType::RespAck, Payload::Empty);
                Ok(true)
            }
            (POSITION, MsgType::Req, position::RESET_ODOM, _) => {
                self.odometry.x = 0;
                self.odometry.y = 0;
                self.odometry.yaw = 0;
                ctx.respond(msg, MsgType::RespAck, Payload::Empty);
                Ok(true)
            }
            (SONAR, MsgType::Req, sonar::GET_GEOM, _) => {
                ctx.respond(msg, MsgType::RespAck, Payload::SonarGeom(Self::sonar_geometry()));
                Ok(true)
            }
            (SONAR, MsgType::Req, sonar::POWER, Payload::Toggle(on)) => {
                self.sonar_on = *on != 0;
                ctx.respond(msg, MsgType::RespAck, Payload::Empty);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Factory: reads the `rate` option (Hz).
pub fn create_driver(spec: &DriverSpec) -> Result<Box<dyn Driver>, DriverError> {
    let rate = spec.option_f64("rate")?.unwrap_or(DEFAULT_RATE_HZ);
    Ok(Box::new(DummyDriver::new(rate)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_registry::DeviceRegistry;
    use crate::dispatcher::Dispatcher;
    use crate::lifecycle::DriverHandle;
    use plexus_common::address::MatchPolicy;
    use plexus_common::queue::{Discipline, QueueHandle};
    use std::sync::Arc;

    fn running(addrs: &[Address]) -> (Dispatcher, DriverHandle) {
        let registry = Arc::new(DeviceRegistry::new(MatchPolicy::Full));
        let handle = DriverHandle::new(Box::new(DummyDriver::new(100.0).unwrap()), 16);
        for addr in addrs {
            registry.register(*addr, &handle, Discipline::Overwrite).unwrap();
        }
        (Dispatcher::new(registry), handle)
    }

    #[test]
    fn rejects_bad_rate() {
        assert!(DummyDriver::new(0.0).is_err());
        assert!(DummyDriver::new(-1.0).is_err());
        assert!(DummyDriver::new(f64::NAN).is_err());
        assert!(DummyDriver::new(1e-300).is_err());
        assert_eq!(
            DummyDriver::new(20.0).unwrap().period(),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn factory_reads_rate_option() {
        let mut spec = DriverSpec::default();
        spec.options.insert("rate".to_string(), toml::Value::Integer(0));
        assert!(create_driver(&spec).is_err());
        spec.options.insert("rate".to_string(), toml::Value::Float(5.0));
        assert!(create_driver(&spec).is_ok());
    }

    #[test]
    fn publishes_to_subscribers_while_running() {
        let laser = Address::local(LASER, 0);
        let (d, handle) = running(&[laser]);
        let q = QueueHandle::new(4, Discipline::Overwrite);
        d.subscribe(&laser, &q).unwrap();

        let msg = q.pop_blocking(Duration::from_secs(2)).expect("laser data");
        assert_eq!(msg.header.msg_type, MsgType::Data);
        match msg.payload {
            Payload::LaserData(scan) => {
                assert_eq!(scan.ranges.len(), LASER_SAMPLES);
                assert_eq!(scan.intensity.len(), LASER_SAMPLES);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        d.unsubscribe(&laser, &q).unwrap();
        assert!(!handle.is_worker_alive());
    }

    #[test]
    fn answers_requests_and_nacks_unknown() {
        let pos = Address::local(POSITION, 0);
        let (d, _handle) = running(&[pos]);
        let q = QueueHandle::new(8, Discipline::Fifo);
        d.subscribe(&pos, &q).unwrap();

        let geom = d
            .request(&q, &pos, position::GET_GEOM, Payload::Empty, Duration::from_secs(2))
            .unwrap();
        assert_eq!(geom.header.msg_type, MsgType::RespAck);
        assert!(matches!(geom.payload, Payload::PositionGeom(_)));

        let nack = d
            .request(&q, &pos, 77, Payload::Empty, Duration::from_secs(2))
            .unwrap();
        assert_eq!(nack.header.msg_type, MsgType::RespNack);
        assert_eq!(nack.header.subtype, 77);

        d.unsubscribe(&pos, &q).unwrap();
    }

    #[test]
    fn position_command_moves_odometry() {
        let pos = Address::local(POSITION, 0);
        let (d, _handle) = running(&[pos]);
        let q = QueueHandle::new(8, Discipline::Overwrite);
        d.subscribe(&pos, &q).unwrap();

        d.request(&q, &pos, position::MOTOR_POWER, Payload::Toggle(1), Duration::from_secs(2))
            .unwrap();
        d.put_msg(
            &pos,
            MsgType::Cmd,
            position::CMD_STATE,
            Payload::PositionCmd(PositionCmd {
                xspeed: 1000,
                ..Default::default()
            }),
            None,
        )
        .unwrap();

        let moved = (0..200).any(|_| {
            matches!(
                q.pop_blocking(Duration::from_millis(50)),
                Some(Message { payload: Payload::PositionData(p), .. }) if p.x > 0
            )
        });
        assert!(moved, "odometry never advanced");
        d.unsubscribe(&pos, &q).unwrap();
    }

    #[test]
    fn extreme_speeds_saturate_instead_of_overflowing() {
        let mut dummy = DummyDriver::new(1.0).unwrap();
        dummy.motors = true;
        dummy.command = PositionCmd {
            xspeed: i32::MAX,
            yspeed: i32::MIN,
            yawspeed: i32::MAX,
            ..Default::default()
        };
        for _ in 0..4 {
            dummy.integrate();
        }
        assert_eq!(dummy.odometry.x, i32::MAX);
        assert_eq!(dummy.odometry.y, i32::MIN);
        assert!((0..360).contains(&dummy.odometry.yaw));
        assert_eq!(dummy.odometry.xspeed, i32::MAX);

        dummy.command.yawspeed = i32::MIN;
        dummy.integrate();
        assert!((0..360).contains(&dummy.odometry.yaw));
    }
}
