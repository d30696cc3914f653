//! Wire-level byte tags and control-command encoding.
//!
//! The relay carries a raw byte stream; control messages are a single
//! tag byte optionally followed by a one-byte payload. There is no
//! framing beyond that, so the decoder walks the stream byte-wise.
//!
//! ## Wire format
//!
//! ```text
//! PING_REQUEST   0x7F
//! PING_RESPONSE  0x7E
//! STOP           0x65
//! SPEED          0x73  + speed byte (1–24)
//! JOG            0x6A  + direction byte (-1 | +1, two's complement)
//! AXIS           0x61  + axis code (X=0, Y=1, Z=2, A=3)
//! ```

use bytes::Bytes;

use crate::error::MillError;

// ── Tag bytes ────────────────────────────────────────────────────

pub const PING_REQUEST: u8 = 0x7F;
pub const PING_RESPONSE: u8 = 0x7E;
pub const STOP: u8 = 0x65;
pub const SPEED: u8 = 0x73;
pub const JOG: u8 = 0x6A;
pub const AXIS: u8 = 0x61;

/// Relay channel carrying control traffic.
pub const CONTROL_CHANNEL: u32 = 0;
/// Relay channel carrying the raw video byte feed.
pub const VIDEO_CHANNEL: u32 = 1;

/// Inclusive bounds accepted for [`ControlCommand::Speed`].
pub const SPEED_RANGE: std::ops::RangeInclusive<u8> = 1..=24;

// ── Axis ─────────────────────────────────────────────────────────

/// Machine axis selectable on the mill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
    A,
}

impl Axis {
    /// Numeric code sent on the wire.
    pub fn code(self) -> u8 {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::A => 3,
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: u8) -> Result<Self, MillError> {
        match code {
            0 => Ok(Axis::X),
            1 => Ok(Axis::Y),
            2 => Ok(Axis::Z),
            3 => Ok(Axis::A),
            other => Err(MillError::InvalidCommand(format!(
                "unknown axis code: {other}"
            ))),
        }
    }
}

impl std::str::FromStr for Axis {
    type Err = MillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "X" | "x" => Ok(Axis::X),
            "Y" | "y" => Ok(Axis::Y),
            "Z" | "z" => Ok(Axis::Z),
            "A" | "a" => Ok(Axis::A),
            other => Err(MillError::InvalidCommand(format!("unknown axis: {other}"))),
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
            Axis::Z => write!(f, "Z"),
            Axis::A => write!(f, "A"),
        }
    }
}

// ── JogDirection ─────────────────────────────────────────────────

/// Direction of a jog request. Zero is never sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogDirection {
    Negative,
    Positive,
}

impl JogDirection {
    /// Collapse an arbitrary signed magnitude to its sign.
    ///
    /// Returns `None` for zero, which must not be transmitted.
    pub fn from_signum(value: i32) -> Option<Self> {
        match value.signum() {
            1 => Some(JogDirection::Positive),
            -1 => Some(JogDirection::Negative),
            _ => None,
        }
    }

    /// Signed byte sent on the wire.
    pub fn byte(self) -> u8 {
        match self {
            JogDirection::Positive => 1i8 as u8,
            JogDirection::Negative => (-1i8) as u8,
        }
    }
}

// ── ControlCommand ───────────────────────────────────────────────

/// A single outbound control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Halt the mill immediately.
    Stop,
    /// Move the selected axis one step in the given direction.
    Jog(JogDirection),
    /// Set the feed speed level.
    Speed(u8),
    /// Select the active axis.
    SelectAxis(Axis),
}

impl ControlCommand {
    /// Encode to the exact bytes written to the relay.
    ///
    /// Speed values outside [`SPEED_RANGE`] are rejected here so a bad
    /// value never reaches the wire.
    pub fn encode(&self) -> Result<Bytes, MillError> {
        let bytes = match *self {
            ControlCommand::Stop => Bytes::from_static(&[STOP]),
            ControlCommand::Jog(dir) => Bytes::from(vec![JOG, dir.byte()]),
            ControlCommand::Speed(speed) => {
                if !SPEED_RANGE.contains(&speed) {
                    return Err(MillError::InvalidCommand(format!(
                        "speed {speed} outside {}..={}",
                        SPEED_RANGE.start(),
                        SPEED_RANGE.end()
                    )));
                }
                Bytes::from(vec![SPEED, speed])
            }
            ControlCommand::SelectAxis(axis) => Bytes::from(vec![AXIS, axis.code()]),
        };
        Ok(bytes)
    }

    /// Decode one command from the front of `buf`.
    ///
    /// Returns the command and the number of bytes consumed. Used by
    /// test peers and diagnostics; the client itself only encodes.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), MillError> {
        let Some(&tag) = buf.first() else {
            return Err(MillError::InvalidCommand("empty buffer".into()));
        };
        match tag {
            STOP => Ok((ControlCommand::Stop, 1)),
            JOG => {
                let dir = *buf
                    .get(1)
                    .ok_or_else(|| MillError::InvalidCommand("truncated JOG".into()))?;
                let dir = JogDirection::from_signum((dir as i8) as i32).ok_or_else(|| {
                    MillError::InvalidCommand("JOG direction must be non-zero".into())
                })?;
                Ok((ControlCommand::Jog(dir), 2))
            }
            SPEED => {
                let speed = *buf
                    .get(1)
                    .ok_or_else(|| MillError::InvalidCommand("truncated SPEED".into()))?;
                Ok((ControlCommand::Speed(speed), 2))
            }
            AXIS => {
                let code = *buf
                    .get(1)
                    .ok_or_else(|| MillError::InvalidCommand("truncated AXIS".into()))?;
                Ok((ControlCommand::SelectAxis(Axis::from_code(code)?), 2))
            }
            other => Err(MillError::InvalidCommand(format!(
                "unknown tag: {other:#x}"
            ))),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_tag_only() {
        let bytes = ControlCommand::Stop.encode().unwrap();
        assert_eq!(&bytes[..], &[STOP]);
    }

    #[test]
    fn jog_carries_signed_direction() {
        let fwd = ControlCommand::Jog(JogDirection::Positive).encode().unwrap();
        assert_eq!(&fwd[..], &[JOG, 0x01]);

        let back = ControlCommand::Jog(JogDirection::Negative).encode().unwrap();
        assert_eq!(&back[..], &[JOG, 0xFF]);
    }

    #[test]
    fn jog_signum_collapses_magnitude() {
        assert_eq!(JogDirection::from_signum(37), Some(JogDirection::Positive));
        assert_eq!(JogDirection::from_signum(-4), Some(JogDirection::Negative));
        assert_eq!(JogDirection::from_signum(0), None);
    }

    #[test]
    fn speed_bounds_enforced() {
        assert!(ControlCommand::Speed(1).encode().is_ok());
        assert!(ControlCommand::Speed(24).encode().is_ok());
        assert!(ControlCommand::Speed(0).encode().is_err());
        assert!(ControlCommand::Speed(25).encode().is_err());
    }

    #[test]
    fn axis_codes_roundtrip() {
        for (axis, code) in [(Axis::X, 0), (Axis::Y, 1), (Axis::Z, 2), (Axis::A, 3)] {
            let bytes = ControlCommand::SelectAxis(axis).encode().unwrap();
            assert_eq!(&bytes[..], &[AXIS, code]);

            let (decoded, used) = ControlCommand::decode(&bytes).unwrap();
            assert_eq!(decoded, ControlCommand::SelectAxis(axis));
            assert_eq!(used, 2);
        }
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        assert!(ControlCommand::decode(&[0x00]).is_err());
        assert!(ControlCommand::decode(&[]).is_err());
    }

    #[test]
    fn decode_rejects_zero_jog() {
        assert!(ControlCommand::decode(&[JOG, 0x00]).is_err());
    }

    #[test]
    fn ping_tags_distinct_from_commands() {
        let tags = [PING_REQUEST, PING_RESPONSE, STOP, SPEED, JOG, AXIS];
        for (i, a) in tags.iter().enumerate() {
            for b in &tags[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
