use serde::{Deserialize, Serialize};

use crate::codec::ParseError;

/// Largest magnitude that fits the 4-digit frame field.
pub const MAX_MAGNITUDE: u16 = 9999;

/// Line terminator appended to every outbound frame.
pub const FRAME_TERMINATOR: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnDirection {
    Left,
    Right,
}

/// A motion intent for the drive controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionCommand {
    Turn { degrees: u16, direction: TurnDirection },
    /// Drive forward for `steps` controller time units (seconds on the stock firmware).
    Forward { steps: u16 },
    Stop,
}

impl MotionCommand {
    /// Turn by a signed angle: positive is clockwise (right), negative counter-clockwise.
    /// Returns `None` when the rounded angle is zero.
    pub fn turn_by(delta_deg: f64) -> Option<Self> {
        let deg = delta_deg.abs().round().min(f64::from(MAX_MAGNITUDE)) as u16;
        if deg == 0 {
            return None;
        }
        let direction = if delta_deg > 0.0 { TurnDirection::Right } else { TurnDirection::Left };
        Some(MotionCommand::Turn { degrees: deg, direction })
    }

    /// Signed turn angle (right positive), `None` for non-turn commands.
    pub fn signed_degrees(&self) -> Option<i32> {
        match *self {
            MotionCommand::Turn { degrees, direction: TurnDirection::Right } => Some(i32::from(degrees)),
            MotionCommand::Turn { degrees, direction: TurnDirection::Left } => Some(-i32::from(degrees)),
            _ => None,
        }
    }
}

/// Non-motion requests for the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigCommand {
    /// Auxiliary opcode `A` (absolute servo angle on the stock firmware).
    Aux(u16),
    QueryStatus,
    QueryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    Motion(MotionCommand),
    Config(ConfigCommand),
}

impl From<MotionCommand> for Outbound {
    fn from(cmd: MotionCommand) -> Self {
        Outbound::Motion(cmd)
    }
}

impl From<ConfigCommand> for Outbound {
    fn from(cmd: ConfigCommand) -> Self {
        Outbound::Config(cmd)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("magnitude {0} does not fit 4 digits (max 9999)")]
    MagnitudeOutOfRange(u16),
}

fn op_frame(op: char, magnitude: u16) -> Result<String, EncodeError> {
    if magnitude > MAX_MAGNITUDE {
        return Err(EncodeError::MagnitudeOutOfRange(magnitude));
    }
    Ok(format!("{}{:04}", op, magnitude))
}

impl Outbound {
    /// The frame text without terminator, e.g. `F0002`.
    pub fn frame(&self) -> Result<String, EncodeError> {
        match *self {
            Outbound::Motion(MotionCommand::Forward { steps }) => op_frame('F', steps),
            Outbound::Motion(MotionCommand::Turn { degrees, direction: TurnDirection::Left }) => op_frame('L', degrees),
            Outbound::Motion(MotionCommand::Turn { degrees, direction: TurnDirection::Right }) => op_frame('R', degrees),
            Outbound::Motion(MotionCommand::Stop) => op_frame('S', 0),
            Outbound::Config(ConfigCommand::Aux(payload)) => op_frame('A', payload),
            Outbound::Config(ConfigCommand::QueryStatus) => Ok("STATUS".to_string()),
            Outbound::Config(ConfigCommand::QueryConfig) => Ok("CONFIG".to_string()),
        }
    }

    /// Parses a frame as produced by [`Outbound::frame`]. Used by link-side tooling
    /// and test doubles that play the controller.
    pub fn parse(frame: &str) -> Result<Outbound, ParseError> {
        let frame = frame.trim();
        match frame {
            "STATUS" => return Ok(Outbound::Config(ConfigCommand::QueryStatus)),
            "CONFIG" => return Ok(Outbound::Config(ConfigCommand::QueryConfig)),
            "STOP" => return Ok(Outbound::Motion(MotionCommand::Stop)),
            _ => {}
        }
        if frame.len() != 5 || !frame.is_ascii() {
            return Err(ParseError::Unrecognized(frame.to_string()));
        }
        let (op, digits) = frame.split_at(1);
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::MalformedNumeric { field: "magnitude", value: digits.to_string() });
        }
        let n: u16 = digits
            .parse()
            .map_err(|_| ParseError::MalformedNumeric { field: "magnitude", value: digits.to_string() })?;
        let out = match op {
            "F" => MotionCommand::Forward { steps: n }.into(),
            "L" => MotionCommand::Turn { degrees: n, direction: TurnDirection::Left }.into(),
            "R" => MotionCommand::Turn { degrees: n, direction: TurnDirection::Right }.into(),
            "S" => MotionCommand::Stop.into(),
            "A" => ConfigCommand::Aux(n).into(),
            _ => return Err(ParseError::Unrecognized(frame.to_string())),
        };
        Ok(out)
    }
}

/// Encodes a command into the bytes written to the wire, terminator included.
pub fn encode(cmd: &Outbound) -> Result<Vec<u8>, EncodeError> {
    let frame = cmd.frame()?;
    let mut out = Vec::with_capacity(frame.len() + FRAME_TERMINATOR.len());
    out.extend_from_slice(frame.as_bytes());
    out.extend_from_slice(FRAME_TERMINATOR);
    Ok(out)
}
