use bytes::{Buf, BytesMut};
use time::OffsetDateTime;
use tracing::warn;

use crate::telemetry::{GpsFix, MotorStatus, Telemetry};
use crate::GeoPoint;

/// Longest line accepted without a terminator before the buffer is discarded.
pub const DEFAULT_MAX_LINE: usize = 256;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("line is not ASCII")]
    NotAscii,
    #[error("unrecognized line: {0:?}")]
    Unrecognized(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("malformed numeric field `{field}`: {value:?}")]
    MalformedNumeric { field: &'static str, value: String },
    #[error("coordinates out of range: lat={lat} lon={lon}")]
    OutOfRange { lat: f64, lon: f64 },
    #[error("GPS reports no position")]
    NoFix,
}

fn parse_f64(field: &'static str, value: &str) -> Result<f64, ParseError> {
    let v = value.trim();
    match v.parse::<f64>() {
        Ok(x) if x.is_finite() => Ok(x),
        _ => Err(ParseError::MalformedNumeric { field, value: v.to_string() }),
    }
}

fn parse_int<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    let v = value.trim();
    v.parse::<T>().map_err(|_| ParseError::MalformedNumeric { field, value: v.to_string() })
}

fn parse_flag(field: &'static str, value: &str) -> Result<bool, ParseError> {
    match value.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(ParseError::MalformedNumeric { field, value: other.to_string() }),
    }
}

/// Decodes one inbound line. The GPS fix is stamped with `now`.
pub fn decode_line(line: &str, now: OffsetDateTime) -> Result<Telemetry, ParseError> {
    let s = line.trim_matches(|c: char| c == '\r' || c == '\n' || c.is_whitespace());
    if s.is_empty() {
        return Err(ParseError::Empty);
    }
    if !s.is_ascii() {
        return Err(ParseError::NotAscii);
    }

    let parts: Vec<&str> = s.split(',').collect();
    match parts[0] {
        "OK" if parts.len() == 1 => Ok(Telemetry::Ack),
        "BOOT" => Ok(Telemetry::Boot),
        "GPS" => decode_gps(&parts, now),
        "STATUS" => Ok(Telemetry::Status(parts[1..].iter().map(|p| p.trim().to_string()).collect())),
        "CONFIG" => decode_config(&parts[1..]),
        "STATE" => {
            let active = parts.get(1).ok_or(ParseError::MissingField("active"))?;
            let timed = parts.get(2).ok_or(ParseError::MissingField("timed"))?;
            Ok(Telemetry::State { active: parse_flag("active", active)?, timed: parse_flag("timed", timed)? })
        }
        "SERVO" => decode_servo(&parts[1..]),
        head if head.starts_with("ERR") => {
            let code = parse_int::<u8>("err_code", &head[3..])?;
            Ok(Telemetry::Error { code })
        }
        head if head.len() > 1 && head.starts_with('M') && head[1..].bytes().all(|b| b.is_ascii_digit()) => {
            decode_motor(&parts)
        }
        _ => Err(ParseError::Unrecognized(s.to_string())),
    }
}

fn decode_gps(parts: &[&str], now: OffsetDateTime) -> Result<Telemetry, ParseError> {
    let lat_s = parts.get(1).ok_or(ParseError::MissingField("lat"))?;
    let lon_s = parts.get(2).ok_or(ParseError::MissingField("lon"))?;
    if lat_s.trim() == "NA" || lon_s.trim() == "NA" {
        return Err(ParseError::NoFix);
    }
    let lat = parse_f64("lat", lat_s)?;
    let lon = parse_f64("lon", lon_s)?;
    let point = GeoPoint::new(lat, lon);
    if !point.is_valid() {
        return Err(ParseError::OutOfRange { lat, lon });
    }
    Ok(Telemetry::Gps(GpsFix::new(point, now)))
}

fn decode_config(fields: &[&str]) -> Result<Telemetry, ParseError> {
    if fields.len() % 2 != 0 {
        return Err(ParseError::MissingField("config value"));
    }
    let pairs = fields
        .chunks(2)
        .map(|kv| (kv[0].trim().to_string(), kv[1].trim().to_string()))
        .collect();
    Ok(Telemetry::Config(pairs))
}

// SERVO,ANG,90.0,BUSY,0
fn decode_servo(fields: &[&str]) -> Result<Telemetry, ParseError> {
    let mut angle = None;
    let mut busy = None;
    for kv in fields.chunks(2) {
        match (kv[0].trim(), kv.get(1)) {
            ("ANG", Some(v)) => angle = Some(parse_f64("servo_angle", v)? as f32),
            ("BUSY", Some(v)) => busy = Some(parse_flag("servo_busy", v)?),
            _ => {}
        }
    }
    Ok(Telemetry::Servo {
        angle_deg: angle.ok_or(ParseError::MissingField("ANG"))?,
        busy: busy.ok_or(ParseError::MissingField("BUSY"))?,
    })
}

// M0,TRPM,100.0,ARPM,98.5,CNT,12345
fn decode_motor(parts: &[&str]) -> Result<Telemetry, ParseError> {
    if parts.len() < 7 {
        return Err(ParseError::MissingField("motor fields"));
    }
    Ok(Telemetry::Motor(MotorStatus {
        motor_id: parse_int("motor_id", &parts[0][1..])?,
        target_rpm: parse_f64("target_rpm", parts[2])? as f32,
        actual_rpm: parse_f64("actual_rpm", parts[4])? as f32,
        encoder_count: parse_int("encoder_count", parts[6])?,
    }))
}

/// Reassembles newline-terminated lines from arbitrary read chunks.
///
/// A partial line stays buffered until its terminator arrives.
#[derive(Debug)]
pub struct LineDecoder {
    buf: BytesMut,
    max_line: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

impl LineDecoder {
    pub fn new(max_line: usize) -> Self {
        Self { buf: BytesMut::with_capacity(max_line), max_line: max_line.max(8) }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.max_line && !self.buf.contains(&b'\n') {
            warn!("codec: dropping {} unterminated bytes (limit {})", self.buf.len(), self.max_line);
            self.buf.clear();
        }
    }

    /// Bytes held for an incomplete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete line with the terminator and any `\r` stripped.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line = String::from_utf8_lossy(&self.buf[..pos]).replace('\r', "");
        self.buf.advance(pos + 1);
        Some(line)
    }

    /// Next decoded line, skipping blank ones. `None` once only a partial line remains.
    pub fn decode_next(&mut self, now: OffsetDateTime) -> Option<Result<Telemetry, ParseError>> {
        loop {
            let line = self.next_line()?;
            match decode_line(&line, now) {
                Err(ParseError::Empty) => continue,
                other => return Some(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-05-01 10:00:00 UTC);

    #[test]
    fn decodes_gps_line() {
        let t = decode_line("GPS,31.231312,121.474597\n", T0).unwrap();
        match t {
            Telemetry::Gps(fix) => {
                assert_eq!(fix.point, GeoPoint::new(31.231312, 121.474597));
                assert_eq!(fix.received_at, T0);
                assert!(fix.valid);
            }
            other => panic!("expected gps, got {:?}", other),
        }
    }

    #[test]
    fn bad_gps_number_is_an_error_not_zero() {
        let err = decode_line("GPS,abc,1.0\n", T0).unwrap_err();
        assert_eq!(err, ParseError::MalformedNumeric { field: "lat", value: "abc".into() });

        let err = decode_line("GPS,1.0,nan", T0).unwrap_err();
        assert!(matches!(err, ParseError::MalformedNumeric { field: "lon", .. }));
    }

    #[test]
    fn gps_without_position() {
        assert_eq!(decode_line("GPS,NA,NA", T0).unwrap_err(), ParseError::NoFix);
        assert_eq!(decode_line("GPS,12.0", T0).unwrap_err(), ParseError::MissingField("lon"));
        assert!(matches!(decode_line("GPS,95.0,10.0", T0), Err(ParseError::OutOfRange { .. })));
    }

    #[test]
    fn decodes_controller_replies() {
        assert_eq!(decode_line("OK\r\n", T0).unwrap(), Telemetry::Ack);
        assert_eq!(decode_line("BOOT,OK", T0).unwrap(), Telemetry::Boot);
        assert_eq!(decode_line("ERR06", T0).unwrap(), Telemetry::Error { code: 6 });
        assert_eq!(decode_line("STATE,1,0", T0).unwrap(), Telemetry::State { active: true, timed: false });
        assert_eq!(
            decode_line("SERVO,ANG,90.0,BUSY,0", T0).unwrap(),
            Telemetry::Servo { angle_deg: 90.0, busy: false }
        );
        assert_eq!(
            decode_line("M1,TRPM,100.0,ARPM,98.5,CNT,12345", T0).unwrap(),
            Telemetry::Motor(MotorStatus { motor_id: 1, target_rpm: 100.0, actual_rpm: 98.5, encoder_count: 12345 })
        );
        assert_eq!(
            decode_line("STATUS,RUN,2", T0).unwrap(),
            Telemetry::Status(vec!["RUN".into(), "2".into()])
        );
        assert_eq!(
            decode_line("CONFIG,KP,1.0,KI,0.1", T0).unwrap(),
            Telemetry::Config(vec![("KP".into(), "1.0".into()), ("KI".into(), "0.1".into())])
        );
    }

    #[test]
    fn unknown_lines_are_errors() {
        assert!(matches!(decode_line("HELLO", T0), Err(ParseError::Unrecognized(_))));
        assert!(matches!(decode_line("MOTOR", T0), Err(ParseError::Unrecognized(_))));
        assert_eq!(decode_line("   ", T0).unwrap_err(), ParseError::Empty);
        assert_eq!(decode_line("GPS,1.0,2.0°", T0).unwrap_err(), ParseError::NotAscii);
    }

    #[test]
    fn partial_line_waits_for_terminator() {
        let mut dec = LineDecoder::default();
        dec.feed(b"GPS,31.2313");
        assert!(dec.decode_next(T0).is_none());
        assert_eq!(dec.pending(), 11);

        dec.feed(b"12,121.474597\r\nOK\n\nST");
        let first = dec.decode_next(T0).unwrap().unwrap();
        assert!(matches!(first, Telemetry::Gps(f) if f.point == GeoPoint::new(31.231312, 121.474597)));
        assert_eq!(dec.decode_next(T0).unwrap().unwrap(), Telemetry::Ack);
        assert!(dec.decode_next(T0).is_none());
        assert_eq!(dec.pending(), 2);
    }

    #[test]
    fn malformed_line_does_not_stall_the_stream() {
        let mut dec = LineDecoder::default();
        dec.feed(b"GPS,abc,1.0\nGARBAGE\nOK\n");
        assert!(dec.decode_next(T0).unwrap().is_err());
        assert!(dec.decode_next(T0).unwrap().is_err());
        assert_eq!(dec.decode_next(T0).unwrap().unwrap(), Telemetry::Ack);
    }

    #[test]
    fn runaway_line_is_dropped() {
        let mut dec = LineDecoder::new(16);
        dec.feed(&[b'x'; 40]);
        assert_eq!(dec.pending(), 0);
        dec.feed(b"OK\n");
        assert_eq!(dec.decode_next(T0).unwrap().unwrap(), Telemetry::Ack);
    }
}
