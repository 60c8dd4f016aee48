pub mod consts;
pub mod error;

use std::collections::HashMap;
use std::fmt;

use consts::{DataFormat, MeasType};
use error::DecodeError;
use jiff::Timestamp;
use tracing::{debug, error, warn};

/// Replay suppression: packets closer than this are checked against the
/// rolling packet id, anything later is treated as a fresh session.
const REPLAY_WINDOW_MICROS: i64 = 4_000_000;
/// Forward packet id distance (mod 256) must stay below this to be accepted.
const MAX_COUNTER_JUMP: u8 = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
    Timestamp(Timestamp),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Timestamp(ts) => write!(f, "{ts}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub unit: Option<&'static str>,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct Decoded {
    /// reversed-MAC from the payload when present, else the transport address
    pub address: String,
    /// device only advertises when triggered
    pub sleepy: bool,
    pub measurements: HashMap<&'static str, Measurement>,
}

/// BTHome v2 service data decoder. One instance per monitored address:
/// the replay state is carried across calls.
#[derive(Debug, Default)]
pub struct BthomeDecoder {
    last_packet_id: Option<u8>,
    last_accepted: Option<Timestamp>,
}

impl BthomeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one advertisement. A suppressed duplicate yields an empty
    /// measurement map, whole-advertisement rejections are errors.
    pub fn decode(
        &mut self,
        address: &str,
        service_data: &[u8],
        received: Timestamp,
    ) -> Result<Decoded, DecodeError> {
        let Some(&adv_info) = service_data.first() else {
            return Err(DecodeError::EmptyServiceData);
        };

        if adv_info & 1 != 0 {
            return Err(DecodeError::Encrypted);
        }

        let version = (adv_info >> 5) & 7;
        if version != 2 {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let mac_included = adv_info & (1 << 1) != 0;
        let sleepy = adv_info & (1 << 2) != 0;

        let (address, payload) = if mac_included {
            if service_data.len() < 7 {
                return Err(DecodeError::Truncated);
            }
            let mut mac = service_data[1..7].to_vec();
            mac.reverse();
            (to_mac(&mac), &service_data[7..])
        } else {
            (address.to_string(), &service_data[1..])
        };

        let measurements = self.parse_payload(payload, received);
        Ok(Decoded { address, sleepy, measurements })
    }

    fn parse_payload(
        &mut self,
        payload: &[u8],
        received: Timestamp,
    ) -> HashMap<&'static str, Measurement> {
        let mut measurements = HashMap::new();
        let mut next = 0usize;
        let mut prev_object_id = 0u8;

        while payload.len() > next {
            let start = next;
            let object_id = payload[start];

            if prev_object_id > object_id {
                warn!(
                    "object ids not in ascending order, payload: {}",
                    hex(payload)
                );
            }
            let Some(meas) = consts::lookup(object_id) else {
                error!("unknown object id {object_id:#04x} in payload: {}", hex(payload));
                break;
            };
            prev_object_id = object_id;

            let (data_start, data_length) = match meas.format {
                DataFormat::String | DataFormat::Raw => {
                    let Some(&len) = payload.get(start + 1) else {
                        error!("truncated record in payload: {}", hex(payload));
                        break;
                    };
                    (start + 2, len as usize)
                }
                _ => (start + 1, meas.data_length),
            };
            next = data_start + data_length;

            if data_length == 0 {
                error!("record with data length 0 in payload: {}", hex(payload));
                continue;
            }
            if payload.len() < next {
                error!("truncated record in payload: {}", hex(payload));
                break;
            }
            let data = &payload[data_start..next];

            if object_id == consts::OBJECT_PACKET_ID {
                let packet_id = data[0];
                if self.skip_old_or_duplicated(packet_id, received) {
                    return HashMap::new();
                }
                self.last_packet_id = Some(packet_id);
                self.last_accepted = Some(received);
            }

            if let Some(value) = decode_value(data, &meas) {
                measurements.insert(meas.state_name, Measurement { unit: meas.unit, value });
            }
        }

        measurements
    }

    fn skip_old_or_duplicated(&self, packet_id: u8, received: Timestamp) -> bool {
        let (Some(last_id), Some(last_at)) = (self.last_packet_id, self.last_accepted) else {
            debug!("first packet, not filtering packet id {packet_id}");
            return false;
        };

        if received.as_microsecond() - last_at.as_microsecond() > REPLAY_WINDOW_MICROS {
            debug!("more than 4s since last packet, not filtering packet id {packet_id}");
            return false;
        }

        // forward distance on the rolling counter, wrapping at 256
        let distance = packet_id.wrapping_sub(last_id);
        if distance > 0 && distance < MAX_COUNTER_JUMP {
            return false;
        }

        debug!("packet id {packet_id} is a duplicate or older than {last_id}, skipping");
        true
    }
}

fn decode_value(data: &[u8], meas: &MeasType) -> Option<Value> {
    match meas.format {
        DataFormat::UnsignedInt => {
            let raw = parse_uint(data)?;
            Some(Value::Number(round_scaled(raw as f64, meas.factor)))
        }
        DataFormat::SignedInt => {
            let raw = parse_sint(data)?;
            Some(Value::Number(round_scaled(raw as f64, meas.factor)))
        }
        DataFormat::Float => {
            let raw = match data.len() {
                2 => half_to_f64(u16::from_le_bytes([data[0], data[1]])),
                4 => f32::from_le_bytes(data.try_into().ok()?) as f64,
                8 => f64::from_le_bytes(data.try_into().ok()?),
                n => {
                    error!("only 2, 4 or 8 byte floats are supported, got {n} bytes");
                    return None;
                }
            };
            Some(Value::Number(round_scaled(raw, meas.factor)))
        }
        DataFormat::String => match std::str::from_utf8(data) {
            Ok(s) => Some(Value::Text(s.to_string())),
            Err(_) => {
                error!("string record is not valid UTF-8: {}", hex(data));
                None
            }
        },
        DataFormat::Raw => Some(Value::Text(hex(data))),
        DataFormat::Timestamp => {
            let secs = parse_uint(data)?;
            match Timestamp::from_second(secs as i64) {
                Ok(ts) => Some(Value::Timestamp(ts)),
                Err(_) => {
                    error!("timestamp record out of range: {secs}");
                    None
                }
            }
        }
    }
}

fn parse_uint(data: &[u8]) -> Option<u64> {
    if data.len() > 8 {
        error!("integer record longer than 8 bytes: {}", hex(data));
        return None;
    }
    let mut buf = [0u8; 8];
    buf[..data.len()].copy_from_slice(data);
    Some(u64::from_le_bytes(buf))
}

fn parse_sint(data: &[u8]) -> Option<i64> {
    if data.is_empty() || data.len() > 8 {
        error!("integer record longer than 8 bytes: {}", hex(data));
        return None;
    }
    let negative = data[data.len() - 1] & 0x80 != 0;
    let mut buf = if negative { [0xffu8; 8] } else { [0u8; 8] };
    buf[..data.len()].copy_from_slice(data);
    Some(i64::from_le_bytes(buf))
}

/// Apply the descriptor's scale factor and round to the precision it
/// implies (factor 0.1 keeps one decimal place).
fn round_scaled(raw: f64, factor: f64) -> f64 {
    let places = (-factor.log10()).round().max(0.0);
    let scale = 10f64.powf(places);
    (raw * factor * scale).round() / scale
}

fn half_to_f64(bits: u16) -> f64 {
    let sign = if bits >> 15 == 1 { -1.0 } else { 1.0 };
    let exponent = ((bits >> 10) & 0x1f) as i32;
    let fraction = (bits & 0x3ff) as f64;
    match exponent {
        0 => sign * fraction * 2f64.powi(-24),
        0x1f if fraction == 0.0 => sign * f64::INFINITY,
        0x1f => f64::NAN,
        _ => sign * (1.0 + fraction / 1024.0) * 2f64.powi(exponent - 15),
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn to_mac(addr: &[u8]) -> String {
    addr.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
