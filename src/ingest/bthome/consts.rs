/// BTHome v2 object id of the packet id record, drives replay suppression
pub const OBJECT_PACKET_ID: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataFormat {
    UnsignedInt,
    SignedInt,
    Float,
    String,
    Raw,
    Timestamp,
}

#[derive(Debug, Clone, Copy)]
pub struct MeasType {
    pub state_name: &'static str,
    pub unit: Option<&'static str>,
    /// ignored for String/Raw, those carry an explicit length byte
    pub data_length: usize,
    pub format: DataFormat,
    pub factor: f64,
}

const fn uint(state_name: &'static str, unit: Option<&'static str>, data_length: usize, factor: f64) -> MeasType {
    MeasType { state_name, unit, data_length, format: DataFormat::UnsignedInt, factor }
}

const fn sint(state_name: &'static str, unit: Option<&'static str>, data_length: usize, factor: f64) -> MeasType {
    MeasType { state_name, unit, data_length, format: DataFormat::SignedInt, factor }
}

/// BTHome v2 measurement table, keyed by the one-byte object id
pub fn lookup(object_id: u8) -> Option<MeasType> {
    Some(match object_id {
        0x00 => uint("packet_id", None, 1, 1.0),
        0x01 => uint("battery", Some("%"), 1, 1.0),
        0x02 => sint("temperature", Some("°C"), 2, 0.01),
        0x03 => uint("humidity", Some("%"), 2, 0.01),
        0x05 => uint("illuminance", Some("lux"), 3, 0.01),
        0x0A => uint("energy", Some("kWh"), 3, 0.001),
        0x0B => uint("power", Some("W"), 3, 0.01),
        0x0C => uint("voltage", Some("V"), 2, 0.001),
        0x14 => uint("moisture", Some("%"), 2, 0.01),
        0x21 => uint("motion", None, 1, 1.0),
        0x2E => uint("humidity", Some("%"), 1, 1.0),
        0x3A => uint("button", None, 1, 1.0),
        0x3F => sint("rotation", Some("°"), 2, 0.1),
        0x45 => sint("temperature", Some("°C"), 2, 0.1),
        0x50 => MeasType {
            state_name: "timestamp",
            unit: None,
            data_length: 4,
            format: DataFormat::Timestamp,
            factor: 1.0,
        },
        0x51 => uint("acceleration", Some("m/s²"), 2, 0.001),
        0x53 => MeasType {
            state_name: "text",
            unit: None,
            data_length: 0,
            format: DataFormat::String,
            factor: 1.0,
        },
        0x54 => MeasType {
            state_name: "raw",
            unit: None,
            data_length: 0,
            format: DataFormat::Raw,
            factor: 1.0,
        },
        _ => return None,
    })
}
