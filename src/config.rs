use std::{error::Error, fs};

use ron::{extensions::Extensions, Options};
use serde::{Deserialize, Serialize};

use crate::ingest::serial::SerialConfig;
use crate::ingest::ScanSensorConfig;
use crate::replicate::UploadConfig;
use crate::retention::RetentionConfig;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub version: f32,
    pub database_path: String,
    pub api_listen: String,
    /// BLE sensors to monitor
    pub scan: Vec<ScanSensorConfig>,
    /// control board link, omit on installations without one
    pub serial: Option<SerialConfig>,
    pub cache: CacheConfig,
    pub retention: RetentionConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CacheConfig {
    /// coalescing window: at most one durable write per entity per TTL
    pub ttl_minutes: i64,
    /// cache-miss fallback reads ignore durable rows older than this
    pub freshness_minutes: i64,
}

impl Config {
    pub fn from_file(file_path: &str) -> Result<Self, Box<dyn Error>> {
        Self::parse(&fs::read_to_string(file_path)?)
    }

    pub fn parse(s: &str) -> Result<Self, Box<dyn Error>> {
        let options = Options::default()
            .with_default_extension(Extensions::IMPLICIT_SOME)
            .with_default_extension(Extensions::UNWRAP_NEWTYPES)
            .with_default_extension(Extensions::UNWRAP_VARIANT_NEWTYPES);
        Ok(options.from_str(s)?)
    }
}
