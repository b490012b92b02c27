//! Reads the `coordinator` and `simulation` sections from HOCON.
//!
//! Both sections are optional and any key missing from them keeps its
//! default. `SUBKEEPER_*` overrides are not applied here; see
//! [`super::load_and_validate`].

use std::path::Path;

use hocon::HoconLoader;

use crate::common::error::ConfigError;
use crate::config::types::Config;

fn parse_error(e: hocon::Error) -> ConfigError {
    ConfigError::ParseError {
        message: e.to_string(),
    }
}

fn into_config(loader: HoconLoader) -> Result<Config, ConfigError> {
    loader.resolve::<Config>().map_err(parse_error)
}

/// Parse a config file. An unreadable file is an `IoError`; bad HOCON or
/// mistyped values are a `ParseError`.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let loader = HoconLoader::new()
        .load_file(path)
        .map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;
    into_config(loader)
}

/// Parse config text already in memory, e.g. an embedded default or a test fixture.
pub fn load_config_str(content: &str) -> Result<Config, ConfigError> {
    into_config(HoconLoader::new().load_str(content).map_err(parse_error)?)
}
