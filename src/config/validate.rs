// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{ConfigFile, RawConfigFile, TransportSection};
use crate::errors::{IpcError, Result};
use crate::transport::TransportSettings;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = IpcError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let transport = validate_transport(&raw.transport)?;
        validate_profiles(&raw)?;
        Ok(ConfigFile::new_unchecked(
            transport,
            raw.defaults.profile,
            raw.profile,
        ))
    }
}

fn validate_transport(section: &TransportSection) -> Result<TransportSettings> {
    let settings = TransportSettings {
        startup_grace: parse_field("startup_grace", &section.startup_grace)?,
        connect_timeout: parse_field("connect_timeout", &section.connect_timeout)?,
        stop_grace: parse_field("stop_grace", &section.stop_grace)?,
        kill_timeout: parse_field("kill_timeout", &section.kill_timeout)?,
        drain_timeout: parse_field("drain_timeout", &section.drain_timeout)?,
        max_line_bytes: section.max_line_bytes,
    };

    if settings.max_line_bytes == 0 {
        return Err(IpcError::Config(
            "[transport].max_line_bytes must be greater than zero".to_string(),
        ));
    }

    if settings.connect_timeout < settings.startup_grace {
        return Err(IpcError::Config(format!(
            "[transport].connect_timeout ({:?}) must not be shorter than startup_grace ({:?})",
            settings.connect_timeout, settings.startup_grace
        )));
    }

    Ok(settings)
}

fn parse_field(name: &str, value: &str) -> Result<Duration> {
    let duration = parse_duration(value)
        .map_err(|e| IpcError::Config(format!("invalid [transport].{name}: {e}")))?;
    if duration.is_zero() {
        return Err(IpcError::Config(format!(
            "[transport].{name} must be greater than zero"
        )));
    }
    Ok(duration)
}

fn validate_profiles(cfg: &RawConfigFile) -> Result<()> {
    for (name, profile) in cfg.profile.iter() {
        if profile.interpreter.trim().is_empty() {
            return Err(IpcError::Config(format!(
                "profile '{name}' has an empty interpreter"
            )));
        }
    }

    if let Some(default) = &cfg.defaults.profile {
        if !cfg.profile.contains_key(default) {
            return Err(IpcError::Config(format!(
                "[defaults].profile refers to unknown profile '{default}'"
            )));
        }
    }
    Ok(())
}

/// Parse a duration like `"3s"`, `"250ms"`, `"1m"` or `"2h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' is missing a unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{num_part}': {e}"))?;

    match unit_part.trim().to_lowercase().as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        unit => Err(format!(
            "unsupported duration unit '{unit}'; expected ms, s, m, or h"
        )),
    }
}
