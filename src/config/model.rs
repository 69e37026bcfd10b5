// src/config/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::transport::{DEFAULT_MAX_LINE_BYTES, TransportSettings};
use crate::types::IpcMode;

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [transport]
/// startup_grace = "100ms"
/// connect_timeout = "5s"
///
/// [defaults]
/// profile = "echo"
///
/// [profile.echo]
/// interpreter = "/usr/bin/python3"
/// script = "scripts/echo.py"
/// mode = "stdio"
/// payload = '{"value":"ping"}'
/// ```
///
/// All sections are optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub transport: TransportSection,

    #[serde(default)]
    pub defaults: DefaultsSection,

    /// Named script profiles from `[profile.<name>]`.
    #[serde(default)]
    pub profile: BTreeMap<String, ProfileConfig>,
}

/// `[transport]` section. Durations use the `<n>ms|s|m|h` grammar.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportSection {
    /// How long a freshly spawned child must survive before `start` succeeds.
    #[serde(default = "default_startup_grace")]
    pub startup_grace: String,

    /// Socket mode: bound on waiting for the child to connect back.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Socket mode: voluntary-exit window after the connection is closed.
    #[serde(default = "default_stop_grace")]
    pub stop_grace: String,

    #[serde(default = "default_kill_timeout")]
    pub kill_timeout: String,

    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,

    /// Byte limit for one line read from the child.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_startup_grace() -> String {
    "100ms".to_string()
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

fn default_stop_grace() -> String {
    "2s".to_string()
}

fn default_kill_timeout() -> String {
    "2s".to_string()
}

fn default_drain_timeout() -> String {
    "1s".to_string()
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            startup_grace: default_startup_grace(),
            connect_timeout: default_connect_timeout(),
            stop_grace: default_stop_grace(),
            kill_timeout: default_kill_timeout(),
            drain_timeout: default_drain_timeout(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsSection {
    /// Profile used when the command line names none.
    #[serde(default)]
    pub profile: Option<String>,
}

/// `[profile.<name>]` section: everything needed to build a run request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProfileConfig {
    pub interpreter: String,

    #[serde(default)]
    pub script: Option<String>,

    /// Extra arguments placed after the script.
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub mode: IpcMode,

    #[serde(default)]
    pub payload: Option<String>,
}

/// Validated configuration. Build it with `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub transport: TransportSettings,
    pub default_profile: Option<String>,
    pub profiles: BTreeMap<String, ProfileConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        transport: TransportSettings,
        default_profile: Option<String>,
        profiles: BTreeMap<String, ProfileConfig>,
    ) -> Self {
        Self {
            transport,
            default_profile,
            profiles,
        }
    }

    pub fn profile(&self, name: &str) -> Option<&ProfileConfig> {
        self.profiles.get(name)
    }

    /// The profile to use when none was named explicitly.
    pub fn default_profile(&self) -> Option<(&str, &ProfileConfig)> {
        let name = self.default_profile.as_deref()?;
        self.profiles.get(name).map(|p| (name, p))
    }
}
