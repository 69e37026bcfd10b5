// src/types.rs

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::transport::LaunchSpec;

/// Wire strategy used to talk to the child for one run.
///
/// - `StandardStream`: the child's stdin/stdout/stderr are piped; exactly one
///   request line is written and stdin is then closed.
/// - `LocalSocket`: the child connects back to a loopback listener opened by
///   us and exchanges newline-terminated messages over TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcMode {
    #[default]
    #[serde(alias = "stdio", alias = "standard-stream")]
    StandardStream,
    #[serde(alias = "socket", alias = "local-socket")]
    LocalSocket,
}

impl IpcMode {
    pub fn as_str(self) -> &'static str {
        match self {
            IpcMode::StandardStream => "standard-stream",
            IpcMode::LocalSocket => "local-socket",
        }
    }
}

impl fmt::Display for IpcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpcMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stdio" | "standard-stream" | "standard_stream" => Ok(IpcMode::StandardStream),
            "socket" | "local-socket" | "local_socket" => Ok(IpcMode::LocalSocket),
            other => Err(format!(
                "invalid ipc mode: {other} (expected \"stdio\" or \"socket\")"
            )),
        }
    }
}

/// One run as requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub interpreter: PathBuf,
    /// Script path followed by any extra arguments.
    pub script_args: Vec<String>,
    pub mode: IpcMode,
    /// The single request line (standard-stream) or first message (socket).
    pub payload: String,
}

impl RunRequest {
    pub fn new(
        interpreter: impl Into<PathBuf>,
        script: impl Into<String>,
        mode: IpcMode,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            script_args: vec![script.into()],
            mode,
            payload: payload.into(),
        }
    }

    /// Append extra arguments after the script path.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            interpreter: self.interpreter.clone(),
            args: self.script_args.clone(),
            mode: self.mode,
        }
    }
}
