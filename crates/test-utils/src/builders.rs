#![allow(dead_code)]

use std::path::Path;

use ipcrun::types::{IpcMode, RunRequest};

/// Builder for `RunRequest`s that target the `ipcrun-echo` reference child
/// (or any other program) directly, without a script path.
pub struct RequestBuilder {
    request: RunRequest,
}

impl RequestBuilder {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            request: RunRequest {
                interpreter: program.as_ref().to_path_buf(),
                script_args: Vec::new(),
                mode: IpcMode::StandardStream,
                payload: String::new(),
            },
        }
    }

    pub fn mode(mut self, mode: IpcMode) -> Self {
        self.request.mode = mode;
        self
    }

    pub fn socket(self) -> Self {
        self.mode(IpcMode::LocalSocket)
    }

    pub fn payload(mut self, payload: &str) -> Self {
        self.request.payload = payload.to_string();
        self
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.request.script_args.push(arg.to_string());
        self
    }

    /// `--emit <line>` for each line.
    pub fn emit(mut self, lines: &[&str]) -> Self {
        for line in lines {
            self = self.arg("--emit").arg(line);
        }
        self
    }

    pub fn exit_code(self, code: i32) -> Self {
        self.arg("--exit-code").arg(&code.to_string())
    }

    pub fn build(self) -> RunRequest {
        self.request
    }
}

/// Builder for config TOML text.
#[derive(Default)]
pub struct ConfigTomlBuilder {
    transport: Vec<(String, String)>,
    default_profile: Option<String>,
    profiles: Vec<String>,
}

impl ConfigTomlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(mut self, key: &str, value: &str) -> Self {
        self.transport.push((key.to_string(), value.to_string()));
        self
    }

    pub fn default_profile(mut self, name: &str) -> Self {
        self.default_profile = Some(name.to_string());
        self
    }

    pub fn profile(mut self, name: &str, interpreter: &Path, script: &str, mode: &str) -> Self {
        self.profiles.push(format!(
            "[profile.{name}]\ninterpreter = {interpreter:?}\nscript = {script:?}\nmode = {mode:?}\n",
            interpreter = interpreter.display().to_string(),
        ));
        self
    }

    pub fn build(self) -> String {
        let mut out = String::new();
        if !self.transport.is_empty() {
            out.push_str("[transport]\n");
            for (key, value) in &self.transport {
                out.push_str(&format!("{key} = {value:?}\n"));
            }
            out.push('\n');
        }
        if let Some(name) = &self.default_profile {
            out.push_str(&format!("[defaults]\nprofile = {name:?}\n\n"));
        }
        for profile in &self.profiles {
            out.push_str(profile);
            out.push('\n');
        }
        out
    }
}
