use std::{collections::BTreeMap, path::Path, process::Stdio, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::SessionError;

/// How to spawn a local inference server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// `llama-server -m <model> --host 127.0.0.1 --port <port> --jinja`
    pub fn llama_server(binary: impl Into<String>, model_path: &Path, port: u16) -> Self {
        Self::new(binary)
            .with_arg("-m")
            .with_arg(model_path.display().to_string())
            .with_arg("--host")
            .with_arg("127.0.0.1")
            .with_arg("--port")
            .with_arg(port.to_string())
            .with_arg("--jinja")
    }

    pub fn spawn(&self) -> Result<ServerProcess, SessionError> {
        debug!(program = %self.program, args = ?self.args, "spawning inference server");
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(ServerProcess { child })
    }
}

#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
}

impl ServerProcess {
    /// `Some(description)` once the child has exited.
    pub fn exit_status(&mut self) -> Result<Option<String>, SessionError> {
        Ok(self.child.try_wait()?.map(|status| status.to_string()))
    }

    pub async fn shutdown(mut self, timeout: Duration) {
        if let Err(error) = self.child.start_kill() {
            debug!(%error, "inference server already gone");
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "inference server stopped"),
            Ok(Err(error)) => warn!(%error, "failed to reap inference server"),
            Err(_) => warn!(?timeout, "inference server did not exit in time"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llama_server_arguments() {
        let spec = LaunchSpec::llama_server("llama-server", Path::new("/models/q4.gguf"), 8081);
        assert_eq!(
            spec.args,
            vec!["-m", "/models/q4.gguf", "--host", "127.0.0.1", "--port", "8081", "--jinja"]
        );
    }
}
