//! Supervises an optional `runOnConnect`/`runOnRead`/`runOnPublish`-style
//! shell command tied to a connection or path lifecycle: spawned on setup,
//! killed on teardown.

use log::{info, warn};
use tokio::process::{Child, Command};

/// A shell command string, spawned via `sh -lc` the way an interactive
/// command request is launched elsewhere in this codebase.
#[derive(Debug)]
pub struct ChildCommand {
    command: String,
    envs: Vec<(String, String)>,
    child: Option<Child>,
}

impl ChildCommand {
    pub fn new(command: String, envs: Vec<(String, String)>) -> Self {
        Self { command, envs, child: None }
    }

    /// Spawns the command if it isn't already running. Idempotent so a
    /// caller can call this unconditionally from a setup path.
    pub fn spawn(&mut self) -> std::io::Result<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let child = Command::new("sh").arg("-lc").arg(&self.command).envs(self.envs.clone()).spawn()?;
        info!("spawned child command: {}", self.command);
        self.child = Some(child);
        Ok(())
    }

    /// Sends a kill and waits for exit. Safe to call even if `spawn` was
    /// never called or already failed.
    pub async fn shutdown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.kill().await {
            warn!("failed to kill child command '{}': {e}", self.command);
            return;
        }
        match child.wait().await {
            Ok(status) => info!("child command '{}' exited: {status}", self.command),
            Err(e) => warn!("error waiting for child command '{}': {e}", self.command),
        }
    }
}

impl Drop for ChildCommand {
    fn drop(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = child.start_kill();
        }
    }
}
