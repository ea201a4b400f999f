//! Shell / WG exec wrapper (spec.md §4.A).
//!
//! Every `wg`, `wg-quick`, and `ip` invocation in this crate goes through
//! [`NetAdmin`] rather than a bare `tokio::process::Command::new`, so tests
//! can substitute [`FakeNetAdmin`] and assert the exact command sequence
//! invariants 1-2 (refcount/pin soundness) depend on.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::process::Command;
use tracing::{debug, warn};

/// stderr substrings that mean "already in the desired state" for an
/// idempotent `ip`/`wg` command — not a real failure.
const IDEMPOTENT_BENIGN: &[&str] = &[
    "No such file or directory",
    "No such process",
    "File exists",
    "RTNETLINK answers: File exists",
    "FIB table does not exist",
    "Cannot find device",
    "not found in table",
];

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn is_idempotent_benign(&self) -> bool {
        IDEMPOTENT_BENIGN.iter().any(|needle| self.stderr.contains(needle))
    }
}

#[async_trait]
pub trait NetAdmin: Send + Sync {
    /// Runs `cmd` with the standard merged environment, logging the
    /// invocation and its result.
    async fn run(&self, cmd: &[&str]) -> CommandOutput;

    /// Same as [`NetAdmin::run`] but suppresses logging and treats a known
    /// idempotency-benign stderr as success.
    async fn run_quiet(&self, cmd: &[&str]) -> CommandOutput {
        let out = self.run_silent(cmd).await;
        if out.ok || out.is_idempotent_benign() {
            CommandOutput { ok: true, ..out }
        } else {
            out
        }
    }

    /// Implementation hook for `run_quiet`: identical to `run` but without
    /// the info-level logging `run` does on every invocation.
    async fn run_silent(&self, cmd: &[&str]) -> CommandOutput;

    /// Runs `cmd` feeding `stdin` to it, used by WG peer registration's
    /// `wg genkey | wg pubkey` pipeline (spec.md §4.J step 2).
    async fn run_piped(&self, cmd: &[&str], stdin: &str) -> CommandOutput;
}

/// Real implementation, shelling out via `tokio::process::Command` so a
/// slow `wg-quick up` (DNS resolution, endpoint handshake) never blocks the
/// scheduling loop (spec.md §5).
pub struct ShellNetAdmin {
    path: String,
}

impl ShellNetAdmin {
    pub fn new() -> Self {
        let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/sbin:/usr/bin:/sbin:/bin".to_string());
        Self { path }
    }

    fn env(&self) -> HashMap<&'static str, String> {
        let mut env = HashMap::new();
        env.insert("WG_QUICK_USERSPACE_IMPLEMENTATION", "boringtun".to_string());
        env.insert("WG_ENDPOINT_RESOLUTION_RETRIES", "2".to_string());
        env.insert("PATH", self.path.clone());
        env
    }

    async fn exec(&self, cmd: &[&str]) -> CommandOutput {
        self.exec_piped(cmd, None).await
    }

    async fn exec_piped(&self, cmd: &[&str], stdin: Option<&str>) -> CommandOutput {
        if cmd.is_empty() {
            return CommandOutput { ok: false, stdout: String::new(), stderr: "empty command".into() };
        }
        let mut command = Command::new(cmd[0]);
        command.args(&cmd[1..]);
        command.env_clear();
        for (k, v) in self.env() {
            command.env(k, v);
        }
        if stdin.is_some() {
            command.stdin(std::process::Stdio::piped());
        }
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => return CommandOutput { ok: false, stdout: String::new(), stderr: e.to_string() },
        };
        if let Some(input) = stdin {
            use tokio::io::AsyncWriteExt;
            if let Some(mut pipe) = child.stdin.take() {
                let _ = pipe.write_all(input.as_bytes()).await;
            }
        }
        match child.wait_with_output().await {
            Ok(output) => CommandOutput {
                ok: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Err(e) => CommandOutput { ok: false, stdout: String::new(), stderr: e.to_string() },
        }
    }
}

impl Default for ShellNetAdmin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetAdmin for ShellNetAdmin {
    async fn run(&self, cmd: &[&str]) -> CommandOutput {
        debug!(cmd = cmd.join(" "), "netadmin run");
        let out = self.exec(cmd).await;
        if !out.ok {
            warn!(cmd = cmd.join(" "), stderr = %out.stderr, "netadmin command failed");
        }
        out
    }

    async fn run_silent(&self, cmd: &[&str]) -> CommandOutput {
        self.exec(cmd).await
    }

    async fn run_piped(&self, cmd: &[&str], stdin: &str) -> CommandOutput {
        debug!(cmd = cmd.join(" "), "netadmin run (piped)");
        self.exec_piped(cmd, Some(stdin)).await
    }
}

/// Test double recording every command it was asked to run.
#[derive(Default)]
pub struct FakeNetAdmin {
    pub log: parking_lot::Mutex<Vec<String>>,
    /// Commands (by exact joined string, stdin excluded) that should report failure.
    pub failures: parking_lot::Mutex<std::collections::HashSet<String>>,
    /// Canned stdout for a given joined command, stdin excluded from the key.
    pub stdout_overrides: parking_lot::Mutex<HashMap<String, String>>,
}

impl FakeNetAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, cmd: &str) {
        self.failures.lock().insert(cmd.to_string());
    }

    pub fn set_stdout(&self, cmd: &str, stdout: &str) {
        self.stdout_overrides.lock().insert(cmd.to_string(), stdout.to_string());
    }

    pub fn history(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl NetAdmin for FakeNetAdmin {
    async fn run(&self, cmd: &[&str]) -> CommandOutput {
        self.run_silent(cmd).await
    }

    async fn run_silent(&self, cmd: &[&str]) -> CommandOutput {
        let joined = cmd.join(" ");
        self.log.lock().push(joined.clone());
        if self.failures.lock().contains(&joined) {
            return CommandOutput { ok: false, stdout: String::new(), stderr: "fake failure".into() };
        }
        if let Some(stdout) = self.stdout_overrides.lock().get(&joined).cloned() {
            return CommandOutput { ok: true, stdout, stderr: String::new() };
        }
        CommandOutput { ok: true, stdout: String::new(), stderr: String::new() }
    }

    async fn run_piped(&self, cmd: &[&str], stdin: &str) -> CommandOutput {
        let joined = cmd.join(" ");
        self.log.lock().push(format!("{joined} <<< {stdin}"));
        if self.failures.lock().contains(&joined) {
            return CommandOutput { ok: false, stdout: String::new(), stderr: "fake failure".into() };
        }
        if let Some(stdout) = self.stdout_overrides.lock().get(&joined).cloned() {
            return CommandOutput { ok: true, stdout, stderr: String::new() };
        }
        CommandOutput { ok: true, stdout: format!("piped:{stdin}"), stderr: String::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_quiet_absorbs_idempotent_benign_stderr() {
        struct AlwaysFileExists;
        #[async_trait]
        impl NetAdmin for AlwaysFileExists {
            async fn run(&self, cmd: &[&str]) -> CommandOutput {
                self.run_silent(cmd).await
            }
            async fn run_silent(&self, _cmd: &[&str]) -> CommandOutput {
                CommandOutput { ok: false, stdout: String::new(), stderr: "RTNETLINK answers: File exists".into() }
            }
            async fn run_piped(&self, cmd: &[&str], _stdin: &str) -> CommandOutput {
                self.run_silent(cmd).await
            }
        }
        let admin = AlwaysFileExists;
        let out = admin.run_quiet(&["ip", "rule", "add"]).await;
        assert!(out.ok);
    }

    #[tokio::test]
    async fn fake_records_command_sequence() {
        let fake = FakeNetAdmin::new();
        fake.run(&["wg-quick", "up", "foo"]).await;
        fake.run(&["wg-quick", "down", "foo"]).await;
        assert_eq!(fake.history(), vec!["wg-quick up foo", "wg-quick down foo"]);
    }
}
