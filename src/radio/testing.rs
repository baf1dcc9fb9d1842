//! Scripted command runner for tests.

use super::runner::{CommandError, CommandRunner};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Reply {
    Stdout(String),
    /// Stdout after the given delay.
    Delayed(Duration, String),
    /// Never answers; the caller's future stays pending.
    Hang,
    Killed,
    Failed(String),
}

/// Answers commands by substring match and records every command line.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, Reply)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `reply` to commands containing `pattern`. Earlier rules win.
    pub fn on(self, pattern: &str, reply: Reply) -> Self {
        self.rules.lock().push((pattern.to_string(), reply));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.contains(pattern)).count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command_line: &str, _timeout: Duration) -> Result<String, CommandError> {
        self.calls.lock().push(command_line.to_string());

        let reply = self
            .rules
            .lock()
            .iter()
            .find(|(pattern, _)| command_line.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone());

        match reply {
            Some(Reply::Stdout(out)) => Ok(out),
            Some(Reply::Delayed(delay, out)) => {
                tokio::time::sleep(delay).await;
                Ok(out)
            }
            Some(Reply::Hang) => std::future::pending().await,
            Some(Reply::Killed) => Err(CommandError::Killed),
            Some(Reply::Failed(stderr)) => Err(CommandError::Failed {
                code: Some(1),
                stderr,
            }),
            None => Err(CommandError::Failed {
                code: Some(127),
                stderr: format!("no scripted reply for `{}`", command_line),
            }),
        }
    }
}
