//! The agent half of a local backend.
//!
//! [`CommandAgent`] starts a configured shell command once per turn with the
//! prompt on stdin, the way a CLI coding agent is driven non-interactively.
//! Threads only exist as ids handed to the command through the environment,
//! so an agent that keeps sessions can resume them. The agent is expected to
//! record phase progress in the plan's state itself; the runner learns about
//! it by polling.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{MessageOptions, ThreadId};

/// Agent operations of [`ExecutionBackend`](super::backend::ExecutionBackend),
/// for backends that keep the host side themselves.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Raw response in the `{thread:{id}}` shape.
    async fn start_thread(&self) -> Result<Value>;

    /// Raw response in the `{turn:{id}}` shape. Returns once the turn has
    /// started, not when it ends.
    async fn send_user_message(
        &self,
        thread_id: &ThreadId,
        text: &str,
        options: &MessageOptions,
    ) -> Result<Value>;

    async fn interrupt_turn(&self, thread_id: &ThreadId, turn_id: &str) -> Result<()>;
}

type Turns = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Runs `sh -c <command>` per turn in the project root.
pub struct CommandAgent {
    command: String,
    workdir: PathBuf,
    threads: AtomicU64,
    turns_started: AtomicU64,
    turns: Turns,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>, workdir: impl AsRef<Path>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.as_ref().to_path_buf(),
            threads: AtomicU64::new(0),
            turns_started: AtomicU64::new(0),
            turns: Arc::default(),
        }
    }

    /// Turns whose process has not exited yet.
    pub fn active_turns(&self) -> usize {
        lock(&self.turns).len()
    }
}

fn lock(turns: &Turns) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    turns.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl AgentClient for CommandAgent {
    async fn start_thread(&self) -> Result<Value> {
        let n = self.threads.fetch_add(1, Ordering::Relaxed) + 1;
        let thread_id = format!("thread-{}-{}", std::process::id(), n);
        debug!(thread_id = %thread_id, "started thread");
        Ok(json!({"thread": {"id": thread_id}}))
    }

    async fn send_user_message(
        &self,
        thread_id: &ThreadId,
        text: &str,
        options: &MessageOptions,
    ) -> Result<Value> {
        let n = self.turns_started.fetch_add(1, Ordering::Relaxed) + 1;
        let turn_id = format!("{}-turn-{}", thread_id, n);

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .env("FORGE_THREAD_ID", thread_id.as_str())
            .env("FORGE_TURN_ID", &turn_id)
            .kill_on_drop(true);
        if let Some(mode) = &options.collaboration_mode {
            command.env("FORGE_COLLABORATION_MODE", mode.to_string());
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn agent command: {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // An agent that takes its prompt elsewhere may exit without reading.
            let written = match stdin.write_all(text.as_bytes()).await {
                Ok(()) => stdin.shutdown().await,
                Err(err) => Err(err),
            };
            if let Err(err) = written
                && err.kind() != ErrorKind::BrokenPipe
            {
                return Err(err).context("Failed to write prompt to agent stdin");
            }
        }

        let token = CancellationToken::new();
        lock(&self.turns).insert(turn_id.clone(), token.clone());
        info!(thread_id = %thread_id, turn_id = %turn_id, pid = child.id().unwrap_or(0), "agent turn started");

        let turns = Arc::clone(&self.turns);
        let watched = turn_id.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = token.cancelled() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    if let Err(err) = child.kill().await {
                        warn!(turn_id = %watched, error = %err, "failed to kill agent process");
                    }
                    child.wait().await
                }
            };
            lock(&turns).remove(&watched);
            match status {
                Ok(status) if status.success() => debug!(turn_id = %watched, "agent turn exited"),
                Ok(status) => warn!(turn_id = %watched, code = ?status.code(), "agent turn exited with failure"),
                Err(err) => warn!(turn_id = %watched, error = %err, "failed to wait for agent process"),
            }
        });

        Ok(json!({"turn": {"id": turn_id}}))
    }

    /// Kills the turn's process. A turn that already exited is not an error.
    async fn interrupt_turn(&self, thread_id: &ThreadId, turn_id: &str) -> Result<()> {
        match lock(&self.turns).remove(turn_id) {
            Some(token) => {
                info!(thread_id = %thread_id, turn_id, "interrupting agent turn");
                token.cancel();
            }
            None => debug!(thread_id = %thread_id, turn_id, "turn not running; nothing to interrupt"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::backend::{extract_thread_id, extract_turn_id};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_threads_get_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let agent = CommandAgent::new("true", dir.path());
        let first = extract_thread_id(&agent.start_thread().await.unwrap()).unwrap();
        let second = extract_thread_id(&agent.start_thread().await.unwrap()).unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_turn_receives_prompt_and_environment() {
        let dir = TempDir::new().unwrap();
        let agent = CommandAgent::new(
            "cat > prompt.txt; printf '%s' \"$FORGE_COLLABORATION_MODE\" > mode.txt; echo done > finished.txt",
            dir.path(),
        );
        let thread = extract_thread_id(&agent.start_thread().await.unwrap()).unwrap();
        let options = MessageOptions {
            collaboration_mode: Some(json!({"mode": "pair"})),
        };

        let response = agent
            .send_user_message(&thread, "run task-1:tests", &options)
            .await
            .unwrap();
        let turn_id = extract_turn_id(&response).unwrap();
        assert!(turn_id.starts_with(thread.as_str()));

        let finished = dir.path().join("finished.txt");
        wait_for(|| finished.exists()).await;
        assert_eq!(
            fs::read_to_string(dir.path().join("prompt.txt")).unwrap(),
            "run task-1:tests"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("mode.txt")).unwrap(),
            r#"{"mode":"pair"}"#
        );
        wait_for(|| agent.active_turns() == 0).await;
    }

    #[tokio::test]
    async fn test_interrupt_kills_the_turn() {
        let dir = TempDir::new().unwrap();
        let agent = CommandAgent::new("cat > /dev/null; sleep 30", dir.path());
        let thread = extract_thread_id(&agent.start_thread().await.unwrap()).unwrap();
        let response = agent
            .send_user_message(&thread, "long turn", &MessageOptions::default())
            .await
            .unwrap();
        let turn_id = extract_turn_id(&response).unwrap();
        assert_eq!(agent.active_turns(), 1);

        agent.interrupt_turn(&thread, &turn_id).await.unwrap();
        wait_for(|| agent.active_turns() == 0).await;

        // Finished and unknown turns are fine to interrupt.
        agent.interrupt_turn(&thread, &turn_id).await.unwrap();
        agent.interrupt_turn(&thread, "pending").await.unwrap();
    }
}
