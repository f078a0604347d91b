//! Engine CLI process spawner.
//!
//! Spawns coding-agent CLI processes (claude-code compatible argument layout)
//! with piped stdio and exposes them through the session process port.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{user_frame, EngineConfig};
use crate::domain::ports::{ProcessExit, SessionProcess, SessionSpawner, SpawnRequest, SpawnedProcess};

const READ_CHUNK_SIZE: usize = 8192;

/// How long a process gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Spawns engine CLI processes from their configured definitions.
pub struct EngineProcessSpawner {
    engines: HashMap<String, EngineConfig>,
}

impl EngineProcessSpawner {
    pub fn new(engines: Vec<EngineConfig>) -> Self {
        Self {
            engines: engines.into_iter().map(|e| (e.name.clone(), e)).collect(),
        }
    }

    /// Build CLI arguments for a request.
    fn build_args(engine: &EngineConfig, request: &SpawnRequest) -> Vec<String> {
        let mut args = engine.args.clone();

        if let Some(flag) = &engine.permission_flag {
            args.push(flag.clone());
            args.push(request.permission_mode.clone());
        }

        // stream-json engines receive the prompt as their first stdin frame
        if !engine.streams_input() {
            if let Some(flag) = &engine.prompt_flag {
                args.push(flag.clone());
            }
            args.push(request.prompt.clone());
        }

        args
    }
}

#[async_trait]
impl SessionSpawner for EngineProcessSpawner {
    async fn spawn(&self, request: SpawnRequest) -> DomainResult<SpawnedProcess> {
        let engine = self
            .engines
            .get(&request.engine)
            .ok_or_else(|| DomainError::UnknownEngine(request.engine.clone()))?;

        if !request.workspace_path.is_dir() {
            return Err(DomainError::SpawnFailed(format!(
                "workspace {} does not exist",
                request.workspace_path.display()
            )));
        }

        let session_id = Uuid::new_v4().to_string();
        let args = Self::build_args(engine, &request);

        let mut cmd = Command::new(&engine.binary);
        cmd.args(&args)
            .current_dir(&request.workspace_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &engine.env {
            cmd.env(key, value);
        }
        cmd.env("TASKWIRE_SESSION_ID", &session_id);
        cmd.env("TASKWIRE_TOPIC_ID", &request.topic_id);
        if let Some(task_id) = request.task_id {
            cmd.env("TASKWIRE_TASK_ID", task_id.to_string());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| DomainError::SpawnFailed(format!("failed to spawn {}: {e}", engine.binary)))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DomainError::SpawnFailed("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DomainError::SpawnFailed("failed to capture stdout".to_string()))?;
        let stderr = child.stderr.take();

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let terminated = Arc::new(AtomicBool::new(false));

        let waiter_session = session_id.clone();
        let waiter_terminated = Arc::clone(&terminated);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            waiter_terminated.store(true, Ordering::SeqCst);
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(session_id = %waiter_session, error = %e, "failed to wait for engine process");
                    None
                }
            };
            debug!(session_id = %waiter_session, exit_code = ?code, "engine process exited");
            let _ = exit_tx.send(ProcessExit { code });
        });

        if let Some(stderr) = stderr {
            let stderr_session = session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(session_id = %stderr_session, stderr = %line, "engine stderr");
                }
            });
        }

        let process = Arc::new(EngineProcess {
            id: session_id.clone(),
            engine: engine.name.clone(),
            pid,
            stdin: Mutex::new(Some(stdin)),
            kill_tx: std::sync::Mutex::new(Some(kill_tx)),
            terminated,
        });

        if engine.streams_input() {
            process.write(&user_frame(&request.prompt)).await?;
        }

        info!(
            session_id = %session_id,
            engine = %engine.name,
            pid = ?pid,
            topic_id = %request.topic_id,
            "engine process spawned"
        );

        Ok(SpawnedProcess {
            handle: process,
            output: read_chunks(stdout),
            exit: exit_rx,
        })
    }

    fn supports(&self, engine: &str) -> bool {
        self.engines.contains_key(engine)
    }
}

fn read_chunks(stdout: ChildStdout) -> futures::stream::BoxStream<'static, std::io::Result<Vec<u8>>> {
    stream::unfold(Some(stdout), |state| async move {
        let mut stdout = state?;
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        match stdout.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), Some(stdout)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

/// A spawned engine CLI process.
struct EngineProcess {
    id: String,
    engine: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    terminated: Arc<AtomicBool>,
}

impl EngineProcess {
    fn force_kill(&self) {
        if let Ok(mut guard) = self.kill_tx.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    }
}

#[async_trait]
impl SessionProcess for EngineProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn engine(&self) -> &str {
        &self.engine
    }

    async fn write(&self, bytes: &[u8]) -> DomainResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| DomainError::Transport(format!("session {} input is closed", self.id)))?;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn terminate(&self) -> DomainResult<()> {
        // Close input first so a well-behaved engine can exit on EOF.
        self.stdin.lock().await.take();

        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                debug!(session_id = %self.id, error = %e, "SIGTERM not delivered");
            }
        }

        let kill_tx = self.kill_tx.lock().ok().and_then(|mut guard| guard.take());
        if let Some(kill_tx) = kill_tx {
            let session_id = self.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(TERMINATE_GRACE).await;
                if kill_tx.send(()).is_ok() {
                    debug!(session_id = %session_id, "engine ignored SIGTERM, killing");
                }
            });
        }

        info!(session_id = %self.id, engine = %self.engine, "engine process terminated");
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.force_kill();
    }
}
