//! Mock session spawner for testing and dry runs.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::{ProcessExit, SessionProcess, SessionSpawner, SpawnRequest, SpawnedProcess};

/// Scripted behaviour of one mock session.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Raw output chunks, emitted in order
    pub chunks: Vec<Vec<u8>>,
    /// Delay before each chunk
    pub chunk_delay: Option<Duration>,
    /// Fail the spawn itself with this message
    pub spawn_error: Option<String>,
    /// After the chunks, report a dropped transport
    pub transport_error: bool,
    /// Keep the output open until terminated
    pub hold_open: bool,
    pub exit_code: Option<i32>,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            chunks: vec![],
            chunk_delay: None,
            spawn_error: None,
            transport_error: false,
            hold_open: false,
            exit_code: Some(0),
        }
    }
}

impl MockScript {
    /// Emit the given NDJSON lines, one chunk each.
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: lines
                .into_iter()
                .map(|l| {
                    let mut line: String = l.into();
                    line.push('\n');
                    line.into_bytes()
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Emit arbitrary chunks without adding newlines.
    pub fn chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        Self {
            chunks: chunks.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Stream some assistant text and finish successfully.
    pub fn completes_with(text: &str) -> Self {
        Self::lines([
            serde_json::json!({"type": "system", "subtype": "init"}).to_string(),
            serde_json::json!({"type": "assistant", "text": text}).to_string(),
            serde_json::json!({"type": "result", "subtype": "success", "result": text, "is_error": false, "total_cost_usd": 0.01})
                .to_string(),
        ])
    }

    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn with_transport_error(mut self) -> Self {
        self.transport_error = true;
        self.exit_code = None;
        self
    }

    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

/// Spawn recorded by the mock.
#[derive(Debug, Clone)]
pub struct RecordedSpawn {
    pub session_id: String,
    pub request: SpawnRequest,
    pub writes: Arc<RwLock<Vec<Vec<u8>>>>,
    pub terminated: Arc<AtomicBool>,
}

impl RecordedSpawn {
    pub async fn written_text(&self) -> Vec<String> {
        self.writes
            .read()
            .await
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Mock spawner with per-engine script queues.
///
/// Each spawn for an engine pops the next script; the last one is reused
/// once the queue is down to a single entry.
pub struct MockSpawner {
    scripts: Arc<RwLock<HashMap<String, VecDeque<MockScript>>>>,
    default_script: MockScript,
    spawns: Arc<RwLock<Vec<RecordedSpawn>>>,
}

impl MockSpawner {
    pub fn new() -> Self {
        Self::with_default_script(MockScript::completes_with("Mock task completed successfully."))
    }

    pub fn with_default_script(script: MockScript) -> Self {
        Self {
            scripts: Arc::new(RwLock::new(HashMap::new())),
            default_script: script,
            spawns: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Queue a script for the next spawn of `engine`.
    pub async fn push_script(&self, engine: &str, script: MockScript) {
        let mut scripts = self.scripts.write().await;
        scripts.entry(engine.to_string()).or_default().push_back(script);
    }

    async fn next_script(&self, engine: &str) -> MockScript {
        let mut scripts = self.scripts.write().await;
        match scripts.get_mut(engine) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| self.default_script.clone()),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| self.default_script.clone()),
            None => self.default_script.clone(),
        }
    }

    /// All spawns so far, in order.
    pub async fn spawns(&self) -> Vec<RecordedSpawn> {
        self.spawns.read().await.clone()
    }

    pub async fn spawn_count(&self) -> usize {
        self.spawns.read().await.len()
    }
}

impl Default for MockSpawner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionSpawner for MockSpawner {
    async fn spawn(&self, request: SpawnRequest) -> DomainResult<SpawnedProcess> {
        let script = self.next_script(&request.engine).await;
        if let Some(message) = script.spawn_error {
            return Err(DomainError::SpawnFailed(message));
        }

        let session_id = Uuid::new_v4().to_string();
        let writes = Arc::new(RwLock::new(Vec::new()));
        let terminated = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(Notify::new());

        self.spawns.write().await.push(RecordedSpawn {
            session_id: session_id.clone(),
            request: request.clone(),
            writes: Arc::clone(&writes),
            terminated: Arc::clone(&terminated),
        });

        let (out_tx, out_rx) = mpsc::channel::<std::io::Result<Vec<u8>>>(64);
        let (exit_tx, exit_rx) = oneshot::channel();

        let feeder_terminated = Arc::clone(&terminated);
        let feeder_stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut killed = false;
            for chunk in script.chunks {
                if let Some(delay) = script.chunk_delay {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = feeder_stop.notified() => { killed = true; break; }
                    }
                }
                if feeder_terminated.load(Ordering::SeqCst) {
                    killed = true;
                    break;
                }
                if out_tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
            if !killed && script.transport_error {
                let _ = out_tx
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "mock transport dropped",
                    )))
                    .await;
            }
            if !killed && script.hold_open && !feeder_terminated.load(Ordering::SeqCst) {
                feeder_stop.notified().await;
                killed = true;
            }
            drop(out_tx);
            let killed = killed || feeder_terminated.load(Ordering::SeqCst);
            let code = if killed { None } else { script.exit_code };
            let _ = exit_tx.send(ProcessExit { code });
        });

        let output = stream::unfold(out_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Ok(SpawnedProcess {
            handle: Arc::new(MockProcess {
                id: session_id,
                engine: request.engine,
                writes,
                terminated,
                stop,
            }),
            output,
            exit: exit_rx,
        })
    }

    fn supports(&self, _engine: &str) -> bool {
        true
    }
}

struct MockProcess {
    id: String,
    engine: String,
    writes: Arc<RwLock<Vec<Vec<u8>>>>,
    terminated: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

#[async_trait]
impl SessionProcess for MockProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn engine(&self) -> &str {
        &self.engine
    }

    async fn write(&self, bytes: &[u8]) -> DomainResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(DomainError::Transport(format!("session {} input is closed", self.id)));
        }
        self.writes.write().await.push(bytes.to_vec());
        Ok(())
    }

    async fn terminate(&self) -> DomainResult<()> {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.stop.notify_one();
        }
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}
