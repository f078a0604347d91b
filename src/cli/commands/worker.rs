//! Implementation of the `taskwire worker` commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapters::chat::{ConsoleChatSender, WebhookChatSender};
use crate::adapters::reporter::LoggingResultReporter;
use crate::adapters::substrates::{EngineProcessSpawner, MockSpawner};
use crate::adapters::workspace::LocalWorkspacePreparer;
use crate::cli::commands::CommandContext;
use crate::domain::models::Config;
use crate::domain::ports::{ChatSender, SessionSpawner};
use crate::infrastructure::config::ConfigLoader;
use crate::services::{
    ChatterSuppressor, EngineFailoverController, ExecutorConfig, FailoverPolicy, InboundDispatcher,
    RecoveryService, SessionBridge, SuppressingChatSender, TaskExecutor, TopicRouter,
    TopicRouterConfig,
};

/// Reply the local host sends for every inbound line it reads.
const HOST_ACK: &str = "Reply received.";

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub command: WorkerCommands,
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommands {
    /// Claim and execute tasks until interrupted
    Run(RunArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Machine id (defaults to worker.machine_id, then the host name)
    #[arg(long)]
    pub machine_id: Option<String>,

    /// Only claim tasks for this project
    #[arg(long)]
    pub project: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    pub max_concurrency: Option<u32>,

    /// Also run the stale machine and task recovery sweep
    #[arg(long)]
    pub with_recovery: bool,

    /// Read `<topic> <text>` lines from stdin as chat replies
    #[arg(long)]
    pub stdin_replies: bool,

    /// Use a scripted engine instead of launching engine processes
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(id) = &self.machine_id {
            config.worker.machine_id = Some(id.clone());
        }
        if let Some(project) = &self.project {
            config.worker.project_filter = Some(project.clone());
        }
        if let Some(n) = self.max_concurrency {
            config.worker.max_concurrency = n;
        }
    }
}

pub async fn execute(args: WorkerArgs, _json_mode: bool) -> Result<()> {
    match args.command {
        WorkerCommands::Run(run) => run_worker(run).await,
    }
}

async fn run_worker(args: RunArgs) -> Result<()> {
    let mut config = ConfigLoader::load().context("Failed to load configuration")?;
    args.apply(&mut config);
    ConfigLoader::validate(&config)?;
    let ctx = CommandContext::with_config(config).await?;
    let config = &ctx.config;

    let chat: Arc<dyn ChatSender> = match &config.chat.webhook_url {
        Some(url) => Arc::new(
            WebhookChatSender::new(url.clone(), config.chat.max_sends_per_second)
                .context("Failed to create webhook chat sender")?,
        ),
        None => Arc::new(ConsoleChatSender::new()),
    };

    let suppressor = ChatterSuppressor::in_memory(config.suppression.ttl());
    let paths = ChatPaths::new(chat, suppressor.clone());
    let router = TopicRouter::new(paths.direct.clone(), TopicRouterConfig::from(&config.router));

    let spawner: Arc<dyn SessionSpawner> = if args.dry_run {
        Arc::new(MockSpawner::new())
    } else {
        Arc::new(EngineProcessSpawner::new(config.engines.clone()))
    };

    let transcript_entries = config.router.transcript_entries;
    let failover = Arc::new(EngineFailoverController::new(
        FailoverPolicy::from(&config.failover),
        spawner.clone(),
        router.clone(),
        Some(ctx.store.clone()),
        transcript_entries,
    ));
    let bridge = Arc::new(SessionBridge::new(
        spawner,
        router.clone(),
        failover,
        config.transport.clone(),
        transcript_entries,
    ));

    let executor = TaskExecutor::new(
        ctx.store.clone(),
        ctx.registry.clone(),
        bridge,
        Arc::new(LocalWorkspacePreparer::new(PathBuf::from(&config.worker.workspace_root))),
        Arc::new(LoggingResultReporter),
        paths.direct.clone(),
        ExecutorConfig::from_worker(&config.worker),
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let mut handles: Vec<JoinHandle<()>> = vec![
        executor.start_heartbeat_loop(shutdown_tx.subscribe()),
        executor.start_poll_loop(shutdown_tx.subscribe()),
        suppressor.start_evictor(config.suppression.ttl(), shutdown_tx.subscribe()),
    ];

    if args.with_recovery {
        let recovery = RecoveryService::new(ctx.store.clone(), ctx.registry.clone(), config.recovery.clone());
        handles.push(recovery.start(shutdown_tx.subscribe()));
    }

    if args.stdin_replies {
        let dispatcher = InboundDispatcher::new(router.clone(), suppressor.clone());
        handles.push(start_stdin_replies(dispatcher, paths.host.clone(), shutdown_tx.subscribe()));
    }

    info!(
        machine_id = %executor.config().machine_id,
        max_concurrency = executor.config().max_concurrency,
        dry_run = args.dry_run,
        "worker running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt")?;
    info!("interrupt received, shutting down worker");

    let requeued = executor.shutdown().await.context("Worker shutdown failed")?;
    if !requeued.is_empty() {
        info!(count = requeued.len(), "tasks handed back to the queue");
    }
    shutdown_tx.send(()).ok();
    for handle in handles {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("background task did not stop in time");
        }
    }
    ctx.pool.close().await;
    Ok(())
}

/// Outgoing chat paths for one worker.
///
/// Only the host's own replies consult suppression. Session output and
/// worker notices such as task failures always go out, so an armed entry
/// can never swallow them.
struct ChatPaths {
    host: Arc<SuppressingChatSender>,
    direct: Arc<dyn ChatSender>,
}

impl ChatPaths {
    fn new(chat: Arc<dyn ChatSender>, suppressor: ChatterSuppressor) -> Self {
        let host = Arc::new(SuppressingChatSender::new(chat, suppressor));
        let direct = host.passthrough();
        Self { host, direct }
    }
}

/// Split an inbound line into topic and reply text.
fn parse_reply_line(line: &str) -> Option<(&str, &str)> {
    let (topic, text) = line.trim().split_once(char::is_whitespace)?;
    let text = text.trim();
    (!topic.is_empty() && !text.is_empty()).then_some((topic, text))
}

/// Local stand-in for a chat host: every line is routed to its topic's
/// session, then answered with the host's own acknowledgment. The
/// acknowledgment passes through suppression, so it is only seen when no
/// session took the reply.
fn start_stdin_replies(
    dispatcher: InboundDispatcher,
    host_sender: Arc<SuppressingChatSender>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "failed to read stdin");
                            break;
                        }
                    };
                    let Some((topic, text)) = parse_reply_line(&line) else {
                        warn!("ignoring stdin line; expected `<topic> <text>`");
                        continue;
                    };
                    let ack = match dispatcher.dispatch(topic, text).await {
                        Ok(_) => HOST_ACK.to_string(),
                        Err(e) => format!("{HOST_ACK} No session took it: {e}"),
                    };
                    if let Err(e) = host_sender.send(topic, &ack).await {
                        warn!(topic_id = %topic, error = %e, "host reply failed");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::chat::RecordingChatSender;

    #[test]
    fn test_parse_reply_line() {
        assert_eq!(parse_reply_line("42 use sqlite please"), Some(("42", "use sqlite please")));
        assert_eq!(parse_reply_line("  task:abc   2  "), Some(("task:abc", "2")));
        assert_eq!(parse_reply_line("42"), None);
        assert_eq!(parse_reply_line("   "), None);
    }

    #[tokio::test]
    async fn test_worker_notices_bypass_armed_suppression() {
        let recorder = Arc::new(RecordingChatSender::new());
        let suppressor = ChatterSuppressor::in_memory(Duration::from_secs(60));
        let paths = ChatPaths::new(recorder.clone(), suppressor.clone());

        suppressor.suppress_next("42", Duration::from_secs(60)).await;
        paths.direct.send("42", "Task failed: spawn failed").await.unwrap();
        assert_eq!(recorder.texts_for("42").await, vec!["Task failed: spawn failed"]);

        // The entry is still armed for the host's own reply.
        paths.host.send("42", HOST_ACK).await.unwrap();
        assert_eq!(recorder.texts_for("42").await.len(), 1);
        paths.host.send("42", HOST_ACK).await.unwrap();
        assert_eq!(recorder.texts_for("42").await.len(), 2);
    }

    #[test]
    fn test_run_args_override_config() {
        let mut config = Config::default();
        let args = RunArgs {
            machine_id: Some("m1".into()),
            max_concurrency: Some(6),
            ..RunArgs::default()
        };
        args.apply(&mut config);
        assert_eq!(config.worker.machine_id.as_deref(), Some("m1"));
        assert_eq!(config.worker.max_concurrency, 6);
        assert!(config.worker.project_filter.is_none());
    }
}
