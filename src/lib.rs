pub mod cli;
pub mod config;
pub mod demux;
pub mod error;
pub mod notifier;
pub mod protocol;
pub mod scheduler;
pub mod sse;
pub mod store;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use config::Config;
use demux::Demultiplexer;
use error::GenerationError;
use notifier::{ChannelHub, ChannelMessage};
use protocol::{continuation_prompt, continuation_seed, initial_prompt, CompletionRequest};
use scheduler::{FlushDirective, UpdateScheduler};
use sse::SseParser;
use store::{PersistedResultSet, ResultStore, StoredStream};
use transport::Transport;

pub use demux::{StreamBuffer, StreamUpdate};

// ---------------------------------------------------------------------------
// Run lifecycle
// ---------------------------------------------------------------------------

/// Per-run state machine. `Completed`, `Cancelled`, and `Failed` are
/// terminal for that run instance; a new start supersedes the old run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Called once per applied delta and once more per non-empty stream at the
/// end of a successful run.
pub type ProgressFn = Box<dyn FnMut(StreamUpdate) + Send>;

/// How a run ended, decided by the driver loop.
enum Outcome {
    Completed,
    Cancelled,
    Failed(GenerationError),
}

struct ActiveRun {
    id: Uuid,
    cancel: CancellationToken,
    superseded: Arc<AtomicBool>,
    state_rx: watch::Receiver<RunState>,
    _task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// GenerationCoordinator — the process-wide run manager
// ---------------------------------------------------------------------------

/// Owns the single active generation run: opens the transport, demultiplexes
/// the stream, schedules flushes into the store and the broadcast hub, and
/// supersedes itself when a new request arrives.
pub struct GenerationCoordinator {
    client: Client,
    config: Config,
    store: Arc<ResultStore>,
    hub: ChannelHub,
    active: Mutex<Option<ActiveRun>>,
}

impl GenerationCoordinator {
    pub fn new(config: Config, store: Arc<ResultStore>, hub: ChannelHub) -> Self {
        GenerationCoordinator {
            client: Client::new(),
            config,
            store,
            hub,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn hub(&self) -> &ChannelHub {
        &self.hub
    }

    /// Start a fresh generation of `stream_count` continuations of `prompt`,
    /// superseding any in-flight run. Returns the new run's id.
    pub fn start_generation(
        &self,
        prompt: &str,
        stream_count: usize,
        max_tokens: Option<u32>,
        on_progress: ProgressFn,
    ) -> Uuid {
        self.launch(
            vec![initial_prompt(prompt)],
            vec![String::new(); stream_count],
            stream_count,
            max_tokens.unwrap_or(self.config.max_tokens),
            on_progress,
        )
    }

    /// Resume all streams from their accumulated contents: same mechanics as
    /// a fresh start, with per-stream continuation prompts, seeded buffers,
    /// and the larger continuation token budget.
    pub fn continue_generation(
        &self,
        current_contents: &[String],
        on_progress: ProgressFn,
    ) -> Uuid {
        let prompts = current_contents
            .iter()
            .map(|c| continuation_prompt(c))
            .collect();
        let seeds = current_contents
            .iter()
            .map(|c| continuation_seed(c))
            .collect();
        self.launch(
            prompts,
            seeds,
            current_contents.len(),
            self.config.continue_max_tokens,
            on_progress,
        )
    }

    /// Stop the active run, if any. Quiet: buffered content is flushed, no
    /// terminal broadcast is sent, and queued messages drain normally.
    pub fn cancel(&self) {
        let active = self.active.lock().expect("run slot poisoned");
        if let Some(run) = active.as_ref() {
            run.cancel.cancel();
        }
    }

    /// State of the current (or most recent) run.
    pub fn run_state(&self) -> RunState {
        let active = self.active.lock().expect("run slot poisoned");
        active
            .as_ref()
            .map(|run| *run.state_rx.borrow())
            .unwrap_or(RunState::Idle)
    }

    /// Id of the current (or most recent) run.
    pub fn run_id(&self) -> Option<Uuid> {
        let active = self.active.lock().expect("run slot poisoned");
        active.as_ref().map(|run| run.id)
    }

    /// Wait until the current run leaves `Running`. Returns immediately when
    /// nothing is active.
    pub async fn wait(&self) -> RunState {
        let mut rx = {
            let active = self.active.lock().expect("run slot poisoned");
            match active.as_ref() {
                Some(run) => run.state_rx.clone(),
                None => return RunState::Idle,
            }
        };
        while *rx.borrow() == RunState::Running {
            if rx.changed().await.is_err() {
                break;
            }
        }
        let state = *rx.borrow();
        state
    }

    fn launch(
        &self,
        prompts: Vec<String>,
        seeds: Vec<String>,
        stream_count: usize,
        max_tokens: u32,
        on_progress: ProgressFn,
    ) -> Uuid {
        // Supersede first: the outgoing run must not write a terminal
        // snapshot over the result set this run is about to reset.
        {
            let mut active = self.active.lock().expect("run slot poisoned");
            if let Some(previous) = active.take() {
                previous.superseded.store(true, Ordering::Relaxed);
                previous.cancel.cancel();
            }
        }

        let run_id = Uuid::new_v4();
        let stream_ids: Vec<String> = (0..stream_count)
            .map(|_| Uuid::new_v4().to_string())
            .collect();

        // A snapshot left by a run with a different shape is stale; the new
        // run then resets everything to its fresh loading state. Persistence
        // trouble is never fatal here.
        if let Err(err) = self.store.discard_if_stale(stream_count) {
            warn!(error = %err, "could not discard stale snapshot");
        }
        let initial = initial_snapshot(&stream_ids, &seeds);
        if let Err(err) = self.store.save(&initial) {
            warn!(error = %err, "could not persist initial snapshot");
        }

        let (state_tx, state_rx) = watch::channel(RunState::Running);
        let cancel = CancellationToken::new();
        let superseded = Arc::new(AtomicBool::new(false));
        let ctx = RunContext {
            run_id,
            request: CompletionRequest::new(
                prompts,
                max_tokens,
                &self.config.sampling,
                &self.config.password,
            ),
            seeds,
            stream_ids,
            transport: Transport::new(self.client.clone(), self.config.endpoint.clone()),
            store: Arc::clone(&self.store),
            hub: self.hub.clone(),
            channel: self.config.channel.clone(),
            threshold: self.config.flush_threshold,
            window: self.config.throttle_window(),
            cancel: cancel.clone(),
            superseded: Arc::clone(&superseded),
            state_tx,
            on_progress,
        };
        let task = tokio::spawn(drive_run(ctx));

        let mut active = self.active.lock().expect("run slot poisoned");
        *active = Some(ActiveRun {
            id: run_id,
            cancel,
            superseded,
            state_rx,
            _task: task,
        });
        run_id
    }
}

impl Drop for GenerationCoordinator {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ---------------------------------------------------------------------------
// Run driver
// ---------------------------------------------------------------------------

struct RunContext {
    run_id: Uuid,
    request: CompletionRequest,
    seeds: Vec<String>,
    stream_ids: Vec<String>,
    transport: Transport,
    store: Arc<ResultStore>,
    hub: ChannelHub,
    channel: String,
    threshold: usize,
    window: Duration,
    cancel: CancellationToken,
    superseded: Arc<AtomicBool>,
    state_tx: watch::Sender<RunState>,
    on_progress: ProgressFn,
}

async fn drive_run(mut ctx: RunContext) {
    info!(run = %ctx.run_id, streams = ctx.stream_ids.len(), "generation run started");

    let mut demux = Demultiplexer::with_seeds(ctx.seeds.clone());
    let mut scheduler = UpdateScheduler::new(ctx.threshold, ctx.window);
    let outcome = run_loop(&mut ctx, &mut demux, &mut scheduler).await;

    match outcome {
        Outcome::Completed => {
            demux.finish(&mut |update| {
                scheduler.offer(update.index, update.content.clone(), true);
                (ctx.on_progress)(update);
            });
            flush_terminal(&ctx, &demux, &mut scheduler);
            ctx.hub
                .publish(&ctx.channel, ChannelMessage::GenerationComplete);
            ctx.hub.close_after_drain(&ctx.channel);
            info!(run = %ctx.run_id, tokens = demux.total_tokens(), "generation run completed");
            let _ = ctx.state_tx.send(RunState::Completed);
        }
        Outcome::Cancelled => {
            if ctx.superseded.load(Ordering::Relaxed) {
                // The replacing run already reset the result set; writing
                // this run's buffers now would clobber it.
                info!(run = %ctx.run_id, "generation run superseded");
            } else {
                // Quiet stop: flush what's buffered, no terminal broadcast,
                // let already-queued messages drain.
                flush_terminal(&ctx, &demux, &mut scheduler);
                info!(run = %ctx.run_id, "generation run cancelled");
            }
            let _ = ctx.state_tx.send(RunState::Cancelled);
        }
        Outcome::Failed(err) => {
            flush_terminal(&ctx, &demux, &mut scheduler);
            ctx.hub
                .publish(&ctx.channel, ChannelMessage::GenerationError);
            ctx.hub.close_after_drain(&ctx.channel);
            warn!(run = %ctx.run_id, error = %err, "generation run failed");
            let _ = ctx.state_tx.send(RunState::Failed);
        }
    }
}

async fn run_loop(
    ctx: &mut RunContext,
    demux: &mut Demultiplexer,
    scheduler: &mut UpdateScheduler,
) -> Outcome {
    let response = match ctx.transport.open(&ctx.request, &ctx.cancel).await {
        Ok(response) => response,
        Err(err) if err.is_abort() => return Outcome::Cancelled,
        Err(err) => return Outcome::Failed(err),
    };

    let body = response.bytes_stream();
    tokio::pin!(body);
    let mut parser = SseParser::new();

    loop {
        let deadline = scheduler.deadline();
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Outcome::Cancelled,
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                flush_throttled(ctx, demux, scheduler);
            }
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    let mut flush_now = false;
                    for frame in parser.feed(&bytes) {
                        demux.apply(&frame, &mut |update| {
                            let directive = scheduler.offer(
                                update.index,
                                update.content.clone(),
                                update.complete,
                            );
                            flush_now |= directive == FlushDirective::Immediate;
                            (ctx.on_progress)(update);
                        });
                    }
                    if flush_now {
                        flush_throttled(ctx, demux, scheduler);
                    }
                }
                Some(Err(err)) => return Outcome::Failed(err.into()),
                None => return Outcome::Completed,
            }
        }
    }
}

/// Mid-run flush: broadcast the latest content per index and persist a
/// snapshot off the runtime. Firing with unchanged data is harmless.
fn flush_throttled(ctx: &RunContext, demux: &Demultiplexer, scheduler: &mut UpdateScheduler) {
    let pending = scheduler.fire();
    if pending.is_empty() {
        return;
    }
    for update in &pending {
        ctx.hub.publish(
            &ctx.channel,
            ChannelMessage::UpdateContent {
                index: update.index,
                content: update.content.clone(),
            },
        );
    }
    ctx.store
        .save_deferred(running_snapshot(demux, &ctx.stream_ids));
}

/// Terminal flush: broadcast whatever is pending and force a synchronous
/// save with every index marked no-longer-loading, so a context opened the
/// next instant reads the final shape.
fn flush_terminal(ctx: &RunContext, demux: &Demultiplexer, scheduler: &mut UpdateScheduler) {
    for update in scheduler.fire() {
        ctx.hub.publish(
            &ctx.channel,
            ChannelMessage::UpdateContent {
                index: update.index,
                content: update.content.clone(),
            },
        );
    }
    if let Err(err) = ctx.store.save(&final_snapshot(demux, &ctx.stream_ids)) {
        warn!(error = %err, "could not persist final snapshot");
    }
}

// ---------------------------------------------------------------------------
// Snapshot shaping
// ---------------------------------------------------------------------------

fn initial_snapshot(stream_ids: &[String], seeds: &[String]) -> PersistedResultSet {
    PersistedResultSet {
        streams: stream_ids
            .iter()
            .zip(seeds)
            .map(|(id, seed)| StoredStream {
                id: id.clone(),
                content: seed.clone(),
                is_loading: true,
            })
            .collect(),
    }
}

fn running_snapshot(demux: &Demultiplexer, stream_ids: &[String]) -> PersistedResultSet {
    snapshot(demux, stream_ids, true)
}

fn final_snapshot(demux: &Demultiplexer, stream_ids: &[String]) -> PersistedResultSet {
    snapshot(demux, stream_ids, false)
}

fn snapshot(demux: &Demultiplexer, stream_ids: &[String], running: bool) -> PersistedResultSet {
    PersistedResultSet {
        streams: demux
            .buffers()
            .iter()
            .zip(stream_ids)
            .map(|(buffer, id)| StoredStream {
                id: id.clone(),
                content: buffer.content.clone(),
                is_loading: running && !buffer.complete,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeltaChoice, DeltaContent, DeltaFrame};
    use tempfile::TempDir;

    fn coordinator() -> (TempDir, GenerationCoordinator) {
        let dir = TempDir::new().expect("tempdir");
        let mut config = Config::default();
        config.store_path = dir.path().join("snap.db");
        let store = Arc::new(ResultStore::open(&config.store_path).expect("store"));
        let coordinator = GenerationCoordinator::new(config, store, ChannelHub::new());
        (dir, coordinator)
    }

    fn content_frame(index: i64, text: &str) -> DeltaFrame {
        DeltaFrame {
            object: None,
            choices: vec![DeltaChoice {
                index,
                delta: DeltaContent {
                    content: Some(text.to_string()),
                },
            }],
        }
    }

    #[test]
    fn test_idle_before_any_run() {
        let (_dir, c) = coordinator();
        assert_eq!(c.run_state(), RunState::Idle);
        assert!(c.run_id().is_none());
    }

    #[test]
    fn test_cancel_without_run_is_a_no_op() {
        let (_dir, c) = coordinator();
        c.cancel();
        assert_eq!(c.run_state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_wait_returns_idle_with_no_run() {
        let (_dir, c) = coordinator();
        assert_eq!(c.wait().await, RunState::Idle);
    }

    #[test]
    fn test_initial_snapshot_marks_all_loading() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let seeds = vec![String::new(), "seed\n\n".to_string()];
        let snap = initial_snapshot(&ids, &seeds);
        assert_eq!(snap.stream_count(), 2);
        assert!(snap.streams.iter().all(|s| s.is_loading));
        assert_eq!(snap.streams[1].content, "seed\n\n");
    }

    #[test]
    fn test_final_snapshot_clears_loading_even_for_empty_buffers() {
        let mut demux = Demultiplexer::new(3);
        demux.apply(&content_frame(0, "abc"), &mut |_| {});
        demux.finish(&mut |_| {});

        let ids: Vec<String> = (0..3).map(|i| format!("id-{i}")).collect();
        let snap = final_snapshot(&demux, &ids);
        assert_eq!(snap.streams[0].content, "abc");
        assert!(snap.streams.iter().all(|s| !s.is_loading));
    }

    #[test]
    fn test_running_snapshot_keeps_incomplete_loading() {
        let mut demux = Demultiplexer::new(2);
        let ids: Vec<String> = (0..2).map(|i| format!("id-{i}")).collect();
        let snap = running_snapshot(&demux, &ids);
        assert!(snap.streams.iter().all(|s| s.is_loading));

        demux.apply(&content_frame(1, "x"), &mut |_| {});
        demux.finish(&mut |_| {});
        let snap = running_snapshot(&demux, &ids);
        assert!(snap.streams[0].is_loading);
        assert!(!snap.streams[1].is_loading);
    }
}
