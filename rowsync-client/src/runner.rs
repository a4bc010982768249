//! Push/pull connection loop.
//!
//! One loop runs per direction. Every cycle walks
//! Pending -> Debounce -> WaitSlot -> Delay -> Send and back to Pending:
//! requests collected while debouncing share one dispatch, a semaphore caps
//! concurrent dispatches, and the inter-send delay adapts to observed
//! dispatch durations - the median of the last few successes divided by the
//! connection budget, clamped to the configured window. Failures back off
//! exponentially until the next success.

use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    select,
    sync::{mpsc, oneshot, watch, Semaphore},
    time::{sleep, Instant},
};
use tracing::{debug, warn};

/// How many successful dispatch durations feed the adaptive delay.
const DURATION_SAMPLES: usize = 9;

#[derive(thiserror::Error, Debug, PartialEq, Clone)]
#[error("connection loop closed")]
pub struct ClosedError;

/// Performs one push or pull request. The loop owns scheduling; the
/// dispatcher owns the wire.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self) -> Result<(), String>;
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Upper bound on concurrent dispatches.
    pub max_connections: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Wakes Pending even without an explicit send.
    pub watchdog: Duration,
    /// How long Pending lingers to coalesce bursts of send requests.
    pub debounce: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            max_connections: 3,
            min_delay: Duration::from_millis(30),
            max_delay: Duration::from_secs(60),
            watchdog: Duration::from_secs(10),
            debounce: Duration::from_millis(10),
        }
    }
}

enum Cmd {
    Send { now: bool, done: oneshot::Sender<()> },
    Close,
}

struct LoopState {
    durations: VecDeque<Duration>,
    delay: Duration,
    failed: bool,
}

impl LoopState {
    fn record_success(&mut self, elapsed: Duration, config: &RunnerConfig) {
        self.durations.push_back(elapsed);
        while self.durations.len() > DURATION_SAMPLES {
            self.durations.pop_front();
        }
        if self.failed {
            self.failed = false;
            self.delay = config.min_delay;
        } else {
            let spread = median(&self.durations) / config.max_connections.max(1) as u32;
            self.delay = spread.clamp(config.min_delay, config.max_delay);
        }
    }

    fn record_failure(&mut self, config: &RunnerConfig) {
        self.failed = true;
        self.delay = (self.delay * 2)
            .clamp(config.min_delay, config.max_delay);
    }
}

fn median(durations: &VecDeque<Duration>) -> Duration {
    if durations.is_empty() {
        return Duration::ZERO;
    }
    let mut sorted: Vec<Duration> = durations.iter().copied().collect();
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2
    }
}

/// Handle to a running loop. Dropping the handle closes the loop.
pub struct ConnectionLoop {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    closed: Arc<AtomicBool>,
}

impl ConnectionLoop {
    /// Spawns the loop. A visibility watcher, when supplied, gates
    /// non-urgent sends until it reads `true`.
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        config: RunnerConfig,
        visibility: Option<watch::Receiver<bool>>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(run(dispatcher, config, cmd_rx, visibility, closed.clone()));
        ConnectionLoop { cmd_tx, closed }
    }

    /// Requests a dispatch and resolves once it ran. `now` skips debounce,
    /// delay and visibility gating.
    pub async fn send(&self, now: bool) -> Result<(), ClosedError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClosedError);
        }
        let (done, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Send { now, done })
            .map_err(|_| ClosedError)?;
        // A dropped resolver means the loop terminated underneath us.
        done_rx.await.map_err(|_| ClosedError)
    }

    /// Transitions to the terminal state; every pending and future send
    /// rejects with [`ClosedError`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.cmd_tx.send(Cmd::Close);
    }
}

impl Drop for ConnectionLoop {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    dispatcher: Arc<dyn Dispatcher>,
    config: RunnerConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    mut visibility: Option<watch::Receiver<bool>>,
    closed: Arc<AtomicBool>,
) {
    let semaphore = Arc::new(Semaphore::new(config.max_connections));
    let state = Arc::new(Mutex::new(LoopState {
        durations: VecDeque::new(),
        delay: config.min_delay,
        failed: false,
    }));

    'pending: loop {
        let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();
        let mut urgent = false;

        // Pending: a send request or the watchdog wakes us.
        select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Cmd::Close) => break 'pending,
                Some(Cmd::Send { now, done }) => {
                    waiters.push(done);
                    urgent = now;
                }
            },
            _ = sleep(config.watchdog) => {
                debug!("watchdog tick");
            }
        }

        // Debounce: coalesce a burst into one dispatch.
        if !urgent {
            let deadline = sleep(config.debounce);
            tokio::pin!(deadline);
            loop {
                select! {
                    _ = &mut deadline => break,
                    cmd = cmd_rx.recv() => match cmd {
                        None | Some(Cmd::Close) => break 'pending,
                        Some(Cmd::Send { now, done }) => {
                            waiters.push(done);
                            if now {
                                urgent = true;
                                break;
                            }
                        }
                    },
                }
            }
        }

        if !urgent {
            if let Some(watcher) = &mut visibility {
                while !*watcher.borrow() {
                    if watcher.changed().await.is_err() {
                        break;
                    }
                }
            }
        }

        // WaitSlot.
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closes");

        // Delay, interruptible by an urgent send joining in.
        if !urgent {
            let delay = state.lock().expect("loop state lock").delay;
            let deadline = sleep(delay);
            tokio::pin!(deadline);
            loop {
                select! {
                    _ = &mut deadline => break,
                    cmd = cmd_rx.recv() => match cmd {
                        None | Some(Cmd::Close) => break 'pending,
                        Some(Cmd::Send { now, done }) => {
                            waiters.push(done);
                            if now {
                                break;
                            }
                        }
                    },
                }
            }
        }

        // Send: runs detached so the loop can pipeline up to the budget.
        let dispatcher = dispatcher.clone();
        let state = state.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = dispatcher.dispatch().await;
            let elapsed = started.elapsed();
            {
                let mut state = state.lock().expect("loop state lock");
                match &result {
                    Ok(()) => state.record_success(elapsed, &config),
                    Err(err) => {
                        warn!(%err, "dispatch failed, backing off");
                        state.record_failure(&config);
                    }
                }
            }
            for done in waiters {
                let _ = done.send(());
            }
            drop(permit);
        });
    }

    // Terminal: reject everything still queued by dropping the resolvers.
    closed.store(true, Ordering::Release);
    cmd_rx.close();
    while cmd_rx.recv().await.is_some() {}
    debug!("connection loop closed");
}
