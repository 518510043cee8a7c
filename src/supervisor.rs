//! Worker supervisor
//!
//! The coordinator starts N worker processes and replaces every one that
//! exits. Replacements get a fresh index that is never reused. A worker
//! that dies young is replaced after an exponential backoff delay. Once a
//! worker survives `min_uptime` the backoff resets to zero.
//!
//! Process handling sits behind `WorkerLauncher`, so the coordinator's
//! bookkeeping can be driven without spawning real processes.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ServerSettings;
use crate::server::parse_ready_line;

/// Lifecycle notifications from workers
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Listening { index: usize, addr: SocketAddr },
    Exited {
        index: usize,
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
        uptime: Duration,
    },
}

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;

/// Starts and stops worker processes
#[async_trait]
pub trait WorkerLauncher: Send {
    /// Start worker `index`, reporting its events on `events`; returns its pid
    fn launch(&mut self, index: usize, events: EventSender) -> io::Result<Option<u32>>;

    /// Stop every running worker and wait for them to exit
    async fn shutdown(&mut self);
}

/// Timing knobs of the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub workers: usize,
    pub min_uptime: Duration,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl SupervisorSettings {
    pub fn from_server(server: &ServerSettings, workers: usize) -> Self {
        Self {
            workers,
            min_uptime: Duration::from_secs(server.min_uptime_secs),
            backoff: Duration::from_millis(server.respawn_backoff_ms),
            max_backoff: Duration::from_millis(server.max_respawn_backoff_ms),
        }
    }
}

/// Delay before replacing a worker, given how many workers in a row died young
pub fn respawn_delay(rapid_failures: u32, base: Duration, max: Duration) -> Duration {
    if rapid_failures == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(rapid_failures - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub pid: Option<u32>,
    pub listening: Option<SocketAddr>,
}

/// Live workers by index, shared with observers
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<Mutex<BTreeMap<usize, WorkerInfo>>>,
}

impl WorkerRegistry {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<usize, WorkerInfo>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, index: usize, pid: Option<u32>) {
        self.lock().insert(index, WorkerInfo { pid, listening: None });
    }

    fn mark_listening(&self, index: usize, addr: SocketAddr) {
        if let Some(worker) = self.lock().get_mut(&index) {
            worker.listening = Some(addr);
        }
    }

    fn remove(&self, index: usize) -> Option<WorkerInfo> {
        self.lock().remove(&index)
    }

    /// Indices of running workers, ascending
    pub fn indices(&self) -> Vec<usize> {
        self.lock().keys().copied().collect()
    }

    pub fn get(&self, index: usize) -> Option<WorkerInfo> {
        self.lock().get(&index).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counters reported when the coordinator stops
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupervisorReport {
    pub launched: usize,
    pub exited: usize,
    pub respawned: usize,
}

pub struct Coordinator<L: WorkerLauncher> {
    launcher: L,
    settings: SupervisorSettings,
    registry: WorkerRegistry,
    next_index: usize,
    rapid_failures: u32,
    report: SupervisorReport,
}

impl<L: WorkerLauncher> Coordinator<L> {
    pub fn new(launcher: L, settings: SupervisorSettings) -> Self {
        Self {
            launcher,
            settings,
            registry: WorkerRegistry::default(),
            next_index: 1,
            rapid_failures: 0,
            report: SupervisorReport::default(),
        }
    }

    pub fn registry(&self) -> WorkerRegistry {
        self.registry.clone()
    }

    fn spawn_worker(&mut self, events: &EventSender) -> io::Result<usize> {
        let index = self.next_index;
        self.next_index += 1;

        let pid = self.launcher.launch(index, events.clone())?;
        self.registry.insert(index, pid);
        self.report.launched += 1;
        info!("Forked worker {} (pid {:?})", index, pid);
        Ok(index)
    }

    /// Backoff for the replacement of a worker that ran for `uptime`
    fn next_delay(&mut self, uptime: Duration) -> Duration {
        if uptime >= self.settings.min_uptime {
            self.rapid_failures = 0;
        } else {
            self.rapid_failures = self.rapid_failures.saturating_add(1);
        }
        respawn_delay(self.rapid_failures, self.settings.backoff, self.settings.max_backoff)
    }

    /// Supervise workers until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> io::Result<SupervisorReport> {
        let (events, mut inbox) = mpsc::unbounded_channel();

        info!("Coordinator starting {} workers", self.settings.workers);
        for _ in 0..self.settings.workers {
            if let Err(e) = self.spawn_worker(&events) {
                self.launcher.shutdown().await;
                return Err(e);
            }
        }

        'supervise: loop {
            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break 'supervise;
                    }
                    continue 'supervise;
                }
                event = inbox.recv() => match event {
                    Some(event) => event,
                    None => break 'supervise,
                },
            };

            match event {
                WorkerEvent::Listening { index, addr } => {
                    info!("Worker {} is listening at {}", index, addr);
                    self.registry.mark_listening(index, addr);
                }
                WorkerEvent::Exited { index, code, uptime } => {
                    self.report.exited += 1;
                    self.registry.remove(index);
                    warn!(
                        "Worker {} died (exit code {:?}) after {:.1}s",
                        index,
                        code,
                        uptime.as_secs_f64()
                    );

                    let delay = self.next_delay(uptime);
                    if !delay.is_zero() {
                        info!("Waiting {:?} before replacing worker {}", delay, index);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break 'supervise;
                                }
                            }
                        }
                    }

                    match self.spawn_worker(&events) {
                        Ok(replacement) => {
                            self.report.respawned += 1;
                            debug!("Worker {} replaced by worker {}", index, replacement);
                        }
                        Err(e) => {
                            // Treated like a worker that died at once, so retries back off.
                            error!("Failed to fork replacement for worker {}: {}", index, e);
                            let _ = events.send(WorkerEvent::Exited {
                                index: self.next_index - 1,
                                code: None,
                                uptime: Duration::ZERO,
                            });
                        }
                    }
                }
            }
        }

        info!("Coordinator shutting down {} workers", self.registry.len());
        self.launcher.shutdown().await;
        Ok(self.report)
    }
}

struct ChildHandle {
    kill: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Launches workers as child processes of a given program
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    children: HashMap<usize, ChildHandle>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
            children: HashMap::new(),
        }
    }

    /// Re-execute the running binary
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, Vec::new()))
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    fn launch(&mut self, index: usize, events: EventSender) -> io::Result<Option<u32>> {
        self.children.retain(|_, child| !child.task.is_finished());

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--worker-index")
            .arg(index.to_string())
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        let started = Instant::now();

        if let Some(stdout) = child.stdout.take() {
            let events = events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match parse_ready_line(&line) {
                        Some(addr) => {
                            let _ = events.send(WorkerEvent::Listening { index, addr });
                        }
                        None => debug!("worker {}: {}", index, line),
                    }
                }
            });
        }

        let (kill, mut killed) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut killed => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill worker {}: {}", index, e);
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    error!("Failed to wait for worker {}: {}", index, e);
                    None
                }
            };
            let _ = events.send(WorkerEvent::Exited {
                index,
                code,
                uptime: started.elapsed(),
            });
        });

        self.children.insert(index, ChildHandle { kill, task });
        Ok(pid)
    }

    async fn shutdown(&mut self) {
        for (index, child) in self.children.drain() {
            let _ = child.kill.send(());
            if let Err(e) = child.task.await {
                warn!("Worker {} monitor ended abnormally: {}", index, e);
            }
        }
    }
}
