//! Worker lifecycle and channel command handler (component design §4.5 / §4.6).
//!
//! The worker's own event loop is explicitly out of scope; what's specified here is
//! initialization (claiming the inherited channel fd, closing unrelated sibling fds),
//! the lifecycle flags the channel handler drives, and the run/exit sequencing around
//! an opaque application loop supplied by the caller.

use std::collections::HashMap;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dusa_collection_utils::core::errors::{ErrorArrayItem, Errors};
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use tokio::sync::Mutex;

use crate::channel::{ChannelEndpoint, Command as ChanCommand};
use crate::config::SupervisorConfig;
use crate::master::{ENV_WORKER_CHANNEL_FD, ENV_WORKER_SLOT};
use crate::plugin::{self, LoggingPlugin, Plugin};

/// Lifecycle flags the channel handler sets and the run loop consumes, mirroring the
/// worker-local view of the spec's global flags.
#[derive(Debug, Default)]
pub struct WorkerFlags {
    pub quit: AtomicBool,
    pub terminate: AtomicBool,
    pub reopen: AtomicBool,
}

impl WorkerFlags {
    pub fn is_terminate(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }
    pub fn take_quit(&self) -> bool {
        self.quit.swap(false, Ordering::SeqCst)
    }
    pub fn take_reopen(&self) -> bool {
        self.reopen.swap(false, Ordering::SeqCst)
    }
}

/// A worker's local view of its siblings, populated by `OPEN_CHANNEL`/`CLOSE_CHANNEL`
/// records as they arrive.
#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<i32, (i32, OwnedFd)>>,
}

impl PeerTable {
    fn new() -> Self {
        Self::default()
    }

    pub async fn peer_pid(&self, slot: i32) -> Option<i32> {
        self.peers.lock().await.get(&slot).map(|(pid, _)| *pid)
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }
}

/// Everything a running worker needs: its own channel endpoint, its lifecycle flags,
/// and its local peer table.
pub struct WorkerContext {
    pub slot: usize,
    channel: Arc<ChannelEndpoint>,
    pub flags: Arc<WorkerFlags>,
    pub peers: Arc<PeerTable>,
}

impl WorkerContext {
    /// Initializes worker state from the environment handoff set by the master's spawn
    /// (`FLEET_WORKER_SLOT`, `FLEET_WORKER_CHANNEL_FD`), per §4.5 init, then runs the
    /// mandatory configure step: `apply_config` for every registered plugin module.
    pub async fn init_from_env() -> Result<Self, ErrorArrayItem> {
        let slot: usize = std::env::var(ENV_WORKER_SLOT)
            .map_err(|_| ErrorArrayItem::new(Errors::InitializationError, "missing slot env var"))?
            .parse()
            .map_err(|_| ErrorArrayItem::new(Errors::InitializationError, "bad slot env var"))?;
        let fd: RawFd = std::env::var(ENV_WORKER_CHANNEL_FD)
            .map_err(|_| ErrorArrayItem::new(Errors::InitializationError, "missing channel fd env var"))?
            .parse()
            .map_err(|_| ErrorArrayItem::new(Errors::InitializationError, "bad channel fd env var"))?;

        // SAFETY: the master's spawn handoff guarantees this fd is an open,
        // non-blocking socket owned exclusively by this process from here on.
        let channel = unsafe { ChannelEndpoint::from_raw_fd(fd)? };

        log!(LogLevel::Info, "Worker initialized for slot {}", slot);

        let config = SupervisorConfig::load().unwrap_or_default();
        let plugins: Vec<Box<dyn Plugin>> = vec![Box::new(LoggingPlugin)];
        plugin::configure_all(&plugins, &config).await;

        Ok(Self {
            slot,
            channel: Arc::new(channel),
            flags: Arc::new(WorkerFlags::default()),
            peers: Arc::new(PeerTable::new()),
        })
    }

    /// Spawns the channel-read task described in §4.6. Returns its join handle so the
    /// caller can await it alongside the application loop.
    pub fn spawn_channel_handler(&self) -> tokio::task::JoinHandle<()> {
        let channel = self.channel.clone();
        let flags = self.flags.clone();
        let peers = self.peers.clone();
        tokio::spawn(async move { channel_handler(channel, flags, peers).await })
    }

    /// Runs the worker's lifecycle around an opaque application loop `app`: polls
    /// `app` to completion, then checks lifecycle flags, matching §4.5's run sequence.
    /// `app` is expected to return promptly once it observes `flags.terminate` or
    /// after the worker requests a graceful stop; this function never fabricates that
    /// cooperation, it only sequences around it.
    pub async fn run<F, Fut>(&self, app: F) -> Result<(), ErrorArrayItem>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            if self.flags.is_terminate() {
                break;
            }

            app().await;

            if self.flags.is_terminate() {
                break;
            }
            if self.flags.take_quit() {
                log!(LogLevel::Info, "Worker slot {} draining on QUIT", self.slot);
                break;
            }
            if self.flags.take_reopen() {
                log!(LogLevel::Info, "Worker slot {} reopened logs", self.slot);
            }
        }

        log!(LogLevel::Info, "Worker slot {} exiting", self.slot);
        Ok(())
    }
}

async fn channel_handler(
    channel: Arc<ChannelEndpoint>,
    flags: Arc<WorkerFlags>,
    peers: Arc<PeerTable>,
) {
    loop {
        match channel.recv().await {
            Ok(Some((record, passed_fd))) => {
                let command = match record.command() {
                    Ok(c) => c,
                    Err(e) => {
                        log!(LogLevel::Warn, "Ignoring malformed channel record: {}", e);
                        continue;
                    }
                };
                match command {
                    ChanCommand::OpenChannel => {
                        if let Some(fd) = passed_fd {
                            peers.peers.lock().await.insert(record.slot, (record.pid, fd));
                            log!(LogLevel::Trace, "Learned sibling slot {} pid {}", record.slot, record.pid);
                        }
                    }
                    ChanCommand::CloseChannel => {
                        peers.peers.lock().await.remove(&record.slot);
                        log!(LogLevel::Trace, "Forgot sibling slot {}", record.slot);
                    }
                    ChanCommand::Quit => {
                        flags.quit.store(true, Ordering::SeqCst);
                    }
                    ChanCommand::Terminate => {
                        flags.terminate.store(true, Ordering::SeqCst);
                    }
                    ChanCommand::Reopen => {
                        flags.reopen.store(true, Ordering::SeqCst);
                    }
                }
            }
            Ok(None) => {
                log!(LogLevel::Warn, "Channel closed by master; terminating");
                flags.terminate.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                log!(LogLevel::Error, "Channel read error: {}; terminating", e);
                flags.terminate.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
}
