//! Signal intake: translates external signals into the global one-bit flags the
//! master loop inspects, following the spec's priority-ordered consumption model.
//!
//! Real `sigprocmask`-blocked delivery with `sig_atomic_t` flags has no safe, direct
//! tokio equivalent; `tokio::signal::unix` is the idiomatic re-expression the design
//! notes explicitly invite ("re-express as an internal message queue"). Each signal
//! gets its own listener task that flips an `AtomicBool` and wakes a shared
//! [`tokio::sync::Notify`] so the master loop's `wait` step behaves like the spec's
//! blocked `sigsuspend`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dusa_collection_utils::core::errors::ErrorArrayItem;
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;

/// The global one-bit supervision flags from the spec's data model.
#[derive(Debug, Default)]
pub struct GlobalFlags {
    pub reap: AtomicBool,
    pub terminate: AtomicBool,
    pub quit: AtomicBool,
    pub reconfigure: AtomicBool,
    pub reopen: AtomicBool,
    pub noaccept: AtomicBool,
    pub restart: AtomicBool,
    pub sigalrm: AtomicBool,
    /// Woken any time one of the flags above is set, standing in for the spec's
    /// race-free unblock-and-wait.
    pub notify: Notify,
}

impl GlobalFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn raise(&self, flag: &AtomicBool, name: &str) {
        flag.store(true, Ordering::SeqCst);
        log!(LogLevel::Trace, "Signal flag raised: {}", name);
        self.notify.notify_one();
    }

    pub fn take_reap(&self) -> bool {
        self.reap.swap(false, Ordering::SeqCst)
    }
    pub fn take_sigalrm(&self) -> bool {
        self.sigalrm.swap(false, Ordering::SeqCst)
    }
    pub fn take_reconfigure(&self) -> bool {
        self.reconfigure.swap(false, Ordering::SeqCst)
    }
    pub fn take_reopen(&self) -> bool {
        self.reopen.swap(false, Ordering::SeqCst)
    }
    pub fn take_noaccept(&self) -> bool {
        self.noaccept.swap(false, Ordering::SeqCst)
    }
    pub fn take_restart(&self) -> bool {
        self.restart.swap(false, Ordering::SeqCst)
    }
    pub fn is_terminate(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }
    pub fn is_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Spawns one listener task per signal named in the spec's external interfaces table
/// and returns the shared flags they populate. Mirrors the master's `sigprocmask`
/// block-then-consume step: these tasks run for the lifetime of the master.
pub fn spawn_master_signal_intake(flags: Arc<GlobalFlags>) -> Result<(), ErrorArrayItem> {
    spawn_listener(SignalKind::child(), flags.clone(), |f| f.raise(&f.reap, "reap"))?;
    spawn_listener(SignalKind::alarm(), flags.clone(), |f| {
        f.raise(&f.sigalrm, "sigalrm")
    })?;
    spawn_listener(SignalKind::interrupt(), flags.clone(), |f| {
        f.raise(&f.terminate, "terminate")
    })?;
    spawn_listener(SignalKind::terminate(), flags.clone(), |f| {
        f.raise(&f.terminate, "terminate")
    })?;
    spawn_listener(SignalKind::quit(), flags.clone(), |f| f.raise(&f.quit, "quit"))?;
    spawn_listener(SignalKind::hangup(), flags.clone(), |f| {
        f.raise(&f.reconfigure, "reconfigure")
    })?;
    spawn_listener(SignalKind::user_defined1(), flags.clone(), |f| {
        f.raise(&f.reopen, "reopen")
    })?;
    spawn_listener(SignalKind::user_defined2(), flags.clone(), |f| {
        f.raise(&f.noaccept, "noaccept")
    })?;
    Ok(())
}

fn spawn_listener(
    kind: SignalKind,
    flags: Arc<GlobalFlags>,
    on_signal: impl Fn(&GlobalFlags) + Send + 'static,
) -> Result<(), ErrorArrayItem> {
    let mut stream = signal(kind).map_err(ErrorArrayItem::from)?;
    tokio::spawn(async move {
        while stream.recv().await.is_some() {
            on_signal(&flags);
        }
    });
    Ok(())
}
