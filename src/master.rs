//! The master supervisor loop: spawn, signal broadcast, reap, and graceful-termination
//! escalation, driven by the fixed priority order from the component design.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dusa_collection_utils::core::errors::{ErrorArrayItem, Errors};
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{self, Signal};
use nix::unistd::{dup2, Pid};
use tokio::process::{Child, Command};

use crate::channel::{ChannelEndpoint, ChannelRecord, Command as ChanCommand};
use crate::config::SupervisorConfig;
use crate::signals::{spawn_master_signal_intake, GlobalFlags};
use crate::table::{ProcessTable, RespawnType};

/// The fd number the worker finds its channel end at after exec, communicated via the
/// `FLEET_WORKER_CHANNEL_FD` environment variable (always this constant in practice,
/// but the worker is expected to read the variable rather than hardcode it).
pub const WORKER_CHANNEL_FD: i32 = 3;

pub const ENV_WORKER_SLOT: &str = "FLEET_WORKER_SLOT";
pub const ENV_WORKER_CHANNEL_FD: &str = "FLEET_WORKER_CHANNEL_FD";

struct WorkerHandle {
    child: Child,
    channel: ChannelEndpoint,
}

/// Owns the process table and drives the master's supervision state machine.
pub struct Supervisor {
    config: SupervisorConfig,
    table: ProcessTable,
    workers: Vec<Option<WorkerHandle>>,
    flags: Arc<GlobalFlags>,
    delay_ms: u64,
    sigio: i64,
}

impl Supervisor {
    /// Read-only access to the process table, for diagnostics and invariant checks.
    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            table: ProcessTable::new(),
            workers: Vec::new(),
            flags: GlobalFlags::new(),
            delay_ms: 0,
            sigio: 0,
        }
    }

    /// Runs the master cycle. Returns once a clean `master_exit` condition is reached
    /// (all children down and a terminate/quit was in flight).
    pub async fn run(&mut self) -> Result<(), ErrorArrayItem> {
        spawn_master_signal_intake(self.flags.clone())?;
        self.start_worker_processes(self.config.worker_processes, RespawnType::Respawn)
            .await?;

        let mut live = true;
        loop {
            if self.delay_ms > 0 && self.flags.take_sigalrm() {
                self.delay_ms *= 2;
                log!(LogLevel::Trace, "Escalation delay doubled to {}ms", self.delay_ms);
            }

            tokio::select! {
                _ = self.flags.wait() => {}
                _ = tokio::time::sleep(Duration::from_millis(self.delay_ms)), if self.delay_ms > 0 => {
                    self.flags.sigalrm.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            }

            if self.flags.take_reap() {
                live = self.reap_children().await?;
            }

            if !live && (self.flags.is_terminate() || self.flags.is_quit()) {
                log!(LogLevel::Info, "Master exit: fleet drained");
                return Ok(());
            }

            if self.flags.is_terminate() {
                if self.delay_ms == 0 {
                    self.delay_ms = self.config.escalation_start_ms;
                }
                if self.sigio > 0 {
                    self.sigio -= 1;
                    continue;
                }
                self.sigio = self.config.worker_processes as i64 + 2;
                if self.delay_ms > self.config.escalation_ceiling_ms {
                    log!(LogLevel::Warn, "Escalating to SIGKILL for remaining workers");
                    self.signal_worker_processes(None, Some(Signal::SIGKILL)).await?;
                } else {
                    self.signal_worker_processes(Some(ChanCommand::Terminate), Some(Signal::SIGTERM))
                        .await?;
                }
                continue;
            }

            if self.flags.is_quit() {
                self.signal_worker_processes(Some(ChanCommand::Quit), Some(Signal::SIGQUIT))
                    .await?;
                continue;
            }

            if self.flags.take_reconfigure() {
                self.start_worker_processes(self.config.worker_processes, RespawnType::JustRespawn)
                    .await?;
                tokio::time::sleep(Duration::from_millis(self.config.reconfigure_settle_ms)).await;
                live = true;
                self.signal_worker_processes(Some(ChanCommand::Quit), Some(Signal::SIGQUIT))
                    .await?;
                continue;
            }

            if self.flags.take_restart() {
                self.start_worker_processes(self.config.worker_processes, RespawnType::Respawn)
                    .await?;
                live = true;
                continue;
            }

            if self.flags.take_reopen() {
                self.signal_worker_processes(Some(ChanCommand::Reopen), Some(Signal::SIGUSR1))
                    .await?;
                continue;
            }

            if self.flags.take_noaccept() {
                self.signal_worker_processes(Some(ChanCommand::Quit), Some(Signal::SIGQUIT))
                    .await?;
                continue;
            }
        }
    }

    /// Spawns `n` workers with the given respawn policy, broadcasting `OPEN_CHANNEL`
    /// for each to every other currently-live sibling as it comes up.
    pub async fn start_worker_processes(
        &mut self,
        n: usize,
        respawn: RespawnType,
    ) -> Result<(), ErrorArrayItem> {
        for _ in 0..n {
            self.spawn_worker(respawn).await?;
        }
        Ok(())
    }

    /// Spawns one worker. Spawn failures (exec, missing pid, table install) are logged
    /// as critical and swallowed here rather than propagated: per the error-handling
    /// design, a failed spawn leaves its slot reserved-but-unfilled and the supervisor
    /// keeps running the rest of the fleet rather than exiting.
    async fn spawn_worker(&mut self, respawn: RespawnType) -> Result<(), ErrorArrayItem> {
        match self.try_spawn_worker(respawn).await {
            Ok(_) => Ok(()),
            Err(e) => {
                log!(LogLevel::Error, "Spawn failed, leaving slot reserved: {}", e);
                Ok(())
            }
        }
    }

    async fn try_spawn_worker(&mut self, respawn: RespawnType) -> Result<usize, ErrorArrayItem> {
        let index = self.table.allocate();

        let (master_end, worker_end) = ChannelEndpoint::pair()?;
        fcntl(master_end.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| ErrorArrayItem::new(Errors::InputOutput, format!("fcntl: {}", e)))?;

        let worker_raw_fd = worker_end.as_raw_fd();
        let mut command = Command::new(self.config.worker_program.to_path_buf());
        command.args(&self.config.worker_args);
        command.env(ENV_WORKER_SLOT, index.to_string());
        command.env(ENV_WORKER_CHANNEL_FD, WORKER_CHANNEL_FD.to_string());
        for (k, v) in &self.config.worker_env {
            command.env(k, v);
        }
        command.stdin(Stdio::null());

        unsafe {
            command.pre_exec(move || {
                if worker_raw_fd != WORKER_CHANNEL_FD {
                    dup2(worker_raw_fd, WORKER_CHANNEL_FD).map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }

        log!(LogLevel::Info, "Spawning worker into slot {}", index);
        let child = command.spawn().map_err(|e| {
            ErrorArrayItem::new(Errors::SupervisedChild, format!("spawn failed: {}", e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ErrorArrayItem::new(Errors::SupervisedChild, "no pid after spawn"))?
            as i32;

        self.table
            .install(index, pid, master_end.as_raw_fd(), worker_raw_fd, "worker process", respawn)?;

        while self.workers.len() <= index {
            self.workers.push(None);
        }
        self.workers[index] = Some(WorkerHandle {
            child,
            channel: master_end,
        });

        self.broadcast_open_channel(index, pid).await?;
        Ok(index)
    }

    /// Broadcasts `OPEN_CHANNEL{slot, pid, fd}` for the newly spawned `subject_slot` to
    /// every other currently-live, non-detached sibling.
    async fn broadcast_open_channel(&self, subject_slot: usize, pid: i32) -> Result<(), ErrorArrayItem> {
        let master_fd = match self.table.get(subject_slot).and_then(|s| s.master_fd) {
            Some(fd) => fd,
            None => return Ok(()),
        };

        for (slot, entry) in self.table.iter() {
            if slot == subject_slot || entry.is_empty() || entry.detached {
                continue;
            }
            if let Some(Some(handle)) = self.workers.get(slot) {
                let record = ChannelRecord::new(ChanCommand::OpenChannel, pid, subject_slot as i32, master_fd);
                if let Err(e) = handle.channel.send(record, Some(master_fd)).await {
                    log!(LogLevel::Warn, "OPEN_CHANNEL broadcast to slot {} failed: {}", slot, e);
                }
            }
        }
        Ok(())
    }

    /// Broadcasts `CLOSE_CHANNEL{slot}` for a reaped slot to every remaining sibling.
    async fn broadcast_close_channel(&self, subject_slot: usize, pid: i32) -> Result<(), ErrorArrayItem> {
        for (slot, entry) in self.table.iter() {
            if slot == subject_slot || entry.is_empty() || entry.detached {
                continue;
            }
            if let Some(Some(handle)) = self.workers.get(slot) {
                let record = ChannelRecord::new(ChanCommand::CloseChannel, pid, subject_slot as i32, -1);
                if let Err(e) = handle.channel.send(record, None).await {
                    log!(LogLevel::Warn, "CLOSE_CHANNEL broadcast to slot {} failed: {}", slot, e);
                }
            }
        }
        Ok(())
    }

    /// Walks the table broadcasting a channel command and/or raw OS signal, per the
    /// signal-broadcast table in the component design. `just_spawn` slots consume the
    /// immunity on the first broadcast of any kind rather than sending anything.
    async fn signal_worker_processes(
        &mut self,
        chan_command: Option<ChanCommand>,
        raw_signal: Option<Signal>,
    ) -> Result<(), ErrorArrayItem> {
        let is_shutdown = matches!(chan_command, Some(ChanCommand::Quit));
        let slots: Vec<usize> = self.table.iter().map(|(i, _)| i).collect();

        for slot in slots {
            let (pid, detached, empty, already_exiting, just_spawn) = {
                let entry = match self.table.get(slot) {
                    Some(e) => e,
                    None => continue,
                };
                (entry.pid, entry.detached, entry.is_empty(), entry.exiting, entry.just_spawn)
            };

            if empty || detached {
                continue;
            }
            if is_shutdown && already_exiting {
                continue;
            }
            if just_spawn {
                if let Some(entry) = self.table.get_mut(slot) {
                    entry.just_spawn = false;
                }
                log!(LogLevel::Trace, "Slot {} immune to this broadcast (just_spawn)", slot);
                continue;
            }

            let mut delivered = false;
            if let Some(cmd) = chan_command {
                if let Some(Some(handle)) = self.workers.get(slot) {
                    let record = ChannelRecord::new(cmd, pid, slot as i32, -1);
                    match handle.channel.send(record, None).await {
                        Ok(()) => delivered = true,
                        Err(e) => log!(LogLevel::Warn, "Channel send to slot {} failed: {}", slot, e),
                    }
                }
            }

            if !delivered {
                if let Some(sig) = raw_signal {
                    match signal::kill(Pid::from_raw(pid), sig) {
                        Ok(()) => {}
                        Err(nix::errno::Errno::ESRCH) => {
                            log!(LogLevel::Trace, "Slot {} pid {} already gone", slot, pid);
                            if let Some(entry) = self.table.get_mut(slot) {
                                entry.exited = true;
                                entry.exiting = false;
                            }
                            self.flags.reap.store(true, std::sync::atomic::Ordering::SeqCst);
                            continue;
                        }
                        Err(e) => {
                            log!(LogLevel::Warn, "kill(slot {}, {:?}) failed: {}", slot, sig, e)
                        }
                    }
                }
            }

            if chan_command != Some(ChanCommand::Reopen) {
                if let Some(entry) = self.table.get_mut(slot) {
                    entry.exiting = true;
                }
            }
        }
        Ok(())
    }

    /// Reaps any slot whose child has exited: closes/broadcasts, respawns if entitled,
    /// and shrinks or holes the table. Returns whether the fleet is still live.
    async fn reap_children(&mut self) -> Result<bool, ErrorArrayItem> {
        let mut live = false;
        let slots: Vec<usize> = self.table.iter().map(|(i, _)| i).collect();

        for slot in slots {
            let already_marked_exited = self.table.get(slot).is_some_and(|e| e.exited);

            let just_exited = if let Some(Some(handle)) = self.workers.get_mut(slot) {
                match handle.child.try_wait() {
                    Ok(Some(status)) => {
                        log!(LogLevel::Info, "Worker slot {} exited: {:?}", slot, status);
                        true
                    }
                    Ok(None) => false,
                    Err(e) => {
                        log!(LogLevel::Warn, "try_wait on slot {} failed: {}", slot, e);
                        false
                    }
                }
            } else {
                false
            };

            if just_exited {
                if let Some(entry) = self.table.get_mut(slot) {
                    entry.exited = true;
                }
            }

            let exited = already_marked_exited || just_exited;
            if !exited {
                let entry = self.table.get(slot);
                if let Some(entry) = entry {
                    if !entry.is_empty() && (entry.exiting || !entry.detached) {
                        live = true;
                    }
                }
                continue;
            }

            let (pid, detached, respawn, exiting) = {
                let entry = self.table.get(slot).unwrap();
                (entry.pid, entry.detached, entry.respawn, entry.exiting)
            };

            if !detached {
                self.broadcast_close_channel(slot, pid).await?;
            }
            self.workers[slot] = None;

            let terminate = self.flags.is_terminate();
            let quit = self.flags.is_quit();
            let should_respawn = matches!(respawn, RespawnType::Respawn | RespawnType::JustRespawn)
                && !exiting
                && !terminate
                && !quit;

            if should_respawn {
                self.respawn_into(slot, respawn).await?;
                live = true;
            } else {
                self.table.free(slot);
            }
        }

        Ok(live)
    }

    /// Reinstalls a worker directly into `slot` (the index a dead child just vacated),
    /// rather than freeing it and going through `allocate()`'s hole-scan, which could
    /// hand back a different, lower index than the one the reaper is replacing.
    /// Like `spawn_worker`, failures are logged and swallowed rather than propagated.
    async fn respawn_into(&mut self, slot: usize, respawn: RespawnType) -> Result<(), ErrorArrayItem> {
        if let Err(e) = self.try_respawn_into(slot, respawn).await {
            log!(LogLevel::Error, "Respawn into slot {} failed, leaving slot reserved: {}", slot, e);
        }
        Ok(())
    }

    async fn try_respawn_into(&mut self, slot: usize, respawn: RespawnType) -> Result<(), ErrorArrayItem> {
        let (master_end, worker_end) = ChannelEndpoint::pair()?;
        fcntl(master_end.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| ErrorArrayItem::new(Errors::InputOutput, format!("fcntl: {}", e)))?;
        let worker_raw_fd = worker_end.as_raw_fd();

        let mut command = Command::new(self.config.worker_program.to_path_buf());
        command.args(&self.config.worker_args);
        command.env(ENV_WORKER_SLOT, slot.to_string());
        command.env(ENV_WORKER_CHANNEL_FD, WORKER_CHANNEL_FD.to_string());
        for (k, v) in &self.config.worker_env {
            command.env(k, v);
        }
        command.stdin(Stdio::null());
        unsafe {
            command.pre_exec(move || {
                if worker_raw_fd != WORKER_CHANNEL_FD {
                    dup2(worker_raw_fd, WORKER_CHANNEL_FD).map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }

        log!(LogLevel::Info, "Respawning worker into slot {}", slot);
        let child = command.spawn().map_err(|e| {
            ErrorArrayItem::new(Errors::SupervisedChildDied, format!("respawn failed: {}", e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ErrorArrayItem::new(Errors::SupervisedChild, "no pid after respawn"))?
            as i32;

        self.table
            .install(slot, pid, master_end.as_raw_fd(), worker_raw_fd, "worker process", respawn)?;
        self.workers[slot] = Some(WorkerHandle { child, channel: master_end });
        self.broadcast_open_channel(slot, pid).await
    }
}
