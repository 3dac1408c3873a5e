//! The fixed-size control-channel wire record and the transport that carries it,
//! including out-of-band file-descriptor passing for `OPEN_CHANNEL`.

use dusa_collection_utils::core::errors::{ErrorArrayItem, Errors};
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use nix::cmsg_space;
use nix::sys::socket::{
    self, recvmsg, sendmsg, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;

/// Control-channel command, matching the wire values from the spec's external
/// interface table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    OpenChannel = 1,
    CloseChannel = 2,
    Quit = 3,
    Terminate = 4,
    Reopen = 5,
}

impl Command {
    fn from_u32(value: u32) -> Result<Self, ErrorArrayItem> {
        Ok(match value {
            1 => Command::OpenChannel,
            2 => Command::CloseChannel,
            3 => Command::Quit,
            4 => Command::Terminate,
            5 => Command::Reopen,
            other => {
                return Err(ErrorArrayItem::new(
                    Errors::GeneralError,
                    format!("Unknown channel command value: {}", other),
                ))
            }
        })
    }
}

/// The fixed-size channel record: `{ command, pid, slot, fd }`, native-endian, as
/// specified in the external interfaces section. `fd` is informational only; the real
/// descriptor transfer for `OPEN_CHANNEL` rides in the message's ancillary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ChannelRecord {
    pub command: u32,
    pub pid: i32,
    pub slot: i32,
    pub fd: i32,
}

const RECORD_SIZE: usize = std::mem::size_of::<ChannelRecord>();

impl ChannelRecord {
    pub fn new(command: Command, pid: i32, slot: i32, fd: i32) -> Self {
        Self {
            command: command as u32,
            pid,
            slot,
            fd,
        }
    }

    pub fn command(&self) -> Result<Command, ErrorArrayItem> {
        Command::from_u32(self.command)
    }

    fn to_bytes(self) -> [u8; RECORD_SIZE] {
        unsafe { std::mem::transmute(self) }
    }

    fn from_bytes(bytes: [u8; RECORD_SIZE]) -> Self {
        unsafe { std::mem::transmute(bytes) }
    }
}

/// One end of a control-channel socketpair, wrapped for async readiness-driven raw
/// syscalls. `tokio::net::UnixStream` doesn't expose `sendmsg`/`recvmsg` ancillary
/// data, so the fd is driven directly through `AsyncFd` the way `nix` recommends for
/// operations tokio's socket types don't cover.
pub struct ChannelEndpoint {
    inner: AsyncFd<OwnedFd>,
}

impl ChannelEndpoint {
    /// Creates a connected pair of channel endpoints (master end, worker end).
    pub fn pair() -> Result<(ChannelEndpoint, ChannelEndpoint), ErrorArrayItem> {
        let (a, b) = socket::socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .map_err(|e| {
            ErrorArrayItem::new(Errors::InputOutput, format!("socketpair failed: {}", e))
        })?;
        Ok((
            ChannelEndpoint {
                inner: AsyncFd::new(a).map_err(ErrorArrayItem::from)?,
            },
            ChannelEndpoint {
                inner: AsyncFd::new(b).map_err(ErrorArrayItem::from)?,
            },
        ))
    }

    /// Wraps an already-open, already-nonblocking raw fd (used on the worker side,
    /// after it receives its channel fd via the environment handoff).
    ///
    /// # Safety
    /// `fd` must be a valid, open, non-blocking socket fd owned uniquely by the
    /// caller from this point on.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self, ErrorArrayItem> {
        let owned = OwnedFd::from_raw_fd(fd);
        Ok(Self {
            inner: AsyncFd::new(owned).map_err(ErrorArrayItem::from)?,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }

    /// Sends a record, optionally carrying a file descriptor via `SCM_RIGHTS`
    /// (used for `OPEN_CHANNEL`).
    pub async fn send(
        &self,
        record: ChannelRecord,
        pass_fd: Option<RawFd>,
    ) -> Result<(), ErrorArrayItem> {
        let bytes = record.to_bytes();
        loop {
            let mut guard = self
                .inner
                .writable()
                .await
                .map_err(ErrorArrayItem::from)?;

            let result = guard.try_io(|fd| {
                let iov = [IoSlice::new(&bytes)];
                let cmsgs: &[ControlMessage] = match &pass_fd {
                    Some(fd) => &[ControlMessage::ScmRights(std::slice::from_ref(fd))],
                    None => &[],
                };
                sendmsg::<()>(fd.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });

            match result {
                Ok(inner) => return inner.map_err(ErrorArrayItem::from),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receives one record, and the fd carried via `SCM_RIGHTS` if any (present for
    /// `OPEN_CHANNEL`). Returns `Ok(None)` on a clean EOF (peer closed the channel).
    pub async fn recv(&self) -> Result<Option<(ChannelRecord, Option<OwnedFd>)>, ErrorArrayItem> {
        loop {
            let mut guard = self
                .inner
                .readable()
                .await
                .map_err(ErrorArrayItem::from)?;

            let result = guard.try_io(|fd| {
                let mut buf = [0u8; RECORD_SIZE];
                let mut iov = [IoSliceMut::new(&mut buf)];
                let mut cmsg_buffer = cmsg_space!(RawFd);
                let msg = recvmsg::<()>(
                    fd.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buffer),
                    MsgFlags::empty(),
                )
                .map_err(std::io::Error::from)?;

                let n = msg.bytes;
                if n == 0 {
                    return Ok(None);
                }
                if n != RECORD_SIZE {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("short channel read: {} of {} bytes", n, RECORD_SIZE),
                    ));
                }

                let mut passed_fd = None;
                for cmsg in msg.cmsgs().map_err(std::io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        if let Some(&fd) = fds.first() {
                            passed_fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                }

                Ok(Some((ChannelRecord::from_bytes(buf), passed_fd)))
            });

            match result {
                Ok(inner) => {
                    let inner = inner.map_err(ErrorArrayItem::from)?;
                    log!(LogLevel::Trace, "Channel record received: {:?}", inner.as_ref().map(|(r, _)| r));
                    return Ok(inner);
                }
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(test)]
mod channel_tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_plain_record() {
        let (a, b) = ChannelEndpoint::pair().unwrap();
        let record = ChannelRecord::new(Command::Quit, 42, 1, -1);
        a.send(record, None).await.unwrap();
        let (got, fd) = b.recv().await.unwrap().unwrap();
        assert_eq!(got.command().unwrap(), Command::Quit);
        assert_eq!(got.pid, 42);
        assert_eq!(got.slot, 1);
        assert!(fd.is_none());
    }

    #[tokio::test]
    async fn round_trips_a_passed_fd() {
        let (a, b) = ChannelEndpoint::pair().unwrap();
        let (extra_a, extra_b) = ChannelEndpoint::pair().unwrap();

        let record = ChannelRecord::new(Command::OpenChannel, 7, 2, extra_a.as_raw_fd());
        a.send(record, Some(extra_a.as_raw_fd())).await.unwrap();
        let (got, fd) = b.recv().await.unwrap().unwrap();
        assert_eq!(got.command().unwrap(), Command::OpenChannel);
        assert!(fd.is_some());
        drop(extra_b);
    }

    #[tokio::test]
    async fn recv_returns_none_on_peer_close() {
        let (a, b) = ChannelEndpoint::pair().unwrap();
        drop(a);
        let result = b.recv().await.unwrap();
        assert!(result.is_none());
    }
}
