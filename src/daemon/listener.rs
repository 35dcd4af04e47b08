//! Client-facing listening socket: inherited from the service manager or
//! created on the configured path.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, UnixAddr, bind, getsockopt, listen, socket,
    sockopt,
};
use tracing::{debug, info, warn};

use crate::core::config::SocketConfig;
use crate::core::errors::{MuxError, Result};

/// Where the listening socket came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    /// Passed in by the service manager; its path is not ours to remove.
    Inherited,
    /// Bound by this process.
    Created,
}

/// Socket path created by this process, unlinked on drop.
#[derive(Debug)]
pub struct SocketArtifact {
    path: Option<PathBuf>,
}

impl SocketArtifact {
    /// Path this artifact will unlink, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for SocketArtifact {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed socket path"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "cannot remove socket path"),
        }
    }
}

/// A socket in listening state plus the filesystem artifact it owns, if any.
#[derive(Debug)]
pub struct ListeningChannel {
    listener: UnixListener,
    artifact: SocketArtifact,
    origin: ChannelOrigin,
}

impl ListeningChannel {
    /// Bind a fresh socket at `path`, replacing a stale socket left behind by
    /// an earlier run.
    pub fn create(path: &Path, backlog: u32) -> Result<Self> {
        let fail = |details: String| MuxError::Listener {
            path: path.to_path_buf(),
            details,
        };

        remove_stale_socket(path)?;

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|errno| fail(format!("socket: {errno}")))?;
        let addr = UnixAddr::new(path).map_err(|errno| fail(format!("address: {errno}")))?;
        bind(fd.as_raw_fd(), &addr).map_err(|errno| fail(format!("bind: {errno}")))?;
        let artifact = SocketArtifact {
            path: Some(path.to_path_buf()),
        };

        let backlog = i32::try_from(backlog)
            .map_err(|_| fail(format!("backlog {backlog} out of range")))
            .and_then(|n| Backlog::new(n).map_err(|errno| fail(format!("backlog: {errno}"))))?;
        listen(&fd, backlog).map_err(|errno| fail(format!("listen: {errno}")))?;

        info!(path = %path.display(), "listening on fresh socket");
        Ok(Self {
            listener: UnixListener::from(fd),
            artifact,
            origin: ChannelOrigin::Created,
        })
    }

    /// Adopt a descriptor handed over by the service manager. It must already
    /// be a listening socket.
    pub fn from_inherited(fd: OwnedFd) -> Result<Self> {
        let listening = getsockopt(&fd, sockopt::AcceptConn).map_err(|errno| {
            MuxError::SocketActivation {
                details: format!("descriptor {} is not a socket: {errno}", fd.as_raw_fd()),
            }
        })?;
        if !listening {
            return Err(MuxError::SocketActivation {
                details: format!("descriptor {} is not listening", fd.as_raw_fd()),
            });
        }
        info!(fd = fd.as_raw_fd(), "using socket from service manager");
        Ok(Self {
            listener: UnixListener::from(fd),
            artifact: SocketArtifact { path: None },
            origin: ChannelOrigin::Inherited,
        })
    }

    /// Whether the socket was inherited or created.
    #[must_use]
    pub fn origin(&self) -> ChannelOrigin {
        self.origin
    }

    /// Socket path this process created, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.artifact.path()
    }

    /// The listening socket.
    #[must_use]
    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }

    /// Split into the listener and the path guard so both can be owned by the
    /// reactor independently.
    #[must_use]
    pub fn into_parts(self) -> (UnixListener, SocketArtifact) {
        (self.listener, self.artifact)
    }
}

/// Obtain the listening channel: inherited when exactly one socket was passed
/// in, otherwise freshly created on `config.path`.
pub fn acquire(config: &SocketConfig) -> Result<ListeningChannel> {
    if config.socket_activation {
        let fds = inherited_descriptors()?;
        if let Some(fd) = select_inherited(&fds)? {
            // SAFETY: the service manager passed this descriptor to us and
            // nothing else in the process has taken ownership of it.
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            return ListeningChannel::from_inherited(owned);
        }
    }
    ListeningChannel::create(&config.path, config.backlog)
}

fn inherited_descriptors() -> Result<Vec<RawFd>> {
    sd_notify::listen_fds()
        .map(|fds| fds.collect())
        .map_err(|err| MuxError::SocketActivation {
            details: err.to_string(),
        })
}

/// Zero descriptors means "create one"; more than one is a setup error.
pub fn select_inherited(fds: &[RawFd]) -> Result<Option<RawFd>> {
    match fds {
        [] => Ok(None),
        [fd] => Ok(Some(*fd)),
        many => Err(MuxError::SocketActivation {
            details: format!("received {} descriptors, expected at most one", many.len()),
        }),
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path).map_err(|source| MuxError::io(path, source))?;
            debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Ok(_) => Err(MuxError::Listener {
            path: path.to_path_buf(),
            details: "path exists and is not a socket".to_string(),
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(MuxError::io(path, source)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn at_most_one_inherited_descriptor() {
        assert_eq!(select_inherited(&[]).expect("none"), None);
        assert_eq!(select_inherited(&[3]).expect("one"), Some(3));
        let err = select_inherited(&[3, 4]).unwrap_err();
        assert_eq!(err.code(), "WDM-3001");
    }

    #[test]
    fn created_channel_accepts_and_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mux.sock");
        let channel = ListeningChannel::create(&path, 8).expect("create");
        assert_eq!(channel.origin(), ChannelOrigin::Created);
        assert_eq!(channel.path(), Some(path.as_path()));

        let _client = UnixStream::connect(&path).expect("connect");
        let (_conn, _) = channel.listener().accept().expect("accept");

        drop(channel);
        assert!(!path.exists());
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mux.sock");
        let stale = UnixListener::bind(&path).expect("stale bind");
        drop(stale);
        assert!(path.exists());

        let channel = ListeningChannel::create(&path, 8).expect("replace stale socket");
        UnixStream::connect(&path).expect("connect to new socket");
        drop(channel);
    }

    #[test]
    fn regular_file_is_not_clobbered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mux.sock");
        std::fs::write(&path, b"precious").expect("write");
        let err = ListeningChannel::create(&path, 8).unwrap_err();
        assert_eq!(err.code(), "WDM-3002");
        assert_eq!(std::fs::read(&path).expect("still there"), b"precious");
    }

    #[test]
    fn inherited_listener_is_adopted_without_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("activated.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        let channel = ListeningChannel::from_inherited(OwnedFd::from(listener)).expect("adopt");
        assert_eq!(channel.origin(), ChannelOrigin::Inherited);
        assert_eq!(channel.path(), None);

        drop(channel);
        // inherited channels leave the filesystem alone
        assert!(path.exists());
    }

    #[test]
    fn inherited_non_listening_socket_is_rejected() {
        let (a, _b) = UnixStream::pair().expect("pair");
        let err = ListeningChannel::from_inherited(OwnedFd::from(a)).unwrap_err();
        assert_eq!(err.code(), "WDM-3001");
    }

    #[test]
    fn acquire_creates_when_nothing_inherited() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SocketConfig {
            path: dir.path().join("mux.sock"),
            socket_activation: false,
            ..SocketConfig::default()
        };
        let channel = acquire(&config).expect("acquire");
        assert_eq!(channel.origin(), ChannelOrigin::Created);
        assert!(config.path.exists());
    }
}
