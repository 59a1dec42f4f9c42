//! Peer confinement over connected sockets
//!
//! Reads the peer's label with `SO_PEERSEC`. The kernel reports the exact
//! size it needs on overflow, and every retry must ask for strictly more
//! room than the attempt before it.

use crate::config::types::{ArmorError, Result};
use crate::kernel::confinement::ConfinementContext;
use crate::kernel::probe::Prober;
use crate::kernel::procattr::{INITIAL_ATTR_BUF, MAX_ATTR_BUF};
use std::io;
use std::os::unix::io::AsRawFd;

/// Outcome of a single label read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRead {
    /// Bytes written into the buffer
    Filled(usize),
    /// The label needs `needed` bytes
    TooSmall { needed: usize },
}

/// Something that can report a peer's security label
pub trait PeerLabelSource {
    fn read_label(&self, buf: &mut [u8]) -> io::Result<PeerRead>;
}

/// `SO_PEERSEC` on a connected socket
pub struct SocketPeer<'a, S: AsRawFd> {
    socket: &'a S,
}

impl<'a, S: AsRawFd> SocketPeer<'a, S> {
    pub fn new(socket: &'a S) -> Self {
        Self { socket }
    }
}

impl<S: AsRawFd> PeerLabelSource for SocketPeer<'_, S> {
    fn read_label(&self, buf: &mut [u8]) -> io::Result<PeerRead> {
        let mut optlen = libc::socklen_t::try_from(buf.len())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

        // SAFETY: buf is valid for optlen bytes and optlen is a valid out pointer.
        let rc = unsafe {
            libc::getsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PEERSEC,
                buf.as_mut_ptr().cast(),
                &mut optlen,
            )
        };

        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ERANGE) {
                return Ok(PeerRead::TooSmall {
                    needed: optlen as usize,
                });
            }
            return Err(err);
        }
        Ok(PeerRead::Filled(optlen as usize))
    }
}

/// Confinement of the process at the other end of `source`.
pub fn get_peer_confinement<P: PeerLabelSource>(
    prober: &Prober,
    source: &P,
) -> Result<ConfinementContext> {
    if !matches!(prober.param_enabled(), Ok(true)) {
        return Err(ArmorError::InvalidArgument(
            "peer labels require AppArmor to be enabled".to_string(),
        ));
    }

    let mut size = INITIAL_ATTR_BUF;
    loop {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)?;
        buf.resize(size, 0);

        let needed = match source.read_label(&mut buf)? {
            PeerRead::Filled(0) => {
                return Err(ArmorError::Protocol("empty peer label".to_string()))
            }
            PeerRead::Filled(len) if len > size => {
                return Err(ArmorError::Protocol(format!(
                    "peer label length {} exceeds buffer of {}",
                    len, size
                )))
            }
            PeerRead::Filled(len) => {
                if buf[len - 1] == 0 {
                    buf.truncate(len - 1);
                    return Ok(ConfinementContext::parse(buf, false));
                }
                if len < size {
                    buf.truncate(len);
                    return Ok(ConfinementContext::parse(buf, false));
                }
                // Unterminated and full: one more byte for the NUL.
                len + 1
            }
            PeerRead::TooSmall { needed } => needed,
        };

        if needed <= size {
            return Err(ArmorError::Protocol(format!(
                "peer label retry would not grow the buffer ({} <= {})",
                needed, size
            )));
        }
        if needed > MAX_ATTR_BUF {
            return Err(ArmorError::Protocol(format!(
                "peer label needs {} bytes",
                needed
            )));
        }
        log::trace!("Peer label needs {} bytes, had {}", needed, size);
        size = needed;
    }
}

/// Convenience wrapper for a connected socket
pub fn get_socket_peer_confinement<S: AsRawFd>(
    prober: &Prober,
    socket: &S,
) -> Result<ConfinementContext> {
    get_peer_confinement(prober, &SocketPeer::new(socket))
}
