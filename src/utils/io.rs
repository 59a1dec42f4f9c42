/// Single-shot syscall helpers shared by the proc attr and query clients
///
/// None of these retry on EINTR: one logical operation maps onto exactly one
/// `write` and a bounded run of `read` calls, and interruption is reported to
/// the caller unchanged.
use crate::config::types::{ArmorError, Result};
use std::io::{Read, Write};

/// Outcome of filling a fixed buffer from a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// EOF reached after this many bytes; at least one spare byte remains
    Complete(usize),
    /// The buffer filled before EOF was observed
    Exhausted,
}

/// Read until EOF or until `buf` is full.
///
/// Short reads are accumulated. A buffer that fills completely is reported
/// as [`FillOutcome::Exhausted`] even if EOF would have followed, so the
/// caller always has room to NUL terminate.
pub fn fill_from<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<FillOutcome> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => return Ok(FillOutcome::Complete(filled)),
            n => filled += n,
        }
    }

    Ok(FillOutcome::Exhausted)
}

/// Issue exactly one write of `buf`.
///
/// A write that transfers fewer bytes than requested is a protocol error;
/// a failing write keeps its OS error.
pub fn write_once<W: Write>(writer: &mut W, buf: &[u8]) -> Result<()> {
    let written = writer.write(buf)?;
    if written != buf.len() {
        return Err(ArmorError::Protocol(format!(
            "short write: {} of {} bytes accepted",
            written,
            buf.len()
        )));
    }
    Ok(())
}

/// Thread id of the caller
pub fn gettid() -> i32 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Current thread's errno
pub fn last_errno() -> i32 {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    unsafe { *libc::__errno_location() }
}

/// Overwrite the current thread's errno
pub fn restore_errno(value: i32) {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    unsafe { *libc::__errno_location() = value }
}
