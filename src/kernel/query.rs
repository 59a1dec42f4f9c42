//! Access queries against `<apparmorfs>/.access`
//!
//! A query is one write of a binary request followed by one read of a fixed
//! 67 byte ASCII reply. The request layout is
//!
//! ```text
//! "label\0" | subject label | NUL | class | class payload
//! ```
//!
//! For the file class the payload is the path (length implied by the write
//! size). Link queries carry `link NUL target` and are checked with a single
//! `AA_MAY_LINK` request, which approximates the kernel's two step link
//! check (create the link, then access the target) in one round trip.

use crate::config::types::{ArmorError, QueryDecision, Result};
use crate::kernel::probe::{self, Prober};
use crate::utils::io::write_once;
use once_cell::sync::OnceCell;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;

/// Opcode written over the first bytes of every request
pub const QUERY_CMD_LABEL: &[u8; 6] = b"label\0";

/// Bytes reserved at the front of a request for [`QUERY_CMD_LABEL`]
pub const QUERY_HEADER_LEN: usize = QUERY_CMD_LABEL.len();

/// Exact size of `allow 0x%08x\ndeny 0x%08x\naudit 0x%08x\nquiet 0x%08x\n`
pub const QUERY_REPLY_LEN: usize = 67;

/// Class tag for file mediation
pub const AA_CLASS_FILE: u8 = 2;

/// Mask used for link queries
pub const AA_MAY_LINK: u32 = 0x40000;

/// File permission bits
pub mod perms {
    pub const AA_MAY_EXEC: u32 = 1 << 0;
    pub const AA_MAY_WRITE: u32 = 1 << 1;
    pub const AA_MAY_READ: u32 = 1 << 2;
    pub const AA_MAY_APPEND: u32 = 1 << 3;
    pub const AA_MAY_CREATE: u32 = 1 << 4;
    pub const AA_MAY_DELETE: u32 = 1 << 5;
    pub const AA_MAY_OPEN: u32 = 1 << 6;
    pub const AA_MAY_RENAME: u32 = 1 << 7;
    pub const AA_MAY_SETATTR: u32 = 1 << 8;
    pub const AA_MAY_GETATTR: u32 = 1 << 9;
    pub const AA_MAY_SETCRED: u32 = 1 << 10;
    pub const AA_MAY_GETCRED: u32 = 1 << 11;
    pub const AA_MAY_CHMOD: u32 = 1 << 12;
    pub const AA_MAY_CHOWN: u32 = 1 << 13;
    pub const AA_MAY_LOCK: u32 = 0x8000;
    pub const AA_EXEC_MMAP: u32 = 0x10000;
    pub const AA_MAY_LINK: u32 = super::AA_MAY_LINK;
}

/// Raw permission sets returned by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryReply {
    pub allow: u32,
    pub deny: u32,
    pub audit: u32,
    pub quiet: u32,
}

impl QueryReply {
    /// Parse a reply; anything but the exact fixed width format is rejected.
    pub fn parse(reply: &[u8]) -> Result<Self> {
        if reply.len() != QUERY_REPLY_LEN {
            return Err(ArmorError::Protocol(format!(
                "query reply is {} bytes, expected {}",
                reply.len(),
                QUERY_REPLY_LEN
            )));
        }

        let mut rest = reply;
        let mut fields = [0u32; 4];
        for (slot, name) in fields.iter_mut().zip(["allow", "deny", "audit", "quiet"]) {
            let (value, tail) = parse_field(rest, name)?;
            *slot = value;
            rest = tail;
        }

        Ok(Self {
            allow: fields[0],
            deny: fields[1],
            audit: fields[2],
            quiet: fields[3],
        })
    }

    /// Apply the kernel's decision rules to `mask`.
    pub fn decide(&self, mask: u32) -> QueryDecision {
        let allowed = mask & !(self.allow & !self.deny) == 0;
        let audit = if allowed { self.audit } else { u32::MAX };
        let audited = mask & !(audit & !self.quiet) == 0;
        QueryDecision { allowed, audited }
    }
}

/// Parse `<name> 0x<8 hex>\n` from the front of `input`.
fn parse_field<'a>(input: &'a [u8], name: &str) -> Result<(u32, &'a [u8])> {
    let malformed = || ArmorError::Protocol(format!("malformed '{}' field in query reply", name));

    let rest = input.strip_prefix(name.as_bytes()).ok_or_else(malformed)?;
    let rest = rest.strip_prefix(b" 0x").ok_or_else(malformed)?;
    if rest.len() < 9 || rest[8] != b'\n' {
        return Err(malformed());
    }

    let digits = &rest[..8];
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(malformed());
    }
    let text = std::str::from_utf8(digits).map_err(|_| malformed())?;
    let value = u32::from_str_radix(text, 16).map_err(|_| malformed())?;

    Ok((value, &rest[9..]))
}

/// Channel to the kernel's transactional query file
pub trait QueryTransport {
    type Channel: Read + Write;

    /// Open a fresh channel for one request/reply exchange.
    fn open(&self) -> Result<Self::Channel>;
}

/// Transport over `<apparmorfs>/.access`
pub struct SecurityfsTransport<'a> {
    prober: &'a Prober,
    access_path: OnceCell<PathBuf>,
}

impl<'a> SecurityfsTransport<'a> {
    pub fn new(prober: &'a Prober) -> Self {
        Self {
            prober,
            access_path: OnceCell::new(),
        }
    }

    /// Path of the query file, resolved once and retried after failures
    pub fn access_path(&self) -> Result<&PathBuf> {
        self.access_path
            .get_or_try_init(|| Ok(self.prober.interface_dir()?.join(".access")))
    }
}

impl QueryTransport for SecurityfsTransport<'_> {
    type Channel = File;

    fn open(&self) -> Result<File> {
        let path = self.access_path()?;
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ArmorError::NotSupported(format!(
                    "kernel has no query interface at {}",
                    path.display()
                )),
                _ => ArmorError::at_path(path, e),
            })
    }
}

/// Access query client
pub struct AccessQuery<T: QueryTransport> {
    transport: T,
}

static SYSTEM_QUERY: once_cell::sync::Lazy<AccessQuery<SecurityfsTransport<'static>>> =
    once_cell::sync::Lazy::new(|| AccessQuery::new(SecurityfsTransport::new(probe::system())));

/// Process-wide client using the system prober
pub fn system() -> &'static AccessQuery<SecurityfsTransport<'static>> {
    &SYSTEM_QUERY
}

impl<T: QueryTransport> AccessQuery<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Submit a prepared request.
    ///
    /// `query` must hold [`QUERY_HEADER_LEN`] spare bytes followed by the
    /// label, a NUL, the class tag and its payload. The header bytes are
    /// overwritten with the query opcode.
    pub fn query_label(&self, mask: u32, query: &mut [u8]) -> Result<QueryDecision> {
        if mask == 0 {
            return Err(ArmorError::InvalidArgument("empty permission mask".to_string()));
        }
        if query.len() <= QUERY_HEADER_LEN {
            return Err(ArmorError::InvalidArgument(format!(
                "query of {} bytes has no room past the header",
                query.len()
            )));
        }

        let mut channel = self.transport.open()?;
        query[..QUERY_HEADER_LEN].copy_from_slice(QUERY_CMD_LABEL);

        write_once(&mut channel, query).map_err(|err| match err.raw_os_error() {
            // The kernel could not resolve the subject label.
            Some(libc::ENOENT) if matches!(err, ArmorError::Io(_)) => ArmorError::SubjectUnknown,
            _ => err,
        })?;

        let mut reply = [0u8; QUERY_REPLY_LEN];
        let len = channel.read(&mut reply)?;
        if len != QUERY_REPLY_LEN {
            return Err(ArmorError::Protocol(format!(
                "query reply is {} bytes, expected {}",
                len, QUERY_REPLY_LEN
            )));
        }

        let decision = QueryReply::parse(&reply)?.decide(mask);
        log::trace!("Query mask {:#x}: {:?}", mask, decision);
        Ok(decision)
    }

    /// Query `mask` on a file path given as raw bytes.
    pub fn query_file_path_len(&self, mask: u32, label: &[u8], path: &[u8]) -> Result<QueryDecision> {
        let mut query = build_query(label, &[path])?;
        self.query_label(mask, &mut query)
    }

    pub fn query_file_path(&self, mask: u32, label: &str, path: &str) -> Result<QueryDecision> {
        self.query_file_path_len(mask, label.as_bytes(), path.as_bytes())
    }

    /// Would `label` be allowed to create `link` pointing at `target`.
    pub fn query_link_path_len(&self, label: &[u8], target: &[u8], link: &[u8]) -> Result<QueryDecision> {
        let mut query = build_query(label, &[link, target])?;
        self.query_label(AA_MAY_LINK, &mut query)
    }

    pub fn query_link_path(&self, label: &str, target: &str, link: &str) -> Result<QueryDecision> {
        self.query_link_path_len(label.as_bytes(), target.as_bytes(), link.as_bytes())
    }
}

/// Lay out header room, label, NUL, file class and NUL separated payload parts.
fn build_query(label: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let payload: usize = parts.iter().map(|p| p.len()).sum::<usize>() + parts.len().saturating_sub(1);
    let size = QUERY_HEADER_LEN + label.len() + 1 + 1 + payload;

    let mut query = Vec::new();
    query.try_reserve_exact(size)?;
    query.resize(QUERY_HEADER_LEN, 0);
    query.extend_from_slice(label);
    query.push(0);
    query.push(AA_CLASS_FILE);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            query.push(0);
        }
        query.extend_from_slice(part);
    }
    Ok(query)
}
