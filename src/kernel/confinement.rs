//! Confinement context parsing
//!
//! The kernel reports a task's confinement as `label (mode)`, or the bare
//! string `unconfined`. [`split_confinement`] separates the two in place;
//! [`ConfinementContext`] owns the split buffer and hands out views.

use std::borrow::Cow;
use std::ffi::CStr;
use std::fmt;
use std::ops::Range;

/// Label of a task that has no profile attached
pub const UNCONFINED: &str = "unconfined";

/// Byte ranges produced by [`split_confinement`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitRanges {
    /// Label occupies `buf[..label_len]`
    pub label_len: usize,
    /// Mode, when a well formed ` (mode)` suffix was present
    pub mode: Option<Range<usize>>,
}

/// Split a confinement string into label and mode, in place.
///
/// With `strip_newline` a single trailing `\n` is dropped first. A
/// ` (mode)` suffix has its space and closing parenthesis overwritten with
/// NUL, so the buffer no longer holds the original text afterwards. Without
/// such a suffix the whole content is the label.
pub fn split_confinement(buf: &mut [u8], strip_newline: bool) -> SplitRanges {
    let mut size = buf.len();

    if strip_newline && size > 0 && buf[size - 1] == b'\n' {
        buf[size - 1] = 0;
        size -= 1;
    }

    if &buf[..size] == UNCONFINED.as_bytes() {
        return SplitRanges {
            label_len: size,
            mode: None,
        };
    }

    if size > 3 && buf[size - 1] == b')' {
        let mut pos = size - 3;
        while pos > 0 {
            if buf[pos] == b' ' && buf[pos + 1] == b'(' {
                buf[pos] = 0;
                buf[size - 1] = 0;
                let mode = pos + 2..size - 1;
                let label_len = pos;
                return SplitRanges {
                    label_len,
                    mode: if &buf[..label_len] == UNCONFINED.as_bytes() {
                        None
                    } else {
                        Some(mode)
                    },
                };
            }
            pos -= 1;
        }
    }

    SplitRanges {
        label_len: size,
        mode: None,
    }
}

/// A task's confinement: label plus optional enforcement mode
///
/// The label is stored NUL terminated so it can be handed to C callers.
#[derive(Clone, PartialEq, Eq)]
pub struct ConfinementContext {
    buf: Vec<u8>,
    label_len: usize,
    mode: Option<Range<usize>>,
}

impl ConfinementContext {
    /// Take ownership of raw attribute content and split it.
    ///
    /// `content` must not include a terminating NUL.
    pub fn parse(mut content: Vec<u8>, strip_newline: bool) -> Self {
        let ranges = split_confinement(&mut content, strip_newline);
        // Room for the terminator is usually already there from the read buffer.
        if content.len() == ranges.label_len {
            content.push(0);
        } else {
            content[ranges.label_len] = 0;
        }
        Self {
            buf: content,
            label_len: ranges.label_len,
            mode: ranges.mode,
        }
    }

    pub fn label_bytes(&self) -> &[u8] {
        &self.buf[..self.label_len]
    }

    pub fn mode_bytes(&self) -> Option<&[u8]> {
        self.mode.clone().map(|range| &self.buf[range])
    }

    pub fn label(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.label_bytes())
    }

    pub fn mode(&self) -> Option<Cow<'_, str>> {
        self.mode_bytes().map(String::from_utf8_lossy)
    }

    /// Label as a NUL terminated C string
    pub fn label_cstr(&self) -> Option<&CStr> {
        CStr::from_bytes_until_nul(&self.buf[..=self.label_len]).ok()
    }

    pub fn is_unconfined(&self) -> bool {
        self.label_bytes() == UNCONFINED.as_bytes()
    }

    /// Length a C caller would receive: label plus terminator
    pub fn raw_len(&self) -> usize {
        self.label_len + 1
    }
}

impl fmt::Display for ConfinementContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode() {
            Some(mode) => write!(f, "{} ({})", self.label(), mode),
            None => write!(f, "{}", self.label()),
        }
    }
}

impl fmt::Debug for ConfinementContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfinementContext")
            .field("label", &self.label())
            .field("mode", &self.mode())
            .finish()
    }
}
