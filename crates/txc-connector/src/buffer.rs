use std::ffi::CStr;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::warn;
use txc_core::{Result, TxcError};

use crate::ffi::Api;

/// A NUL-terminated buffer allocated by the connector.
///
/// Handed to input stream subscribers and returned by
/// [`Sender::send`](crate::Sender::send). The buffer is released with
/// `FreeMemory` when the `TCStr` is dropped; until then it keeps the library
/// loaded.
///
/// ```no_run
/// # fn f(buf: txc_connector::TCStr) {
/// // contents are read through `Deref<Target = CStr>`
/// let text: std::borrow::Cow<str> = buf.to_string_lossy();
/// let bytes: &[u8] = buf.to_bytes();
/// # }
/// ```
pub struct TCStr {
    ptr: NonNull<u8>,
    api: Arc<Api>,
}

// SAFETY: the buffer is immutable once delivered and `FreeMemory` may be
// called from any thread.
unsafe impl Send for TCStr {}

impl TCStr {
    #[inline]
    pub(crate) fn new(ptr: NonNull<u8>, api: Arc<Api>) -> Self {
        Self { ptr, api }
    }

    /// `None` for a null pointer.
    ///
    /// # Safety
    /// A non-null `ptr` must be an unreleased, NUL-terminated buffer obtained
    /// from the connector behind `api`.
    #[inline]
    pub(crate) unsafe fn from_raw(ptr: *mut u8, api: Arc<Api>) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self::new(ptr, api))
    }
}

impl Drop for TCStr {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the buffer came from this connector and is released once.
        if !unsafe { self.api.free_memory(self.ptr.as_ptr()) } {
            warn!("FreeMemory returned false for a live connector buffer");
        }
    }
}

impl Deref for TCStr {
    type Target = CStr;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: the connector NUL-terminates every buffer it hands out and
        // keeps it intact until FreeMemory.
        unsafe { CStr::from_ptr(self.ptr.as_ptr().cast()) }
    }
}

impl AsRef<[u8]> for TCStr {
    fn as_ref(&self) -> &[u8] {
        self.to_bytes()
    }
}

impl fmt::Debug for TCStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TCStr").field(&self.ptr).finish()
    }
}

impl fmt::Display for TCStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

/* SendCommand replies come in three forms:
 *   Success:   <result success="true" .../>
 *   Refusal:   <result success="false"><message>...</message></result>
 *   Exception: <error>...</error> */

/// Classify a `SendCommand` reply; successful replies are handed back.
pub fn parse_send_response(buf: TCStr) -> Result<TCStr> {
    enum Reply {
        Success,
        Refused,
        Error,
        Unknown,
    }

    let reply = {
        let head = buf.to_bytes().trim_ascii_start();
        if is_element(head, b"result") {
            match xml_attr(head, "success") {
                Some(b"true") => Reply::Success,
                Some(_) => Reply::Refused,
                None => Reply::Unknown,
            }
        } else if is_element(head, b"error") {
            Reply::Error
        } else {
            Reply::Unknown
        }
    };

    match reply {
        Reply::Success => Ok(buf),
        Reply::Refused => Err(TxcError::InvalidCommand(buf.to_string_lossy().into_owned())),
        Reply::Error => Err(TxcError::Connector(buf.to_string_lossy().into_owned())),
        Reply::Unknown => Err(TxcError::UnexpectedResponse(buf.to_string_lossy().into_owned())),
    }
}

/// `transactionid` of a successful reply (order commands).
pub fn transaction_id(reply: &CStr) -> Option<u64> {
    let value = xml_attr(reply.to_bytes(), "transactionid")?;
    std::str::from_utf8(value).ok()?.parse().ok()
}

fn is_element(bytes: &[u8], name: &[u8]) -> bool {
    match bytes.strip_prefix(b"<").and_then(|b| b.strip_prefix(name)) {
        Some(rest) => {
            matches!(rest.first(), Some(b'>' | b'/' | b' ' | b'\t' | b'\r' | b'\n'))
        }
        None => false,
    }
}

/// Value of attribute `name` on the first element of `bytes`.
///
/// Single and double quotes are accepted, whitespace around `=` is skipped.
pub fn xml_attr<'a>(bytes: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let end = bytes.iter().position(|&b| b == b'>').unwrap_or(bytes.len());
    let tag = &bytes[..end];
    let name = name.as_bytes();

    let mut i = 1;
    while i + name.len() <= tag.len() {
        if tag[i - 1].is_ascii_whitespace() && tag[i..].starts_with(name) {
            let mut j = skip_ws(tag, i + name.len());
            if tag.get(j) == Some(&b'=') {
                j = skip_ws(tag, j + 1);
                if let Some(&quote @ (b'"' | b'\'')) = tag.get(j) {
                    let value = &tag[j + 1..];
                    let len = value.iter().position(|&b| b == quote)?;
                    return Some(&value[..len]);
                }
            }
        }
        i += 1;
    }
    None
}

#[inline]
fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes() {
        let xml = br#"<result success="true" transactionid = '42'/>"#;
        assert_eq!(xml_attr(xml, "success"), Some(&b"true"[..]));
        assert_eq!(xml_attr(xml, "transactionid"), Some(&b"42"[..]));
        assert_eq!(xml_attr(xml, "id"), None);
        // name must start at a word boundary
        assert_eq!(xml_attr(br#"<command xid="1"/>"#, "id"), None);
        // only the first element is inspected
        assert_eq!(xml_attr(br#"<a><b id="1"/></a>"#, "id"), None);
        assert_eq!(xml_attr(br#"<command id = "connect">"#, "id"), Some(&b"connect"[..]));
    }

    #[test]
    fn element_names() {
        assert!(is_element(b"<result success=\"true\"/>", b"result"));
        assert!(is_element(b"<error>x</error>", b"error"));
        assert!(!is_element(b"<results/>", b"result"));
        assert!(!is_element(b"result", b"result"));
    }

    #[test]
    fn transaction_ids() {
        let ok =
            CStr::from_bytes_with_nul(b"<result success=\"true\" transactionid=\"7\"/>\0").unwrap();
        assert_eq!(transaction_id(ok), Some(7));
        let none = CStr::from_bytes_with_nul(b"<result success=\"true\"/>\0").unwrap();
        assert_eq!(transaction_id(none), None);
    }
}
