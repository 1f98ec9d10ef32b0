//! Client message framing.

use ldap3_proto::proto::LdapMsg;
use ldap3_proto::LdapCodec;
use ldap_proxy_core::types::{DerefPolicy, SearchScope};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

const SEARCH_REQUEST_TAG: u8 = 0x63;
const ENUMERATED_TAG: u8 = 0x0a;

/// [`LdapCodec`] that accepts out-of-range search scope and alias codes.
///
/// Before a search request is decoded its `scope` and `derefAliases` enumerations are rewritten
/// in place: an unknown scope becomes whole-subtree and an unknown alias policy becomes always.
#[derive(Default)]
pub(crate) struct ClientCodec {
    inner: LdapCodec,
}

impl Decoder for ClientCodec {
    type Item = <LdapCodec as Decoder>::Item;
    type Error = <LdapCodec as Decoder>::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        normalize_search_enums(src);
        self.inner.decode(src)
    }
}

impl Encoder<LdapMsg> for ClientCodec {
    type Error = <LdapCodec as Encoder<LdapMsg>>::Error;

    fn encode(&mut self, item: LdapMsg, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.inner.encode(item, dst)
    }
}

/// Rewrites unknown scope and deref codes of a search request at the head of `buf`.
///
/// Does nothing for other operations, or when the bytes needed are not buffered yet.
fn normalize_search_enums(buf: &mut [u8]) {
    let Some(message) = content_start(buf, 0) else {
        return;
    };
    let Some(op) = element_end(buf, message) else {
        return;
    };
    if buf.get(op) != Some(&SEARCH_REQUEST_TAG) {
        return;
    }
    let Some(request) = content_start(buf, op) else {
        return;
    };
    let Some(scope) = element_end(buf, request) else {
        return;
    };
    let Some(deref) = normalize_enumerated(buf, scope, |code| {
        SearchScope::from_code(code).code()
    }) else {
        return;
    };
    normalize_enumerated(buf, deref, |code| DerefPolicy::from_code(code).code());
}

/// Content offset and length of the element starting at `pos`.
fn header(buf: &[u8], pos: usize) -> Option<(usize, usize)> {
    let tag = *buf.get(pos)?;
    // LDAP never uses multi-byte tags for these elements.
    if tag & 0x1f == 0x1f {
        return None;
    }
    let first = *buf.get(pos + 1)?;
    if first < 0x80 {
        return Some((pos + 2, usize::from(first)));
    }
    let octets = usize::from(first & 0x7f);
    if octets == 0 || octets > std::mem::size_of::<usize>() {
        return None;
    }
    let length = buf
        .get(pos + 2..pos + 2 + octets)?
        .iter()
        .fold(0usize, |length, byte| (length << 8) | usize::from(*byte));
    Some((pos + 2 + octets, length))
}

fn content_start(buf: &[u8], pos: usize) -> Option<usize> {
    header(buf, pos).map(|(start, _)| start)
}

fn element_end(buf: &[u8], pos: usize) -> Option<usize> {
    let (start, length) = header(buf, pos)?;
    start.checked_add(length)
}

/// Normalizes the ENUMERATED at `pos` and returns the offset of the next element.
///
/// The value keeps its encoded length so no enclosing length changes.
fn normalize_enumerated(
    buf: &mut [u8],
    pos: usize,
    normalize: impl Fn(i64) -> i64,
) -> Option<usize> {
    if *buf.get(pos)? != ENUMERATED_TAG {
        return None;
    }
    let (start, length) = header(buf, pos)?;
    let end = start.checked_add(length)?;
    let value = buf.get_mut(start..end)?;
    let code = enumerated_value(value);
    let normalized = normalize(code.unwrap_or(-1));
    if code != Some(normalized) {
        let replacement = u8::try_from(normalized).ok()?;
        if let Some((last, leading)) = value.split_last_mut() {
            leading.fill(0);
            *last = replacement;
        }
    }
    Some(end)
}

fn enumerated_value(bytes: &[u8]) -> Option<i64> {
    let (first, _) = bytes.split_first()?;
    if bytes.len() > 8 {
        return None;
    }
    let sign: i64 = if first & 0x80 == 0 { 0 } else { -1 };
    Some(
        bytes
            .iter()
            .fold(sign, |value, byte| (value << 8) | i64::from(*byte)),
    )
}

/// BER for a search request with a `(objectClass=*)` filter and no attributes.
#[cfg(test)]
pub(crate) fn encoded_search(msgid: u8, base: &str, scope: u8, deref: u8) -> Vec<u8> {
    let mut request = vec![0x04, u8::try_from(base.len()).unwrap()];
    request.extend_from_slice(base.as_bytes());
    request.extend_from_slice(&[
        ENUMERATED_TAG,
        0x01,
        scope,
        ENUMERATED_TAG,
        0x01,
        deref,
        0x02,
        0x01,
        0x00,
        0x02,
        0x01,
        0x00,
        0x01,
        0x01,
        0x00,
        0x87,
        0x0b,
    ]);
    request.extend_from_slice(b"objectClass");
    request.extend_from_slice(&[0x30, 0x00]);

    let mut message = vec![
        0x02,
        0x01,
        msgid,
        SEARCH_REQUEST_TAG,
        u8::try_from(request.len()).unwrap(),
    ];
    message.extend(request);
    let mut frame = vec![0x30, u8::try_from(message.len()).unwrap()];
    frame.extend(message);
    frame
}
