// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Best-effort HTTP request-head parsing over a truncated payload prefix.
//!
//! The input is whatever prefix of a TCP payload direction the kernel side
//! captured, so the head may be cut anywhere: mid request line, mid header,
//! before the terminating blank line. The parser extracts what it can and
//! answers `None` only when the payload cannot be the start of an HTTP
//! request. It never reads past its input.
//!
//! Parsing is byte-level throughout; header text is converted lossily at
//! the end, so a stray non-UTF-8 byte in a value never costs the request.
//! Deviations from RFC semantics are intentional: on repeated header names
//! the first occurrence wins (duplicates of tracing headers indicate a
//! misbehaving client, not data to merge), and header name casing is kept
//! as received.

use std::collections::HashMap;

/// Window of the payload prefix handed to the parser.
pub const HTTP_PAYLOAD_MAX_SIZE: usize = 157;

/// Parsed request line plus the header block.
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    pub method: String,
    /// URI path, query string stripped, scheme and authority stripped for
    /// absolute-form targets.
    pub path: String,
    pub version: String,
    /// Query string without the leading `?`, empty if none.
    pub query: String,
    pub headers: HashMap<String, String>,
}

/// Recognizes an HTTP request head in a payload prefix.
///
/// Returns `None` when the payload is not the start of an HTTP request:
/// a leading ASCII `'0'` (request lines start with an uppercase method
/// letter), a blank line at offset zero, no request line terminator, a
/// request line that is not exactly three space-separated tokens, or a
/// target that is neither origin-form nor an absolute URI with a path.
pub fn parse_request_head(payload: &[u8]) -> Option<RequestHead> {
    if payload.first().map_or(true, |&b| b == b'0') {
        return None;
    }

    // Everything from the last CRLF-CRLF on is body (or the start of one);
    // a blank line at offset zero means there is no request line at all.
    let mut payload = payload;
    if let Some(idx) = rfind(payload, b"\r\n\r\n") {
        if idx == 0 {
            return None;
        }
        payload = &payload[..idx];
    }

    let idx = find(payload, b"\r\n")?;
    let line = &payload[..idx];

    let tokens: Vec<&[u8]> = line.split(|&b| b == b' ').collect();
    let &[method, target, version] = tokens.as_slice() else {
        return None;
    };

    let (uri, query) = match target.iter().position(|&b| b == b'?') {
        Some(mark) => (&target[..mark], &target[mark + 1..]),
        None => (target, b"".as_slice()),
    };
    let path = request_path(uri)?;

    let mut headers = HashMap::new();
    let mut rest = &payload[idx + 2..];
    loop {
        let (header_line, tail) = match find(rest, b"\r\n") {
            Some(eol) => (&rest[..eol], Some(&rest[eol + 2..])),
            None => (rest, None),
        };
        let Some(colon) = header_line.iter().position(|&b| b == b':') else {
            break;
        };
        let name = lossy(&header_line[..colon]);
        if !headers.contains_key(&name) {
            headers.insert(name, lossy(trim_ascii_whitespace(&header_line[colon + 1..])));
        }
        match tail {
            Some(tail) => rest = tail,
            None => break,
        }
    }

    Some(RequestHead {
        method: lossy(method),
        path: lossy(path),
        version: lossy(version),
        query: lossy(query),
        headers,
    })
}

/// Validates the request target and strips scheme and authority.
///
/// Absolute-form targets must carry a `/` after the authority; origin-form
/// targets must start with `/`.
fn request_path(uri: &[u8]) -> Option<&[u8]> {
    if uri.len() > 8 && uri.starts_with(b"https://") {
        let off = uri[8..].iter().position(|&b| b == b'/')?;
        Some(&uri[8 + off..])
    } else if uri.len() > 7 && uri.starts_with(b"http://") {
        let off = uri[7..].iter().position(|&b| b == b'/')?;
        Some(&uri[7 + off..])
    } else if uri.first() == Some(&b'/') {
        Some(uri)
    } else {
        None
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn trim_ascii_whitespace(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}
