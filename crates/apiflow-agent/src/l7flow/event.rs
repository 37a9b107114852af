// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire layout of kernel-side payload events and the buffer pool that
//! receives them.
//!
//! Each perf event carries a fixed header followed by a bounded payload
//! prefix:
//!
//! ```text
//! saddr     4 x u32   source address words (IPv4 uses the last word)
//! daddr     4 x u32
//! sport     u32
//! dport     u32
//! pid       u32
//! netns     u32
//! meta      u32       L3 family and L4 protocol bitfield
//! comm      16 bytes  NUL-padded task name
//! ts        u64       kernel timestamp, nanoseconds
//! tcp_seq   u32
//! fn_id     u32       syscall / TLS hook the payload was captured in
//! index     u32       position of this chunk within the flow
//! tid       u32
//! act_size  u32       payload bytes that follow
//! payload   act_size bytes, at most the 4 KiB window
//! ```
//!
//! All integers are little-endian as written by the eBPF side.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

use bytes::Buf;

/// L3 family and L4 protocol live in disjoint ranges of `meta`.
pub const CONN_L3_MASK: u32 = 0x00ff;
pub const CONN_L3_IPV4: u32 = 0x0000;
pub const CONN_L3_IPV6: u32 = 0x0001;
pub const CONN_L4_MASK: u32 = 0xff00;
pub const CONN_L4_TCP: u32 = 0x0000;
pub const CONN_L4_UDP: u32 = 0x0100;

/// Payload window captured per event.
pub const PAYLOAD_BUF_SIZE: usize = 4096;

pub const KERNEL_TASK_COMM_LEN: usize = 16;

const EVENT_HEADER_SIZE: usize = 96;

/// Events whose decode fails are counted, not surfaced.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventDecodeError {
    #[error("event shorter than header: {0} bytes")]
    TruncatedHeader(usize),
    #[error("payload length {actual} exceeds remaining {remaining} bytes")]
    TruncatedPayload { actual: usize, remaining: usize },
    #[error("payload length {0} exceeds the capture window")]
    OversizedPayload(usize),
}

/// Syscall or TLS library hook a payload chunk was captured in.
///
/// The read side of the socket observes incoming request bytes, the write
/// side outgoing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SourceFunction {
    Unknown = 0,
    SysRead = 1,
    SysWrite = 2,
    SysRecvFrom = 3,
    SysSendTo = 4,
    SysReadV = 5,
    SysWriteV = 6,
    SysSendFile = 7,
    SslRead = 8,
    SslWrite = 9,
}

impl SourceFunction {
    #[must_use]
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            1 => SourceFunction::SysRead,
            2 => SourceFunction::SysWrite,
            3 => SourceFunction::SysRecvFrom,
            4 => SourceFunction::SysSendTo,
            5 => SourceFunction::SysReadV,
            6 => SourceFunction::SysWriteV,
            7 => SourceFunction::SysSendFile,
            8 => SourceFunction::SslRead,
            9 => SourceFunction::SslWrite,
            _ => SourceFunction::Unknown,
        }
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        match self {
            SourceFunction::SysRead
            | SourceFunction::SysRecvFrom
            | SourceFunction::SysReadV
            | SourceFunction::SslRead => Direction::Incoming,
            _ => Direction::Outgoing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

/// Connection identity shared by every chunk of a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub saddr: [u32; 4],
    pub daddr: [u32; 4],
    pub sport: u32,
    pub dport: u32,
    pub pid: u32,
    pub netns: u32,
    pub meta: u32,
    pub task_name: String,
}

impl ConnectionInfo {
    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        self.meta & CONN_L3_MASK == CONN_L3_IPV6
    }

    #[must_use]
    pub fn is_tcp(&self) -> bool {
        self.meta & CONN_L4_MASK == CONN_L4_TCP
    }

    #[must_use]
    pub fn src_ip(&self) -> IpAddr {
        addr_words_to_ip(&self.saddr, self.is_ipv6())
    }

    #[must_use]
    pub fn dst_ip(&self) -> IpAddr {
        addr_words_to_ip(&self.daddr, self.is_ipv6())
    }
}

fn addr_words_to_ip(words: &[u32; 4], ipv6: bool) -> IpAddr {
    if ipv6 {
        let mut octets = [0u8; 16];
        for (i, word) in words.iter().enumerate() {
            octets[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        IpAddr::V4(Ipv4Addr::from(words[3].to_be_bytes()))
    }
}

/// One decoded perf event, reused through the [`BufferPool`].
#[derive(Debug, Default)]
pub struct NetworkData {
    pub conn: ConnectionInfo,
    pub ts: u64,
    pub tcp_seq: u32,
    pub source_fn: u32,
    pub index: u32,
    pub tid: u32,
    pub act_size: u32,
    pub payload: Vec<u8>,
}

impl NetworkData {
    /// PID/TID pair packed the way trace records carry it.
    #[must_use]
    pub fn pid_tid(&self) -> u64 {
        u64::from(self.conn.pid) << 32 | u64::from(self.tid)
    }

    #[must_use]
    pub fn source_function(&self) -> SourceFunction {
        SourceFunction::from_tag(self.source_fn)
    }

    /// Decodes a raw perf event into this buffer.
    pub fn decode(&mut self, mut raw: &[u8]) -> Result<(), EventDecodeError> {
        if raw.len() < EVENT_HEADER_SIZE {
            return Err(EventDecodeError::TruncatedHeader(raw.len()));
        }

        for word in &mut self.conn.saddr {
            *word = raw.get_u32_le();
        }
        for word in &mut self.conn.daddr {
            *word = raw.get_u32_le();
        }
        self.conn.sport = raw.get_u32_le();
        self.conn.dport = raw.get_u32_le();
        self.conn.pid = raw.get_u32_le();
        self.conn.netns = raw.get_u32_le();
        self.conn.meta = raw.get_u32_le();

        let mut comm = [0u8; KERNEL_TASK_COMM_LEN];
        raw.copy_to_slice(&mut comm);
        self.conn.task_name = task_name(&comm);

        self.ts = raw.get_u64_le();
        self.tcp_seq = raw.get_u32_le();
        self.source_fn = raw.get_u32_le();
        self.index = raw.get_u32_le();
        self.tid = raw.get_u32_le();
        self.act_size = raw.get_u32_le();

        let actual = self.act_size as usize;
        if actual > PAYLOAD_BUF_SIZE {
            return Err(EventDecodeError::OversizedPayload(actual));
        }
        if actual > raw.remaining() {
            return Err(EventDecodeError::TruncatedPayload {
                actual,
                remaining: raw.remaining(),
            });
        }

        self.payload.clear();
        self.payload.extend_from_slice(&raw[..actual]);

        Ok(())
    }

    /// Encodes this event back into the wire layout.
    ///
    /// The inverse of [`NetworkData::decode`]; the kernel side is the only
    /// producer in deployment, this exists for replay tooling and tests.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(EVENT_HEADER_SIZE + self.payload.len());
        for word in self.conn.saddr {
            raw.extend_from_slice(&word.to_le_bytes());
        }
        for word in self.conn.daddr {
            raw.extend_from_slice(&word.to_le_bytes());
        }
        for value in [
            self.conn.sport,
            self.conn.dport,
            self.conn.pid,
            self.conn.netns,
            self.conn.meta,
        ] {
            raw.extend_from_slice(&value.to_le_bytes());
        }

        let mut comm = [0u8; KERNEL_TASK_COMM_LEN];
        let name = self.conn.task_name.as_bytes();
        let len = name.len().min(KERNEL_TASK_COMM_LEN);
        comm[..len].copy_from_slice(&name[..len]);
        raw.extend_from_slice(&comm);

        raw.extend_from_slice(&self.ts.to_le_bytes());
        for value in [
            self.tcp_seq,
            self.source_fn,
            self.index,
            self.tid,
            self.payload.len() as u32,
        ] {
            raw.extend_from_slice(&value.to_le_bytes());
        }
        raw.extend_from_slice(&self.payload);
        raw
    }

    /// Clears metadata and truncates the payload, keeping its capacity.
    pub fn reset(&mut self) {
        self.conn = ConnectionInfo::default();
        self.ts = 0;
        self.tcp_seq = 0;
        self.source_fn = 0;
        self.index = 0;
        self.tid = 0;
        self.act_size = 0;
        self.payload.clear();
    }
}

/// Task names arrive NUL-padded; trailing whitespace is kernel noise.
fn task_name(comm: &[u8; KERNEL_TASK_COMM_LEN]) -> String {
    String::from_utf8_lossy(comm)
        .trim_matches('\0')
        .trim_matches(|c: char| c.is_ascii_whitespace())
        .to_string()
}

/// Unbounded free-list of event buffers.
///
/// Buffers keep their 4 KiB payload allocation across uses; callers must
/// return buffers through [`BufferPool::put`], which resets them.
#[derive(Default)]
pub struct BufferPool {
    free: Mutex<Vec<Box<NetworkData>>>,
}

impl BufferPool {
    #[must_use]
    pub fn new() -> Self {
        BufferPool::default()
    }

    #[allow(clippy::expect_used)]
    pub fn get(&self) -> Box<NetworkData> {
        if let Some(data) = self.free.lock().expect("lock poisoned").pop() {
            return data;
        }
        Box::new(NetworkData {
            payload: Vec::with_capacity(PAYLOAD_BUF_SIZE),
            ..NetworkData::default()
        })
    }

    #[allow(clippy::expect_used)]
    pub fn put(&self, mut data: Box<NetworkData>) {
        data.reset();
        self.free.lock().expect("lock poisoned").push(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(conn: ConnectionInfo, source_fn: SourceFunction, payload: &[u8]) -> NetworkData {
        NetworkData {
            conn,
            ts: 111_222_333,
            tcp_seq: 42,
            source_fn: source_fn as u32,
            index: 0,
            tid: 5678,
            act_size: payload.len() as u32,
            payload: payload.to_vec(),
        }
    }

    fn sample_conn() -> ConnectionInfo {
        ConnectionInfo {
            saddr: [0, 0, 0, 0x0a00_0001],
            daddr: [0, 0, 0, 0x0a00_0002],
            sport: 44210,
            dport: 80,
            pid: 1234,
            netns: 4_026_531_992,
            meta: CONN_L3_IPV4 | CONN_L4_TCP,
            task_name: "curl".to_string(),
        }
    }

    #[test]
    fn decode_inverts_encode() {
        let event = sample_event(
            sample_conn(),
            SourceFunction::SysWrite,
            b"GET / HTTP/1.1\r\nHost: a\r\n",
        );
        let raw = event.encode();

        let mut data = NetworkData::default();
        data.decode(&raw).unwrap();

        assert_eq!(data.conn, event.conn);
        assert_eq!(data.ts, 111_222_333);
        assert_eq!(data.tcp_seq, 42);
        assert_eq!(data.source_function(), SourceFunction::SysWrite);
        assert_eq!(data.tid, 5678);
        assert_eq!(data.pid_tid(), 1234 << 32 | 5678);
        assert_eq!(data.payload, b"GET / HTTP/1.1\r\nHost: a\r\n");
    }

    #[test]
    fn decode_rejects_short_header() {
        let mut data = NetworkData::default();
        assert_eq!(
            data.decode(&[0u8; 10]),
            Err(EventDecodeError::TruncatedHeader(10))
        );
    }

    #[test]
    fn decode_rejects_payload_past_end() {
        let event = sample_event(sample_conn(), SourceFunction::SysRead, b"abcdef");
        let mut raw = event.encode();
        raw.truncate(raw.len() - 3);

        let mut data = NetworkData::default();
        assert_eq!(
            data.decode(&raw),
            Err(EventDecodeError::TruncatedPayload {
                actual: 6,
                remaining: 3
            })
        );
    }

    #[test]
    fn task_name_trims_nuls_and_whitespace() {
        let mut comm = [0u8; KERNEL_TASK_COMM_LEN];
        comm[..6].copy_from_slice(b" curl ");
        assert_eq!(task_name(&comm), "curl");
    }

    #[test]
    fn direction_follows_hook_side() {
        assert_eq!(SourceFunction::SysRead.direction(), Direction::Incoming);
        assert_eq!(SourceFunction::SslRead.direction(), Direction::Incoming);
        assert_eq!(SourceFunction::SysSendTo.direction(), Direction::Outgoing);
        assert_eq!(SourceFunction::SslWrite.direction(), Direction::Outgoing);
    }

    #[test]
    fn ip_rendering() {
        let conn = sample_conn();
        assert_eq!(conn.src_ip().to_string(), "10.0.0.1");
        assert_eq!(conn.dst_ip().to_string(), "10.0.0.2");

        let v6 = ConnectionInfo {
            meta: CONN_L3_IPV6,
            saddr: [0x2001_0db8, 0, 0, 1],
            ..ConnectionInfo::default()
        };
        assert_eq!(v6.src_ip().to_string(), "2001:db8::1");
    }

    #[test]
    fn pool_reuses_and_resets_buffers() {
        let pool = BufferPool::new();
        let mut data = pool.get();
        data.conn.pid = 9;
        data.payload.extend_from_slice(b"leftover");
        pool.put(data);

        let data = pool.get();
        assert_eq!(data.conn.pid, 0);
        assert!(data.payload.is_empty());
        assert!(data.payload.capacity() >= PAYLOAD_BUF_SIZE);
    }
}
