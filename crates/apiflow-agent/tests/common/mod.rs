// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures: raw perf events in the kernel wire layout.

use apiflow_agent::l7flow::event::{
    ConnectionInfo, NetworkData, SourceFunction, CONN_L3_IPV4, CONN_L4_TCP,
};

pub const TEST_PID: u32 = 4242;
pub const TEST_TID: u32 = 4243;

pub fn test_conn(task_name: &str) -> ConnectionInfo {
    ConnectionInfo {
        saddr: [0, 0, 0, 0x0a00_0001],
        daddr: [0, 0, 0, 0x0a00_0002],
        sport: 51334,
        dport: 8080,
        pid: TEST_PID,
        netns: 4_026_531_992,
        meta: CONN_L3_IPV4 | CONN_L4_TCP,
        task_name: task_name.to_string(),
    }
}

/// Encodes an event the way the eBPF side would deliver it.
pub fn encode_event(
    conn: &ConnectionInfo,
    ts: u64,
    source_fn: SourceFunction,
    tid: u32,
    payload: &[u8],
) -> Vec<u8> {
    NetworkData {
        conn: conn.clone(),
        ts,
        tcp_seq: 1,
        source_fn: source_fn as u32,
        index: 0,
        tid,
        act_size: payload.len() as u32,
        payload: payload.to_vec(),
    }
    .encode()
}
