// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Replays a handful of synthetic payload events through the full pipeline.
//!
//! Wires the pieces together the way an embedding agent would: process
//! filter, per-CPU workers, exporter. Point the intake URLs somewhere real
//! (or at `nc -l 9529`) to watch the records land:
//!
//! ```sh
//! APIFLOW_METRICS_URL=http://127.0.0.1:9529/v1/write/metric \
//! APIFLOW_TRACE_URL=http://127.0.0.1:9529/v1/write/tracing \
//! cargo run --example replay
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use apiflow_agent::l7flow::event::{NetworkData, SourceFunction, CONN_L3_IPV4, CONN_L4_TCP};
use apiflow_agent::{Config, Exporter, HttpFlowTracer, ProcessFilter};

#[tokio::main]
async fn main() {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new("debug").expect("could not parse log level"))
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = Arc::new(Config::from_env().unwrap_or_else(|err| {
        info!("{err}, using defaults");
        Config::default()
    }));

    let filter = Arc::new(ProcessFilter::new(config.filter.clone()));
    filter.filter(
        1234,
        "curl",
        "/usr/bin/curl",
        &HashMap::from([("DD_SERVICE".to_string(), "replay-demo".to_string())]),
    );

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(1024);

    let exporter = Exporter::new(Arc::clone(&config), rx, cancel.clone());
    let exporter_handle = tokio::spawn(exporter.run());

    let mut tracer = HttpFlowTracer::new(Arc::clone(&config), filter, tx, cancel.clone());
    tracer.start();

    let payloads: [&[u8]; 3] = [
        b"GET /api/v1/users?page=2 HTTP/1.1\r\nHost: example.com\r\n\
          x-datadog-trace-id: 1234567890\r\nx-datadog-parent-id: 42\r\n\
          x-datadog-sampling-priority: 1\r\n",
        b"POST /checkout HTTP/1.1\r\nHost: shop.internal\r\n\
          traceparent: 00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01\r\n",
        b"GET /healthz HTTP/1.1\r\nHost: localhost\r\n",
    ];
    for (i, payload) in payloads.iter().enumerate() {
        let event = NetworkData {
            conn: apiflow_agent::l7flow::event::ConnectionInfo {
                saddr: [0, 0, 0, 0x0a00_0001],
                daddr: [0, 0, 0, 0x0a00_0002],
                sport: 50000 + i as u32,
                dport: 80,
                pid: 1234,
                netns: 4_026_531_992,
                meta: CONN_L3_IPV4 | CONN_L4_TCP,
                task_name: "curl".to_string(),
            },
            ts: 1_000_000 * i as u64,
            tcp_seq: i as u32,
            source_fn: SourceFunction::SysWrite as u32,
            index: 0,
            tid: 1235,
            act_size: payload.len() as u32,
            payload: payload.to_vec(),
        };
        tracer.handle_event(i, &event.encode());
    }

    // Give the flush interval a chance to fire, then drain and stop.
    tokio::time::sleep(config.flush_interval + Duration::from_millis(500)).await;
    cancel.cancel();
    tracer.join().await;
    let _ = exporter_handle.await;

    info!("replay finished");
}
