// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batches finished records and posts them to the intake endpoints.
//!
//! Trace and metric records travel to separate configurable URLs. Records
//! are collected from the pipeline's non-blocking channel, encoded as JSON
//! batches, and flushed on an interval or when a batch fills up. A 4xx
//! response means the payload is bad and the batch is dropped; transport
//! errors and 5xx responses are retried with a linear backoff before the
//! batch is counted as lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use apiflow_spanid::format_span_id;

use crate::config::Config;
use crate::error::AgentError;
use crate::l7flow::{ExportRecord, HttpStats, TraceInfo};

/// Flush early once a batch accumulates this many records.
const MAX_BATCH_RECORDS: usize = 512;

/// Delivery counters, shared with whoever wants to watch the exporter.
#[derive(Debug, Default)]
pub struct ExportStats {
    pub traces_sent: AtomicU64,
    pub metrics_sent: AtomicU64,
    pub records_dropped: AtomicU64,
}

pub struct Exporter {
    config: Arc<Config>,
    client: reqwest::Client,
    rx: mpsc::Receiver<ExportRecord>,
    cancel: CancellationToken,
    stats: Arc<ExportStats>,
}

impl Exporter {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        rx: mpsc::Receiver<ExportRecord>,
        cancel: CancellationToken,
    ) -> Self {
        Exporter {
            config,
            client: reqwest::Client::new(),
            rx,
            cancel,
            stats: Arc::new(ExportStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<ExportStats> {
        Arc::clone(&self.stats)
    }

    /// Drains the record channel until cancellation or channel close,
    /// flushing on the configured interval.
    pub async fn run(mut self) {
        let mut traces: Vec<Value> = Vec::new();
        let mut metrics: Vec<Value> = Vec::new();
        let mut flush_interval = tokio::time::interval(self.config.flush_interval);
        flush_interval.tick().await; // discard the immediate first tick
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    while let Ok(record) = self.rx.try_recv() {
                        self.buffer(record, &mut traces, &mut metrics).await;
                    }
                    self.flush(&mut traces, &mut metrics).await;
                    debug!("exporter stopped");
                    break;
                }
                _ = flush_interval.tick() => {
                    self.flush(&mut traces, &mut metrics).await;
                }
                received = self.rx.recv() => match received {
                    Some(record) => self.buffer(record, &mut traces, &mut metrics).await,
                    None => {
                        self.flush(&mut traces, &mut metrics).await;
                        break;
                    }
                }
            }
        }
    }

    async fn buffer(&self, record: ExportRecord, traces: &mut Vec<Value>, metrics: &mut Vec<Value>) {
        match record {
            ExportRecord::Trace(info) => {
                traces.push(trace_value(&info, self.config.conv_to_dd));
            }
            ExportRecord::Metric(stats) => metrics.push(metric_value(&stats)),
        }
        if traces.len() >= MAX_BATCH_RECORDS || metrics.len() >= MAX_BATCH_RECORDS {
            self.flush(traces, metrics).await;
        }
    }

    async fn flush(&self, traces: &mut Vec<Value>, metrics: &mut Vec<Value>) {
        if !traces.is_empty() {
            let batch = std::mem::take(traces);
            let sent = batch.len() as u64;
            if self.post(&self.config.trace_post_url, batch).await {
                self.stats.traces_sent.fetch_add(sent, Ordering::Relaxed);
            } else {
                self.stats.records_dropped.fetch_add(sent, Ordering::Relaxed);
            }
        }
        if !metrics.is_empty() {
            let batch = std::mem::take(metrics);
            let sent = batch.len() as u64;
            if self.post(&self.config.metrics_post_url, batch).await {
                self.stats.metrics_sent.fetch_add(sent, Ordering::Relaxed);
            } else {
                self.stats.records_dropped.fetch_add(sent, Ordering::Relaxed);
            }
        }
    }

    /// Posts one batch. Returns whether the intake accepted it.
    async fn post(&self, url: &str, batch: Vec<Value>) -> bool {
        let count = batch.len();
        let body = json!({
            "tags": self.config.global_tags,
            "points": batch,
        });

        for attempt in 0..=self.config.export_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.export_retry_backoff * attempt).await;
            }

            match self.send_once(url, &body).await {
                Ok(response) if response.status().is_success() => {
                    debug!("flushed {count} records to {url}");
                    return true;
                }
                Ok(response) if response.status().is_client_error() => {
                    // The intake rejected the payload; retrying cannot help.
                    error!(
                        "{}: intake rejected batch of {count}: {:?}",
                        response.status(),
                        response.text().await.unwrap_or_default()
                    );
                    return false;
                }
                Ok(response) => {
                    warn!(
                        "{}: transient intake failure, attempt {attempt}",
                        response.status()
                    );
                }
                Err(err) => {
                    warn!("attempt {attempt}: {err}");
                }
            }
        }

        error!("dropping batch of {count} records after retries: {url}");
        false
    }

    async fn send_once(&self, url: &str, body: &Value) -> Result<reqwest::Response, AgentError> {
        Ok(self.client.post(url).json(body).send().await?)
    }
}

/// Encodes a trace record.
///
/// Identifier rendering follows the wire encoding the context arrived with:
/// hex for W3C, decimal for Datadog. `conv_to_dd` forces the decimal form,
/// collapsing 128-bit IDs to their low half the way 64-bit consumers expect.
fn trace_value(info: &TraceInfo, conv_to_dd: bool) -> Value {
    let hex = info.hex_encode && !conv_to_dd;
    let trace_id = if hex {
        info.trace_id.to_hex()
    } else {
        format_span_id(info.trace_id.low, false)
    };

    json!({
        "resource": format!("{} {}", info.method, info.path),
        "service": info.service,
        "host": info.host,
        "method": info.method,
        "path": info.path,
        "version": info.version,
        "param": info.param,
        "trace_id": trace_id,
        "parent_id": format_span_id(info.parent_span_id, hex),
        "span_id": format_span_id(info.thr_trace_id, hex),
        "have_trace_id": info.have_trace_id,
        "sampled": info.aspan_sampled,
        "pid_tid": info.pid_tid,
        "task_comm": info.task_comm,
        "process_name": info.process_name,
        "ts": info.ts,
    })
}

fn metric_value(stats: &HttpStats) -> Value {
    json!({
        "direction": stats.direction.as_str(),
        "src": stats.src,
        "dst": stats.dst,
        "l4_proto": stats.l4_proto,
        "method": stats.method,
        "path": stats.path,
        "version": stats.version,
        "pid": stats.pid,
        "netns": stats.netns,
        "task_comm": stats.task_name,
        "recv": stats.recv,
        "send": stats.send,
        "ts": stats.ts,
    })
}
