// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request assembly from raw payload events.
//!
//! Perf events arrive per CPU from the eBPF side and are routed to one
//! worker per CPU. Each worker recognizes HTTP request heads in the payload
//! prefix, extracts distributed-tracing context, consults the process
//! filter, and hands finished records to the exporter over a non-blocking
//! channel. Within a connection the kernel side delivers chunks in wire
//! order and the workers preserve it; across connections nothing is
//! ordered.
//!
//! Nothing here is fatal: undecodable events, non-HTTP payloads, and full
//! channels are counted and logged, never propagated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use apiflow_spanid::{Id128, InnerIdGenerator, UlidGenerator};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::http::{self, HTTP_PAYLOAD_MAX_SIZE};
use crate::procfilter::ProcessFilter;
use crate::propagation::{self, Extractor};

pub mod event;

use event::{BufferPool, Direction, NetworkData};

/// Placeholder for fields a non-HTTP payload cannot provide.
pub const NO_VALUE: &str = "N/A";

/// Queue depth between the perf callback and each worker.
const WORKER_QUEUE_DEPTH: usize = 4096;

/// Finished request record, published to the trace intake.
#[derive(Debug, Clone)]
pub struct TraceInfo {
    pub host: String,
    pub method: String,
    pub path: String,
    pub version: String,
    /// Query string of the request target, empty if none.
    pub param: String,

    /// Ephemeral in-process ID correlating a response to its request.
    pub thr_trace_id: u64,
    pub trace_id: Id128,
    pub parent_span_id: u64,
    /// Identifiers travel hex encoded (W3C) rather than decimal (Datadog).
    pub hex_encode: bool,
    /// The request arrived with usable upstream trace context.
    pub have_trace_id: bool,
    /// An ancestor span carried a positive sampling decision.
    pub aspan_sampled: bool,

    pub pid_tid: u64,
    pub task_comm: String,
    pub process_name: String,
    pub service: String,
    pub allow_trace: bool,

    pub headers: HashMap<String, String>,
    pub ts: u64,
}

/// L7 statistic emitted for every observed payload, HTTP or not.
#[derive(Debug, Clone)]
pub struct HttpStats {
    pub direction: Direction,
    /// `ip:port` of the connection endpoints.
    pub src: String,
    pub dst: String,
    pub l4_proto: &'static str,
    pub method: String,
    pub path: String,
    pub version: String,
    pub pid: u32,
    pub netns: u32,
    pub task_name: String,
    pub recv: usize,
    pub send: usize,
    pub ts: u64,
}

/// Record handed to the exporter; the variant selects the intake endpoint.
#[derive(Debug, Clone)]
pub enum ExportRecord {
    Trace(Box<TraceInfo>),
    Metric(HttpStats),
}

/// Hot-path defect counters. All failures are counted, none abort.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub events: AtomicU64,
    pub decode_failures: AtomicU64,
    pub not_http: AtomicU64,
    pub traces_emitted: AtomicU64,
    pub records_dropped: AtomicU64,
}

struct PipelineShared {
    config: Arc<Config>,
    filter: Arc<ProcessFilter>,
    /// `None` when generator init failed; requests then go out without a
    /// minted root trace ID.
    ulid: Option<UlidGenerator>,
    inner_ids: Option<InnerIdGenerator>,
    pool: BufferPool,
    out: mpsc::Sender<ExportRecord>,
    stats: Arc<PipelineStats>,
}

/// The per-CPU payload pipeline.
pub struct HttpFlowTracer {
    shared: Arc<PipelineShared>,
    workers: Vec<mpsc::Sender<Box<NetworkData>>>,
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl HttpFlowTracer {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        filter: Arc<ProcessFilter>,
        out: mpsc::Sender<ExportRecord>,
        cancel: CancellationToken,
    ) -> Self {
        let ulid = UlidGenerator::new()
            .map_err(|err| warn!("trace id generator unavailable: {err}"))
            .ok();
        let inner_ids = InnerIdGenerator::new()
            .map_err(|err| warn!("inner id generator unavailable: {err}"))
            .ok();

        HttpFlowTracer {
            shared: Arc::new(PipelineShared {
                config,
                filter,
                ulid,
                inner_ids,
                pool: BufferPool::new(),
                out,
                stats: Arc::new(PipelineStats::default()),
            }),
            workers: Vec::new(),
            handles: Vec::new(),
            cancel,
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Spawns one worker per CPU. Must run inside a tokio runtime.
    pub fn start(&mut self) {
        let worker_count = num_cpus::get().max(1);
        debug!("starting {worker_count} payload workers");

        for _ in 0..worker_count {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            let shared = Arc::clone(&self.shared);
            let cancel = self.cancel.clone();
            self.workers.push(tx);
            self.handles.push(tokio::spawn(run_worker(shared, rx, cancel)));
        }
    }

    /// Entry point for the perf-ring data handler.
    ///
    /// Decodes the raw event into a pooled buffer and routes it to the
    /// worker owning this CPU. Before [`HttpFlowTracer::start`] the event
    /// is processed inline, which keeps single-threaded embedding trivial.
    pub fn handle_event(&self, cpu: usize, raw: &[u8]) {
        self.shared.stats.events.fetch_add(1, Ordering::Relaxed);

        let mut data = self.shared.pool.get();
        if let Err(err) = data.decode(raw) {
            self.shared.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
            warn!("dropping undecodable event from cpu {cpu}: {err}");
            self.shared.pool.put(data);
            return;
        }

        if self.workers.is_empty() {
            self.shared.process(data);
            return;
        }

        let worker = &self.workers[cpu % self.workers.len()];
        if let Err(err) = worker.try_send(data) {
            self.shared.stats.records_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("worker queue rejected event from cpu {cpu}");
            match err {
                mpsc::error::TrySendError::Full(data)
                | mpsc::error::TrySendError::Closed(data) => self.shared.pool.put(data),
            }
        }
    }

    /// Waits for the workers after the cancellation token fired.
    pub async fn join(&mut self) {
        self.workers.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn run_worker(
    shared: Arc<PipelineShared>,
    mut rx: mpsc::Receiver<Box<NetworkData>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                // Drain what was already queued, then exit.
                while let Ok(data) = rx.try_recv() {
                    shared.process(data);
                }
                break;
            }
            received = rx.recv() => match received {
                Some(data) => shared.process(data),
                None => break,
            }
        }
    }
}

impl PipelineShared {
    fn process(&self, data: Box<NetworkData>) {
        let window = data.payload.len().min(HTTP_PAYLOAD_MAX_SIZE);
        let head = http::parse_request_head(&data.payload[..window]);
        let direction = data.source_function().direction();

        let (method, path, version) = match &head {
            Some(head) => (head.method.clone(), head.path.clone(), head.version.clone()),
            None => (
                NO_VALUE.to_string(),
                NO_VALUE.to_string(),
                NO_VALUE.to_string(),
            ),
        };

        let (recv, send) = match direction {
            Direction::Incoming => (data.act_size as usize, 0),
            Direction::Outgoing => (0, data.act_size as usize),
        };
        self.emit(ExportRecord::Metric(HttpStats {
            direction,
            src: format!("{}:{}", data.conn.src_ip(), data.conn.sport),
            dst: format!("{}:{}", data.conn.dst_ip(), data.conn.dport),
            l4_proto: if data.conn.is_tcp() { "tcp" } else { "udp" },
            method,
            path,
            version,
            pid: data.conn.pid,
            netns: data.conn.netns,
            task_name: data.conn.task_name.clone(),
            recv,
            send,
            ts: data.ts,
        }));

        match head {
            Some(head) => self.assemble_trace(&data, head),
            None => {
                self.stats.not_http.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.pool.put(data);
    }

    fn assemble_trace(&self, data: &NetworkData, head: http::RequestHead) {
        let allowed = self
            .filter
            .get_proc_info(data.conn.pid)
            .filter(|info| info.allow_trace);
        let Some(proc_info) = allowed else {
            // Unknown or denied PID: the L7 statistic above already went
            // out, no span and no trace identifiers.
            return;
        };
        if !self.config.enable_trace {
            return;
        }

        let context = propagation::extract_trace_context(&head.headers);
        let have_trace_id = !context.trace_id.is_zero();

        // A request with no usable upstream context roots a new trace.
        let trace_id = if have_trace_id {
            context.trace_id
        } else {
            self.ulid.as_ref().map_or(Id128::ZERO, UlidGenerator::id)
        };
        let thr_trace_id = self
            .inner_ids
            .as_ref()
            .map_or(0, InnerIdGenerator::next_id);

        let host = Extractor::get(&head.headers, "host")
            .unwrap_or_default()
            .to_string();

        self.emit(ExportRecord::Trace(Box::new(TraceInfo {
            host,
            method: head.method,
            path: head.path,
            version: head.version,
            param: head.query,
            thr_trace_id,
            trace_id,
            parent_span_id: context.parent_id,
            hex_encode: context.hex_encoded,
            have_trace_id,
            aspan_sampled: context.sampled,
            pid_tid: data.pid_tid(),
            task_comm: data.conn.task_name.clone(),
            process_name: proc_info.name.clone(),
            service: proc_info.service.clone(),
            allow_trace: proc_info.allow_trace,
            headers: head.headers,
            ts: data.ts,
        })));
        self.stats.traces_emitted.fetch_add(1, Ordering::Relaxed);
    }

    fn emit(&self, record: ExportRecord) {
        if self.out.try_send(record).is_err() {
            self.stats.records_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("export channel full, dropping record");
        }
    }
}
