// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! L7 reassembly and tracing correlation pipeline.
//!
//! This crate is the userspace core of an eBPF HTTP(S) flow tracer. The
//! kernel side captures payload prefixes at syscall tracepoints and TLS
//! library hooks and delivers them over a perf ring; this crate turns those
//! buffers into request records:
//!
//! - [`http`] recognizes HTTP request heads in truncated payload prefixes.
//! - [`propagation`] decodes Datadog and W3C trace context headers.
//! - [`procfilter`] decides which PIDs get trace identifiers attached and
//!   what service name they report as.
//! - [`l7flow`] glues the above together, one worker per CPU.
//! - [`exporter`] ships finished records to the metrics and trace intakes.
//!
//! Perf-ring plumbing, eBPF program loading, and kernel connection
//! bookkeeping live outside this crate; the entry point is
//! [`l7flow::HttpFlowTracer::handle_event`] fed with raw event bytes.

pub mod config;
pub mod error;
pub mod exporter;
pub mod http;
pub mod l7flow;
pub mod procfilter;
pub mod propagation;

pub use config::{Config, FilterConfig};
pub use error::AgentError;
pub use exporter::Exporter;
pub use l7flow::{ExportRecord, HttpFlowTracer, TraceInfo};
pub use procfilter::{ProcSvcInfo, ProcessFilter};
