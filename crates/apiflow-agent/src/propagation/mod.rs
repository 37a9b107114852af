// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Distributed trace context extraction from HTTP headers.
//!
//! Two header formats are recognized, tried in order with the first
//! present format winning:
//!
//! 1. **Datadog**: `x-datadog-trace-id`, `x-datadog-parent-id`,
//!    `x-datadog-sampling-priority`, all decimal. Trace IDs are 64-bit and
//!    land in the low half of the 128-bit ID. Sampling priority above zero
//!    means sampled.
//! 2. **W3C TraceContext**: `traceparent` as
//!    `version-traceid-parentid-flags`; the low bit of the flags byte is
//!    the sampled flag.
//!
//! Extraction on this path runs on every captured request, so it is
//! deliberately non-validating: malformed identifier fields decode to zero
//! rather than failing, and a malformed `traceparent` that is present but
//! not four `-`-separated parts yields an empty context. One bad header
//! must never interrupt correlation of the surrounding traffic.

use apiflow_spanid::{dec_to_id64, hex_to_id128, hex_to_id64, Id128};

pub mod carrier;

pub use carrier::Extractor;

pub const DATADOG_TRACE_ID_KEY: &str = "x-datadog-trace-id";
pub const DATADOG_PARENT_ID_KEY: &str = "x-datadog-parent-id";
pub const DATADOG_SAMPLING_PRIORITY_KEY: &str = "x-datadog-sampling-priority";
pub const TRACEPARENT_KEY: &str = "traceparent";

/// Trace context extracted from a request head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceContext {
    /// An ancestor span carried a positive sampling decision.
    pub sampled: bool,
    /// Identifiers arrived hex encoded (W3C) rather than decimal (Datadog).
    pub hex_encoded: bool,
    pub trace_id: Id128,
    pub parent_id: u64,
}

/// Extracts trace context from a carrier when its header format is present.
pub trait Propagator {
    /// `None` means this propagator's headers are absent; a `Some` with
    /// zero identifiers means they were present but malformed.
    fn extract(&self, carrier: &dyn Extractor) -> Option<TraceContext>;
}

/// Propagator for the Datadog native header format.
#[derive(Clone, Copy)]
pub struct DatadogHeaderPropagator;

impl Propagator for DatadogHeaderPropagator {
    fn extract(&self, carrier: &dyn Extractor) -> Option<TraceContext> {
        let trace_id = carrier.get(DATADOG_TRACE_ID_KEY)?;

        let mut context = TraceContext {
            trace_id: Id128::new(0, dec_to_id64(trace_id)),
            ..TraceContext::default()
        };
        if let Some(parent_id) = carrier.get(DATADOG_PARENT_ID_KEY) {
            context.parent_id = dec_to_id64(parent_id);
        }
        if let Some(priority) = carrier.get(DATADOG_SAMPLING_PRIORITY_KEY) {
            context.sampled = priority.trim().parse::<i64>().is_ok_and(|p| p > 0);
        }

        Some(context)
    }
}

/// Propagator for the W3C TraceContext `traceparent` header.
#[derive(Clone, Copy)]
pub struct TraceContextPropagator;

impl Propagator for TraceContextPropagator {
    fn extract(&self, carrier: &dyn Extractor) -> Option<TraceContext> {
        let traceparent = carrier.get(TRACEPARENT_KEY)?;

        let parts: Vec<&str> = traceparent.split('-').collect();
        let &[_version, trace_id, parent_id, flags] = parts.as_slice() else {
            // Header present but unparseable: the format still claims this
            // request, it just carries no usable context.
            return Some(TraceContext::default());
        };

        Some(TraceContext {
            sampled: sampled_flag(flags),
            hex_encoded: true,
            trace_id: hex_to_id128(trace_id),
            parent_id: hex_to_id64(parent_id),
        })
    }
}

/// Low bit of the final hex nibble of the flags field.
fn sampled_flag(flags: &str) -> bool {
    flags
        .chars()
        .last()
        .and_then(|c| c.to_digit(16))
        .is_some_and(|nibble| nibble & 1 == 1)
}

/// Applies format precedence: Datadog first, then W3C, else an empty
/// context.
#[must_use]
pub fn extract_trace_context(carrier: &dyn Extractor) -> TraceContext {
    let propagators: [&dyn Propagator; 2] = [&DatadogHeaderPropagator, &TraceContextPropagator];
    for propagator in propagators {
        if let Some(context) = propagator.extract(carrier) {
            return context;
        }
    }
    TraceContext::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn datadog_extraction() {
        let carrier = headers(&[
            ("x-datadog-trace-id", "1234567890"),
            ("x-datadog-parent-id", "42"),
            ("x-datadog-sampling-priority", "1"),
        ]);
        let context = extract_trace_context(&carrier);

        assert!(context.sampled);
        assert!(!context.hex_encoded);
        assert_eq!(context.trace_id, Id128::new(0, 1_234_567_890));
        assert_eq!(context.parent_id, 42);
    }

    #[test]
    fn datadog_signed_trace_id_keeps_bit_pattern() {
        let carrier = headers(&[("x-datadog-trace-id", "-1")]);
        let context = extract_trace_context(&carrier);
        assert_eq!(context.trace_id.low, 0xFFFF_FFFF_FFFF_FFFF);
        assert_eq!(context.trace_id.high, 0);
    }

    #[test]
    fn datadog_missing_optional_headers() {
        let carrier = headers(&[("x-datadog-trace-id", "7")]);
        let context = extract_trace_context(&carrier);
        assert_eq!(context.trace_id.low, 7);
        assert_eq!(context.parent_id, 0);
        assert!(!context.sampled);
        assert!(!context.hex_encoded);
    }

    #[test]
    fn datadog_negative_priority_not_sampled() {
        let carrier = headers(&[
            ("x-datadog-trace-id", "7"),
            ("x-datadog-sampling-priority", "-1"),
        ]);
        assert!(!extract_trace_context(&carrier).sampled);

        let carrier = headers(&[
            ("x-datadog-trace-id", "7"),
            ("x-datadog-sampling-priority", "junk"),
        ]);
        assert!(!extract_trace_context(&carrier).sampled);
    }

    #[test]
    fn w3c_extraction() {
        let carrier = headers(&[(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )]);
        let context = extract_trace_context(&carrier);

        assert!(context.sampled);
        assert!(context.hex_encoded);
        assert_eq!(context.trace_id.high, 0x4bf9_2f35_77b3_4da6);
        assert_eq!(context.trace_id.low, 0xa3ce_929d_0e0e_4736);
        assert_eq!(context.parent_id, 0x00f0_67aa_0ba9_02b7);
    }

    #[test]
    fn w3c_not_sampled_flag() {
        let carrier = headers(&[(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00",
        )]);
        assert!(!extract_trace_context(&carrier).sampled);
    }

    #[test]
    fn w3c_malformed_part_count_degrades_to_empty() {
        let carrier = headers(&[("traceparent", "00-abc-def")]);
        assert_eq!(extract_trace_context(&carrier), TraceContext::default());

        let carrier = headers(&[(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
        )]);
        assert_eq!(extract_trace_context(&carrier), TraceContext::default());
    }

    #[test]
    fn w3c_bad_lengths_degrade_to_zero_ids() {
        let carrier = headers(&[("traceparent", "00-4bf92f35-00f067aa0ba902b7-01")]);
        let context = extract_trace_context(&carrier);
        assert!(context.hex_encoded);
        assert!(context.sampled);
        assert_eq!(context.trace_id, Id128::ZERO);
        assert_eq!(context.parent_id, 0x00f0_67aa_0ba9_02b7);
    }

    #[test]
    fn datadog_takes_precedence_over_w3c() {
        let carrier = headers(&[
            ("x-datadog-trace-id", "99"),
            (
                "traceparent",
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            ),
        ]);
        let context = extract_trace_context(&carrier);
        assert!(!context.hex_encoded);
        assert_eq!(context.trace_id, Id128::new(0, 99));
    }

    #[test]
    fn header_names_match_case_insensitively() {
        let carrier = headers(&[("X-Datadog-Trace-Id", "55")]);
        assert_eq!(extract_trace_context(&carrier).trace_id.low, 55);

        let carrier = headers(&[(
            "Traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )]);
        assert!(extract_trace_context(&carrier).hex_encoded);
    }

    #[test]
    fn no_trace_headers_yields_empty_context() {
        let carrier = headers(&[("Host", "example.com")]);
        assert_eq!(extract_trace_context(&carrier), TraceContext::default());
    }
}
