// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span and trace identifier types and codecs.
//!
//! Two identifier widths exist side by side in the tracing ecosystems this
//! agent interoperates with:
//!
//! - **64-bit** span/trace IDs, carried either as unsigned decimal, signed
//!   decimal (a Datadog wire legacy), or 16 hex digits big-endian.
//! - **128-bit** trace IDs, carried as 32 hex digits big-endian. Systems
//!   that only understand 64 bits use the low half and leave the high half
//!   zero.
//!
//! Decoding never fails: a malformed identifier degrades to zero so that a
//! single bad header cannot interrupt trace correlation. Callers that need
//! to distinguish "absent" from "zero" must check before decoding.

pub mod ulid;

pub use ulid::{InnerIdGenerator, UlidGenerator};

/// Errors raised while constructing an identifier generator.
///
/// Identifier *parsing* never errors (it degrades to zero); only generator
/// construction is fallible, when the OS entropy source cannot be read.
#[derive(Debug, thiserror::Error)]
pub enum SpanIdError {
    #[error("failed to seed id generator: {0}")]
    Seed(#[from] rand::Error),
}

/// A 128-bit trace identifier split into two 64-bit halves.
///
/// The wire hex encoding is 32 hex digits big-endian, `high` first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Id128 {
    pub high: u64,
    pub low: u64,
}

impl Id128 {
    pub const ZERO: Id128 = Id128 { high: 0, low: 0 };

    #[must_use]
    pub fn new(high: u64, low: u64) -> Self {
        Id128 { high, low }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.high == 0 && self.low == 0
    }

    /// Canonical 32-hex-digit big-endian rendering, high half first.
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("{:016x}{:016x}", self.high, self.low)
    }
}

/// Formats a 64-bit span ID for the wire.
///
/// `base16` selects the lowercase, zero-padded 16-hex-digit big-endian form;
/// otherwise the unsigned decimal form is used.
#[must_use]
pub fn format_span_id(id: u64, base16: bool) -> String {
    if base16 {
        hex::encode(id.to_be_bytes())
    } else {
        id.to_string()
    }
}

/// Decodes a 32-hex-digit big-endian string into an [`Id128`].
///
/// Anything that does not decode to exactly 16 bytes yields [`Id128::ZERO`].
#[must_use]
pub fn hex_to_id128(s: &str) -> Id128 {
    let Ok(bytes) = hex::decode(s) else {
        return Id128::ZERO;
    };
    if bytes.len() != 16 {
        return Id128::ZERO;
    }
    let mut high = [0u8; 8];
    let mut low = [0u8; 8];
    high.copy_from_slice(&bytes[..8]);
    low.copy_from_slice(&bytes[8..]);
    Id128 {
        high: u64::from_be_bytes(high),
        low: u64::from_be_bytes(low),
    }
}

/// Decodes a 16-hex-digit big-endian string into a 64-bit ID, or 0.
#[must_use]
pub fn hex_to_id64(s: &str) -> u64 {
    let Ok(bytes) = hex::decode(s) else {
        return 0;
    };
    if bytes.len() != 8 {
        return 0;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes);
    u64::from_be_bytes(buf)
}

/// Decodes a decimal 64-bit ID, accepting the signed Datadog legacy form.
///
/// A leading `-` parses as a signed 64-bit decimal whose two's-complement
/// bit pattern is reinterpreted as unsigned; the historical wire format
/// carried IDs that way and the same bits must round-trip. Parse failure
/// yields 0.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn dec_to_id64(s: &str) -> u64 {
    if s.starts_with('-') {
        s.parse::<i64>().map_or(0, |v| v as u64)
    } else {
        s.parse::<u64>().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_span_id_base16() {
        assert_eq!(format_span_id(0x00f0_67aa_0ba9_02b7, true), "00f067aa0ba902b7");
        assert_eq!(format_span_id(0, true), "0000000000000000");
        assert_eq!(format_span_id(u64::MAX, true), "ffffffffffffffff");
    }

    #[test]
    fn format_span_id_decimal() {
        assert_eq!(format_span_id(1_234_567_890, false), "1234567890");
        assert_eq!(
            format_span_id(u64::MAX, false),
            "18446744073709551615",
            "unsigned, never the signed rendering"
        );
    }

    #[test]
    fn hex_id64_round_trip() {
        for id in [0u64, 1, 42, 0x00f0_67aa_0ba9_02b7, u64::MAX] {
            assert_eq!(hex_to_id64(&format_span_id(id, true)), id);
        }
    }

    #[test]
    fn dec_id64_round_trip() {
        for id in [0u64, 1, 42, 1 << 63, u64::MAX] {
            assert_eq!(dec_to_id64(&format_span_id(id, false)), id);
        }
    }

    #[test]
    fn dec_id64_signed_legacy() {
        assert_eq!(dec_to_id64("-1"), u64::MAX);
        assert_eq!(dec_to_id64("-9223372036854775808"), 1 << 63);
        assert_eq!(dec_to_id64("9223372036854775807"), i64::MAX as u64);
    }

    #[test]
    fn dec_id64_malformed_is_zero() {
        assert_eq!(dec_to_id64(""), 0);
        assert_eq!(dec_to_id64("abc"), 0);
        assert_eq!(dec_to_id64("-"), 0);
        assert_eq!(dec_to_id64("18446744073709551616"), 0, "u64 overflow");
        assert_eq!(dec_to_id64("-9223372036854775809"), 0, "i64 underflow");
    }

    #[test]
    fn hex_id128_round_trip() {
        let id = Id128::new(0x4bf9_2f35_77b3_4da6, 0xa3ce_929d_0e0e_4736);
        assert_eq!(id.to_hex(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(hex_to_id128(&id.to_hex()), id);
        assert_eq!(hex_to_id128(&Id128::ZERO.to_hex()), Id128::ZERO);
    }

    #[test]
    fn hex_id128_uppercase_accepted() {
        assert_eq!(
            hex_to_id128("4BF92F3577B34DA6A3CE929D0E0E4736"),
            Id128::new(0x4bf9_2f35_77b3_4da6, 0xa3ce_929d_0e0e_4736)
        );
    }

    #[test]
    fn hex_id128_wrong_length_is_zero() {
        assert_eq!(hex_to_id128(""), Id128::ZERO);
        assert_eq!(hex_to_id128("4bf92f35"), Id128::ZERO);
        // 31 and 33 digits
        assert_eq!(hex_to_id128("4bf92f3577b34da6a3ce929d0e0e473"), Id128::ZERO);
        assert_eq!(hex_to_id128("4bf92f3577b34da6a3ce929d0e0e47361"), Id128::ZERO);
        // right length, bad digit
        assert_eq!(hex_to_id128("4bf92f3577b34da6a3ce929d0e0e473g"), Id128::ZERO);
    }

    #[test]
    fn hex_id64_wrong_length_is_zero() {
        assert_eq!(hex_to_id64("00f067aa0ba902b"), 0);
        assert_eq!(hex_to_id64("00f067aa0ba902b700"), 0);
        assert_eq!(hex_to_id64("zzf067aa0ba902b7"), 0);
    }
}
