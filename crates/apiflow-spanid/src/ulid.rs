// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-ordered identifier generation.
//!
//! [`UlidGenerator`] produces 128-bit IDs laid out ULID-style: the top 48
//! bits carry the Unix timestamp in milliseconds, the remaining 80 bits are
//! random. Within a single millisecond the random field is incremented
//! instead of redrawn, so two IDs from the same generator never collide and
//! sort in generation order.
//!
//! [`InnerIdGenerator`] is a cheaper sibling for ephemeral 63-bit
//! correlation IDs that never leave the process.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::{OsRng, SmallRng};
use rand::{RngCore, SeedableRng};

use crate::{Id128, SpanIdError};

const RAND_MASK: u128 = (1 << 80) - 1;
const TIMESTAMP_MASK: u64 = (1 << 48) - 1;

struct UlidState {
    rng: SmallRng,
    last_ms: u64,
    rand: u128,
}

/// Generator of time-ordered 128-bit identifiers.
///
/// Construction draws the seed from the OS CSPRNG and fails only if that
/// source is unavailable; callers keep the generator optional and treat a
/// missing one as "no ID available". Calls are serialized on an internal
/// mutex.
pub struct UlidGenerator {
    state: Mutex<UlidState>,
}

impl UlidGenerator {
    pub fn new() -> Result<Self, SpanIdError> {
        let rng = SmallRng::from_rng(OsRng)?;
        Ok(UlidGenerator {
            state: Mutex::new(UlidState {
                rng,
                last_ms: 0,
                rand: 0,
            }),
        })
    }

    /// Returns the next identifier.
    ///
    /// Same-millisecond calls increment the 80-bit random field, with the
    /// carry confined to those 80 bits.
    #[allow(clippy::expect_used)]
    pub fn id(&self) -> Id128 {
        let mut state = self.state.lock().expect("lock poisoned");

        let now_ms = unix_millis();
        if now_ms == state.last_ms {
            state.rand = (state.rand + 1) & RAND_MASK;
        } else {
            let rand = random_80(&mut state.rng);
            state.last_ms = now_ms;
            state.rand = rand;
        }

        compose(state.last_ms, state.rand)
    }
}

/// Generator of ephemeral 63-bit correlation identifiers.
///
/// Seeded once from the OS CSPRNG, then driven by a fast in-process RNG.
/// The values only correlate a response with its request inside this agent
/// and are never emitted as trace identifiers.
pub struct InnerIdGenerator {
    rng: Mutex<SmallRng>,
}

impl InnerIdGenerator {
    pub fn new() -> Result<Self, SpanIdError> {
        let rng = SmallRng::from_rng(OsRng)?;
        Ok(InnerIdGenerator {
            rng: Mutex::new(rng),
        })
    }

    /// Next non-negative 63-bit value.
    #[allow(clippy::expect_used)]
    pub fn next_id(&self) -> u64 {
        self.rng.lock().expect("lock poisoned").next_u64() >> 1
    }
}

fn unix_millis() -> u64 {
    // The clock sitting before the epoch degrades to timestamp 0 rather
    // than failing id generation.
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

fn random_80(rng: &mut SmallRng) -> u128 {
    (u128::from(rng.next_u64()) << 16 | u128::from(rng.next_u64() & 0xffff)) & RAND_MASK
}

#[allow(clippy::cast_possible_truncation)]
fn compose(ms: u64, rand: u128) -> Id128 {
    let high = (ms & TIMESTAMP_MASK) << 16 | (rand >> 64) as u64;
    let low = rand as u64;
    Id128 { high, low }
}
