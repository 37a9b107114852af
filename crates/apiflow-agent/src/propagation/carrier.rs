// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Carrier abstraction for reading trace headers.
//!
//! Extraction happens against a header map whose keys keep their wire
//! casing, while trace-context header names match case-insensitively. The
//! carrier hides that: lookups try the canonical lowercase key first and
//! fall back to an ASCII-case-insensitive scan.

use std::collections::HashMap;

/// Read access to trace headers, case-insensitive by key.
pub trait Extractor {
    fn get(&self, key: &str) -> Option<&str>;
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        if let Some(value) = self.get(key) {
            return Some(value.as_str());
        }
        self.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }
}
