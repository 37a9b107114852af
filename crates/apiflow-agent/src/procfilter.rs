// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-process admission decisions and service-name assignment.
//!
//! The filter is consulted from two sides: a process scanner calls
//! [`ProcessFilter::filter`] and [`ProcessFilter::delete`] as PIDs appear
//! and exit, and the payload workers call [`ProcessFilter::get_proc_info`]
//! for every captured request. Perf events for a PID can arrive after the
//! process has already exited, so deleted entries are kept in a bounded LRU
//! and consulted after a live-map miss.
//!
//! A single readers-writer lock covers both containers. The LRU is not
//! thread-safe on reads (a hit refreshes recency), so any touch of it takes
//! the exclusive side.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use lru::LruCache;

use crate::config::FilterConfig;

/// Deleted-PID entries retained for late-arriving events.
const DELETED_PIDS_CAPACITY: usize = 1024;

/// Admission decision and service identity recorded for a PID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcSvcInfo {
    pub name: String,
    pub service: String,
    pub allow_trace: bool,
}

struct FilterState {
    live: HashMap<u32, Arc<ProcSvcInfo>>,
    deleted: LruCache<u32, Arc<ProcSvcInfo>>,
}

/// Rule-driven PID admission filter.
///
/// Rules are fixed at construction; only the per-PID decisions mutate.
pub struct ProcessFilter {
    rules: FilterConfig,
    state: RwLock<FilterState>,
}

impl ProcessFilter {
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn new(rules: FilterConfig) -> Self {
        ProcessFilter {
            rules,
            state: RwLock::new(FilterState {
                live: HashMap::new(),
                deleted: LruCache::new(
                    NonZeroUsize::new(DELETED_PIDS_CAPACITY).expect("nonzero capacity"),
                ),
            }),
        }
    }

    /// Computes and records the admission decision for a PID.
    ///
    /// The admit pass tries env rules, then process-name rules, then path
    /// rules, then the any-process default, stopping at the first match.
    /// Explicit deny rules override any admit, and `disable` overrides
    /// everything. The service name defaults to the process name and is
    /// replaced by the first configured service env var present in `env`.
    #[allow(clippy::expect_used)]
    pub fn filter(&self, pid: u32, name: &str, path: &str, env: &HashMap<String, String>) -> bool {
        let mut allow = false;

        if let Some((_, &admit)) = self
            .rules
            .rule_env
            .iter()
            .find(|(key, _)| env.contains_key(*key))
        {
            allow = admit;
        } else if self.rules.rule_process_name.get(name) == Some(&true) {
            allow = true;
        } else if self.rules.rule_path.contains(path) {
            allow = true;
        } else if self.rules.any_process {
            allow = true;
        }

        if self.rules.rule_process_name.get(name) == Some(&false) {
            allow = false;
        }
        if self
            .rules
            .rule_env
            .iter()
            .any(|(key, &admit)| !admit && env.contains_key(key))
        {
            allow = false;
        }
        if self.rules.disable {
            allow = false;
        }

        let mut info = ProcSvcInfo {
            name: name.to_string(),
            service: name.to_string(),
            allow_trace: allow,
        };
        if !env.is_empty() {
            for key in &self.rules.svc_assign_env {
                if let Some(service) = env.get(key) {
                    info.service = service.clone();
                    break;
                }
            }
        }

        let mut state = self.state.write().expect("lock poisoned");
        // A PID lives in exactly one container: re-observing a previously
        // deleted PID supersedes its stale entry.
        state.deleted.pop(&pid);
        state.live.insert(pid, Arc::new(info));

        allow
    }

    /// Moves a PID from the live map into the deleted LRU.
    #[allow(clippy::expect_used)]
    pub fn delete(&self, pid: u32) {
        let mut state = self.state.write().expect("lock poisoned");
        if let Some(info) = state.live.remove(&pid) {
            state.deleted.push(pid, info);
        }
    }

    /// Looks up the recorded decision for a PID.
    ///
    /// The live map is probed under the shared lock; only on a miss is the
    /// exclusive lock taken to probe the LRU. An LRU hit is returned as is,
    /// without promotion back into the live map.
    #[allow(clippy::expect_used)]
    pub fn get_proc_info(&self, pid: u32) -> Option<Arc<ProcSvcInfo>> {
        {
            let state = self.state.read().expect("lock poisoned");
            if let Some(info) = state.live.get(&pid) {
                return Some(Arc::clone(info));
            }
        }

        let mut state = self.state.write().expect("lock poisoned");
        state.deleted.get(&pid).map(Arc::clone)
    }
}
