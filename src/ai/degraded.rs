//! Degraded-Mode Controller
//!
//! Tracks the process-wide operation mode and chooses between a feature's
//! full and reduced execution paths. The state is a single object behind one
//! read-write lock: written only on degrade/recover events, read on every
//! feature call.
//!
//! The mode is derived from the flagged components: any critical component
//! means `Emergency`, any degraded one means `Degraded`, none means `Normal`.
//!
//! A flagged feature is re-probed like a half-open breaker: once its
//! `probe_interval` has passed and no other component is flagged, one call
//! takes the full path. Success clears the flag; failure re-arms the timer.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::circuit_breaker as cb_constants;
use crate::types::{Result, UltraError};

/// System-wide operating state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    #[default]
    Normal,
    Degraded,
    Emergency,
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Degraded,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedComponent {
    pub severity: Severity,
    pub reason: String,
    pub since: DateTime<Utc>,
}

/// Snapshot of the operation state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationState {
    pub mode: OperationMode,
    pub degraded_components: BTreeMap<String, DegradedComponent>,
}

impl OperationState {
    fn recompute_mode(&mut self) -> OperationMode {
        let worst = self
            .degraded_components
            .values()
            .map(|c| c.severity)
            .max();
        self.mode = match worst {
            None => OperationMode::Normal,
            Some(Severity::Degraded) => OperationMode::Degraded,
            Some(Severity::Critical) => OperationMode::Emergency,
        };
        self.mode
    }
}

pub type SharedDegradedController = Arc<DegradedModeController>;

/// Single guarded operation-mode object, passed by reference
#[derive(Debug)]
pub struct DegradedModeController {
    state: RwLock<OperationState>,
    probe_interval: Duration,
    /// Earliest full-path probe per flagged component
    next_probe: Mutex<HashMap<String, Instant>>,
}

impl Default for DegradedModeController {
    fn default() -> Self {
        Self::with_probe_interval(Duration::from_secs(cb_constants::RECOVERY_TIMEOUT_SECS))
    }
}

impl DegradedModeController {
    /// Initialized to `Normal`
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe_interval(probe_interval: Duration) -> Self {
        Self {
            state: RwLock::new(OperationState::default()),
            probe_interval,
            next_probe: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> OperationMode {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .mode
    }

    pub fn snapshot(&self) -> OperationState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_degraded(&self, component: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .degraded_components
            .contains_key(component)
    }

    pub fn degraded_components(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .degraded_components
            .keys()
            .cloned()
            .collect()
    }

    /// Flag a component. Severity only ever escalates; returns true when
    /// the component's entry changed.
    pub fn mark_degraded(&self, component: &str, severity: Severity, reason: impl Into<String>) -> bool {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous_mode = state.mode;

        let changed = match state.degraded_components.entry(component.to_string()) {
            Entry::Occupied(existing) if existing.get().severity >= severity => false,
            Entry::Occupied(mut existing) => {
                let entry = existing.get_mut();
                entry.severity = severity;
                entry.reason = reason.into();
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(DegradedComponent {
                    severity,
                    reason: reason.into(),
                    since: Utc::now(),
                });
                true
            }
        };

        let mode = state.recompute_mode();
        if changed {
            self.next_probes()
                .entry(component.to_string())
                .or_insert_with(|| Instant::now() + self.probe_interval);
            warn!(component, ?severity, %mode, "Component marked degraded");
        }
        if mode != previous_mode {
            warn!(from = %previous_mode, to = %mode, "Operation mode changed");
        }
        changed
    }

    /// Clear a component's flag; returns true if it was set
    pub fn mark_recovered(&self, component: &str) -> bool {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous_mode = state.mode;

        let removed = state.degraded_components.remove(component).is_some();
        let mode = state.recompute_mode();
        self.next_probes().remove(component);

        if removed {
            info!(component, %mode, "Component recovered");
        }
        if mode != previous_mode {
            info!(from = %previous_mode, to = %mode, "Operation mode changed");
        }
        removed
    }

    fn next_probes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.next_probe
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the full-path probe for `name` when it is the only flagged
    /// component and its timer has expired. Claiming re-arms the timer.
    fn claim_probe(&self, name: &str) -> bool {
        {
            let state = self
                .state
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let only_this = state.degraded_components.len() == 1
                && state.degraded_components.contains_key(name);
            if !only_this {
                return false;
            }
        }

        let now = Instant::now();
        let mut probes = self.next_probes();
        let due = probes.get(name).is_none_or(|at| *at <= now);
        if due {
            probes.insert(name.to_string(), now + self.probe_interval);
        }
        due
    }

    /// Run a feature on the path the current mode allows.
    ///
    /// - `Normal`: run `normal_fn`; on failure flag `name` as degraded and
    ///   run `degraded_fn`; if that fails too, flag it critical and return
    ///   `FeatureUnavailable`
    /// - `Degraded`/`Emergency`: `normal_fn` is not called, except for one
    ///   probe per `probe_interval` while `name` is the only flagged component
    pub async fn execute_feature<T, N, NFut, D, DFut>(
        &self,
        name: &str,
        normal_fn: N,
        degraded_fn: D,
    ) -> Result<T>
    where
        N: FnOnce() -> NFut,
        NFut: Future<Output = Result<T>>,
        D: FnOnce() -> DFut,
        DFut: Future<Output = Result<T>>,
    {
        let mode = self.mode();
        if mode != OperationMode::Normal {
            if !self.claim_probe(name) {
                debug!(feature = name, %mode, "Running degraded path");
                return self.run_degraded(name, degraded_fn).await;
            }
            info!(feature = name, %mode, "Probing full path of degraded feature");
        }

        match normal_fn().await {
            Ok(value) => {
                self.mark_recovered(name);
                Ok(value)
            }
            Err(err) => {
                warn!(feature = name, category = %err.category(), "Feature failed, degrading: {}", err);
                self.mark_degraded(name, Severity::Degraded, err.to_string());
                self.run_degraded(name, degraded_fn).await
            }
        }
    }

    async fn run_degraded<T, D, DFut>(&self, name: &str, degraded_fn: D) -> Result<T>
    where
        D: FnOnce() -> DFut,
        DFut: Future<Output = Result<T>>,
    {
        degraded_fn().await.map_err(|err| {
            self.mark_degraded(name, Severity::Critical, err.to_string());
            UltraError::FeatureUnavailable {
                feature: name.to_string(),
                reason: err.to_string(),
            }
        })
    }

    /// Probe the full path of a flagged feature regardless of mode. A
    /// success clears the flag.
    pub async fn try_recover<T, N, NFut>(&self, name: &str, normal_fn: N) -> Result<T>
    where
        N: FnOnce() -> NFut,
        NFut: Future<Output = Result<T>>,
    {
        let value = normal_fn().await?;
        self.mark_recovered(name);
        Ok(value)
    }
}
