//! Shared engine context
//!
//! Configuration plus the persistence handles every pipeline needs. The
//! context is cheap to clone and is passed explicitly into each driver; no
//! stage reaches for global state.

use std::sync::Arc;

use crate::baseline::{BaselineStore, MemoryBaselineStore};
use crate::config::EngineConfig;
use crate::sinks::{MemorySleepSink, MemoryVitalsSink, SleepRecordSink, VitalsSink};

#[derive(Clone)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub baselines: Arc<dyn BaselineStore>,
    pub vitals: Arc<dyn VitalsSink>,
    pub sleep: Arc<dyn SleepRecordSink>,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        baselines: Arc<dyn BaselineStore>,
        vitals: Arc<dyn VitalsSink>,
        sleep: Arc<dyn SleepRecordSink>,
    ) -> Self {
        Self {
            config,
            baselines,
            vitals,
            sleep,
        }
    }

    /// Context backed entirely by in-memory stores
    pub fn in_memory(config: EngineConfig) -> InMemoryContext {
        let baselines = Arc::new(MemoryBaselineStore::new());
        let vitals = Arc::new(MemoryVitalsSink::new());
        let sleep = Arc::new(MemorySleepSink::new());
        InMemoryContext {
            context: Self::new(config, baselines.clone(), vitals.clone(), sleep.clone()),
            baselines,
            vitals,
            sleep,
        }
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// An [`EngineContext`] that keeps typed handles to its in-memory stores
#[derive(Debug, Clone)]
pub struct InMemoryContext {
    pub context: EngineContext,
    pub baselines: Arc<MemoryBaselineStore>,
    pub vitals: Arc<MemoryVitalsSink>,
    pub sleep: Arc<MemorySleepSink>,
}
