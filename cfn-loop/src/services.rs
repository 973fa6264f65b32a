//! Dependency wiring shared by every orchestrator.
//!
//! Explicit injection, no globals: one [`Services`] value holds the
//! executor, task builder, store, bus, telemetry sink, and observer
//! that a tree of orchestrators runs against.

use std::sync::Arc;

use crate::agent::{AgentExecutor, AgentTaskBuilder, DefaultTaskBuilder};
use crate::memory::MemoryStore;
use crate::observer::{NullObserver, StatusObserver};
use crate::signal::CoordinationBus;
use crate::telemetry::{NullSink, TelemetrySink};

/// Everything an orchestrator needs injected.
#[derive(Clone)]
pub struct Services {
    pub executor: Arc<dyn AgentExecutor>,
    pub builder: Arc<dyn AgentTaskBuilder>,
    pub store: Arc<dyn MemoryStore>,
    pub bus: Arc<CoordinationBus>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub observer: Arc<dyn StatusObserver>,
}

impl Services {
    /// Wire the mandatory pieces; builder, telemetry, and observer
    /// default to pass-through/no-op implementations.
    pub fn new(
        executor: Arc<dyn AgentExecutor>,
        store: Arc<dyn MemoryStore>,
        bus: Arc<CoordinationBus>,
    ) -> Self {
        Self {
            executor,
            builder: Arc::new(DefaultTaskBuilder),
            store,
            bus,
            telemetry: Arc::new(NullSink),
            observer: Arc::new(NullObserver),
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn AgentTaskBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observer = observer;
        self
    }
}
