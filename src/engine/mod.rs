//! Engine process management
//!
//! Everything around the external proxy engine: the typed config document,
//! the generator that produces it from a profile, and the supervisor that
//! runs exactly one engine process at a time.

pub mod document;
pub mod generator;
pub mod supervisor;

pub use document::EngineConfig;
pub use generator::{generate, probe_document};
pub use supervisor::{ProcessState, ProcessSupervisor};

use async_trait::async_trait;

use crate::common::ProcessError;

/// Handle to one started engine process. The generation ties the handle to
/// a specific spawn, so operations against a replaced process become no-ops
/// instead of hitting its successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineHandle {
    pub generation: u64,
    pub pid: Option<u32>,
}

/// Emitted by the supervisor when the engine exits without being asked to.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Crashed {
        generation: u64,
        exit_code: Option<i32>,
        /// Tail of the engine's recent output, for the error surface.
        diagnostic: String,
    },
}

/// Seam between the connection controller and the concrete supervisor.
#[async_trait]
pub trait EngineSlot: Send + Sync {
    /// Start an engine with the given document, replacing any running one.
    async fn start(&self, config: EngineConfig) -> Result<EngineHandle, ProcessError>;

    /// Stop the engine the handle refers to. Stale handles are a no-op.
    async fn stop(&self, handle: &EngineHandle) -> Result<(), ProcessError>;

    /// Current lifecycle state.
    fn state(&self) -> ProcessState;
}
