//! Aplicación distribuida de un modelo de clasificación de arrecifes sobre un
//! catálogo de tiles o directorios.
//!
//! No hay coordinador central: cada worker enumera el catálogo completo y se
//! coordina con los demás sólo a través de marcadores en el filesystem
//! (`.lock` creado con create-exclusive, `.complete` por unidad y agregado).

pub mod claim;
pub mod completion;
pub mod config;
pub mod context;
pub mod enumerate;
pub mod error;
pub mod logging;
pub mod object_store;
pub mod operations;
pub mod pipeline;
pub mod plan;
pub mod preflight;
pub mod probe;
pub mod runner;
pub mod session;
pub mod stage;
pub mod status;
pub mod store;
pub mod unit;
pub mod worker;

/* --------- Re-exports de uso frecuente --------- */

pub use claim::{ClaimGuard, ClaimOutcome, ClaimPolicy, Claimer};
pub use completion::{AggregateReport, CompletionTracker};
pub use config::ApplyConfig;
pub use context::RunContext;
pub use enumerate::{Enumeration, MissingInput};
pub use error::{
    ClaimError, ConfigError, EnumerationError, ObjectStoreError, OperationError, PreflightError,
    SessionError, StageFailure, StoreError,
};
pub use pipeline::{run_pipeline, PipelineOptions, PipelineReport};
pub use plan::{ApplicationPlan, StagePlanner};
pub use runner::{RunSummary, Runner, UnitOutcome};
pub use session::RunSession;
pub use stage::{Commit, Stage, StageIo, StageOperation};
pub use unit::{Artifact, GridCoord, RunLayout, UnitKey, VersionTag, WorkUnit};
pub use worker::{ArraySlot, WorkerId, WorkerIdentity};
