//! # flowstate-engine
//!
//! A PostgreSQL-backed durable workflow engine: declarative state graphs
//! (Task / Choice / Wait / Success / Fail) executed one persisted step at a
//! time by horizontally scalable workers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ExecutionService                         │
//! │   (register definitions, start / read / cancel executions)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutionStore                          │
//! │  (PostgreSQL: workflows, executions, steps, queue, history) │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Worker                              │
//! │  dispatch: claim queue rows (SKIP LOCKED), run one state     │
//! │  wake:     release Wait steps whose deadline passed          │
//! │  reap:     reset abandoned RUNNING steps and requeue them    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every transition an execution makes is persisted in a single transaction
//! (step update, successor step + queue row, history events), so a crash at
//! any point either loses nothing or loses a whole attempt that another
//! worker repeats. The queue row is the unit of work: claimed with
//! `FOR UPDATE SKIP LOCKED`, held under lock while its step runs, deleted on
//! commit.

pub mod clock;
pub mod condition;
pub mod definition;
pub mod interpreter;
pub mod merge;
pub mod service;
pub mod store;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::condition::Condition;
    pub use crate::definition::{DefinitionError, StateDef, StateType, WorkflowDefinition};
    pub use crate::merge::shallow_merge;
    pub use crate::service::{
        EngineError, ExecutionService, ExecutionView, StartOutcome, StepView, WorkflowView,
    };
    pub use crate::store::{
        ExecutionFilter, ExecutionStatus, ExecutionStore, StepStatus, StoreError,
        memory::InMemoryExecutionStore, postgres::PostgresExecutionStore,
    };
    pub use crate::task::{MockTaskHandler, TaskContext, TaskHandler, TaskRegistry, TaskResult};
    pub use crate::worker::{Worker, WorkerConfig};
}

pub use clock::{Clock, ManualClock, SystemClock};
pub use definition::{DefinitionError, WorkflowDefinition};
pub use merge::shallow_merge;
pub use service::{EngineError, ExecutionService, StartOutcome};
pub use store::{
    memory::InMemoryExecutionStore, postgres::PostgresExecutionStore, ExecutionStore, StoreError,
};
pub use task::{MockTaskHandler, TaskHandler, TaskRegistry, TaskResult};
pub use worker::{Worker, WorkerConfig};
