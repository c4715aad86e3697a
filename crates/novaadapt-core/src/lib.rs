//! Stores, policy gate, agent, execution transport, and backup/restore
//! for the novaadapt execution orchestrator. This is the
//! crate the HTTP front-end and CLI compose against; every store here
//! owns its own embedded SQLite file and mutual exclusion.

pub mod action_log;
pub mod agent;
pub mod audit;
pub mod backup;
pub mod cancellation;
pub mod config;
pub mod db;
pub mod execution;
pub mod idempotency;
pub mod jobs;
pub mod plan_store;
pub mod policy;
pub mod transport;

pub use action_log::{ActionLog, ActionLogError};
pub use agent::{Agent, RunObjectiveOutcome, RunObjectiveRequest, SYSTEM_PROMPT};
pub use audit::{AuditStore, AuditStoreConfig, AuditStoreError, ListFilter};
pub use cancellation::CancelHandle;
pub use config::ServerConfig;
pub use execution::{ExecuteOptions, ExecutionError, PlanExecutor};
pub use idempotency::{BeginOutcome, IdempotencyStore, IdempotencyStoreConfig, IdempotencyStoreError};
pub use jobs::{JobClosure, JobFuture, JobManager, JobStoreError, RESTART_ERROR};
pub use plan_store::{PlanStore, PlanStoreError};
pub use policy::ActionPolicy;
pub use transport::{ExecutionTransport, NoopTransport, TransportHealth, TransportOutcome};
