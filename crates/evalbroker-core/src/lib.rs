//! evalbroker-core - File-based IPC broker for assistant evaluation.
//!
//! This library couples an external evaluation client with an in-editor
//! assistant through a shared directory tree. Clients drop request documents
//! into `requests/`; the broker claims them into `processing/`, drives the
//! opaque [`dispatcher::Dispatcher`] collaborator, and publishes terminal
//! outcomes into `responses/` (mirrored into `failed/` for post-mortem when
//! terminal failure is reached).
//!
//! # Guarantees
//!
//! - At most one broker is active per workspace ([`lock`]).
//! - Each request is dispatched exactly once per attempt despite duplicate
//!   watcher events ([`engine`]).
//! - Retries are bounded and sequential per request id; timeouts are enforced
//!   with cooperative cancellation ([`engine`]).
//! - In-flight requests survive crashes and are recovered or force-failed on
//!   the next start ([`recovery`], [`maintenance`]).
//! - Every published document becomes visible atomically ([`fs_safe`]).
//!
//! # Modules
//!
//! - [`broker`]: top-level lifecycle (activate, run, shutdown)
//! - [`engine`]: the request lifecycle state machine
//! - [`watcher`]: `requests/` observation with debounce and poll fallback
//! - [`lock`]: workspace-scoped singleton lock with heartbeat
//! - [`state_store`]: durable `request_id -> ProcessingState` map
//! - [`dispatcher`]: the collaborator contract the broker drives

pub mod broker;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod fs_safe;
pub mod layout;
pub mod lock;
pub mod maintenance;
pub mod recovery;
pub mod request;
pub mod response;
pub mod state_store;
pub mod watcher;
pub mod workspace;

pub use broker::{Broker, BrokerError};
pub use config::BrokerConfig;
pub use dispatcher::{Dispatcher, DispatcherResult};
pub use request::{Command, Request};
pub use response::{Attempt, FinalStatus, Response};
pub use state_store::{ProcessingState, ProcessingStatus, StateStore};
