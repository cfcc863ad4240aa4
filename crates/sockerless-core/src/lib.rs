//! # sockerless-core
//!
//! Backend runtime core for Sockerless.
//!
//! Every Sockerless backend, local or cloud, shares this crate:
//!
//! - In-memory registry of containers, images and exec instances
//! - Container lifecycle engine with exit tracking and wait semantics
//! - Exec engine
//! - Bounded log ring with live fan-out for attach and logs
//! - Docker multiplexed stream framing
//! - The [`ProcessFactory`] contract backends implement
//! - Restart policies and a Docker-style event bus
//! - Registry recovery from a cloud job inventory or the on-disk journal
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                  Runtime                   │
//! │  ┌──────────────────┐  ┌────────────────┐  │
//! │  │ ContainerManager │  │  ExecManager   │  │
//! │  └────────┬─────────┘  └───────┬────────┘  │
//! │           ▼                    ▼           │
//! │  ┌──────────────────────────────────────┐  │
//! │  │      Store (cells + status watch)    │  │
//! │  └──────────────────────────────────────┘  │
//! │           │                                │
//! │           ▼                                │
//! │  ┌──────────────────────────────────────┐  │
//! │  │  ProcessFactory -> ContainerProcess  │  │
//! │  │        (system, cloud adapters)      │  │
//! │  └──────────────────────────────────────┘  │
//! └────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod exec;
pub mod filter;
pub mod frame;
pub mod id;
pub mod image;
pub mod journal;
pub mod logs;
pub mod manager;
pub mod process;
pub mod recovery;
pub mod runtime;
pub mod state;
pub mod store;
pub mod system;

pub use config::Config;
pub use error::{CoreError, ObjectKind, Result};
pub use event::{Event, EventBus, EventKind};
pub use exec::{ExecConfig, ExecInstance, ExecManager, PreparedExec};
pub use filter::ContainerFilter;
pub use frame::{FrameReader, FrameWriter, MuxCodec, RawWriter, StreamKind};
pub use image::Image;
pub use journal::JobJournal;
pub use logs::LogRing;
pub use manager::{ContainerManager, KillSignal, LifecycleConfig, StartResult, WaitCondition};
pub use process::{ContainerProcess, ExecIo, LaunchSpec, ProcessFactory};
pub use recovery::{recover, JobInventory, ManagedJob, RecoveryReport};
pub use runtime::Runtime;
pub use state::{Container, ContainerConfig, ContainerState, RestartPolicy, RestartPolicyName};
pub use store::Store;
pub use system::SystemProcessFactory;
