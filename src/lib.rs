//! # collab-mem — shared memory-image collaboration server
//!
//! Lets several independent editor instances mutate one shared binary
//! memory image and stay synchronized in near-real time, without
//! polling.
//!
//! ## Architecture
//!
//! ```text
//! Editor A ──┐   HTTP GET/PUT    ┌──────────────┐
//!            ├──────────────────►│ CollabServer │
//! Editor B ──┘                   └──────┬───────┘
//!                                       │
//!                              ┌────────┴────────┐
//!                              │ SessionRegistry │ name → session
//!                              └────────┬────────┘
//!                             ┌─────────┴──────────┐
//!                             ▼                    ▼
//!                      ┌─────────────┐     ┌─────────────┐
//!                      │ MemoryRegion│     │ WatchBroker │
//!                      │ (C bytes)   │     │ (fan-out)   │
//!                      └─────────────┘     └──────┬──────┘
//!                                     ┌───────────┼───────────┐
//!                                     ▼           ▼           ▼
//!                                 watch A     watch B     watch C
//! ```
//!
//! A write resolves (or lazily creates) its session, mutates the
//! session's memory region at the given offset, then publishes the
//! changed range to the session's watch broker, which fans it out to
//! every open watch stream. Reads go straight to the region. Watches
//! block without polling until an event or the shutdown signal
//! arrives.
//!
//! ## Modules
//!
//! - [`protocol`] — wire format: greeting header and event frames
//! - [`region`] — fixed-capacity byte region, optionally file-backed
//! - [`session`] — name validation, sessions, and the registry
//! - [`broadcast`] — per-watcher queues and fan-out
//! - [`server`] — warp HTTP boundary, config, graceful shutdown

pub mod broadcast;
pub mod protocol;
pub mod region;
pub mod server;
pub mod session;

pub use broadcast::{Drained, WatchBroker, WatcherHandle, WatchSignal};
pub use protocol::{greeting_header, ProtocolError, UpdateEvent, EVENT_FRAME_LEN, PROTOCOL_VERSION};
pub use region::{MemoryRegion, RegionError, DEFAULT_CAPACITY};
pub use server::{CollabServer, ServerConfig, ServerStats, ServiceError};
pub use session::{normalize_name, RegistryConfig, Session, SessionError, SessionRegistry};
