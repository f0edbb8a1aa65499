//! # Station Lattice
//!
//! Agent discovery and remote invocation across stations.
//!
//! A station hosts a catalog of named agents. Stations that join the same
//! lattice advertise their agents to each other and can run any agent the
//! lattice knows about, wherever it lives.
//!
//! This library provides:
//! - An embedded pub/sub broker hosted by the orchestrator station
//! - A reconnecting broker client with subjects, queue groups and request/reply
//! - A presence-driven directory of stations and their agents
//! - Routed, streaming invocation of remote agents with deadlines
//!
//! ## Architecture
//!
//! ```text
//!   ┌────────────────────────────┐        ┌────────────────────────────┐
//!   │ Station (orchestrator)     │        │ Station (member)           │
//!   │                            │        │                            │
//!   │  EmbeddedBroker ◄──────────┼── ws ──┼─ MeshConnection            │
//!   │        ▲                   │        │    │        │              │
//!   │        │ ws                │        │    ▼        ▼              │
//!   │  MeshConnection            │        │ Presence  Responder ──► engine
//!   │    │         │             │        │ Publisher   ▲              │
//!   │    ▼         ▼             │        │             │              │
//!   │ Directory  Dispatcher ─────┼────────┼── lattice.exec.<st>.<agent>│
//!   └────────────────────────────┘        └────────────────────────────┘
//! ```
//!
//! ## Invocation Flow
//! 1. The dispatcher resolves the agent through the directory
//! 2. It subscribes to `lattice.exec.reply.<correlation id>` and publishes the request
//! 3. The target responder acknowledges, streams partial output, then a final reply
//! 4. The caller sees partials in order and exactly one final result, or an error
//!
//! ## Modules
//! - `broker`: embedded WebSocket broker and its monitor endpoints
//! - `mesh`: broker client connection and reconnect backoff
//! - `directory`: presence-fed view of stations and agents
//! - `presence`: periodic presence announcements
//! - `dispatcher` / `responder`: the two ends of a remote invocation
//! - `engine`: the execution seam and the local agent catalog
//! - `station`: wires everything together per configured role

pub mod broker;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod mesh;
pub mod presence;
pub mod responder;
pub mod station;
pub mod subjects;
pub mod types;
pub mod util;

pub use config::Config;
pub use directory::{AgentListing, AgentRecord, AgentSchema, Directory, DirectoryEvent, StationInfo};
pub use dispatcher::{ExecOptions, Invocation};
pub use engine::{AgentCatalog, AgentExecutor, EchoExecutor, ExecutionEvent, ExecutionRequest};
pub use error::{LatticeError, Result};
pub use station::{MeshStatus, Station};
pub use types::{AgentAdvert, InvocationResult, StationIdentity, StationRole};
