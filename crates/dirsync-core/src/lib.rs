//! dirsync core - multi-master directory replication
//!
//! This crate provides the replication machinery of a directory service:
//! - Change sequence numbers (CSNs) and per-replica ServerState vectors
//! - A framed, versioned wire protocol with window-based flow control
//! - The directory server side: replication domains, broker, total update
//! - The replication server (relay) side: changelog, fan-out, catch-up
//! - Administrative initialize tasks and monitoring snapshots
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐          ┌──────────────────────┐
//! │ Directory server     │          │ Directory server     │
//! │  ReplicationDomain   │          │  ReplicationDomain   │
//! │  (Backend, CSNs)     │          │  (Backend, CSNs)     │
//! │  ReplicationBroker ──┼──┐    ┌──┼── ReplicationBroker  │
//! └──────────────────────┘  │    │  └──────────────────────┘
//!                   Session │    │ Session
//! ┌─────────────────────────┴┐  ┌┴─────────────────────────┐
//! │ ReplicationServer        │  │ ReplicationServer        │
//! │  ReplicationServerDomain ├──┤  ReplicationServerDomain │
//! │  ChangelogDb (file/LMDB) │  │  ChangelogDb (file/LMDB) │
//! └──────────────────────────┘  └──────────────────────────┘
//! ```
//!
//! A local write on a directory server gets a CSN, is applied to the
//! backend and published to the connected relay. The relay stores it in
//! the changelog and forwards it to every other member. Receivers replay
//! changes they have not yet covered in their ServerState.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod backoff;
pub mod broker;
pub mod changelog;
pub mod config;
pub mod csn;
pub mod domain;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod server_state;
pub mod session;
pub mod task;
pub mod testing;

pub use backend::{Backend, Dn, Entry, MemoryBackend, OperationRequest, ResultCode};
pub use config::{ReplicationDomainConfig, ReplicationServerConfig};
pub use csn::{Csn, CsnGenerator};
pub use domain::ReplicationDomain;
pub use error::{Error, Result};
pub use protocol::{ServerStatus, ServerTarget};
pub use server::ReplicationServer;
pub use server_state::ServerState;
pub use task::{InitializeTargetTask, InitializeTask, TaskHandle, TaskState};
