//! `dob-kernel`: the cluster membership, state-publishing and connection
//! admission core of a Distributed Object Broker (DOB).
//!
//! This crate implements the "hard core" of Safir SDK Core's DOB kernel
//! (`dose_main`): a coordinator that elects a leader and maintains a
//! replicated cluster state blob (C4), a state publisher that disseminates
//! it (C5), a connect/disconnect arbiter that gates clients into the shared
//! object pool under admission policy (C6), a connection handler that
//! drives the arbiter from local and remote sources (C7), a process monitor
//! that evicts connections of dead processes (C2), a startup synchronizer
//! for shared-resource initialization (C8), and the periodic-timer-on-strand
//! primitive (C1) everything else is built on.
//!
//! What this crate deliberately does not do: define the on-wire byte layout
//! of application messages (a separate typesystem's job), persist objects to
//! disk, or implement transport reliability -- those are external
//! collaborators, represented here only by the [`comm::CommSubstrate`]
//! trait's contract.

pub mod arbiter;
pub mod comm;
pub mod config;
pub mod connection;
pub mod connection_handler;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod node;
pub mod process_monitor;
pub mod startup_sync;
pub mod state_publisher;
pub mod strand;
pub mod wire;

pub use arbiter::{ConnectArbiter, ConnectRequest, ConnectResponse, ConnectResult};
pub use comm::{CommSubstrate, SendError};
pub use config::{Config, ExitCode};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use connection_handler::ConnectionHandler;
pub use coordinator::Coordinator;
pub use error::DobError;
pub use node::{Node, NodeId, NodeType, NodeTypeId, QuorumPolicy};
pub use process_monitor::ProcessMonitor;
pub use startup_sync::{StartupSynchronizer, Synchronized};
pub use state_publisher::StatePublisher;
pub use strand::{PeriodicTimer, Strand, TimerEvent};
