//! Replication message types

use crate::backend::{Dn, OperationRequest};
use crate::csn::Csn;
use crate::server_state::ServerState;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire discriminant of each message variant
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Handshake opening
    Start = 0x01,
    /// Handshake confirmation with the session status
    StartSession = 0x02,
    /// Replicated change
    Update = 0x10,
    /// Credit grant
    Window = 0x11,
    /// Blocked sender asking for credit
    WindowProbe = 0x12,
    /// Liveness
    Heartbeat = 0x13,
    /// Replica progress report
    ServerState = 0x14,
    /// Status side channel
    ChangeStatus = 0x15,
    /// Connected servers of a domain
    Topology = 0x16,
    /// Importer asks a source to export
    InitializeRequest = 0x20,
    /// Exporter announces a total update
    InitializeTarget = 0x21,
    /// One exported entry
    Entry = 0x22,
    /// Importer acknowledges entries
    InitializeRcvAck = 0x23,
    /// Total update finished
    Done = 0x24,
    /// Total update failed
    Error = 0x25,
    /// Graceful close
    Stop = 0xFE,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Start),
            0x02 => Ok(Self::StartSession),
            0x10 => Ok(Self::Update),
            0x11 => Ok(Self::Window),
            0x12 => Ok(Self::WindowProbe),
            0x13 => Ok(Self::Heartbeat),
            0x14 => Ok(Self::ServerState),
            0x15 => Ok(Self::ChangeStatus),
            0x16 => Ok(Self::Topology),
            0x20 => Ok(Self::InitializeRequest),
            0x21 => Ok(Self::InitializeTarget),
            0x22 => Ok(Self::Entry),
            0x23 => Ok(Self::InitializeRcvAck),
            0x24 => Ok(Self::Done),
            0x25 => Ok(Self::Error),
            0xFE => Ok(Self::Stop),
            _ => Err(Error::codec(format!("Unknown message type: {:#04x}", value))),
        }
    }
}

/// Which end of a session a server is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerKind {
    /// Directory server holding data
    Directory,
    /// Replication server relay
    Replication,
}

/// Replication status of a directory server in a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerStatus {
    /// No session to a relay
    NotConnected,
    /// Replaying and publishing normally
    Normal,
    /// Connected but lagging behind
    Degraded,
    /// A total update runs against this server
    FullUpdate,
    /// Generation ID differs from the relay's; updates are blocked
    BadGenerationId,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerStatus::NotConnected => "not-connected",
            ServerStatus::Normal => "normal",
            ServerStatus::Degraded => "degraded",
            ServerStatus::FullUpdate => "full-update",
            ServerStatus::BadGenerationId => "bad-generation-id",
        };
        f.write_str(name)
    }
}

/// Destination of an addressed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerTarget {
    /// Every directory server of the domain except the sender
    All,
    /// One server
    Server(i32),
}

impl ServerTarget {
    /// Whether `server_id` is addressed
    pub fn includes(&self, server_id: i32) -> bool {
        match self {
            ServerTarget::All => true,
            ServerTarget::Server(id) => *id == server_id,
        }
    }
}

impl fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerTarget::All => f.write_str("all"),
            ServerTarget::Server(id) => write!(f, "{}", id),
        }
    }
}

/// Handshake opening, sent by both ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartMsg {
    /// Sender role
    pub kind: ServerKind,
    /// Highest protocol version the sender speaks
    pub protocol_version: u8,
    /// Replication domain
    pub base_dn: Dn,
    /// Sender server id
    pub server_id: i32,
    /// Sender generation ID
    pub generation_id: i64,
    /// Sender group id
    pub group_id: u8,
    /// Receive window the sender grants its peer
    pub window_size: u32,
    /// Sender heartbeat interval
    pub heartbeat_interval_ms: u64,
    /// Sender progress
    pub server_state: ServerState,
}

/// Replicated change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMsg {
    /// Change stamp
    pub csn: Csn,
    /// Change content
    pub operation: OperationRequest,
}

impl UpdateMsg {
    /// Target DN of the change
    pub fn dn(&self) -> &Dn {
        self.operation.dn()
    }
}

/// Exporter announcement of a total update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeTargetMsg {
    /// Replication domain
    pub base_dn: Dn,
    /// Exporter
    pub sender: i32,
    /// Importer(s)
    pub destination: ServerTarget,
    /// Server that asked for the export (the exporter itself for a push)
    pub requestor: i32,
    /// Entry count estimate
    pub entry_count: u64,
    /// Entries the exporter may send before waiting for an ack
    pub init_window: u32,
    /// Generation ID the importer adopts on success
    pub generation_id: i64,
    /// ServerState the importer adopts on success
    pub server_state: ServerState,
}

/// Directory server as seen in a topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsInfo {
    /// Server id
    pub server_id: i32,
    /// Relay it is connected to
    pub rs_id: i32,
    /// Its generation ID
    pub generation_id: i64,
    /// Its replication status
    pub status: ServerStatus,
    /// Its group id
    pub group_id: u8,
}

/// Replication server as seen in a topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsInfo {
    /// Server id
    pub server_id: i32,
    /// Generation ID of its domain
    pub generation_id: i64,
    /// Its group id
    pub group_id: u8,
}

/// Connected servers of a domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyMsg {
    /// Directory servers
    pub dss: Vec<DsInfo>,
    /// Replication servers
    pub rss: Vec<RsInfo>,
}

/// Closed set of replication messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Handshake opening
    Start(StartMsg),

    /// Handshake confirmation
    StartSession {
        /// Status the initiator starts in
        status: ServerStatus,
        /// Initiator group id
        group_id: u8,
    },

    /// Replicated change
    Update(UpdateMsg),

    /// Credit grant of `num_ack` updates
    Window {
        /// Updates the peer may send on top of its current credit
        num_ack: u32,
    },

    /// Blocked sender asking for credit
    WindowProbe,

    /// Liveness
    Heartbeat {
        /// Sender wall clock
        timestamp_ms: u64,
    },

    /// Replica progress report
    ServerState(ServerState),

    /// Status change of the sender
    ChangeStatus {
        /// New status
        status: ServerStatus,
    },

    /// Connected servers of the domain
    Topology(TopologyMsg),

    /// Importer asks a source to export
    InitializeRequest {
        /// Replication domain
        base_dn: Dn,
        /// Importer
        sender: i32,
        /// Source
        destination: ServerTarget,
        /// Importer ack window
        init_window: u32,
    },

    /// Exporter announces a total update
    InitializeTarget(InitializeTargetMsg),

    /// One exported entry
    Entry {
        /// Exporter
        sender: i32,
        /// Importer(s)
        destination: ServerTarget,
        /// 1-based position in the stream
        seq: u64,
        /// LDIF form of the entry
        ldif: Vec<u8>,
    },

    /// Importer acknowledges `num_ack` entries in total
    InitializeRcvAck {
        /// Importer
        sender: i32,
        /// Exporter
        destination: ServerTarget,
        /// Entries processed so far
        num_ack: u64,
    },

    /// Total update finished
    Done {
        /// Exporter
        sender: i32,
        /// Importer(s)
        destination: ServerTarget,
    },

    /// Total update failed
    Error {
        /// Reporting server
        sender: i32,
        /// Peer of the failed transfer
        destination: ServerTarget,
        /// LDAP result code
        code: u32,
        /// Human readable reason
        details: String,
    },

    /// Graceful close
    Stop,
}

impl ReplicationMessage {
    /// Wire discriminant
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Start(_) => MessageType::Start,
            Self::StartSession { .. } => MessageType::StartSession,
            Self::Update(_) => MessageType::Update,
            Self::Window { .. } => MessageType::Window,
            Self::WindowProbe => MessageType::WindowProbe,
            Self::Heartbeat { .. } => MessageType::Heartbeat,
            Self::ServerState(_) => MessageType::ServerState,
            Self::ChangeStatus { .. } => MessageType::ChangeStatus,
            Self::Topology(_) => MessageType::Topology,
            Self::InitializeRequest { .. } => MessageType::InitializeRequest,
            Self::InitializeTarget(_) => MessageType::InitializeTarget,
            Self::Entry { .. } => MessageType::Entry,
            Self::InitializeRcvAck { .. } => MessageType::InitializeRcvAck,
            Self::Done { .. } => MessageType::Done,
            Self::Error { .. } => MessageType::Error,
            Self::Stop => MessageType::Stop,
        }
    }

    /// `(sender, destination)` of messages routed by server id
    pub fn routing(&self) -> Option<(i32, ServerTarget)> {
        match self {
            Self::InitializeRequest {
                sender,
                destination,
                ..
            }
            | Self::Entry {
                sender,
                destination,
                ..
            }
            | Self::InitializeRcvAck {
                sender,
                destination,
                ..
            }
            | Self::Done {
                sender,
                destination,
            }
            | Self::Error {
                sender,
                destination,
                ..
            } => Some((*sender, *destination)),
            Self::InitializeTarget(msg) => Some((msg.sender, msg.destination)),
            _ => None,
        }
    }

    /// Whether the message belongs to a total update
    pub fn is_bulk_transfer(&self) -> bool {
        self.routing().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_byte_round_trip() {
        for byte in [
            0x01u8, 0x02, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x20, 0x21, 0x22, 0x23, 0x24,
            0x25, 0xFE,
        ] {
            let ty = MessageType::try_from(byte).unwrap();
            assert_eq!(ty as u8, byte);
        }
        assert!(MessageType::try_from(0x99).is_err());
    }

    #[test]
    fn test_routing() {
        let done = ReplicationMessage::Done {
            sender: 1,
            destination: ServerTarget::Server(2),
        };
        assert_eq!(done.routing(), Some((1, ServerTarget::Server(2))));
        assert!(done.is_bulk_transfer());
        assert_eq!(ReplicationMessage::WindowProbe.routing(), None);
        assert!(ServerTarget::All.includes(5));
        assert!(!ServerTarget::Server(4).includes(5));
    }
}
