//! Replication wire protocol
//!
//! Every message travels in a versioned, CRC-checked frame (see [`codec`]).
//! The first exchange on a session is `Start` in both directions; each side
//! then speaks the lower of the two advertised versions.

pub mod codec;
mod message;

pub use message::{
    DsInfo, InitializeTargetMsg, MessageType, ReplicationMessage, RsInfo, ServerKind,
    ServerStatus, ServerTarget, StartMsg, TopologyMsg, UpdateMsg,
};

use crate::{Error, Result};

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: u8 = 1;

/// Oldest protocol version still accepted
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Pick the version both ends speak
pub fn negotiate_version(local: u8, remote: u8) -> Result<u8> {
    let version = local.min(remote);
    if version < MIN_PROTOCOL_VERSION {
        return Err(Error::protocol(format!(
            "Peer protocol version {} is below the minimum {}",
            remote, MIN_PROTOCOL_VERSION
        )));
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_version() {
        assert_eq!(negotiate_version(1, 3).unwrap(), 1);
        assert_eq!(negotiate_version(PROTOCOL_VERSION, PROTOCOL_VERSION).unwrap(), PROTOCOL_VERSION);
        assert!(matches!(negotiate_version(1, 0), Err(Error::Protocol(_))));
    }
}
