// Lockstep - Ricart-Agrawala mutual exclusion for a shared append-only chat log over line-delimited TCP
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{LockstepError, LockstepResult};
use crate::protocol::NodeId;

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(rename(deserialize = "General"))]
    pub general: Option<General>,

    #[serde(rename(deserialize = "Peers"), default)]
    pub peers: Vec<Peer>,

    #[serde(rename(deserialize = "FileServer"))]
    pub file_server: Option<FileServerSection>,
}

#[derive(Deserialize, Debug)]
pub struct General {
    pub node_id: String,

    /// TCP bind for peer REQUEST/REPLY traffic.
    pub bind_address: String,

    /// Address of the file server hosting the chat log.
    pub file_server_address: String,
}

#[derive(Deserialize, Debug)]
pub struct Peer {
    pub node_id: String,

    pub host: String,

    pub port: u16,
}

#[derive(Deserialize, Debug)]
pub struct FileServerSection {
    pub bind_address: String,

    /// Chat log file, one message per line. Created on first post.
    pub log_path: String,
}

/// Validated settings for the node role.
#[derive(Debug)]
pub struct NodeSettings {
    pub node_id: NodeId,
    pub bind_address: String,
    pub file_server_address: String,
    pub peers: Vec<PeerAddr>,
}

/// A peer with a validated id and the address its listener answers on.
#[derive(Debug, Clone)]
pub struct PeerAddr {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Validated settings for the fileserver role.
#[derive(Debug)]
pub struct FileServerSettings {
    pub bind_address: String,
    pub log_path: PathBuf,
}

impl Config {
    /// Extract and validate the node role settings.
    ///
    /// The peer list must be non-empty, free of duplicates, and must not
    /// contain this node's own id. Membership is fixed from here on.
    pub fn node(&self) -> LockstepResult<NodeSettings> {
        let general = self
            .general
            .as_ref()
            .ok_or(LockstepError::MissingSection("General"))?;

        let node_id = NodeId::try_from(general.node_id.as_str())?;

        if self.peers.is_empty() {
            return Err(LockstepError::EmptyPeerSet);
        }

        let mut peers = Vec::with_capacity(self.peers.len());
        let mut seen = BTreeSet::new();

        for peer in &self.peers {
            let peer_id = NodeId::try_from(peer.node_id.as_str())?;

            if peer_id == node_id {
                return Err(LockstepError::SelfInPeers(peer_id.to_string()));
            }

            if !seen.insert(peer_id.clone()) {
                return Err(LockstepError::DuplicatePeer(peer_id.to_string()));
            }

            peers.push(PeerAddr {
                node_id: peer_id,
                host: peer.host.clone(),
                port: peer.port,
            });
        }

        Ok(NodeSettings {
            node_id,
            bind_address: general.bind_address.clone(),
            file_server_address: general.file_server_address.clone(),
            peers,
        })
    }

    /// Extract and validate the fileserver role settings.
    pub fn file_server(&self) -> LockstepResult<FileServerSettings> {
        let section = self
            .file_server
            .as_ref()
            .ok_or(LockstepError::MissingSection("FileServer"))?;

        Ok(FileServerSettings {
            bind_address: section.bind_address.clone(),
            log_path: PathBuf::from(&section.log_path),
        })
    }
}

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;

    fn parse(raw: &str) -> Config {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn node_settings_accepted() {
        let config = parse(
            r#"
            [General]
            node_id = "a"
            bind_address = "0.0.0.0:7401"
            file_server_address = "127.0.0.1:7500"

            [[Peers]]
            node_id = "b"
            host = "127.0.0.1"
            port = 7402

            [[Peers]]
            node_id = "c"
            host = "127.0.0.1"
            port = 7403
            "#,
        );

        let settings = config.node().unwrap();

        assert_eq!(settings.node_id.to_string(), "a");
        assert_eq!(settings.peers.len(), 2);
        assert_eq!(settings.peers[0].address(), "127.0.0.1:7402");
    }

    #[test]
    fn own_id_in_peers_rejected() {
        let config = parse(
            r#"
            [General]
            node_id = "a"
            bind_address = "0.0.0.0:7401"
            file_server_address = "127.0.0.1:7500"

            [[Peers]]
            node_id = "a"
            host = "127.0.0.1"
            port = 7402
            "#,
        );

        assert!(matches!(config.node(), Err(LockstepError::SelfInPeers(_))));
    }

    #[test]
    fn duplicate_peer_rejected() {
        let config = parse(
            r#"
            [General]
            node_id = "a"
            bind_address = "0.0.0.0:7401"
            file_server_address = "127.0.0.1:7500"

            [[Peers]]
            node_id = "b"
            host = "127.0.0.1"
            port = 7402

            [[Peers]]
            node_id = "b"
            host = "127.0.0.1"
            port = 7403
            "#,
        );

        assert!(matches!(config.node(), Err(LockstepError::DuplicatePeer(_))));
    }

    #[test]
    fn empty_peer_list_rejected() {
        let config = parse(
            r#"
            [General]
            node_id = "a"
            bind_address = "0.0.0.0:7401"
            file_server_address = "127.0.0.1:7500"
            "#,
        );

        assert!(matches!(config.node(), Err(LockstepError::EmptyPeerSet)));
    }

    #[test]
    fn missing_general_rejected() {
        let config = parse(
            r#"
            [FileServer]
            bind_address = "0.0.0.0:7500"
            log_path = "chat.log"
            "#,
        );

        assert!(matches!(
            config.node(),
            Err(LockstepError::MissingSection("General"))
        ));

        assert!(config.file_server().is_ok());
    }

    #[test]
    fn missing_file_server_rejected() {
        let config = parse(
            r#"
            [General]
            node_id = "a"
            bind_address = "0.0.0.0:7401"
            file_server_address = "127.0.0.1:7500"
            "#,
        );

        assert!(matches!(
            config.file_server(),
            Err(LockstepError::MissingSection("FileServer"))
        ));
    }

    #[test]
    fn invalid_peer_id_rejected() {
        let config = parse(
            r#"
            [General]
            node_id = "a"
            bind_address = "0.0.0.0:7401"
            file_server_address = "127.0.0.1:7500"

            [[Peers]]
            node_id = "b c"
            host = "127.0.0.1"
            port = 7402
            "#,
        );

        assert!(matches!(config.node(), Err(LockstepError::InvalidNodeId(_))));
    }
}
