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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockstepError {
    #[error("IO error {0}")]
    IoError(#[from] std::io::Error),

    #[error("Line codec error {0}")]
    CodecError(#[from] tokio_util::codec::LinesCodecError),

    #[error("Invalid node id {0:?}")]
    InvalidNodeId(String),

    #[error("Missing configuration section {0}")]
    MissingSection(&'static str),

    #[error("Node id {0} appears in its own peer list")]
    SelfInPeers(String),

    #[error("Duplicate peer id {0}")]
    DuplicatePeer(String),

    #[error("Peer list must name at least one peer")]
    EmptyPeerSet,

    #[error("Peer {0} unreachable after retries: {1}")]
    PeerUnreachable(String, String),

    #[error("File server rejected command: {0}")]
    ServerRejected(String),

    #[error("Connection closed before a response arrived")]
    ConnectionClosed,

    #[error("Coordinator loop is no longer running")]
    CoordinatorGone,
}

pub type LockstepResult<T> = std::result::Result<T, LockstepError>;
