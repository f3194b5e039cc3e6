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

use std::convert::TryFrom;
use std::fmt;

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::{all_consuming, map, map_res, rest, verify};
use nom::sequence::preceded;
use nom::IResult;

use crate::error::LockstepError;

/// Longest node id accepted on the wire.
pub const MAX_NODE_ID_LEN: usize = 64;

/// Longest peer protocol line: verb, 20 decimal digits of timestamp,
/// node id, two separating spaces.
pub const MAX_LINE_LENGTH: usize = 128;

/// Identifier of a node in the fixed membership.
///
/// Printable ASCII without whitespace, at most [`MAX_NODE_ID_LEN`] bytes.
/// The lexicographic ordering is total and serves as the request tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(String);

impl TryFrom<&str> for NodeId {
    type Error = LockstepError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.is_empty()
            || value.len() > MAX_NODE_ID_LEN
            || !value.chars().all(|c| c.is_ascii_graphic())
        {
            return Err(LockstepError::InvalidNodeId(value.to_string()));
        }

        Ok(Self(value.to_string()))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message verbs of the peer protocol.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Verb {
    /// Ask every peer for permission to enter the critical section.
    Request,

    /// Grant permission, either immediately or after our own release.
    Reply,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Request => write!(f, "REQUEST"),
            Verb::Reply => write!(f, "REPLY"),
        }
    }
}

/// One peer protocol message.
///
/// Wire form is a single line, fields separated by single spaces:
/// `REQUEST <ts> <node_id>` or `REPLY <ts> <node_id>`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PeerMessage {
    pub verb: Verb,

    /// Logical clock value at the moment of sending.
    pub timestamp: u64,

    pub sender: NodeId,
}

impl PeerMessage {
    pub fn parse(input: &str) -> IResult<&str, PeerMessage> {
        let (input, verb) = parse_verb(input)?;
        let (input, _) = char(' ')(input)?;
        let (input, timestamp) = parse_timestamp(input)?;
        let (input, _) = char(' ')(input)?;
        let (input, sender) = all_consuming(parse_node_id)(input)?;

        Ok((
            input,
            PeerMessage {
                verb,
                timestamp,
                sender,
            },
        ))
    }

    /// Serialize without the trailing newline; the line codec appends it.
    pub fn to_line(&self) -> String {
        format!("{} {} {}", self.verb, self.timestamp, self.sender)
    }
}

/// One file-server command.
///
/// Wire form: `POST <message>` or `VIEW`, one command per connection.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LogCommand {
    /// Append a message to the chat log.
    Post(String),

    /// Fetch the whole chat log.
    View,
}

impl LogCommand {
    pub fn parse(input: &str) -> IResult<&str, LogCommand> {
        all_consuming(alt((
            map(
                preceded(tag("POST "), verify(rest, |m: &str| !m.is_empty())),
                |m: &str| LogCommand::Post(m.to_string()),
            ),
            map(tag("VIEW"), |_| LogCommand::View),
        )))(input)
    }

    pub fn to_line(&self) -> String {
        match self {
            LogCommand::Post(message) => format!("POST {}", message),
            LogCommand::View => "VIEW".to_string(),
        }
    }
}

fn parse_verb(input: &str) -> IResult<&str, Verb> {
    alt((
        map(tag("REQUEST"), |_| Verb::Request),
        map(tag("REPLY"), |_| Verb::Reply),
    ))(input)
}

fn parse_timestamp(input: &str) -> IResult<&str, u64> {
    map_res(digit1, |digits: &str| digits.parse::<u64>())(input)
}

fn parse_node_id(input: &str) -> IResult<&str, NodeId> {
    map_res(take_while1(|c: char| c.is_ascii_graphic()), NodeId::try_from)(input)
}

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;

    fn id(value: &str) -> NodeId {
        NodeId::try_from(value).unwrap()
    }

    #[test]
    fn parse_valid_request() {
        let m = PeerMessage::parse("REQUEST 1 a").unwrap();

        assert_eq!(
            m.1,
            PeerMessage {
                verb: Verb::Request,
                timestamp: 1,
                sender: id("a"),
            }
        );
    }

    #[test]
    fn parse_valid_reply() {
        let m = PeerMessage::parse("REPLY 42 node-7").unwrap();

        assert_eq!(
            m.1,
            PeerMessage {
                verb: Verb::Reply,
                timestamp: 42,
                sender: id("node-7"),
            }
        );
    }

    #[test]
    fn parse_unknown_verb() {
        assert!(PeerMessage::parse("RELEASE 1 a").is_err());
    }

    #[test]
    fn parse_non_integer_timestamp() {
        assert!(PeerMessage::parse("REQUEST x a").is_err());
        assert!(PeerMessage::parse("REQUEST -1 a").is_err());
    }

    #[test]
    fn parse_double_space_rejected() {
        assert!(PeerMessage::parse("REQUEST  1 a").is_err());
    }

    #[test]
    fn parse_trailing_field_rejected() {
        assert!(PeerMessage::parse("REQUEST 1 a b").is_err());
        assert!(PeerMessage::parse("REQUEST 1 a ").is_err());
    }

    #[test]
    fn parse_oversized_node_id_rejected() {
        let line = format!("REQUEST 1 {}", "x".repeat(MAX_NODE_ID_LEN + 1));

        assert!(PeerMessage::parse(&line).is_err());
    }

    #[test]
    fn peer_message_round_trip() {
        let original = PeerMessage {
            verb: Verb::Reply,
            timestamp: 981,
            sender: id("charlie"),
        };

        let line = original.to_line();
        let parsed = PeerMessage::parse(&line).unwrap();

        assert_eq!(parsed.1, original);
    }

    #[test]
    fn node_id_rejects_whitespace_and_empty() {
        assert!(NodeId::try_from("").is_err());
        assert!(NodeId::try_from("a b").is_err());
        assert!(NodeId::try_from("a\tb").is_err());
        assert!(NodeId::try_from("caf\u{e9}").is_err());
    }

    #[test]
    fn node_id_accepts_max_length() {
        assert!(NodeId::try_from("x".repeat(MAX_NODE_ID_LEN).as_str()).is_ok());
    }

    #[test]
    fn parse_valid_post() {
        let c = LogCommand::parse("POST hello out there").unwrap();

        assert_eq!(c.1, LogCommand::Post("hello out there".to_string()));
    }

    #[test]
    fn parse_valid_view() {
        let c = LogCommand::parse("VIEW").unwrap();

        assert_eq!(c.1, LogCommand::View);
    }

    #[test]
    fn parse_empty_post_rejected() {
        assert!(LogCommand::parse("POST ").is_err());
        assert!(LogCommand::parse("POST").is_err());
    }

    #[test]
    fn parse_view_with_trailing_field_rejected() {
        assert!(LogCommand::parse("VIEW now").is_err());
    }

    #[test]
    fn log_command_round_trip() {
        let original = LogCommand::Post("spaces are fine".to_string());

        let line = original.to_line();
        let parsed = LogCommand::parse(&line).unwrap();

        assert_eq!(parsed.1, original);
    }
}
