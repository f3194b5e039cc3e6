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
use std::mem::take;

use crate::clock::LamportClock;
use crate::protocol::NodeId;

/// Critical-section state of the local node.
///
/// Transitions form a single cycle: Released on acquire becomes Requested,
/// Requested on the last reply becomes Held, Held on release becomes
/// Released. Inbound peer requests never change this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsState {
    Released,
    Requested,
    Held,
}

/// Priority key of an outstanding request.
///
/// The derived ordering compares timestamps first and falls back to the
/// node id, so it is total across distinct nodes. Smaller key wins.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestKey {
    pub timestamp: u64,
    pub node_id: NodeId,
}

/// Decision logic over REQUEST and REPLY events.
///
/// The engine owns every piece of per-node protocol state. It is driven by
/// exactly one task, which is what makes each decision read a consistent
/// view without any locking. Network IO stays outside: methods return the
/// timestamps and recipients of messages the caller must send.
pub struct Engine {
    node_id: NodeId,

    /// Fixed membership, this node excluded.
    peers: BTreeSet<NodeId>,

    clock: LamportClock,

    state: CsState,

    /// Key of the outstanding request; set in Requested and Held only.
    pending_key: Option<RequestKey>,

    /// Peers that have answered the outstanding request.
    replies: BTreeSet<NodeId>,

    /// Peers whose reply is withheld until our release.
    deferred: BTreeSet<NodeId>,
}

impl Engine {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            peers: BTreeSet::new(),
            clock: LamportClock::new(),
            state: CsState::Released,
            pending_key: None,
            replies: BTreeSet::new(),
            deferred: BTreeSet::new(),
        }
    }

    pub fn add_peer(&mut self, peer: NodeId) {
        self.peers.insert(peer);
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Open a request round.
    ///
    /// Returns the timestamp the outgoing REQUEST to every peer carries.
    /// Calling this anywhere but Released is a caller bug and fatal.
    pub fn begin_request(&mut self) -> u64 {
        assert!(
            self.state == CsState::Released,
            "acquire while {:?}",
            self.state
        );

        let timestamp = self.clock.tick();

        self.pending_key = Some(RequestKey {
            timestamp,
            node_id: self.node_id.clone(),
        });
        self.state = CsState::Requested;
        self.replies.clear();

        timestamp
    }

    /// Decide an inbound REQUEST.
    ///
    /// `Some(ts)` means reply immediately with that timestamp; `None` means
    /// the reply is withheld until our own release.
    pub fn on_request(&mut self, timestamp: u64, sender: NodeId) -> Option<u64> {
        if !self.peers.contains(&sender) {
            warn!("Discarding request from unknown sender (peer = {})", sender);

            return None;
        }

        self.clock.observe(timestamp);

        let incoming = RequestKey {
            timestamp,
            node_id: sender.clone(),
        };

        let ours_first = match self.state {
            CsState::Held => true,
            CsState::Requested => match &self.pending_key {
                Some(key) => *key < incoming,
                None => false,
            },
            CsState::Released => false,
        };

        if ours_first {
            debug!("Withholding reply (peer = {})", sender);

            self.deferred.insert(sender);

            None
        } else {
            Some(self.clock.tick())
        }
    }

    /// Record an inbound REPLY.
    ///
    /// True once every peer has answered the outstanding request. A reply
    /// outside Requested is a protocol anomaly and is discarded.
    pub fn on_reply(&mut self, timestamp: u64, sender: NodeId) -> bool {
        if !self.peers.contains(&sender) {
            warn!("Discarding reply from unknown sender (peer = {})", sender);

            return false;
        }

        self.clock.observe(timestamp);

        if self.state != CsState::Requested {
            warn!(
                "Discarding stray reply (peer = {}) (state = {:?})",
                sender, self.state
            );

            return false;
        }

        self.replies.insert(sender);

        self.replies.len() == self.peers.len()
    }

    /// Enter the critical section once every reply is in.
    pub fn enter(&mut self) {
        assert!(
            self.state == CsState::Requested,
            "enter while {:?}",
            self.state
        );
        assert!(
            self.replies.len() == self.peers.len(),
            "enter before all replies arrived"
        );

        self.state = CsState::Held;

        info!("Entered critical section (node = {})", self.node_id);
    }

    /// Leave the critical section.
    ///
    /// Returns the peers owed a withheld reply, each paired with the
    /// timestamp its REPLY carries. Calling this anywhere but Held is a
    /// caller bug and fatal.
    pub fn release(&mut self) -> Vec<(NodeId, u64)> {
        assert!(
            self.state == CsState::Held,
            "release while {:?}",
            self.state
        );

        self.state = CsState::Released;
        self.pending_key = None;
        self.replies.clear();

        info!(
            "Left critical section (node = {}) (clock = {})",
            self.node_id,
            self.clock.read()
        );

        take(&mut self.deferred)
            .into_iter()
            .map(|peer| {
                let timestamp = self.clock.tick();

                (peer, timestamp)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;
    use std::convert::TryFrom;

    fn id(value: &str) -> NodeId {
        NodeId::try_from(value).unwrap()
    }

    fn engine(me: &str, peers: &[&str]) -> Engine {
        let mut engine = Engine::new(id(me));

        for peer in peers {
            engine.add_peer(id(peer));
        }

        engine
    }

    #[test]
    fn uncontested_round() {
        let mut a = engine("a", &["b"]);

        assert_eq!(a.begin_request(), 1);
        assert!(a.on_reply(2, id("b")));

        a.enter();

        assert!(a.release().is_empty());
    }

    #[test]
    fn immediate_reply_when_released() {
        let mut b = engine("b", &["a"]);

        // observe(1) moves the clock to 2; the reply tick carries 3.
        assert_eq!(b.on_request(1, id("a")), Some(3));
    }

    #[test]
    fn defers_behind_own_request() {
        let mut a = engine("a", &["b"]);

        assert_eq!(a.begin_request(), 1);

        // (1, a) < (2, b): our request wins, theirs waits.
        assert_eq!(a.on_request(2, id("b")), None);

        assert!(a.on_reply(3, id("b")));
        a.enter();

        let flushed = a.release();

        assert_eq!(flushed, vec![(id("b"), 5)]);
    }

    #[test]
    fn yields_to_earlier_request() {
        let mut b = engine("b", &["a", "c"]);

        assert!(b.on_request(1, id("c")).is_some());

        assert_eq!(b.begin_request(), 4);

        // (2, a) < (4, b): the incoming request has priority.
        assert!(b.on_request(2, id("a")).is_some());
    }

    #[test]
    fn tie_broken_by_node_id() {
        let mut a = engine("a", &["b"]);
        let mut b = engine("b", &["a"]);

        assert_eq!(a.begin_request(), 1);
        assert_eq!(b.begin_request(), 1);

        // Same timestamp on both sides; "a" < "b" decides.
        assert!(b.on_request(1, id("a")).is_some());
        assert_eq!(a.on_request(1, id("b")), None);
    }

    #[test]
    fn three_way_race_orders_by_key() {
        let mut b = engine("b", &["a", "c"]);

        assert_eq!(b.begin_request(), 1);

        // a ties on timestamp and wins on id; c is later and waits.
        assert!(b.on_request(1, id("a")).is_some());
        assert_eq!(b.on_request(2, id("c")), None);

        assert!(!b.on_reply(5, id("a")));
        assert!(b.on_reply(6, id("c")));

        b.enter();

        let flushed = b.release();

        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].0, id("c"));
    }

    #[test]
    fn stray_reply_discarded() {
        let mut a = engine("a", &["b"]);

        assert!(!a.on_reply(3, id("b")));

        // The anomaly advanced the clock but not the state machine.
        assert_eq!(a.begin_request(), 5);
    }

    #[test]
    fn duplicate_replies_do_not_complete() {
        let mut a = engine("a", &["b", "c"]);

        a.begin_request();

        assert!(!a.on_reply(2, id("b")));
        assert!(!a.on_reply(3, id("b")));
        assert!(a.on_reply(4, id("c")));
    }

    #[test]
    fn unknown_sender_discarded() {
        let mut a = engine("a", &["b"]);

        assert_eq!(a.on_request(1, id("z")), None);

        a.begin_request();

        assert!(!a.on_reply(2, id("z")));
        assert!(a.on_reply(3, id("b")));

        a.enter();

        // The unknown sender was never deferred, so nothing flushes.
        assert!(a.release().is_empty());
    }

    #[test]
    fn release_flushes_every_deferral_with_fresh_timestamps() {
        let mut a = engine("a", &["b", "c"]);

        a.begin_request();
        assert!(!a.on_reply(5, id("b")));
        assert!(a.on_reply(6, id("c")));
        a.enter();

        assert_eq!(a.on_request(7, id("b")), None);
        assert_eq!(a.on_request(8, id("c")), None);

        let flushed = a.release();

        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].0, id("b"));
        assert_eq!(flushed[1].0, id("c"));

        // Each flushed reply outruns everything observed so far.
        assert!(flushed[0].1 > 8);
        assert!(flushed[1].1 > flushed[0].1);
    }

    #[test]
    #[should_panic(expected = "acquire while")]
    fn acquire_twice_is_fatal() {
        let mut a = engine("a", &["b"]);

        a.begin_request();
        a.begin_request();
    }

    #[test]
    #[should_panic(expected = "release while")]
    fn release_without_hold_is_fatal() {
        let mut a = engine("a", &["b"]);

        a.release();
    }

    #[test]
    #[should_panic(expected = "enter before all replies")]
    fn enter_without_quorum_is_fatal() {
        let mut a = engine("a", &["b"]);

        a.begin_request();
        a.enter();
    }
}
