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

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, LinesCodec};

use crate::engine::Engine;
use crate::error::{LockstepError, LockstepResult};
use crate::protocol::{NodeId, PeerMessage, Verb, MAX_LINE_LENGTH};
use crate::transport;
use crate::config::PeerAddr;

pub struct Lockstep {
    /// TCP listener bind for peer REQUEST/REPLY traffic.
    listener: TcpListener,

    /// Protocol state. The event loop is the only task that touches it,
    /// which stands in for the single mutex of the textbook presentation.
    engine: Engine,

    /// Outbound link per peer, keyed by peer id.
    ///
    /// Each link is drained by its own sender task; queue order is
    /// delivery order.
    links: HashMap<NodeId, mpsc::UnboundedSender<PeerMessage>>,

    /// Main event loop receiver.
    rx: mpsc::UnboundedReceiver<Message>,

    /// Cloned into connection readers, links, and handles.
    tx: mpsc::UnboundedSender<Message>,

    /// Completer of the acquire() currently waiting on replies.
    waiter: Option<oneshot::Sender<LockstepResult<()>>>,
}

/// Enum of message variants & data, in which is passed to the event loop
/// and computed.
pub(crate) enum Message {
    /// Parsed REQUEST/REPLY from an accepted peer connection.
    Peer(PeerMessage),

    /// acquire(): answered once every peer reply is in.
    Acquire(oneshot::Sender<LockstepResult<()>>),

    /// release(): answered once the withheld replies are queued.
    Release(oneshot::Sender<()>),

    /// A peer link ran out of delivery attempts.
    LinkDead(NodeId, String),
}

/// Caller side of the critical-section controller.
///
/// Cheap to clone; every clone feeds the same event loop.
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::UnboundedSender<Message>,
}

impl Handle {
    /// Block until this node holds the critical section.
    pub async fn acquire(&self) -> LockstepResult<()> {
        let (reply, response) = oneshot::channel();

        self.tx
            .send(Message::Acquire(reply))
            .map_err(|_| LockstepError::CoordinatorGone)?;

        response.await.map_err(|_| LockstepError::CoordinatorGone)?
    }

    /// Leave the critical section, answering every withheld peer.
    ///
    /// Only valid after acquire() returned; anything else is a fatal
    /// caller bug.
    pub async fn release(&self) -> LockstepResult<()> {
        let (ack, done) = oneshot::channel();

        self.tx
            .send(Message::Release(ack))
            .map_err(|_| LockstepError::CoordinatorGone)?;

        done.await.map_err(|_| LockstepError::CoordinatorGone)
    }
}

impl Lockstep {
    pub async fn new<A>(node_id: NodeId, addr: A) -> LockstepResult<Self>
    where
        A: ToSocketAddrs,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            engine: Engine::new(node_id),
            links: HashMap::new(),
            waiter: None,
            rx,
            tx,
        })
    }

    /// Register a peer and spawn its outbound link.
    ///
    /// The whole membership must be registered before `up()`.
    pub fn peer(&mut self, peer: PeerAddr) -> &mut Self {
        self.engine.add_peer(peer.node_id.clone());
        self.links.insert(
            peer.node_id.clone(),
            transport::spawn_link(peer, self.tx.clone()),
        );

        self
    }

    pub fn handle(&self) -> Handle {
        Handle {
            tx: self.tx.clone(),
        }
    }

    pub fn local_addr(&self) -> LockstepResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start the main event loop.
    ///
    /// Handles accepted peer connections as well as `Lockstep`.rx events.
    pub async fn up(&mut self) -> LockstepResult<()> {
        info!(
            "Started processing peer traffic (node = {})",
            self.engine.node_id()
        );

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => {
                    // Exit to main
                    return Ok(());
                }
                Ok((stream, addr)) = self.listener.accept() => {
                    debug!("Peer has connected (addr = {})", addr);

                    self.process_connection(stream, addr);
                }
                Some(message) = self.rx.recv() => {
                    match message {
                        Message::Peer(message) => self.process_message(message),
                        Message::Acquire(reply) => self.begin_acquire(reply),
                        Message::Release(ack) => self.finish_release(ack),
                        Message::LinkDead(peer, reason) => {
                            if let Some(waiter) = self.waiter.take() {
                                let _ = waiter.send(Err(LockstepError::PeerUnreachable(
                                    peer.to_string(),
                                    reason.clone(),
                                )));
                            }

                            return Err(LockstepError::PeerUnreachable(peer.to_string(), reason));
                        }
                    }
                }
            }
        }
    }

    /// Feed one accepted connection into the event loop.
    ///
    /// A malformed line or codec error closes this connection only; the
    /// peer may reconnect.
    fn process_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let mut frame = LinesCodec::new_with_max_length(MAX_LINE_LENGTH).framed(stream);

            while let Some(line) = frame.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Dropping peer connection (addr = {}): {}", addr, e);
                        break;
                    }
                };

                match PeerMessage::parse(&line) {
                    Ok((_, message)) => {
                        if tx.send(Message::Peer(message)).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        warn!("Malformed peer line (addr = {}) (line = {:?})", addr, line);
                        break;
                    }
                }
            }

            debug!("Peer connection closed (addr = {})", addr);
        });
    }

    fn process_message(&mut self, message: PeerMessage) {
        match message.verb {
            Verb::Request => {
                if let Some(timestamp) = self
                    .engine
                    .on_request(message.timestamp, message.sender.clone())
                {
                    self.send_to(&message.sender, Verb::Reply, timestamp);
                }
            }
            Verb::Reply => {
                if self.engine.on_reply(message.timestamp, message.sender) {
                    self.engine.enter();

                    if let Some(waiter) = self.waiter.take() {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
        }
    }

    fn begin_acquire(&mut self, reply: oneshot::Sender<LockstepResult<()>>) {
        let timestamp = self.engine.begin_request();

        self.waiter = Some(reply);

        debug!("Requesting critical section (ts = {})", timestamp);

        let request = PeerMessage {
            verb: Verb::Request,
            timestamp,
            sender: self.engine.node_id().clone(),
        };

        for (peer, link) in &self.links {
            if link.send(request.clone()).is_err() {
                warn!("Outbound link gone (peer = {})", peer);
            }
        }
    }

    fn finish_release(&mut self, ack: oneshot::Sender<()>) {
        for (peer, timestamp) in self.engine.release() {
            self.send_to(&peer, Verb::Reply, timestamp);
        }

        let _ = ack.send(());
    }

    fn send_to(&self, peer: &NodeId, verb: Verb, timestamp: u64) {
        let message = PeerMessage {
            verb,
            timestamp,
            sender: self.engine.node_id().clone(),
        };

        match self.links.get(peer) {
            Some(link) => {
                if link.send(message).is_err() {
                    warn!("Outbound link gone (peer = {})", peer);
                }
            }
            None => warn!("No outbound link registered (peer = {})", peer),
        }
    }
}
