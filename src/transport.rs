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

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::codec::{Decoder, Framed, LinesCodec};

use futures::sink::SinkExt;

use crate::config::PeerAddr;
use crate::error::{LockstepError, LockstepResult};
use crate::lockstep::Message;
use crate::protocol::{PeerMessage, MAX_LINE_LENGTH};

/// Delivery attempts per message before the link is declared dead.
const DELIVERY_ATTEMPTS: u32 = 5;

/// Delay before the first retry; doubles on every subsequent one.
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Spawn the outbound link to one peer.
///
/// A single task drains the returned channel, so queue order is delivery
/// order and the peer observes our messages in FIFO. The connection is
/// dialed lazily on first send. Once the retry budget of a message runs
/// out, the task reports [`Message::LinkDead`] and stops.
pub(crate) fn spawn_link(
    peer: PeerAddr,
    events: mpsc::UnboundedSender<Message>,
) -> mpsc::UnboundedSender<PeerMessage> {
    let (tx_message, mut rx_message) = mpsc::unbounded_channel::<PeerMessage>();

    tokio::spawn(async move {
        let addr = peer.address();
        let mut link: Option<Framed<TcpStream, LinesCodec>> = None;

        while let Some(message) = rx_message.recv().await {
            if let Err(e) = deliver(&addr, &mut link, &message).await {
                error!(
                    "Peer link failed (peer = {}) (addr = {}): {}",
                    peer.node_id, addr, e
                );

                let _ = events.send(Message::LinkDead(peer.node_id.clone(), e.to_string()));

                break;
            }

            debug!("Delivered message (peer = {})", peer.node_id);
        }

        // Exiting this future drops the connection.
    });

    tx_message
}

/// Write one message, dialing or re-dialing as needed.
///
/// A failed write poisons the cached connection; the message is retried on
/// a fresh one until the attempt budget runs out.
async fn deliver(
    addr: &str,
    link: &mut Option<Framed<TcpStream, LinesCodec>>,
    message: &PeerMessage,
) -> LockstepResult<()> {
    let mut delay = RETRY_DELAY;
    let mut last_error = None;

    for attempt in 0..DELIVERY_ATTEMPTS {
        if attempt > 0 {
            sleep(delay).await;
            delay *= 2;
        }

        if link.is_none() {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    *link = Some(LinesCodec::new_with_max_length(MAX_LINE_LENGTH).framed(stream));
                }
                Err(e) => {
                    warn!(
                        "Connect attempt {} failed (addr = {}): {}",
                        attempt + 1,
                        addr,
                        e
                    );

                    last_error = Some(LockstepError::from(e));

                    continue;
                }
            }
        }

        if let Some(frame) = link.as_mut() {
            match frame.send(message.to_line()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Send attempt {} failed (addr = {}): {}",
                        attempt + 1,
                        addr,
                        e
                    );

                    last_error = Some(LockstepError::from(e));

                    *link = None;
                }
            }
        }
    }

    Err(last_error.unwrap_or(LockstepError::ConnectionClosed))
}
