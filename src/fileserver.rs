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

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tokio::sync::RwLock;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, LinesCodec};

use futures::sink::SinkExt;

use crate::error::LockstepResult;
use crate::protocol::LogCommand;

/// Host of the shared chat log.
///
/// Serves one command per connection: `POST <message>` appends and answers
/// `OK`; `VIEW` answers `OK` and streams the log lines before closing.
/// Failures answer `ERR <reason>`. Write serialization across nodes is the
/// mutual-exclusion layer's job, not this server's.
pub struct FileServer {
    /// TCP listener bind for the file server.
    listener: TcpListener,

    /// Shared data between client handlers and the server.
    ///
    /// Only the log is mutable, so it alone carries the RwLock.
    shared: Arc<Shared>,
}

struct Shared {
    log: RwLock<ChatLog>,
}

/// The append-only chat log on disk, one message per line.
struct ChatLog {
    path: PathBuf,
}

impl ChatLog {
    async fn append(&mut self, message: &str) -> LockstepResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(message.as_bytes()).await?;
        file.write_all(b"\n").await?;

        Ok(())
    }

    async fn snapshot(&self) -> LockstepResult<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents),
            // No post yet; an empty log, not an error.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl FileServer {
    pub async fn new<A>(addr: A, log_path: PathBuf) -> LockstepResult<Self>
    where
        A: ToSocketAddrs,
    {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            shared: Arc::new(Shared {
                log: RwLock::new(ChatLog { path: log_path }),
            }),
        })
    }

    pub fn local_addr(&self) -> LockstepResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until ctrl-c.
    pub async fn up(&mut self) -> LockstepResult<()> {
        info!("Started serving the chat log");

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => {
                    // Exit to main
                    return Ok(());
                }
                Ok((stream, addr)) = self.listener.accept() => {
                    debug!("Client has connected (addr = {})", addr);

                    let shared = self.shared.clone();

                    tokio::spawn(async move {
                        process_client(stream, addr, shared).await;
                    });
                }
            }
        }
    }
}

/// Serve one command; the response ends when the connection closes.
async fn process_client(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) {
    let mut frame = LinesCodec::new().framed(stream);

    let line = match frame.next().await {
        Some(Ok(line)) => line,
        Some(Err(e)) => {
            warn!("Dropping client (addr = {}): {}", addr, e);
            return;
        }
        None => return,
    };

    match LogCommand::parse(&line) {
        Ok((_, LogCommand::Post(message))) => {
            let outcome = shared.log.write().await.append(&message).await;

            let response = match outcome {
                Ok(()) => {
                    info!("Posted message (addr = {})", addr);

                    "OK".to_string()
                }
                Err(e) => {
                    error!("Append failed (addr = {}): {}", addr, e);

                    format!("ERR {}", e)
                }
            };

            if let Err(e) = frame.send(response).await {
                warn!("Response write failed (addr = {}): {}", addr, e);
            }
        }
        Ok((_, LogCommand::View)) => match shared.log.read().await.snapshot().await {
            Ok(contents) => {
                debug!(
                    "Viewed log (addr = {}) (bytes = {})",
                    addr,
                    contents.len()
                );

                // Status line first, so clients can tell a failure from
                // log content.
                if let Err(e) = frame.send("OK".to_string()).await {
                    warn!("Response write failed (addr = {}): {}", addr, e);
                    return;
                }

                for line in contents.lines() {
                    if let Err(e) = frame.send(line.to_string()).await {
                        warn!("Response write failed (addr = {}): {}", addr, e);
                        break;
                    }
                }
            }
            Err(e) => {
                error!("Log read failed (addr = {}): {}", addr, e);

                let _ = frame.send(format!("ERR {}", e)).await;
            }
        },
        Err(_) => {
            warn!("Malformed command (addr = {}) (line = {:?})", addr, line);

            let _ = frame.send("ERR malformed command".to_string()).await;
        }
    }
}
