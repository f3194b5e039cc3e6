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

use std::io::Write;

use async_trait::async_trait;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, Framed, LinesCodec};

use futures::sink::SinkExt;

use crate::error::{LockstepError, LockstepResult};
use crate::lockstep::Handle;
use crate::protocol::LogCommand;

/// A chat-log backend the REPL can post to and read from.
#[async_trait]
pub trait LogStore {
    /// Append a message. Call only while holding the critical section.
    async fn post(&self, message: &str) -> LockstepResult<()>;

    /// Fetch the whole log. Safe at any time, no exclusion involved.
    async fn view(&self) -> LockstepResult<String>;
}

/// Log store backed by the file server, one connection per command.
pub struct RemoteLog {
    addr: String,
}

impl RemoteLog {
    pub fn new(addr: String) -> Self {
        Self { addr }
    }

    async fn connect(&self) -> LockstepResult<Framed<TcpStream, LinesCodec>> {
        Ok(LinesCodec::new().framed(TcpStream::connect(&self.addr).await?))
    }
}

#[async_trait]
impl LogStore for RemoteLog {
    async fn post(&self, message: &str) -> LockstepResult<()> {
        let mut frame = self.connect().await?;

        frame
            .send(LogCommand::Post(message.to_string()).to_line())
            .await?;

        match frame.next().await {
            Some(Ok(line)) if line == "OK" => Ok(()),
            Some(Ok(line)) => Err(LockstepError::ServerRejected(line)),
            Some(Err(e)) => Err(e.into()),
            None => Err(LockstepError::ConnectionClosed),
        }
    }

    async fn view(&self) -> LockstepResult<String> {
        let mut frame = self.connect().await?;

        frame.send(LogCommand::View.to_line()).await?;

        match frame.next().await {
            Some(Ok(line)) if line == "OK" => (),
            Some(Ok(line)) => return Err(LockstepError::ServerRejected(line)),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(LockstepError::ConnectionClosed),
        }

        let mut contents = String::new();

        while let Some(line) = frame.next().await {
            contents.push_str(&line?);
            contents.push('\n');
        }

        Ok(contents)
    }
}

/// A parsed REPL line.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    View,
    Post(String),
    Exit,
}

impl Command {
    /// `view` / `post <text>` / `exit`; anything else is None.
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim();

        if line == "view" {
            return Some(Command::View);
        }

        if line == "exit" {
            return Some(Command::Exit);
        }

        if let Some(text) = line.strip_prefix("post ") {
            let text = text.trim();

            if !text.is_empty() {
                return Some(Command::Post(text.to_string()));
            }
        }

        None
    }
}

/// Drive the chat loop over stdin until `exit` or end of input.
///
/// `post` runs acquire, append, release; the section is released even when
/// the append fails. `view` goes straight to the file server.
pub async fn repl<S>(handle: Handle, store: S) -> LockstepResult<()>
where
    S: LogStore,
{
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    prompt()?;

    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Some(Command::View) => match store.view().await {
                Ok(contents) => print!("{}", contents),
                Err(e) => eprintln!("view failed: {}", e),
            },
            Some(Command::Post(text)) => {
                handle.acquire().await?;

                let posted = store.post(&text).await;

                handle.release().await?;

                if let Err(e) = posted {
                    eprintln!("post failed: {}", e);
                }
            }
            Some(Command::Exit) => return Ok(()),
            None => println!("commands: view | post <text> | exit"),
        }

        prompt()?;
    }

    Ok(())
}

fn prompt() -> LockstepResult<()> {
    print!("> ");
    std::io::stdout().flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn parse_view() {
        assert_eq!(Command::parse("view"), Some(Command::View));
        assert_eq!(Command::parse("  view  "), Some(Command::View));
    }

    #[test]
    fn parse_exit() {
        assert_eq!(Command::parse("exit"), Some(Command::Exit));
    }

    #[test]
    fn parse_post_keeps_inner_spacing() {
        assert_eq!(
            Command::parse("post hello out there"),
            Some(Command::Post("hello out there".to_string()))
        );
    }

    #[test]
    fn parse_empty_post_rejected() {
        assert_eq!(Command::parse("post"), None);
        assert_eq!(Command::parse("post   "), None);
    }

    #[test]
    fn parse_unknown_rejected() {
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("viewx"), None);
        assert_eq!(Command::parse("quit"), None);
    }

    #[tokio::test]
    async fn view_error_status_is_surfaced() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // A server whose only answer is an error status line.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut frame = LinesCodec::new().framed(stream);

            let _ = frame.next().await;
            frame.send("ERR boom".to_string()).await.unwrap();
        });

        let store = RemoteLog::new(addr.to_string());

        assert!(matches!(
            store.view().await,
            Err(LockstepError::ServerRejected(_))
        ));
    }
}
