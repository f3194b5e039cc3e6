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

#[macro_use]
extern crate log;

use std::env::var;
use std::process::exit;

mod chat;
mod clock;
mod config;
mod engine;
mod error;
mod fileserver;
mod lockstep;
mod protocol;
mod transport;

use config::Config;
use fileserver::FileServer;
use lockstep::Lockstep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config_loc = var("LOCKSTEP_CONFIG").unwrap_or("config.toml".into());

    let config: Config = toml::from_slice(&std::fs::read(config_loc)?)?;

    let role = std::env::args().nth(1).unwrap_or_else(|| "node".into());

    match role.as_str() {
        "node" => run_node(&config).await?,
        "fileserver" => run_fileserver(&config).await?,
        other => {
            eprintln!("unknown role {:?}, expected node or fileserver", other);
            exit(2);
        }
    }

    Ok(())
}

async fn run_node(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let settings = config.node()?;

    let mut node = Lockstep::new(settings.node_id.clone(), settings.bind_address.as_str()).await?;

    info!(
        "Listening for peers (node = {}) (addr = {})",
        settings.node_id,
        node.local_addr()?
    );

    for peer in &settings.peers {
        node.peer(peer.clone());
    }

    let handle = node.handle();
    let store = chat::RemoteLog::new(settings.file_server_address.clone());

    tokio::select! {
        result = node.up() => result?,
        result = chat::repl(handle, store) => result?,
    }

    Ok(())
}

async fn run_fileserver(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let settings = config.file_server()?;

    let mut server = FileServer::new(settings.bind_address.as_str(), settings.log_path).await?;

    info!("Listening for clients (addr = {})", server.local_addr()?);

    server.up().await?;

    Ok(())
}
