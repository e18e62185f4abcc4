use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use parley_proto::{Envelope, UserId};
use std::path::PathBuf;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::telemetry::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "parley-relay")]
#[command(about = "Parley signaling relay and debug probe")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Interface to bind (overrides PARLEY_RELAY_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to listen on (overrides PARLEY_RELAY_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Minimum log level
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a running relay as a user and issue one request
    Probe {
        /// Relay URL (e.g., ws://localhost:8080/ws)
        #[arg(long, default_value = "ws://localhost:8080/ws")]
        url: String,

        /// Identity to register as
        #[arg(short = 'u', long)]
        user: String,

        #[command(subcommand)]
        command: ProbeCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProbeCommands {
    /// List other reachable users
    Users,

    /// Send a text message through the relay
    Send {
        /// Recipient identity
        #[arg(short, long)]
        to: String,

        /// Message body
        text: String,
    },

    /// Print every envelope addressed to this user until interrupted
    Listen,
}

pub async fn run_probe(url: String, user: String, command: ProbeCommands) -> Result<()> {
    debug!(%url, %user, "probe connecting");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!(%url, error = %e, "failed to connect");
            return Err(anyhow!("connection failed: {e}"));
        }
        Err(_) => {
            error!(%url, "connection timeout after 5 seconds");
            return Err(anyhow!("connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();
    let identity = UserId::from(user);

    let register = Envelope::Register {
        user_id: identity.clone(),
    };
    write.send(Message::Text(register.encode()?.into())).await?;

    let online = timeout(Duration::from_secs(5), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                if let Ok(Envelope::Registered { online_users, .. }) =
                    Envelope::decode(text.as_str())
                {
                    return Ok::<_, anyhow::Error>(online_users);
                }
            }
        }
        Err(anyhow!("connection closed before registration was acknowledged"))
    })
    .await
    .map_err(|_| anyhow!("timeout waiting for registration ack"))??;
    debug!(online = online.len(), "registered");

    match command {
        ProbeCommands::Users => {
            let request = Envelope::GetUsers {
                user_id: identity.clone(),
            };
            write.send(Message::Text(request.encode()?.into())).await?;
            let users = timeout(Duration::from_secs(5), async {
                while let Some(msg) = read.next().await {
                    if let Message::Text(text) = msg? {
                        if let Ok(Envelope::UsersList { users }) = Envelope::decode(text.as_str())
                        {
                            return Ok::<_, anyhow::Error>(users);
                        }
                    }
                }
                Err(anyhow!("connection closed before users-list arrived"))
            })
            .await
            .map_err(|_| anyhow!("timeout waiting for users-list"))??;

            if users.is_empty() {
                println!("no other users online");
            }
            for user in users {
                println!("{}", user.id);
            }
        }
        ProbeCommands::Send { to, text } => {
            let message = Envelope::text(identity.clone(), UserId::from(to), text);
            write.send(Message::Text(message.encode()?.into())).await?;
            println!("sent");
        }
        ProbeCommands::Listen => {
            while let Some(msg) = read.next().await {
                match msg? {
                    Message::Text(text) => println!("{}", text.as_str()),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            return Ok(());
        }
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_probe_send() {
        let cli = Cli::parse_from([
            "parley-relay",
            "--log-level",
            "debug",
            "probe",
            "--user",
            "alice",
            "send",
            "--to",
            "bob",
            "hello",
        ]);
        assert_eq!(cli.log_level, LogLevel::Debug);
        match cli.command {
            Some(Commands::Probe {
                user,
                command: ProbeCommands::Send { to, text },
                ..
            }) => {
                assert_eq!(user, "alice");
                assert_eq!(to, "bob");
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn command_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::parse_from(["parley-relay", "probe", "-u", "alice", "users"]);
        match cli.command {
            Some(Commands::Probe { url, user, command }) => {
                assert_eq!(url, "ws://localhost:8080/ws");
                assert_eq!(user, "alice");
                assert!(matches!(command, ProbeCommands::Users));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn no_subcommand_runs_server() {
        let cli = Cli::parse_from(["parley-relay", "--port", "9000"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9000));
    }
}
