//! Group chat over TCP.
//!
//! Lines typed on stdin are sent to the group. Commands:
//!
//! - `/peers` - list members and their connectivity
//! - `/file <path>` - share a file
//! - `/quit` - leave (the profile, if any, is saved)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use zeroize::Zeroize;

use meshchat::crypto::{derive_group_network, UserIdentity};
use meshchat::mesh::store::MessageType;
use meshchat::mesh::transport::{StaticDiscovery, TcpConnectionManager};
use meshchat::mesh::{Endpoint, MeshConfig, MeshContext, MeshEvent, MeshNetwork, MeshNode, NodeState};

use super::{load_profile, prompt_passphrase, CommandExecutor};

/// Join a group chat over TCP.
#[derive(Args, Debug)]
pub struct GroupCommand {
    /// Group name (case-insensitive)
    pub name: String,

    /// Shared secret of the group (prompted when omitted)
    #[arg(short, long)]
    pub secret: Option<String>,

    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:7370")]
    pub listen: String,

    /// Bootstrap peer endpoint (repeatable), e.g. 192.168.1.10:7370
    #[arg(short, long = "peer")]
    pub peers: Vec<Endpoint>,

    /// Passphrase-protected profile to use and update
    #[arg(long)]
    pub profile: Option<PathBuf>,

    /// Display name when running without a profile
    #[arg(short = 'n', long, default_value = "anonymous")]
    pub display_name: String,

    /// Only connect to peers on the local network
    #[arg(long)]
    pub local_only: bool,

    /// Config file (default: <config dir>/meshchat/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl CommandExecutor for GroupCommand {
    fn execute(&self) -> Result<()> {
        let config = match &self.config {
            Some(path) => MeshConfig::load(path)?,
            None => MeshConfig::load_default()?,
        };
        let profile = match &self.profile {
            Some(path) => Some(load_profile(path)?),
            None => None,
        };
        let secret = match &self.secret {
            Some(secret) => secret.clone(),
            None => prompt_passphrase("Group secret: ")?,
        };
        if secret.is_empty() {
            bail!("Group secret must not be empty");
        }

        let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
        rt.block_on(self.run(config, profile, secret))
    }
}

impl GroupCommand {
    async fn run(
        &self,
        config: MeshConfig,
        profile: Option<(NodeState, String)>,
        secret: String,
    ) -> Result<()> {
        let connections = TcpConnectionManager::bind(self.listen.as_str())
            .await
            .with_context(|| format!("Failed to listen on {}", self.listen))?;
        let local_addr = connections.local_addr();

        let (identity, state, passphrase) = match profile {
            Some((mut state, passphrase)) => {
                let identity = UserIdentity::from_secret_bytes(&state.identity_secret);
                state.identity_secret.zeroize();
                (identity, Some(state), Some(passphrase))
            }
            None => (UserIdentity::generate(), None, None),
        };

        let mut builder = MeshContext::builder(identity, config)
            .connections(Arc::new(connections))
            .discovery(Arc::new(StaticDiscovery::new(self.peers.clone())));
        builder = match &state {
            Some(state) => builder.profile(state.profile.clone()),
            None => builder.display_name(self.display_name.as_str()),
        };
        let ctx = builder.build()?;
        let node = MeshNode::new(ctx);

        if let Some(state) = state {
            node.restore_networks(state.networks)?;
        }
        let network = self.join(&node, &secret)?;

        println!("Listening on {}", local_addr);
        println!("User id: {}", node.user_id());
        println!("Joined group '{}'. Type /quit to leave.", network.network_name());

        let printer = tokio::spawn(print_events(network.clone()));
        let result = chat_loop(&network).await;
        printer.abort();

        node.shutdown().await;
        if let (Some(path), Some(passphrase)) = (&self.profile, passphrase) {
            node.save(path, &passphrase)
                .with_context(|| format!("Failed to save profile {}", path.display()))?;
        }
        result
    }

    /// Reuses a saved network for this group or creates a new one.
    fn join(&self, node: &Arc<MeshNode>, secret: &str) -> Result<Arc<MeshNetwork>> {
        let network_id = derive_group_network(&self.name, secret).network_id;
        let network = match node.get_network(&network_id) {
            Some(network) => {
                if !network.is_online() {
                    network.go_online();
                }
                network
            }
            None => node.create_group_network(&self.name, secret, self.local_only)?,
        };
        Ok(network)
    }
}

async fn chat_loop(network: &Arc<MeshNetwork>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/peers", _) => print_peers(network),
            ("/file", path) => {
                if path.is_empty() {
                    eprintln!("usage: /file <path>");
                    continue;
                }
                if let Err(e) = network.send_file_attachment(Path::new(path), "").await {
                    eprintln!("Failed to share {}: {}", path, e);
                }
            }
            (cmd, _) if cmd.starts_with('/') => eprintln!("Unknown command {}", cmd),
            _ => {
                network.send_text_message(line).await?;
            }
        }
    }
    Ok(())
}

fn print_peers(network: &MeshNetwork) {
    for peer in network.peers() {
        if peer.is_self() {
            continue;
        }
        let state = if peer.is_online() { "online" } else { "offline" };
        println!(
            "  {:<20} {} {:?} ({} sessions)",
            peer.name_or_id(),
            state,
            peer.connectivity_status(),
            peer.sessions().len()
        );
    }
}

async fn print_events(network: Arc<MeshNetwork>) {
    let mut events = network.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                eprintln!("({} events missed)", missed);
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match event {
            MeshEvent::MessageReceived { message, .. } => {
                let Some(sender) = message.sender_user_id else {
                    println!("* {}", message.message_text);
                    continue;
                };
                if sender == network.local_user_id() {
                    continue;
                }
                let name = network
                    .peer(&sender)
                    .map(|p| p.name_or_id())
                    .unwrap_or_else(|| sender.short());
                match (&message.message_type, &message.file_attachment) {
                    (MessageType::FileAttachment, Some(file)) => println!(
                        "<{}> shared {} ({} bytes) as message {}",
                        name, file.file_name, file.file_size, message.message_number
                    ),
                    _ => println!("<{}> {}", name, message.message_text),
                }
            }
            MeshEvent::PeerTyping { peer_user_id, .. } => {
                if let Some(peer) = network.peer(&peer_user_id) {
                    println!("({} is typing)", peer.name_or_id());
                }
            }
            MeshEvent::PeerConnectivityChanged {
                peer_user_id,
                status,
                ..
            } => {
                if let Some(peer) = network.peer(&peer_user_id) {
                    println!("({} connectivity: {:?})", peer.name_or_id(), status);
                }
            }
            MeshEvent::NetworkStatusChanged { status, .. } => println!("(network {:?})", status),
            _ => {}
        }
    }
}
