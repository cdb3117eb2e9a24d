//! Identity generation command.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Args;

use meshchat::crypto::{masked_user_id, UserIdentity};
use meshchat::mesh::state::NODE_STATE_VERSION;
use meshchat::mesh::{NodeState, PeerProfile};

use super::{default_profile_path, prompt_new_passphrase, CommandExecutor};

/// Generate a new identity and store it in a passphrase-protected profile.
#[derive(Args, Debug)]
pub struct KeygenCommand {
    /// Profile file to create (default: <data dir>/meshchat/profile.bin)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Display name shown to other peers
    #[arg(short, long)]
    pub name: String,

    /// Overwrite an existing profile
    #[arg(long)]
    pub force: bool,
}

impl CommandExecutor for KeygenCommand {
    fn execute(&self) -> Result<()> {
        let path = match &self.output {
            Some(path) => path.clone(),
            None => default_profile_path()?,
        };
        if path.exists() && !self.force {
            bail!(
                "Profile {} already exists (use --force to overwrite)",
                path.display()
            );
        }

        let identity = UserIdentity::generate();
        let profile = PeerProfile {
            display_name: self.name.clone(),
            date_modified: Utc::now(),
            ..PeerProfile::default()
        };
        let state = NodeState {
            version: NODE_STATE_VERSION,
            identity_secret: identity.secret_bytes(),
            profile,
            networks: Vec::new(),
        };

        let passphrase = prompt_new_passphrase()?;
        state
            .save(&path, &passphrase)
            .with_context(|| format!("Failed to save profile {}", path.display()))?;

        let user_id = identity.user_id();
        println!("Identity generated successfully:");
        println!();
        println!("  Profile:   {}", path.display());
        println!("  User id:   {}", user_id);
        println!("  Masked id: {}", masked_user_id(&user_id));
        println!();
        println!("Share your user id with people who want to invite you to a private chat.");
        println!("Keep the profile passphrase secret; it protects your identity key.");

        Ok(())
    }
}
