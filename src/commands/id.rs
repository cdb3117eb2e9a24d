//! Show the identity stored in a profile.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use zeroize::Zeroize;

use meshchat::crypto::{masked_user_id, UserIdentity};

use super::{default_profile_path, load_profile, CommandExecutor};

/// Print the user id, masked id and networks of a profile.
#[derive(Args, Debug)]
pub struct IdCommand {
    /// Profile file (default: <data dir>/meshchat/profile.bin)
    #[arg(short, long)]
    pub profile: Option<PathBuf>,
}

impl CommandExecutor for IdCommand {
    fn execute(&self) -> Result<()> {
        let path = match &self.profile {
            Some(path) => path.clone(),
            None => default_profile_path()?,
        };
        let (mut state, _) = load_profile(&path)?;

        let user_id = UserIdentity::from_secret_bytes(&state.identity_secret).user_id();
        state.identity_secret.zeroize();

        println!("Name:      {}", state.profile.display_name);
        println!("User id:   {}", user_id);
        println!("Masked id: {}", masked_user_id(&user_id));

        if !state.networks.is_empty() {
            println!();
            println!("Networks:");
            for network in &state.networks {
                let name = network.network_name.as_deref().unwrap_or("(private)");
                println!(
                    "  {} {:<20} {:?}",
                    network.network_id.short(),
                    name,
                    network.status
                );
            }
        }
        Ok(())
    }
}
