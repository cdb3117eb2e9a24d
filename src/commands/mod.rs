//! CLI commands.
//!
//! One module per subcommand; `main` dispatches through [`CommandExecutor`].
//! Shared helpers handle the profile file and passphrase prompts.

mod group;
mod id;
mod keygen;

pub use group::GroupCommand;
pub use id::IdCommand;
pub use keygen::KeygenCommand;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use meshchat::mesh::NodeState;

/// A parsed subcommand that can run itself.
pub trait CommandExecutor {
    fn execute(&self) -> Result<()>;
}

/// Default profile location: `<data dir>/meshchat/profile.bin`.
fn default_profile_path() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("meshchat").join("profile.bin"))
        .context("Could not determine the data directory")
}

/// Prompt for a passphrase (input hidden).
fn prompt_passphrase(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).context("Failed to read passphrase")
}

/// Prompt twice and require both entries to match.
fn prompt_new_passphrase() -> Result<String> {
    let passphrase = prompt_passphrase("New profile passphrase: ")?;
    if passphrase.is_empty() {
        bail!("Passphrase must not be empty");
    }
    let confirm = prompt_passphrase("Repeat passphrase: ")?;
    if passphrase != confirm {
        bail!("Passphrases do not match");
    }
    Ok(passphrase)
}

/// Prompt for the passphrase and decrypt the profile at `path`.
fn load_profile(path: &Path) -> Result<(NodeState, String)> {
    if !path.exists() {
        bail!(
            "Profile {} not found. Create one with: meshchat keygen",
            path.display()
        );
    }
    let passphrase = prompt_passphrase("Profile passphrase: ")?;
    let state = NodeState::load(path, &passphrase)
        .with_context(|| format!("Failed to open profile {}", path.display()))?;
    Ok((state, passphrase))
}
