//! Keygen command - generate an onion identity
//!
//! Prints the address and, with `--out`, writes the files a Tor daemon
//! expects in its service directory.

use super::KeygenArgs;
use crate::agent::fs::ensure_private_dir;
use crate::crypto::OnionIdentity;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Write `hostname` and both key files into `dir`
fn write_identity(identity: &OnionIdentity, dir: &Path) -> Result<()> {
    ensure_private_dir(dir)?;

    let files = [
        ("hostname", format!("{}\n", identity.onion_address()).into_bytes()),
        ("hs_ed25519_public_key", identity.public_key_file()),
        ("hs_ed25519_secret_key", identity.private_key_file()),
    ];
    for (name, contents) in files {
        let path = dir.join(name);
        if path.exists() {
            anyhow::bail!("Refusing to overwrite {:?}", path);
        }
        fs::write(&path, contents).with_context(|| format!("Failed to write {:?}", path))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
    }
    Ok(())
}

/// Run the keygen command
pub fn run_keygen(args: &KeygenArgs) -> Result<()> {
    let identity = OnionIdentity::generate().context("Failed to generate identity")?;
    println!("{}", identity.onion_address());

    if let Some(dir) = &args.out {
        write_identity(&identity, dir)?;
        println!("Key files written to {:?}", dir);
    }
    Ok(())
}
