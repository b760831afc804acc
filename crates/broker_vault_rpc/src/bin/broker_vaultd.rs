//! broker-vaultd — runs the vault RPC server (component B) over a Unix
//! socket. Configuration is environment-variable driven (spec.md §6):
//! `VAULT_PATH`, `VAULT_PASSPHRASE`, `VAULT_SOCKET_PATH`.

use broker_vault::VaultStore;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let vault_path = std::env::var("VAULT_PATH").unwrap_or_else(|_| "./runtime/vault.json".into());
    let socket_path = std::env::var("VAULT_SOCKET_PATH").unwrap_or_else(|_| "./runtime/vault.sock".into());
    let passphrase = std::env::var("VAULT_PASSPHRASE")
        .map_err(|_| "VAULT_PASSPHRASE must be set")?;

    let store = VaultStore::open(PathBuf::from(&vault_path), &passphrase)?;
    tracing::info!(vault_path = %vault_path, socket_path = %socket_path, "broker-vaultd starting");

    broker_vault_rpc::serve(PathBuf::from(&socket_path), store).await?;
    Ok(())
}
