use anyhow::Context;
use std::io::Write;
use std::sync::Arc;

use crate::config::{Config, StorageBackend};
use crate::db::Store;
use crate::services::{
    AuthError, AuthService, CredentialStore, DefaultAuthService, SessionManager,
};

async fn open_store(config: &Config) -> anyhow::Result<Arc<Store>> {
    if config.storage.backend == StorageBackend::Memory {
        anyhow::bail!(
            "storage.backend is \"memory\"; user management needs the sqlite backend"
        );
    }

    let store = Store::with_pool_options(&config.storage.database_path, 1, 1)
        .await
        .with_context(|| format!("Failed to open {}", config.storage.database_path))?;
    Ok(Arc::new(store))
}

fn prompt_password() -> anyhow::Result<String> {
    print!("Password: ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}

pub async fn cmd_create_user(
    config: &Config,
    username: &str,
    password: Option<&str>,
) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let credentials = CredentialStore::new(store, config.security.clone());

    let password = match password {
        Some(p) => p.to_string(),
        None => prompt_password()?,
    };

    match credentials.register(username, &password).await {
        Ok(id) => {
            println!("✓ Created user '{}' (id {id})", username.trim());
            Ok(())
        }
        Err(AuthError::DuplicateUser) => {
            println!("User '{}' already exists.", username.trim());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn cmd_revoke_sessions(config: &Config, username: &str) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let auth = DefaultAuthService::new(
        store.clone(),
        CredentialStore::new(store.clone(), config.security.clone()),
        SessionManager::new(store, config.security.session_ttl_hours),
    );

    match auth.revoke_sessions(username).await {
        Ok(0) => println!("No active sessions for '{}'.", username.trim()),
        Ok(n) => println!("✓ Revoked {n} session(s) for '{}'", username.trim()),
        Err(AuthError::InvalidInput(msg)) => println!("{msg}"),
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
