//! token-tables CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use token_tables::{
    MemoryStore, OwnershipKey, TablesConfig, TokenFactory, TokenTables, TokenValue,
    TransitionToken,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = TablesConfig::new()
        .session_prefix(cli.session_prefix.clone())
        .session_timeout(Duration::from_secs(cli.session_timeout))
        .store_timeout(Duration::from_millis(cli.store_timeout_ms));
    if let Some(secs) = cli.token_timeout {
        config = config.token_timeout(Duration::from_secs(secs));
    }

    match cli.command {
        Commands::Mint { prefix, count } => mint(&config, prefix, count),
        Commands::Demo { owner, receiver, payload } => demo(config, owner, receiver, payload).await,
    }
}

fn mint(config: &TablesConfig, prefix: Option<String>, count: usize) -> Result<()> {
    let factory = TokenFactory::new().session_prefix(config.session_prefix.clone());

    for _ in 0..count {
        let token = factory.create_token(prefix.as_deref());
        println!("{}\t{}", token.kind(), token);
    }

    Ok(())
}

async fn demo(config: TablesConfig, owner: String, receiver: String, payload: String) -> Result<()> {
    if owner == receiver {
        anyhow::bail!("--owner and --receiver must differ");
    }

    let store = Arc::new(MemoryStore::new());
    let tables = TokenTables::with_config(store.clone(), config);

    let owner = OwnershipKey::new(owner);
    let receiver = OwnershipKey::new(receiver);
    let owner_session = tables.create_session_token();
    let receiver_session = tables.create_session_token();

    tables
        .add_session(&owner_session, &owner, None)
        .await
        .with_context(|| format!("Failed to open session for {}", owner))?;
    tables
        .add_session(&receiver_session, &receiver, None)
        .await
        .with_context(|| format!("Failed to open session for {}", receiver))?;

    let token = tables
        .create_token(None)
        .into_transition()
        .context("Factory produced a session token for an unprefixed request")?;

    // JSON payloads are kept structured, anything else is stored as is
    let value = match serde_json::from_str::<serde_json::Value>(&payload) {
        Ok(json) => TokenValue::Structured(json),
        Err(_) => TokenValue::Raw(payload),
    };

    tables
        .add_transferable_token(&token, value, &owner)
        .await
        .context("Failed to add transferable token")?;
    print_ledger(&tables, "token added", &[&owner, &receiver], &token).await?;

    tables
        .transfer_token(&token, &owner, &receiver)
        .await
        .context("Transfer failed")?;
    print_ledger(&tables, "token transferred", &[&owner, &receiver], &token).await?;

    tables
        .destroy_session(&receiver_session)
        .await
        .context("Failed to end receiver session")?;
    print_ledger(&tables, "receiver session ended", &[&owner, &receiver], &token).await?;

    println!("Unassigned: {}", join(&tables.list_unassigned_tokens().await));

    tables
        .adopt_token(&token, &owner)
        .await
        .context("Adoption failed")?;
    print_ledger(&tables, "token adopted", &[&owner, &receiver], &token).await?;

    let stats = tables.stats().await;
    info!(
        sessions = stats.sessions,
        cached = stats.cached_values,
        store_sessions = store.session_count(),
        store_values = store.value_count(),
        "Demo finished"
    );

    Ok(())
}

async fn print_ledger(
    tables: &TokenTables,
    step: &str,
    owners: &[&OwnershipKey],
    token: &TransitionToken,
) -> Result<()> {
    println!("== {} ==", step);

    for owner in owners {
        match tables.session_for_owner(owner).await {
            Some(session) => {
                let carried = tables.carried_tokens(&session).await;
                println!("  {} -> {} (carried: {})", owner, session, join(&carried));
            }
            None => println!("  {} -> (no session)", owner),
        }
    }

    let value = tables
        .transition_token_is_active(token)
        .await
        .context("Failed to read token value")?;
    let holder = tables
        .from_token(token)
        .await
        .map(|o| o.to_string())
        .unwrap_or_else(|| "(orphaned)".to_string());
    println!("  token {} held by {}", token, holder);
    println!("  value: {}", value.as_deref().unwrap_or("(none)"));

    Ok(())
}

fn join<T: AsRef<str>>(items: &[T]) -> String {
    if items.is_empty() {
        return "none".to_string();
    }
    items.iter().map(|i| i.as_ref()).collect::<Vec<_>>().join(", ")
}

