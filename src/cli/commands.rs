//! CLI command definitions

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "token-tables")]
#[command(about = "Session and transferable token ledger", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Prefix that marks session tokens
    #[arg(long, env = "TOKEN_TABLES_SESSION_PREFIX", default_value = "user+", global = true)]
    pub session_prefix: String,

    /// Session timeout in seconds
    #[arg(long, env = "TOKEN_TABLES_SESSION_TIMEOUT", default_value_t = 3600, global = true)]
    pub session_timeout: u64,

    /// Transition token timeout in seconds (unlimited when unset)
    #[arg(long, env = "TOKEN_TABLES_TOKEN_TIMEOUT", global = true)]
    pub token_timeout: Option<u64>,

    /// Bound on a single store call, in milliseconds
    #[arg(long, env = "TOKEN_TABLES_STORE_TIMEOUT_MS", default_value_t = 5000, global = true)]
    pub store_timeout_ms: u64,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print fresh tokens
    ///
    /// Examples:
    ///   token-tables mint
    ///   token-tables mint --prefix user+ --count 3
    Mint {
        /// Prefix for the generated tokens
        #[arg(short, long)]
        prefix: Option<String>,

        /// How many tokens to print
        #[arg(short, long, default_value_t = 1, value_parser = parse_count)]
        count: usize,
    },

    /// Run a transfer between two owners against an in-memory store
    ///
    /// Opens a session for each owner, gives the first a carried token,
    /// transfers it to the second, ends the second's session, and prints the
    /// ledger after every step.
    Demo {
        /// Owner that starts with the token
        #[arg(long, default_value = "alice")]
        owner: String,

        /// Owner that receives the token
        #[arg(long, default_value = "bob")]
        receiver: String,

        /// Value carried by the token (JSON is stored structured)
        #[arg(long, default_value = "{\"seat\":\"14C\"}")]
        payload: String,
    },
}

fn parse_count(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("count must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("Invalid count: {}", s)),
    }
}
