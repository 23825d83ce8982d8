//! CLI module - Command-line interface for ticktrack
//!
//! This module provides a structured CLI using clap for argument parsing.

mod commands;

use clap::{Parser, Subcommand};

/// ticktrack - Time tracking server with live timer sync
#[derive(Parser)]
#[command(name = "ticktrack")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP and push server (default)
    #[command(alias = "daemon")]
    Serve,

    /// Register a user without going through the web signup
    CreateUser {
        /// Username to register
        username: String,
        /// Password; read from stdin when omitted
        #[arg(long)]
        password: Option<String>,
    },

    /// Log a user out on every device
    RevokeSessions {
        /// Username whose sessions are removed
        username: String,
    },

    /// Create default config file
    #[command(alias = "init")]
    InitConfig,
}

pub use commands::*;
