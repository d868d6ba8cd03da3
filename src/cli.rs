use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::ledger::{EntityId, EntityKind};

/// rickdex - Rate and collect Rick and Morty cards from the terminal.
#[derive(Parser, Debug)]
#[command(name = "rickdex")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the config file (defaults to ~/.config/rickdex/config.yaml)
    #[arg(short, long, global = true, env = "RICKDEX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sign in and store credentials
    Login {
        username: String,
        #[arg(long, env = "RICKDEX_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Create an account, then sign in
    Register {
        username: String,
        #[arg(long, env = "RICKDEX_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Forget stored credentials
    Logout,

    /// Show who is signed in
    Status,

    /// Browse characters
    Characters {
        /// Number of catalog pages to load
        #[arg(long, default_value_t = 1)]
        pages: usize,

        /// Only show characters whose name contains this text
        #[arg(long)]
        search: Option<String>,
    },

    /// Browse episodes
    Episodes {
        /// Number of catalog pages to load
        #[arg(long, default_value_t = 3)]
        pages: usize,

        /// Only show episodes of this season (1-5)
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
        season: Option<u8>,
    },

    /// Show collected cards
    Collection {
        /// characters or episodes
        kind: EntityKind,

        /// Load the whole collection instead of one batch
        #[arg(long)]
        all: bool,
    },

    /// Rate a character or episode from 1 to 5
    Rate {
        kind: EntityKind,
        id: EntityId,
        #[arg(value_parser = clap::value_parser!(u8).range(1..=5))]
        rating: u8,
    },

    /// Add a card to the collection
    Collect { kind: EntityKind, id: EntityId },

    /// Remove a card from the collection
    Uncollect { kind: EntityKind, id: EntityId },

    /// Show the average rating across all users
    Average { kind: EntityKind, id: EntityId },

    /// Show or update the profile
    Profile {
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        avatar_url: Option<String>,
        #[arg(long)]
        avatar_name: Option<String>,
        #[arg(long)]
        bio: Option<String>,
    },
}
