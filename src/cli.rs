use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;
use crate::models::MeterKind;

#[derive(Debug, Parser)]
#[command(name = "eon-sync", version, about = "Sync E.ON Next smart meter consumption into SQLite")]
pub struct Cli {
    /// SQLite database file (overrides database.path).
    #[arg(long, global = true)]
    pub db: Option<String>,

    /// Extra configuration file layered over config/default.
    #[arg(long, global = true, env = "EON_SYNC_CONFIG")]
    pub config: Option<String>,

    /// E.ON Next account email.
    #[arg(long, global = true, env = "EON_USERNAME")]
    pub username: Option<String>,

    /// E.ON Next account password.
    #[arg(long, global = true, env = "EON_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Fetch new consumption data and merge it into the local database.
    Sync {
        /// Meter serial (required when the account has more than one meter).
        #[arg(long)]
        meter: Option<String>,

        /// Days of history to fetch on the first run (else sync.default_horizon_days).
        #[arg(long)]
        days: Option<i64>,

        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Write stored records as CSV.
    Export {
        /// Meter serial (optional when the database holds a single meter).
        #[arg(long)]
        meter: Option<String>,

        /// Only export intervals from the last N days.
        #[arg(long)]
        days: Option<i64>,

        /// Output file (stdout when omitted).
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Merge a CSV file in the export layout into the database.
    Import {
        /// CSV file to read.
        path: PathBuf,

        /// Meter serial the rows belong to.
        #[arg(long)]
        meter: String,

        #[arg(long, default_value = "electricity")]
        kind: MeterKind,
    },

    /// Summarise stored consumption.
    Stats {
        #[arg(long)]
        meter: Option<String>,

        /// Restrict to the last N days.
        #[arg(long)]
        days: Option<i64>,
    },

    /// List meters on the account.
    Meters,
}

impl Cli {
    /// Flags win over every configuration layer
    pub fn apply(&self, config: &mut Config) {
        if let Some(ref db) = self.db {
            config.database.path = db.clone();
        }
        if let Some(ref username) = self.username {
            config.api.username = Some(username.clone());
        }
        if let Some(ref password) = self.password {
            config.api.password = Some(password.clone());
        }
    }
}
