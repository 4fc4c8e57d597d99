//! CLI argument definitions for grantbridge.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sources` | List sources, credential resolution and breaker status |
//! | `fetch` | Fetch opportunities from one source |
//! | `search` | Search across sources and merge the results |
//!
//! # Examples
//!
//! ```bash
//! grantbridge sources --pretty
//! grantbridge fetch grants_gov --query "rural health" --limit 10
//! grantbridge search "arts education" --source candid --source grants_gov --filter state=NM
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Funding-opportunity aggregation across unreliable upstream sources.
#[derive(Debug, Parser)]
#[command(name = "grantbridge", author, version, about)]
pub struct Cli {
    /// TOML configuration file. Environment overrides apply either way.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Pretty-print JSON output.
    #[arg(long, global = true)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List configured sources with credential and circuit status.
    Sources(SourcesArgs),
    /// Fetch opportunities from a single source.
    Fetch(FetchArgs),
    /// Search every enabled source (or the selected ones) and merge results.
    Search(SearchArgs),
}

#[derive(Debug, Args)]
pub struct SourcesArgs {
    /// Only report this source.
    #[arg(long)]
    pub source: Option<String>,
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Source id, e.g. `grants_gov`.
    pub source: String,

    #[arg(long, default_value = "")]
    pub query: String,

    #[command(flatten)]
    pub shared: QueryArgs,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    pub query: String,

    /// Restrict the search to these sources. Repeatable.
    #[arg(long = "source", value_name = "ID")]
    pub sources: Vec<String>,

    #[command(flatten)]
    pub shared: QueryArgs,
}

#[derive(Debug, Args)]
pub struct QueryArgs {
    /// Filter as `key=value`. Repeatable.
    #[arg(long = "filter", value_name = "KEY=VALUE", value_parser = parse_filter)]
    pub filters: Vec<(String, String)>,

    /// Maximum records per source.
    #[arg(long)]
    pub limit: Option<usize>,
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.trim().is_empty() {
        return Err(String::from("filter key cannot be empty"));
    }
    Ok((key.trim().to_owned(), value.trim().to_owned()))
}
