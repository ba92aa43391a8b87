use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Deserialize;

use crate::error::Result;

const DEFAULT_CONFIG_PATH: &str = "config/spendsync.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub base_url: String,
    pub user_id: String,
    /// Bearer token for the document API.
    pub token: Option<String>,
    pub page_size: usize,
    pub poll_interval_ms: u64,
    pub cache_path: String,
    pub timezone: String,
    pub level: String,
    /// Use an in-process store seeded with sample data instead of HTTP.
    pub memory: bool,
    /// Print JSON instead of tables.
    pub json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            user_id: String::new(),
            token: None,
            page_size: engine::DEFAULT_PAGE_SIZE,
            poll_interval_ms: 2000,
            cache_path: "config/spendsync_cache.json".to_string(),
            timezone: "Europe/Rome".to_string(),
            level: "info".to_string(),
            memory: false,
            json: false,
        }
    }
}

impl AppConfig {
    /// The signed-in user, if any.
    pub fn user_id(&self) -> Option<&str> {
        Some(self.user_id.trim()).filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Parser)]
#[command(name = "spendsync", disable_version_flag = true)]
#[command(about = "Expense tracking against a remote document store")]
pub struct Args {
    /// Optional config file path (TOML).
    #[arg(long, global = true)]
    config: Option<String>,
    /// Override base URL (e.g. http://127.0.0.1:8080).
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Override the signed-in user id (the token is never read from CLI).
    #[arg(long, global = true)]
    user: Option<String>,
    /// Override the page size.
    #[arg(long, global = true)]
    page_size: Option<usize>,
    /// Override timezone (IANA name).
    #[arg(long, global = true)]
    timezone: Option<String>,
    /// Override the local cache file.
    #[arg(long, global = true)]
    cache_path: Option<String>,
    /// Run against a seeded in-memory store.
    #[arg(long, global = true)]
    memory: bool,
    /// Print JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the newest expenses.
    List {
        /// How many pages to fetch.
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },
    /// Follow the newest expenses as they change.
    Watch {
        /// Stop after this many updates.
        #[arg(long)]
        updates: Option<usize>,
    },
    /// Record a new expense.
    Add(AddArgs),
    /// Change some fields of an expense.
    Edit(EditArgs),
    /// Delete an expense.
    Remove { id: String },
    /// Inspect or edit the category list.
    Categories {
        #[command(subcommand)]
        command: CategoriesCommand,
    },
    /// Copy every expense of one user into another.
    Copy {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
}

#[derive(Debug, ClapArgs)]
pub struct AddArgs {
    #[arg(long)]
    pub amount: f64,
    /// Category key, see `categories list`.
    #[arg(long)]
    pub category: String,
    /// `YYYY-MM-DD` in the configured timezone, or RFC 3339. Defaults to now.
    #[arg(long)]
    pub date: Option<String>,
    #[arg(long, default_value = "")]
    pub description: String,
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    #[arg(long, default_value = "")]
    pub location: String,
}

#[derive(Debug, ClapArgs)]
pub struct EditArgs {
    pub id: String,
    #[arg(long)]
    pub amount: Option<f64>,
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long)]
    pub date: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
    /// Replaces all tags.
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    #[arg(long, conflicts_with = "tags")]
    pub clear_tags: bool,
    #[arg(long)]
    pub location: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum CategoriesCommand {
    List,
    /// Add a category; its key is derived from the label.
    Add { label: String },
    /// Remove a custom category by key.
    Remove { value: String },
}

pub fn load() -> Result<(AppConfig, Command)> {
    resolve(Args::parse())
}

fn resolve(args: Args) -> Result<(AppConfig, Command)> {
    let config_path = args.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
    let mut builder = config::Config::builder();
    builder = builder.add_source(config::File::with_name(config_path).required(false));
    builder = builder.add_source(config::Environment::with_prefix("SPENDSYNC"));
    let mut settings: AppConfig = builder.build()?.try_deserialize()?;

    if let Some(base_url) = args.base_url {
        settings.base_url = base_url;
    }
    if let Some(user) = args.user {
        settings.user_id = user;
    }
    if let Some(page_size) = args.page_size {
        settings.page_size = page_size;
    }
    if let Some(timezone) = args.timezone {
        settings.timezone = timezone;
    }
    if let Some(cache_path) = args.cache_path {
        settings.cache_path = cache_path;
    }
    settings.memory |= args.memory;
    settings.json |= args.json;

    Ok((settings, args.command))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> (AppConfig, Command) {
        let mut full = vec!["spendsync", "--config", "does/not/exist"];
        full.extend_from_slice(argv);
        resolve(Args::try_parse_from(full).unwrap()).unwrap()
    }

    #[test]
    fn defaults_apply_without_a_file() {
        let (config, command) = parse(&["list"]);
        assert_eq!(config.page_size, 20);
        assert_eq!(config.poll_interval_ms, 2000);
        assert_eq!(config.timezone, "Europe/Rome");
        assert_eq!(config.cache_path, "config/spendsync_cache.json");
        assert!(!config.memory);
        assert!(matches!(command, Command::List { pages: 1 }));
    }

    #[test]
    fn cli_flags_override() {
        let (config, command) = parse(&[
            "watch",
            "--updates",
            "3",
            "--user",
            "alice",
            "--page-size",
            "5",
            "--memory",
        ]);
        assert_eq!(config.user_id(), Some("alice"));
        assert_eq!(config.page_size, 5);
        assert!(config.memory);
        assert!(matches!(command, Command::Watch { updates: Some(3) }));
    }

    #[test]
    fn blank_user_is_signed_out() {
        let config = AppConfig {
            user_id: "   ".to_string(),
            ..Default::default()
        };
        assert_eq!(config.user_id(), None);
    }

    #[test]
    fn edit_rejects_tags_with_clear() {
        let args = Args::try_parse_from([
            "spendsync",
            "edit",
            "abc",
            "--tag",
            "x",
            "--clear-tags",
        ]);
        assert!(args.is_err());
    }
}
