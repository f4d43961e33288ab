mod cloud;
mod commands;
mod config;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process;
use tracing_subscriber::EnvFilter;

use crate::commands::{
    cmd_history, cmd_list, cmd_log, cmd_remove, cmd_settings_reset, cmd_settings_set,
    cmd_settings_show, cmd_status, cmd_sync, cmd_sync_logout, cmd_sync_status, cmd_timeline,
};
use crate::config::Config;
use buzz_core::db::Database;
use buzz_core::models::{ClockTime, MetabolismRate, SettingsPatch};
use buzz_core::service::BuzzService;

const LOG_ENV: &str = "BUZZ_LOG";

#[derive(Parser)]
#[command(
    name = "buzz",
    version,
    about = "A local-first caffeine tracker CLI",
    long_about = "Log caffeine, see how much is still in your system, and find out when it is safe to sleep."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log a caffeinated drink
    Log {
        /// Caffeine in mg
        amount: f64,
        /// What you had (e.g. "Flat white")
        #[arg(short, long)]
        name: Option<String>,
        /// coffee, espresso, tea, energy, soda, chocolate, supplement, custom
        #[arg(short, long, default_value = "coffee")]
        category: String,
        /// When you had it: HH:MM, "YYYY-MM-DD HH:MM" or RFC 3339 (default: now)
        #[arg(long)]
        at: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove an intake by ID (or a unique prefix of at least 4 characters)
    Remove {
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recent intakes, newest first
    List {
        /// Maximum number of intakes to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show current caffeine level, today's total and bedtime outlook
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show daily totals
    History {
        /// Number of days to show
        #[arg(short, long, default_value_t = 7)]
        days: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Chart the projected caffeine level
    Timeline {
        /// Output the full series as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or change settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
    /// Sync with a `buzz serve` instance
    Sync {
        /// Show sync state instead of syncing
        #[arg(long, conflicts_with = "logout")]
        status: bool,
        /// Forget the sync session; the next sync merges the local log again
        #[arg(long)]
        logout: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start the sync server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
        /// Address to bind to
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Show current settings
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change one or more settings
    Set {
        /// fast, average or slow
        #[arg(long)]
        metabolism: Option<MetabolismRate>,
        /// Daily limit in mg (50-1000)
        #[arg(long)]
        limit: Option<f64>,
        /// Bedtime as HH:MM
        #[arg(long)]
        bedtime: Option<ClockTime>,
        /// Caffeine you can sleep with, in mg (0-200)
        #[arg(long)]
        sleep_target: Option<f64>,
        #[arg(long)]
        pregnancy: Option<bool>,
        #[arg(long)]
        smoker: Option<bool>,
        #[arg(long)]
        oral_contraceptive: Option<bool>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Restore the default settings
    Reset {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing(config_filter: Option<&str>) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .ok()
        .or_else(|| config_filter.and_then(|f| EnvFilter::try_new(f).ok()))
        .unwrap_or_else(|| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    init_tracing(config.log.as_deref());

    let svc = BuzzService::new(&config.db_path)?;

    match cli.command {
        Commands::Log {
            amount,
            name,
            category,
            at,
            json,
        } => cmd_log(&svc, amount, name, &category, at.as_deref(), json),
        Commands::Remove { id, json } => cmd_remove(&svc, &id, json),
        Commands::List { limit, json } => cmd_list(&svc, limit, json),
        Commands::Status { json } => cmd_status(&svc, json),
        Commands::History { days, json } => cmd_history(&svc, days, json),
        Commands::Timeline { json } => cmd_timeline(&svc, json),
        Commands::Settings { command } => match command {
            SettingsCommands::Show { json } => cmd_settings_show(&svc, json),
            SettingsCommands::Set {
                metabolism,
                limit,
                bedtime,
                sleep_target,
                pregnancy,
                smoker,
                oral_contraceptive,
                json,
            } => {
                let patch = SettingsPatch {
                    metabolism_rate: metabolism,
                    caffeine_limit: limit,
                    bedtime,
                    target_sleep_caffeine: sleep_target,
                    pregnancy_adjustment: pregnancy,
                    smoker_adjustment: smoker,
                    oral_contraceptive_adjustment: oral_contraceptive,
                };
                cmd_settings_set(&svc, &patch, json)
            }
            SettingsCommands::Reset { json } => cmd_settings_reset(&svc, json),
        },
        Commands::Sync {
            status,
            logout,
            json,
        } => {
            if status {
                cmd_sync_status(&svc, json)
            } else if logout {
                cmd_sync_logout(&svc, json)
            } else {
                cmd_sync(&svc, &config.remote, json)
            }
        }
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let api_key = if no_auth {
                None
            } else {
                Some(config.load_or_create_api_key()?.0)
            };
            let db = Database::open(&config.db_path)?;
            server::start_server(db, port, &bind, api_key).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_settings_set() {
        let cli = Cli::try_parse_from([
            "buzz",
            "settings",
            "set",
            "--metabolism",
            "slow",
            "--bedtime",
            "22:30",
            "--smoker",
            "true",
        ])
        .unwrap();
        let Commands::Settings {
            command:
                SettingsCommands::Set {
                    metabolism,
                    bedtime,
                    smoker,
                    limit,
                    ..
                },
        } = cli.command
        else {
            panic!("expected settings set");
        };
        assert_eq!(metabolism, Some(MetabolismRate::Slow));
        assert_eq!(bedtime, ClockTime::new(22, 30));
        assert_eq!(smoker, Some(true));
        assert!(limit.is_none());
    }

    #[test]
    fn test_parse_settings_rejects_bad_bedtime() {
        assert!(Cli::try_parse_from(["buzz", "settings", "set", "--bedtime", "25:00"]).is_err());
    }

    #[test]
    fn test_parse_log_defaults() {
        let cli = Cli::try_parse_from(["buzz", "log", "95"]).unwrap();
        let Commands::Log {
            amount, category, ..
        } = cli.command
        else {
            panic!("expected log");
        };
        assert!((amount - 95.0).abs() < f64::EPSILON);
        assert_eq!(category, "coffee");
    }
}
