use clap::builder::{styling::AnsiColor, Styles};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

const ABOUT: &str = "Winter forecast change alerts";

const LONG_ABOUT: &str = "
Fetches National Weather Service forecasts for tracked ZIP codes, keeps a
history of snapshots, and alerts when the forecast changes significantly
(snow totals, temperature, timing, precipitation type, hazard wording).

Meant to be run on a schedule (cron, systemd timer). The exit code is non-zero
when any location failed, so the scheduler can detect trouble.
";

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Yellow.on_default())
    .usage(AnsiColor::Green.on_default())
    .literal(AnsiColor::Green.on_default())
    .placeholder(AnsiColor::Green.on_default());

#[derive(Parser, Debug)]
#[command(version, styles = STYLES, about = ABOUT, long_about = LONG_ABOUT)]
pub struct Args {
    #[arg(long, global = true, value_name = "PATH", help = "Config file (default: <config dir>/snowwatch/config.toml)")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch forecasts, detect changes and send alerts
    Fetch(FetchArgs),

    /// Track a new ZIP code (or refresh the grid of a tracked one)
    AddLocation {
        #[arg(help = "US ZIP code")]
        zip: String,
    },

    /// Record a manual snow measurement
    Observe(ObserveArgs),

    /// List recorded snow measurements, or delete one
    Observations {
        #[arg(long)]
        zip: String,

        #[arg(long, default_value_t = 30)]
        days: i64,

        #[arg(long, value_name = "ID", help = "Delete the observation with this id")]
        delete: Option<i64>,
    },

    /// Show storms tracked in recent forecasts
    Storms {
        #[arg(long)]
        zip: String,

        #[arg(long, default_value_t = 7)]
        days: i64,
    },

    /// Show alerts already sent for a location
    Alerts {
        #[arg(long)]
        zip: String,

        #[arg(long, default_value_t = 7)]
        days: i64,
    },

    /// Delete data older than the retention window
    Purge {
        #[arg(long, help = "Override retention.days from the config")]
        days: Option<i64>,
    },
}

#[derive(ClapArgs, Debug)]
pub struct FetchArgs {
    #[arg(long, conflicts_with_all = ["zip", "location"], help = "All tracked locations (default)")]
    pub all: bool,

    #[arg(long, conflicts_with = "location")]
    pub zip: Option<String>,

    #[arg(long, value_name = "ID", help = "Location id")]
    pub location: Option<i64>,

    #[arg(long, help = "Detect and log changes without notifying or recording them")]
    pub no_notify: bool,

    #[arg(long, help = "Compare stored snapshots only; nothing is fetched or sent")]
    pub dry_run: bool,
}

#[derive(ClapArgs, Debug)]
pub struct ObserveArgs {
    #[arg(long)]
    pub zip: String,

    #[arg(long, value_name = "RFC3339", help = "Observation time (default: now)")]
    pub at: Option<String>,

    #[arg(long, value_name = "INCHES", help = "Total snow depth")]
    pub depth: Option<f64>,

    #[arg(long, value_name = "INCHES", help = "New snowfall since last observation")]
    pub new_snow: Option<f64>,

    #[arg(long, value_name = "F")]
    pub temp: Option<f64>,

    #[arg(long)]
    pub notes: Option<String>,
}
