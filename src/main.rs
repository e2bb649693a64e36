mod cli;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use std::process::ExitCode;

use cli::{Args, Command, FetchArgs, ObserveArgs};
use snowwatch_alerts::{ConfiguredNotifier, Orchestrator, OrchestratorSettings};
use snowwatch_core::{AppError, Config};
use snowwatch_store::{PurgeReport, SnapshotStore, SqliteStore};
use snowwatch_weather::{
    normalize_zip, resolve_location, Location, NewObservation, NwsClient, TrackedEvent, ZipGeocoder,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            match &e {
                AppError::Other(inner) => eprintln!("Error: {:#}", inner),
                other => eprintln!("Error: {}", other),
            }
            eprintln!("{}", e.user_message());
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, AppError> {
    let (config, validation) = Config::load_validated(args.config.as_deref())?;
    snowwatch_core::init_logging(&config.logging.level)?;
    for warning in &validation.warnings {
        tracing::warn!("Config warning: {}", warning);
    }

    tracing::debug!("Using database {}", config.database.path.display());
    let store = SqliteStore::open(&config.database.path)?;

    match args.command {
        Command::Fetch(opts) => fetch(&config, &store, opts).await,
        Command::AddLocation { zip } => add_location(&config, &store, &zip).await,
        Command::Observe(opts) => observe(&store, opts),
        Command::Observations { zip, days, delete } => observations(&store, &zip, days, delete),
        Command::Storms { zip, days } => storms(&store, &zip, days),
        Command::Alerts { zip, days } => alerts(&store, &zip, days),
        Command::Purge { days } => purge(&store, days.unwrap_or(config.retention.days)),
    }
}

/// Look up a tracked location, printing a message when it isn't tracked.
fn tracked_location(store: &SqliteStore, zip: &str) -> Result<Option<Location>, AppError> {
    let Some(zip) = normalize_zip(zip) else {
        eprintln!("Invalid ZIP code: {}", zip);
        return Ok(None);
    };
    let location = store.location_by_zip(&zip)?;
    if location.is_none() {
        eprintln!("Unknown location ZIP {}. Add it with `snowwatch add-location {}`.", zip, zip);
    }
    Ok(location)
}

async fn fetch(config: &Config, store: &SqliteStore, opts: FetchArgs) -> Result<ExitCode, AppError> {
    let locations = if let Some(zip) = opts.zip.as_deref() {
        match tracked_location(store, zip)? {
            Some(location) => vec![location],
            None => return Ok(ExitCode::FAILURE),
        }
    } else if let Some(id) = opts.location {
        match store.location(id)? {
            Some(location) => vec![location],
            None => {
                eprintln!("Unknown location id {}", id);
                return Ok(ExitCode::FAILURE);
            }
        }
    } else {
        tracing::debug!("Processing all tracked locations (--all: {})", opts.all);
        store.all_locations()?
    };

    if locations.is_empty() {
        println!("No locations tracked. Add one with `snowwatch add-location <ZIP>`.");
        return Ok(ExitCode::SUCCESS);
    }

    let nws = NwsClient::from_config(&config.api)?;
    let notifier = ConfiguredNotifier::from_config(&config.notify, opts.no_notify);

    let mut settings = OrchestratorSettings::from_config(config);
    settings.dry_run = opts.dry_run;
    if opts.no_notify {
        settings.notify = false;
    }

    let orchestrator = Orchestrator::new(store, &nws, &notifier, settings);
    let summary = orchestrator.run(&locations).await;

    for outcome in &summary.outcomes {
        println!("{}", outcome.summary_line());
    }

    if summary.all_succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn add_location(config: &Config, store: &SqliteStore, zip: &str) -> Result<ExitCode, AppError> {
    let Some(zip) = normalize_zip(zip) else {
        eprintln!("Invalid ZIP code: {}", zip);
        return Ok(ExitCode::FAILURE);
    };
    let nws = NwsClient::from_config(&config.api)?;

    // Grid assignments occasionally move; re-resolve a tracked ZIP in place.
    if let Some(existing) = store.location_by_zip(&zip)? {
        let grid = nws.grid_point(existing.latitude, existing.longitude).await?;
        if grid != existing.grid {
            store.update_grid(existing.id, &grid)?;
            println!("Updated {} grid {} -> {}", existing.display_name(), existing.grid, grid);
        } else {
            println!("{} is already tracked (id {})", existing.display_name(), existing.id);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let geocoder = ZipGeocoder::from_config(&config.api)?;
    let new_location = resolve_location(&geocoder, &nws, &zip).await?;
    let location = store.upsert_location(&new_location)?;
    println!(
        "Tracking {} (id {}, grid {})",
        location.display_name(),
        location.id,
        location.grid
    );
    Ok(ExitCode::SUCCESS)
}

fn observe(store: &SqliteStore, opts: ObserveArgs) -> Result<ExitCode, AppError> {
    let Some(location) = tracked_location(store, &opts.zip)? else {
        return Ok(ExitCode::FAILURE);
    };

    let observed_at = match opts.at.as_deref() {
        Some(at) => DateTime::parse_from_rfc3339(at)
            .with_context(|| format!("Invalid --at timestamp: {}", at))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    if opts.depth.is_none() && opts.new_snow.is_none() && opts.temp.is_none() && opts.notes.is_none() {
        eprintln!("Nothing to record: pass at least one of --depth, --new-snow, --temp, --notes");
        return Ok(ExitCode::FAILURE);
    }

    let saved = store.save_observation(
        location.id,
        &NewObservation {
            observed_at,
            snow_depth_in: opts.depth,
            new_snow_in: opts.new_snow,
            temperature_f: opts.temp,
            notes: opts.notes,
        },
    )?;
    println!(
        "Recorded observation {} for {} at {}",
        saved.id,
        location.display_name(),
        saved.observed_at.format("%Y-%m-%d %H:%M UTC")
    );
    Ok(ExitCode::SUCCESS)
}

fn observations(store: &SqliteStore, zip: &str, days: i64, delete: Option<i64>) -> Result<ExitCode, AppError> {
    let Some(location) = tracked_location(store, zip)? else {
        return Ok(ExitCode::FAILURE);
    };

    if let Some(id) = delete {
        if store.delete_observation(location.id, id)? {
            println!("Deleted observation {} for {}", id, location.display_name());
            return Ok(ExitCode::SUCCESS);
        }
        eprintln!("No observation {} for {}", id, location.display_name());
        return Ok(ExitCode::FAILURE);
    }

    let since = Utc::now() - Duration::days(days.max(0));
    let observations = store.observations_for_location(location.id, since)?;
    if observations.is_empty() {
        println!("No observations for {} in the last {} days", location.display_name(), days);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Observations for {} (last {} days):", location.display_name(), days);
    for obs in &observations {
        let mut fields = Vec::new();
        if let Some(depth) = obs.snow_depth_in {
            fields.push(format!("depth {:.1}\"", depth));
        }
        if let Some(new_snow) = obs.new_snow_in {
            fields.push(format!("new {:.1}\"", new_snow));
        }
        if let Some(temp) = obs.temperature_f {
            fields.push(format!("{:.0}°F", temp));
        }
        if let Some(notes) = &obs.notes {
            fields.push(notes.clone());
        }
        println!(
            "  #{:<4} {}  {}",
            obs.id,
            obs.observed_at.format("%Y-%m-%d %H:%M"),
            fields.join(", ")
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn storms(store: &SqliteStore, zip: &str, days: i64) -> Result<ExitCode, AppError> {
    let Some(location) = tracked_location(store, zip)? else {
        return Ok(ExitCode::FAILURE);
    };

    let since = Utc::now() - Duration::days(days.max(0));
    let detections = store.detected_events(location.id, since)?;
    if detections.is_empty() {
        println!("No storms tracked for {} in the last {} days", location.display_name(), days);
        return Ok(ExitCode::SUCCESS);
    }

    // Detections arrive oldest first; group them per storm in first-seen order
    let mut storms: Vec<(String, Vec<&TrackedEvent>)> = Vec::new();
    for detection in &detections {
        match storms.iter_mut().find(|(id, _)| *id == detection.event_id) {
            Some((_, seen)) => seen.push(detection),
            None => storms.push((detection.event_id.clone(), vec![detection])),
        }
    }

    println!("Storms for {} (last {} days):", location.display_name(), days);
    for (event_id, seen) in &storms {
        let (Some(first), Some(latest)) = (seen.first(), seen.last()) else {
            continue;
        };
        let storm = &latest.event;
        println!(
            "  {}  {}: {} - {}, {:.1}\" ({} since first seen at {:.1}\"), confidence {}, {} detection(s)",
            event_id,
            storm.headline(),
            storm.start_time.format("%a %m/%d %H:%MZ"),
            storm.end_time.format("%a %m/%d %H:%MZ"),
            storm.snow_total_in,
            trend(first.event.snow_total_in, storm.snow_total_in),
            first.event.snow_total_in,
            storm.confidence.label(),
            seen.len()
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// Direction of a storm's total across detections; inside an inch is steady.
fn trend(first: f64, latest: f64) -> &'static str {
    let change = latest - first;
    if change > 1.0 {
        "rising"
    } else if change < -1.0 {
        "falling"
    } else {
        "steady"
    }
}

fn alerts(store: &SqliteStore, zip: &str, days: i64) -> Result<ExitCode, AppError> {
    let Some(location) = tracked_location(store, zip)? else {
        return Ok(ExitCode::FAILURE);
    };

    let since = Utc::now() - Duration::days(days.max(0));
    let history = store.alerts_for_location(location.id, since)?;
    if history.is_empty() {
        println!("No alerts for {} in the last {} days", location.display_name(), days);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Alerts for {} (last {} days):", location.display_name(), days);
    for alert in &history {
        println!(
            "  {}  [{}] {}",
            alert.notified_at.format("%Y-%m-%d %H:%M"),
            alert.kind,
            alert.summary
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn purge(store: &SqliteStore, days: i64) -> Result<ExitCode, AppError> {
    if days <= 0 {
        eprintln!("Retention must be at least one day (got {})", days);
        return Ok(ExitCode::FAILURE);
    }

    let cutoff = Utc::now() - Duration::days(days);
    let mut report = PurgeReport::default();
    let mut alerts = 0;
    for location in store.all_locations()? {
        report += store.purge_older_than(location.id, cutoff)?;
        alerts += store.purge_alerts_older_than(location.id, cutoff)?;
    }

    println!(
        "Purged {} forecasts, {} discussions, {} storm detections and {} alerts older than {} days",
        report.forecasts, report.discussions, report.storms, alerts, days
    );
    Ok(ExitCode::SUCCESS)
}
