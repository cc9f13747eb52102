//! mcp-forecast CLI
//!
//! Uso:
//!   mcp-forecast weekly [YYYY-MM-DD]
//!   mcp-forecast backfill <YYYY-MM-DD>...
//!   mcp-forecast catchup
//!   mcp-forecast reconcile <YYYY-MM-DD>

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use mcp_forecast::config::AppConfig;
use mcp_forecast::ml_engine::config_bridge::MLConfigConvertible;
use mcp_forecast::ml_engine::{HolidayCalendar, ModelStore};
use mcp_forecast::persistence::{CsvForecastStore, CsvMarketData};
use mcp_forecast::workflow::export::ExportSettings;
use mcp_forecast::workflow::{CycleReport, CycleSettings, WeeklyCycle};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: mcp-forecast <weekly [YYYY-MM-DD] | backfill <YYYY-MM-DD>... | catchup | reconcile <YYYY-MM-DD>>";

enum Command {
    Weekly(NaiveDate),
    Backfill(Vec<NaiveDate>),
    CatchUp,
    Reconcile(NaiveDate),
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("Invalid date '{}'", raw))
}

fn parse_command(args: &[String]) -> Result<Command> {
    let today = Utc::now().date_naive();
    match args.first().map(String::as_str) {
        Some("weekly") => match args.get(1) {
            Some(raw) => Ok(Command::Weekly(parse_date(raw)?)),
            None => Ok(Command::Weekly(today)),
        },
        Some("backfill") => {
            let dates = args[1..].iter().map(|a| parse_date(a)).collect::<Result<Vec<_>>>()?;
            if dates.is_empty() {
                bail!("backfill needs at least one date\n{}", USAGE);
            }
            Ok(Command::Backfill(dates))
        }
        Some("catchup") => Ok(Command::CatchUp),
        Some("reconcile") => match args.get(1) {
            Some(raw) => Ok(Command::Reconcile(parse_date(raw)?)),
            None => bail!("reconcile needs a date\n{}", USAGE),
        },
        _ => bail!("{}", USAGE),
    }
}

/// Last day catch-up may target: the day after the last observed price hour,
/// never past today
fn catch_up_horizon(today: NaiveDate, last_price: Option<NaiveDateTime>) -> NaiveDate {
    match last_price {
        Some(ts) => (ts + Duration::hours(1)).date().min(today),
        None => today,
    }
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn summarize(report: &CycleReport) {
    for (stage, outcome) in &report.stages {
        info!("  {:<20} {:?}", stage.to_string(), outcome);
    }
}

fn run(command: Command, config: &AppConfig) -> Result<()> {
    let engine = config.to_ml_engine_config();
    let calendar = HolidayCalendar::load(engine.holidays_file.as_deref())
        .context("Failed loading holiday calendar")?;
    let market = CsvMarketData::open(&config.persistence.data_dir).context("Failed loading market data")?;
    let horizon = catch_up_horizon(Utc::now().date_naive(), market.last_price_timestamp());
    let mut store = CsvForecastStore::open(&config.persistence.data_dir).context("Failed opening forecast store")?;
    let models = ModelStore::new(&config.persistence.data_dir).context("Failed opening model store")?;

    let settings = CycleSettings {
        engine,
        export: ExportSettings::from(&config.export),
    };
    let mut cycle = WeeklyCycle::new(settings, calendar, &market, &mut store, models);

    match command {
        Command::Weekly(date) => {
            let report = cycle.run(date)?;
            summarize(&report);
        }
        Command::Backfill(dates) => {
            for report in cycle.backfill(&dates)? {
                summarize(&report);
            }
        }
        Command::CatchUp => {
            let reports = cycle.catch_up(horizon)?;
            info!("🔁 Catch-up ran {} weeks up to {}", reports.len(), horizon);
        }
        Command::Reconcile(date) => {
            let result = cycle.reconcile(date)?;
            info!(
                "📊 {}: MAE={:.2} RMSE={:.2} MAPE={:.2}% over {} rows",
                result.week,
                result.metrics.mae,
                result.metrics.rmse,
                result.metrics.mape,
                result.rows.len()
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);
    info!("🚀 mcp-forecast starting: {}", config.digest());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(2);
        }
    };

    match run(command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}
