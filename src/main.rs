pub mod models {
    pub mod oilfox;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod models;
    pub mod store;
}
pub mod env_file;
pub mod schema;
pub mod store;
pub mod watchdog;
pub mod services {
    pub mod poll;
    pub mod schedule;
    pub mod sync;
}

use crate::client::OilfoxClient;
use crate::config::{Config, StateBackend};
use crate::db::store::PgStore;
use crate::services::poll::Poller;
use crate::services::schedule::{self, DEFAULT_CRON, Shutdown};
use crate::services::sync::TreeSynchronizer;
use crate::store::{MemoryStore, StateStore};
use crate::watchdog::Watchdog;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{error, info};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    env_file: Option<PathBuf>,
    /// Run one cycle and exit even without `OILFOX_SCHEDULE`.
    once: bool,
    print_schedule: bool,
}

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
    applied: usize,
}

fn parse_cli<I>(args: I) -> Result<CliArgs, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut cli = CliArgs::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let path = match arg.to_str() {
            Some("--env-file") => Some(
                args.next()
                    .map(PathBuf::from)
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            ),
            Some(s) if s.starts_with("--env-file=") => {
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                Some(PathBuf::from(path_str))
            }
            Some("--once") => {
                cli.once = true;
                None
            }
            Some("--print-schedule") => {
                cli.print_schedule = true;
                None
            }
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        };
        if let Some(path) = path {
            if cli.env_file.is_some() {
                return Err("`--env-file` provided more than once".to_string());
            }
            cli.env_file = Some(path);
        }
    }
    Ok(cli)
}

fn load_env(cli: &CliArgs) -> Result<Option<LoadedEnvFile>, String> {
    let (path, explicit) = match &cli.env_file {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("env file not found: {}", path.display()));
            }
            (path.clone(), true)
        }
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let default_path = cwd.join(".env");
            if !default_path.is_file() {
                return Ok(None);
            }
            (default_path, false)
        }
    };
    let applied = env_file::load(&path)?;
    Ok(Some(LoadedEnvFile { path, explicit, applied }))
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

/// Returns `false` when a single-shot cycle failed.
fn run(cli: &CliArgs) -> Result<bool, String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (api={}{}, collection={}, timeout={}ms, interval={}s, schedule={}, watchdog={}, keying={})",
        cfg.profile.base_url,
        cfg.profile.summary_path,
        cfg.profile.collection,
        cfg.request_timeout.as_millis(),
        cfg.poll_interval.as_secs(),
        cfg.schedule.as_deref().unwrap_or("-"),
        cfg.watchdog
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "off".to_string()),
        cfg.device_keying.as_str()
    );

    // 2) Open the state tree
    match &cfg.backend {
        StateBackend::Postgres { database_url } => {
            let conn = open_database(database_url, cfg.watchdog)?;
            let mut poller = build_poller(&cfg, PgStore::new(conn));
            drive(&cfg, cli, &mut poller)
        }
        StateBackend::Memory => {
            info!("Using in-memory state tree; nothing is persisted");
            let mut poller = build_poller(&cfg, MemoryStore::default());
            let ok = drive(&cfg, cli, &mut poller)?;
            for (path, slot) in poller.store().slots() {
                let value = slot.value.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
                info!("{} = {} ({})", path, value, slot.spec.value_type.as_str());
            }
            Ok(ok)
        }
    }
}

/// Connect and migrate under the watchdog, so a stalled server cannot hold
/// an external cron slot forever.
fn open_database(database_url: &str, watchdog: Option<Duration>) -> Result<PgConnection, String> {
    let _watchdog = watchdog.map(|d| Watchdog::arm_for("database startup", d));
    let mut conn = PgConnection::establish(database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");
    apply_database_migrations(&mut conn)?;
    Ok(conn)
}

fn build_poller<S: StateStore>(cfg: &Config, store: S) -> Poller<S> {
    let client = OilfoxClient::new(cfg.profile.clone(), cfg.credentials.clone(), cfg.request_timeout);
    Poller::new(client, store, TreeSynchronizer::new(cfg.device_keying), cfg.watchdog)
}

fn drive<S: StateStore>(cfg: &Config, cli: &CliArgs, poller: &mut Poller<S>) -> Result<bool, String> {
    // 3) Resolve the external schedule, if any
    if cli.print_schedule || cfg.schedule.is_some() {
        let configured = cfg.schedule.as_deref().unwrap_or(DEFAULT_CRON);
        let effective = schedule::effective_schedule(poller.store_mut(), configured, &mut rand::rng())?;
        if cli.print_schedule {
            println!("{}", effective);
            return Ok(true);
        }
        info!("Scheduled externally: {}", effective);
    }

    // 4) Poll
    if cli.once || cfg.schedule.is_some() {
        Ok(schedule::run_once(poller))
    } else {
        info!("Starting poll loop: interval={}s", cfg.poll_interval.as_secs());
        schedule::run_loop(poller, cfg.poll_interval, &Shutdown::default());
        Ok(true)
    }
}

fn main() {
    let mut args = std::env::args_os();
    args.next(); // skip program name
    let loaded_env = match parse_cli(args).and_then(|cli| load_env(&cli).map(|env| (cli, env))) {
        Ok(v) => v,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };
    let (cli, loaded_env) = loaded_env;

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!(
            "Environment loaded from {} .env file: {} ({} variable(s) applied)",
            origin,
            info.path.display(),
            info.applied
        );
    }

    info!(
        "oilfox-sync {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    match run(&cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("fatal: {}", e);
            std::process::exit(1);
        }
    }
}
