//! Poll scheduling: a single cycle per external cron invocation, or a
//! steady in-process loop.

use crate::models::oilfox::ValueType;
use crate::services::poll::Poller;
use crate::store::{SlotSpec, StateStore};
use log::{error, info, warn};
use rand::Rng;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Unconfigured hourly schedule. Every installation left at this value would
/// hit the API at minute zero.
pub const DEFAULT_CRON: &str = "0 * * * *";
pub const SCHEDULE_SLOT: &str = "system.schedule";

/// Validate a cron expression and spread the default one over the hour.
///
/// Returns the effective expression and whether it was rewritten.
pub fn normalize_schedule<R: Rng>(expr: &str, rng: &mut R) -> Result<(String, bool), String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if !(5..=6).contains(&fields.len()) {
        return Err(format!(
            "schedule {:?} must have 5 or 6 space-separated fields, got {}",
            expr,
            fields.len()
        ));
    }
    if fields.join(" ") == DEFAULT_CRON {
        let minute = rng.random_range(0..60);
        return Ok((format!("{} * * * *", minute), true));
    }
    Ok((fields.join(" "), false))
}

/// Resolve the schedule this installation runs on.
///
/// A rewritten default is persisted in [`SCHEDULE_SLOT`] and reused on later
/// runs, so one installation keeps one minute.
pub fn effective_schedule<S, R>(store: &mut S, configured: &str, rng: &mut R) -> Result<String, String>
where
    S: StateStore + ?Sized,
    R: Rng,
{
    let (normalized, rewritten) = normalize_schedule(configured, rng)?;
    if !rewritten {
        return Ok(normalized);
    }

    let stored = store
        .read(SCHEDULE_SLOT)
        .map_err(|e| format!("reading {} failed: {}", SCHEDULE_SLOT, e))?
        .and_then(|slot| slot.value)
        .and_then(|v| v.as_str().map(str::to_string));
    if let Some(previous) = stored {
        return Ok(previous);
    }

    store
        .declare(SCHEDULE_SLOT, &SlotSpec::read_only("schedule", ValueType::String))
        .and_then(|_| store.write(SCHEDULE_SLOT, &serde_json::Value::String(normalized.clone())))
        .map_err(|e| format!("persisting {} failed: {}", SCHEDULE_SLOT, e))?;
    warn!(
        "Default schedule {:?} replaced by {:?} to spread load across installations",
        DEFAULT_CRON, normalized
    );
    Ok(normalized)
}

/// Stop signal for the polling loop.
///
/// The binary installs no signal handler and never triggers it; SIGTERM ends
/// the process between committed writes. Callers embedding [`run_loop`] keep
/// a clone to stop it.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`; returns `true` as soon as shutdown is triggered.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub failures: u64,
}

/// Run one cycle, logging any failure. A failed cycle is skipped, not retried.
pub fn poll_logged<S: StateStore>(poller: &mut Poller<S>) -> bool {
    match poller.run_cycle() {
        Ok(_) => true,
        Err(e) => {
            error!("Poll cycle skipped ({} error): {}", e.kind(), e);
            false
        }
    }
}

/// Exactly one cycle; the caller exits afterwards.
pub fn run_once<S: StateStore>(poller: &mut Poller<S>) -> bool {
    info!("Running single poll cycle");
    poll_logged(poller)
}

/// Poll on a steady cadence until `shutdown` is triggered. The next tick is
/// armed only after the previous cycle returned.
pub fn run_loop<S: StateStore>(poller: &mut Poller<S>, interval: Duration, shutdown: &Shutdown) -> LoopStats {
    let mut stats = LoopStats::default();
    while !shutdown.is_triggered() {
        let tick_start = Instant::now();
        stats.cycles += 1;
        if !poll_logged(poller) {
            stats.failures += 1;
        }

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if shutdown.wait(interval.saturating_sub(elapsed)) {
            break;
        }
    }
    info!(
        "Polling stopped after {} cycle(s), {} failed",
        stats.cycles, stats.failures
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ApiProfile, OilfoxClient};
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use crate::services::sync::TreeSynchronizer;
    use crate::store::MemoryStore;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use serde_json::json;
    use std::thread;

    #[test]
    fn default_schedule_gets_random_minute() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..50 {
            let (expr, rewritten) = normalize_schedule("0  *  * * *", &mut rng).unwrap();
            assert!(rewritten);
            let fields: Vec<&str> = expr.split(' ').collect();
            assert_eq!(&fields[1..], &["*", "*", "*", "*"]);
            let minute: u32 = fields[0].parse().unwrap();
            assert!(minute < 60);
        }
    }

    #[test]
    fn custom_schedule_is_kept() {
        let mut rng = SmallRng::seed_from_u64(7);
        assert_eq!(
            normalize_schedule("*/15 * * * *", &mut rng).unwrap(),
            ("*/15 * * * *".to_string(), false)
        );
        assert_eq!(
            normalize_schedule("30 0 * * * *", &mut rng).unwrap(),
            ("30 0 * * * *".to_string(), false)
        );
        assert!(normalize_schedule("hourly", &mut rng).is_err());
    }

    #[test]
    fn rewritten_schedule_is_sticky() {
        let mut store = MemoryStore::default();
        let first = effective_schedule(&mut store, DEFAULT_CRON, &mut SmallRng::seed_from_u64(1)).unwrap();
        for seed in 2..10 {
            let again = effective_schedule(&mut store, DEFAULT_CRON, &mut SmallRng::seed_from_u64(seed)).unwrap();
            assert_eq!(again, first);
        }
        assert_eq!(store.value(SCHEDULE_SLOT), Some(&json!(first)));

        let custom = effective_schedule(&mut store, "5 * * * *", &mut SmallRng::seed_from_u64(1)).unwrap();
        assert_eq!(custom, "5 * * * *");
    }

    #[test]
    fn shutdown_wakes_waiter() {
        let shutdown = Shutdown::default();
        let remote = shutdown.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.trigger();
        });
        let started = Instant::now();
        assert!(shutdown.wait(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        t.join().unwrap();
        assert!(!Shutdown::default().wait(Duration::from_millis(10)));
    }

    fn poller(server: &MockServer) -> Poller<MemoryStore> {
        Poller::new(
            OilfoxClient::for_test(&server.base_url(), ApiProfile::v2(), Duration::from_secs(5)),
            MemoryStore::default(),
            TreeSynchronizer::default(),
            None,
        )
    }

    fn healthy_api(summary: serde_json::Value) -> MockServer {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v2/backoffice/session");
            then.status(200).json_body(json!({"token": "t"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/v2/user/summary");
            then.status(200).json_body(summary);
        });
        server
    }

    #[test]
    fn loop_runs_until_shutdown() {
        let server = healthy_api(json!({"country": "DE", "devices": []}));
        let mut p = poller(&server);
        let shutdown = Shutdown::default();
        let remote = shutdown.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            remote.trigger();
        });

        let stats = run_loop(&mut p, Duration::from_millis(20), &shutdown);
        t.join().unwrap();
        assert!(stats.cycles >= 2, "only {} cycle(s)", stats.cycles);
        assert_eq!(stats.failures, 0);
        assert_eq!(p.store().value("info.country"), Some(&json!("DE")));
    }

    #[test]
    fn loop_counts_failed_cycles() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v2/backoffice/session");
            then.status(500).body("down");
        });
        let mut p = poller(&server);
        let shutdown = Shutdown::default();
        let remote = shutdown.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            remote.trigger();
        });

        let stats = run_loop(&mut p, Duration::from_millis(20), &shutdown);
        t.join().unwrap();
        assert!(stats.cycles >= 1);
        assert_eq!(stats.failures, stats.cycles);
    }

    #[test]
    fn once_reports_outcome() {
        let ok = healthy_api(json!({"country": "DE"}));
        assert!(run_once(&mut poller(&ok)));

        let bad = MockServer::start();
        bad.mock(|when, then| {
            when.method(POST).path("/v2/backoffice/session");
            then.status(200).json_body(json!({}));
        });
        assert!(!run_once(&mut poller(&bad)));
    }
}
