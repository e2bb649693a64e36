//! Per-location fetch pass.
//!
//! Each location runs `Idle → Fetching → Storing → Detecting → Filtering →
//! Notifying → Done`, or ends in `Failed`. Locations are processed
//! sequentially and a failure never stops the remaining locations.

use chrono::{Duration, Utc};
use std::fmt;

use snowwatch_core::{Config, LedgerError};
use snowwatch_store::{AlertLedger, SnapshotStore};
use snowwatch_weather::{ChangeEvent, ForecastFetcher, ForecastSnapshot, Location};

use crate::detect::{ChangeDetector, Thresholds};
use crate::notify::{AlertMessage, MessageLimits, Notifier};
use crate::storms::identify_storms;

/// Why a pass ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Fetch(String),
    /// Duplicate or out-of-order fetch; nothing was lost
    OutOfOrder(String),
    Storage(String),
    Filtering(String),
    Notifying(String),
}

impl FailureReason {
    /// Informational failures are not operator-facing errors.
    pub fn is_informational(&self) -> bool {
        matches!(self, FailureReason::OutOfOrder(_))
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Fetch(m) => write!(f, "fetch failed: {}", m),
            FailureReason::OutOfOrder(m) => write!(f, "snapshot skipped: {}", m),
            FailureReason::Storage(m) => write!(f, "storage failed: {}", m),
            FailureReason::Filtering(m) => write!(f, "alert lookup failed: {}", m),
            FailureReason::Notifying(m) => write!(f, "notification failed: {}", m),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassState {
    Idle,
    Fetching,
    Storing,
    Detecting,
    Filtering,
    Notifying,
    Done,
    Failed(FailureReason),
}

impl PassState {
    pub fn is_failed(&self) -> bool {
        matches!(self, PassState::Failed(_))
    }
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassState::Idle => f.write_str("idle"),
            PassState::Fetching => f.write_str("fetching"),
            PassState::Storing => f.write_str("storing"),
            PassState::Detecting => f.write_str("detecting"),
            PassState::Filtering => f.write_str("filtering"),
            PassState::Notifying => f.write_str("notifying"),
            PassState::Done => f.write_str("done"),
            PassState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Compare stored history only: no fetch, no notification, no ledger writes
    pub dry_run: bool,
    /// When false, changes are logged but neither notified nor recorded
    pub notify: bool,
    /// Purge snapshots and discussions older than this after storing
    pub retention: Option<Duration>,
    pub thresholds: Thresholds,
    pub message: MessageLimits,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            dry_run: false,
            notify: true,
            retention: Some(Duration::days(30)),
            thresholds: Thresholds::default(),
            message: MessageLimits::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dry_run: false,
            notify: config.notify.enabled,
            retention: (config.retention.days > 0).then(|| Duration::days(config.retention.days)),
            thresholds: Thresholds::from(&config.alerts),
            message: MessageLimits::from(&config.notify),
        }
    }
}

/// Result of one location's pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassOutcome {
    pub location_id: i64,
    pub display_name: String,
    pub state: PassState,
    pub events_detected: usize,
    pub events_notified: usize,
    /// Every state entered, starting with `Idle`
    pub transitions: Vec<PassState>,
}

impl PassOutcome {
    fn new(location: &Location) -> Self {
        Self {
            location_id: location.id,
            display_name: location.display_name(),
            state: PassState::Idle,
            events_detected: 0,
            events_notified: 0,
            transitions: vec![PassState::Idle],
        }
    }

    fn enter(&mut self, state: PassState) {
        tracing::debug!("{}: {} -> {}", self.display_name, self.state, state);
        self.transitions.push(state.clone());
        self.state = state;
    }

    fn fail(mut self, reason: FailureReason) -> Self {
        if reason.is_informational() {
            tracing::info!("{}: {}", self.display_name, reason);
        } else {
            tracing::error!("{}: {}", self.display_name, reason);
        }
        self.enter(PassState::Failed(reason));
        self
    }

    fn done(mut self) -> Self {
        self.enter(PassState::Done);
        self
    }

    pub fn is_failed(&self) -> bool {
        self.state.is_failed()
    }

    /// One line for the command-line summary.
    pub fn summary_line(&self) -> String {
        match &self.state {
            PassState::Failed(reason) => format!("{}: FAILED - {}", self.display_name, reason),
            state => format!(
                "{}: {} ({} changes detected, {} notified)",
                self.display_name, state, self.events_detected, self.events_notified
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub outcomes: Vec<PassOutcome>,
}

impl RunSummary {
    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed_count() == 0
    }

    pub fn total_notified(&self) -> usize {
        self.outcomes.iter().map(|o| o.events_notified).sum()
    }
}

pub struct Orchestrator<'a, S, F, N> {
    store: &'a S,
    fetcher: &'a F,
    notifier: &'a N,
    detector: ChangeDetector,
    settings: OrchestratorSettings,
}

impl<'a, S, F, N> Orchestrator<'a, S, F, N>
where
    S: SnapshotStore + AlertLedger,
    F: ForecastFetcher,
    N: Notifier,
{
    pub fn new(store: &'a S, fetcher: &'a F, notifier: &'a N, settings: OrchestratorSettings) -> Self {
        Self {
            store,
            fetcher,
            notifier,
            detector: ChangeDetector::new(settings.thresholds.clone()),
            settings,
        }
    }

    /// Run every location in order.
    pub async fn run(&self, locations: &[Location]) -> RunSummary {
        let mut summary = RunSummary::default();
        for location in locations {
            let outcome = self.run_location(location).await;
            summary.outcomes.push(outcome);
        }

        tracing::info!(
            "Run finished: {} locations, {} failed, {} alerts sent",
            summary.outcomes.len(),
            summary.failed_count(),
            summary.total_notified()
        );
        summary
    }

    pub async fn run_location(&self, location: &Location) -> PassOutcome {
        let mut outcome = PassOutcome::new(location);
        tracing::info!("Processing {} ({})", outcome.display_name, location.zip_code);

        if !self.settings.dry_run {
            outcome.enter(PassState::Fetching);
            let snapshot = match self.fetcher.fetch_snapshot(location).await {
                Ok(snapshot) => snapshot,
                Err(e) => return outcome.fail(FailureReason::Fetch(e.to_string())),
            };
            self.refresh_discussion(location).await;

            outcome.enter(PassState::Storing);
            if let Err(e) = self.store.append_snapshot(location.id, &snapshot) {
                let reason = if e.is_out_of_order() {
                    FailureReason::OutOfOrder(e.to_string())
                } else {
                    FailureReason::Storage(e.to_string())
                };
                return outcome.fail(reason);
            }
            self.purge_expired(location);
            self.track_storms(location, &snapshot);
        }

        let history = match self.store.latest_two(location.id) {
            Ok(history) => history,
            Err(e) => return outcome.fail(FailureReason::Storage(e.to_string())),
        };
        let [current, previous] = history.as_slice() else {
            tracing::info!(
                "{}: {} snapshot(s) stored, no comparison possible yet",
                outcome.display_name,
                history.len()
            );
            return outcome.done();
        };

        outcome.enter(PassState::Detecting);
        let detection = self.detector.detect(previous, current);
        outcome.events_detected = detection.events.len();
        if detection.events.is_empty() {
            tracing::info!("{}: no significant changes", outcome.display_name);
            return outcome.done();
        }
        for event in &detection.events {
            tracing::info!("{}: {}", outcome.display_name, event.summary());
        }

        if !self.settings.notify && !self.settings.dry_run {
            return outcome.done();
        }

        outcome.enter(PassState::Filtering);
        let fresh = match retry_once("filter", || {
            self.store.filter_unnotified(location.id, &detection.events)
        }) {
            Ok(fresh) => fresh,
            Err(e) => return outcome.fail(FailureReason::Filtering(e.to_string())),
        };
        if fresh.is_empty() {
            tracing::info!("{}: all changes already notified", outcome.display_name);
            return outcome.done();
        }
        if self.settings.dry_run {
            tracing::info!(
                "{}: would notify {} change(s) (dry run)",
                outcome.display_name,
                fresh.len()
            );
            return outcome.done();
        }

        outcome.enter(PassState::Notifying);
        match self.deliver(location, &outcome.display_name, &fresh).await {
            Ok(delivered) => outcome.events_notified = delivered,
            Err(reason) => return outcome.fail(reason),
        }
        outcome.done()
    }

    async fn refresh_discussion(&self, location: &Location) {
        match self.fetcher.fetch_discussion(location).await {
            Ok(Some(discussion)) => match self.store.save_discussion(location.id, &discussion) {
                Ok(true) => tracing::info!("Stored discussion issued {}", discussion.issued_at),
                Ok(false) => tracing::debug!("Discussion issued {} already stored", discussion.issued_at),
                Err(e) => tracing::warn!("Failed to store discussion: {}", e),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Discussion fetch failed: {}", e),
        }
    }

    fn purge_expired(&self, location: &Location) {
        let Some(retention) = self.settings.retention else {
            return;
        };
        if let Err(e) = self.store.purge_older_than(location.id, Utc::now() - retention) {
            tracing::warn!("Retention purge failed for location {}: {}", location.id, e);
        }
    }

    fn track_storms(&self, location: &Location, snapshot: &ForecastSnapshot) {
        let storms = identify_storms(snapshot);
        if storms.is_empty() {
            return;
        }
        match self
            .store
            .save_detected_events(location.id, snapshot.captured_at, &storms)
        {
            Ok(ids) => tracing::info!("Tracking {} storm(s): {}", ids.len(), ids.join(", ")),
            Err(e) => tracing::warn!("Failed to store storms for location {}: {}", location.id, e),
        }
    }

    /// Notify, then record the events the message showed. Each step gets one retry.
    ///
    /// Returns how many events were delivered and recorded. Events hidden behind the
    /// overflow line stay unrecorded.
    async fn deliver(
        &self,
        location: &Location,
        display_name: &str,
        events: &[ChangeEvent],
    ) -> Result<usize, FailureReason> {
        let message = AlertMessage::build(display_name, events, self.settings.message);
        let shown = events.get(..message.shown).unwrap_or(events);
        if shown.len() < events.len() {
            tracing::info!(
                "{}: {} change(s) did not fit in the message and stay pending",
                display_name,
                events.len() - shown.len()
            );
        }

        if let Err(first) = self.notifier.notify(&message.title, &message.body).await {
            tracing::warn!("Notification failed, retrying once: {}", first);
            self.notifier
                .notify(&message.title, &message.body)
                .await
                .map_err(|e| FailureReason::Notifying(e.to_string()))?;
        }

        let recorded = match self.store.record_notified(location.id, shown) {
            Err(LedgerError::Storage(e)) => {
                tracing::warn!("Recording alerts failed, retrying once: {}", e);
                self.store.record_notified(location.id, shown)
            }
            other => other,
        };
        match recorded {
            Ok(()) => Ok(shown.len()),
            Err(LedgerError::Duplicate(e)) => {
                tracing::info!("{}", e);
                Ok(shown.len())
            }
            Err(e) => Err(FailureReason::Notifying(format!("sent but not recorded: {}", e))),
        }
    }
}

fn retry_once<T, E: fmt::Display>(what: &str, mut op: impl FnMut() -> Result<T, E>) -> Result<T, E> {
    op().or_else(|e| {
        tracing::warn!("{} failed, retrying once: {}", what, e);
        op()
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use chrono::{DateTime, TimeZone};
    use snowwatch_core::{FetchError, NotifyError, StorageError};
    use snowwatch_store::{PurgeReport, SqliteStore};
    use snowwatch_weather::{Discussion, ForecastPeriod, GridRef, NewLocation, SnowEvent};
    use std::cell::{Cell, RefCell};
    use std::collections::{HashMap, VecDeque};
    use std::sync::OnceLock;

    #[derive(Default)]
    struct FakeFetcher {
        snapshots: RefCell<HashMap<i64, VecDeque<Result<ForecastSnapshot, FetchError>>>>,
        discussion_fails: bool,
    }

    impl FakeFetcher {
        fn push(&self, location_id: i64, result: Result<ForecastSnapshot, FetchError>) {
            self.snapshots
                .borrow_mut()
                .entry(location_id)
                .or_default()
                .push_back(result);
        }
    }

    impl ForecastFetcher for FakeFetcher {
        async fn fetch_snapshot(&self, location: &Location) -> Result<ForecastSnapshot, FetchError> {
            self.snapshots
                .borrow_mut()
                .get_mut(&location.id)
                .and_then(|q| q.pop_front())
                .unwrap_or(Err(FetchError::Timeout))
        }

        async fn fetch_discussion(&self, _location: &Location) -> Result<Option<Discussion>, FetchError> {
            if self.discussion_fails {
                return Err(FetchError::ConnectionFailed("down".into()));
            }
            Ok(Some(Discussion {
                issued_at: Utc.with_ymd_and_hms(2026, 1, 12, 9, 0, 0).unwrap(),
                fetched_at: Utc::now(),
                office: "BOU".to_string(),
                text: "Snow returns midweek.".to_string(),
            }))
        }
    }

    #[derive(Default)]
    struct FakeNotifier {
        sent: RefCell<Vec<(String, String)>>,
        attempts: Cell<u32>,
        failures_left: Cell<u32>,
    }

    impl FakeNotifier {
        fn failing(times: u32) -> Self {
            let notifier = Self::default();
            notifier.failures_left.set(times);
            notifier
        }
    }

    impl Notifier for FakeNotifier {
        async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError> {
            self.attempts.set(self.attempts.get() + 1);
            if self.failures_left.get() > 0 {
                self.failures_left.set(self.failures_left.get() - 1);
                return Err(NotifyError::delivery("toast service unavailable"));
            }
            self.sent.borrow_mut().push((title.to_string(), message.to_string()));
            Ok(())
        }
    }

    /// Store wrapper that injects ledger and storm-tracking failures.
    struct FlakyLedger {
        inner: SqliteStore,
        filter_failures: Cell<u32>,
        record_failures: Cell<u32>,
        /// Another writer records the same events just before us
        record_race: Cell<bool>,
        storms_fail: Cell<bool>,
    }

    impl FlakyLedger {
        fn new(inner: SqliteStore) -> Self {
            Self {
                inner,
                filter_failures: Cell::new(0),
                record_failures: Cell::new(0),
                record_race: Cell::new(false),
                storms_fail: Cell::new(false),
            }
        }
    }

    impl SnapshotStore for FlakyLedger {
        fn append_snapshot(&self, location_id: i64, snapshot: &ForecastSnapshot) -> Result<(), StorageError> {
            self.inner.append_snapshot(location_id, snapshot)
        }
        fn latest_two(&self, location_id: i64) -> Result<Vec<ForecastSnapshot>, StorageError> {
            self.inner.latest_two(location_id)
        }
        fn purge_older_than(&self, location_id: i64, cutoff: DateTime<Utc>) -> Result<PurgeReport, StorageError> {
            self.inner.purge_older_than(location_id, cutoff)
        }
        fn save_discussion(&self, location_id: i64, discussion: &Discussion) -> Result<bool, StorageError> {
            self.inner.save_discussion(location_id, discussion)
        }
        fn latest_discussion(&self, location_id: i64) -> Result<Option<Discussion>, StorageError> {
            self.inner.latest_discussion(location_id)
        }
        fn save_detected_events(
            &self,
            location_id: i64,
            detected_at: DateTime<Utc>,
            events: &[SnowEvent],
        ) -> Result<Vec<String>, StorageError> {
            if self.storms_fail.get() {
                return Err(StorageError::QueryFailed("disk I/O error".into()));
            }
            self.inner.save_detected_events(location_id, detected_at, events)
        }
    }

    impl AlertLedger for FlakyLedger {
        fn filter_unnotified(&self, location_id: i64, events: &[ChangeEvent]) -> Result<Vec<ChangeEvent>, StorageError> {
            if self.filter_failures.get() > 0 {
                self.filter_failures.set(self.filter_failures.get() - 1);
                return Err(StorageError::QueryFailed("database is locked".into()));
            }
            self.inner.filter_unnotified(location_id, events)
        }
        fn record_notified(&self, location_id: i64, events: &[ChangeEvent]) -> Result<(), LedgerError> {
            if self.record_failures.get() > 0 {
                self.record_failures.set(self.record_failures.get() - 1);
                return Err(StorageError::QueryFailed("database is locked".into()).into());
            }
            if self.record_race.get() {
                self.inner.record_notified(location_id, events)?;
            }
            self.inner.record_notified(location_id, events)
        }
    }

    fn add_location(store: &SqliteStore, zip: &str, city: &str) -> Location {
        store
            .upsert_location(&NewLocation {
                zip_code: zip.to_string(),
                latitude: 39.48,
                longitude: -106.04,
                grid: GridRef {
                    office: "BOU".to_string(),
                    x: 40,
                    y: 60,
                },
                city: Some(city.to_string()),
                state: Some("CO".to_string()),
            })
            .unwrap()
    }

    /// Recent capture times so retention never purges test data.
    fn captured(offset_hours: i64) -> DateTime<Utc> {
        static BASE: OnceLock<DateTime<Utc>> = OnceLock::new();
        let base = *BASE.get_or_init(|| Utc::now() - Duration::days(1));
        base + Duration::hours(offset_hours)
    }

    fn snapshot(offset_hours: i64, day3_snow: f64) -> ForecastSnapshot {
        let first = Utc.with_ymd_and_hms(2026, 1, 12, 13, 0, 0).unwrap();
        ForecastSnapshot {
            captured_at: captured(offset_hours),
            periods: (0..5)
                .map(|i| ForecastPeriod {
                    period_id: format!("day-{}", i + 1),
                    name: format!("Day {}", i + 1),
                    start_time: first + Duration::hours(24 * i),
                    end_time: first + Duration::hours(24 * i + 12),
                    temperature_f: Some(22.0),
                    snow_amount_in: Some(if i == 2 { day3_snow } else { 0.0 }),
                    precip_probability: Some(if i == 2 { 80.0 } else { 10.0 }),
                    precip_type: None,
                    hazard_text: None,
                })
                .collect(),
            hourly: vec![],
            gridpoint: Default::default(),
            raw_payload: None,
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings::default()
    }

    #[tokio::test]
    async fn test_first_snapshot_ends_done_without_detection() {
        let store = SqliteStore::in_memory().unwrap();
        let loc = add_location(&store, "80424", "Breckenridge");
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        let notifier = FakeNotifier::default();

        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());
        let outcome = orchestrator.run_location(&loc).await;

        assert_eq!(outcome.state, PassState::Done);
        assert_eq!(
            outcome.transitions,
            vec![PassState::Idle, PassState::Fetching, PassState::Storing, PassState::Done]
        );
        assert_eq!(store.snapshot_count(loc.id).unwrap(), 1);
        assert_eq!(store.discussion_count(loc.id).unwrap(), 1);
        assert!(notifier.sent.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_snow_increase_notified_once() {
        let store = SqliteStore::in_memory().unwrap();
        let loc = add_location(&store, "80424", "Breckenridge");
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        fetcher.push(loc.id, Ok(snapshot(3, 6.5)));
        fetcher.push(loc.id, Ok(snapshot(6, 6.5)));
        let notifier = FakeNotifier::default();
        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());

        orchestrator.run_location(&loc).await;
        let second = orchestrator.run_location(&loc).await;
        assert_eq!(second.state, PassState::Done);
        assert_eq!(second.events_detected, 1);
        assert_eq!(second.events_notified, 1);
        assert_eq!(
            second.transitions,
            vec![
                PassState::Idle,
                PassState::Fetching,
                PassState::Storing,
                PassState::Detecting,
                PassState::Filtering,
                PassState::Notifying,
                PassState::Done
            ]
        );

        let sent = notifier.sent.borrow().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "Weather Alert: Breckenridge, CO");
        assert!(sent[0].1.contains("day-3"));

        // unchanged forecast: nothing detected, nothing sent
        let third = orchestrator.run_location(&loc).await;
        assert_eq!(third.state, PassState::Done);
        assert_eq!(third.events_detected, 0);
        assert_eq!(notifier.sent.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_already_notified_change_is_filtered() {
        let store = SqliteStore::in_memory().unwrap();
        let loc = add_location(&store, "80424", "Breckenridge");
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        fetcher.push(loc.id, Ok(snapshot(3, 6.5)));
        let notifier = FakeNotifier::default();
        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());
        orchestrator.run_location(&loc).await;
        orchestrator.run_location(&loc).await;

        // Re-comparing the same stored pair finds the change already recorded
        let dry = Orchestrator::new(
            &store,
            &fetcher,
            &notifier,
            OrchestratorSettings {
                dry_run: true,
                ..settings()
            },
        );
        let outcome = dry.run_location(&loc).await;
        assert_eq!(outcome.state, PassState::Done);
        assert_eq!(outcome.events_detected, 1);
        assert_eq!(outcome.events_notified, 0);
        assert!(!outcome.transitions.contains(&PassState::Fetching));
        assert!(!outcome.transitions.contains(&PassState::Notifying));
        assert_eq!(notifier.sent.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_isolated() {
        let store = SqliteStore::in_memory().unwrap();
        let broken = add_location(&store, "80424", "Breckenridge");
        let healthy = add_location(&store, "80435", "Keystone");
        let fetcher = FakeFetcher::default();
        fetcher.push(broken.id, Err(FetchError::Upstream { status: 503, message: "busy".into() }));
        fetcher.push(healthy.id, Ok(snapshot(0, 1.0)));
        let notifier = FakeNotifier::default();

        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());
        let summary = orchestrator.run(&[broken.clone(), healthy.clone()]).await;

        assert_eq!(summary.failed_count(), 1);
        assert!(!summary.all_succeeded());
        assert!(matches!(
            summary.outcomes[0].state,
            PassState::Failed(FailureReason::Fetch(_))
        ));
        assert_eq!(summary.outcomes[1].state, PassState::Done);
        assert_eq!(store.snapshot_count(broken.id).unwrap(), 0);
        assert_eq!(store.snapshot_count(healthy.id).unwrap(), 1);
        assert!(summary.outcomes[0].summary_line().contains("FAILED"));
    }

    #[tokio::test]
    async fn test_out_of_order_snapshot_fails_informationally() {
        let store = SqliteStore::in_memory().unwrap();
        let loc = add_location(&store, "80424", "Breckenridge");
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(5, 4.0)));
        fetcher.push(loc.id, Ok(snapshot(5, 9.0)));
        let notifier = FakeNotifier::default();
        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());

        orchestrator.run_location(&loc).await;
        let outcome = orchestrator.run_location(&loc).await;

        match &outcome.state {
            PassState::Failed(reason) => assert!(reason.is_informational()),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(store.snapshot_count(loc.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_notify_failure_retried_once_then_left_unrecorded() {
        let store = SqliteStore::in_memory().unwrap();
        let loc = add_location(&store, "80424", "Breckenridge");
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        fetcher.push(loc.id, Ok(snapshot(3, 6.5)));
        let notifier = FakeNotifier::failing(2);
        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());

        orchestrator.run_location(&loc).await;
        let outcome = orchestrator.run_location(&loc).await;

        assert!(matches!(
            outcome.state,
            PassState::Failed(FailureReason::Notifying(_))
        ));
        assert_eq!(notifier.attempts.get(), 2);
        assert_eq!(outcome.events_notified, 0);

        // Next run would retry: the change is still unrecorded
        let history = store.latest_two(loc.id).unwrap();
        let events = ChangeDetector::default().detect(&history[1], &history[0]).events;
        assert_eq!(store.filter_unnotified(loc.id, &events).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notify_succeeds_on_retry() {
        let store = SqliteStore::in_memory().unwrap();
        let loc = add_location(&store, "80424", "Breckenridge");
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        fetcher.push(loc.id, Ok(snapshot(3, 6.5)));
        let notifier = FakeNotifier::failing(1);
        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());

        orchestrator.run_location(&loc).await;
        let outcome = orchestrator.run_location(&loc).await;

        assert_eq!(outcome.state, PassState::Done);
        assert_eq!(outcome.events_notified, 1);
        assert_eq!(notifier.attempts.get(), 2);
    }

    #[tokio::test]
    async fn test_filtering_retried_once() {
        let inner = SqliteStore::in_memory().unwrap();
        let loc = add_location(&inner, "80424", "Breckenridge");
        let store = FlakyLedger::new(inner);
        store.filter_failures.set(1);
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        fetcher.push(loc.id, Ok(snapshot(3, 6.5)));
        fetcher.push(loc.id, Ok(snapshot(6, 9.0)));
        let notifier = FakeNotifier::default();
        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());

        orchestrator.run_location(&loc).await;
        let recovered = orchestrator.run_location(&loc).await;
        assert_eq!(recovered.state, PassState::Done);
        assert_eq!(recovered.events_notified, 1);

        store.filter_failures.set(2);
        let failed = orchestrator.run_location(&loc).await;
        assert!(matches!(
            failed.state,
            PassState::Failed(FailureReason::Filtering(_))
        ));
        assert_eq!(notifier.sent.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_no_notify_mode_detects_without_recording() {
        let store = SqliteStore::in_memory().unwrap();
        let loc = add_location(&store, "80424", "Breckenridge");
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        fetcher.push(loc.id, Ok(snapshot(3, 6.5)));
        let notifier = FakeNotifier::default();
        let orchestrator = Orchestrator::new(
            &store,
            &fetcher,
            &notifier,
            OrchestratorSettings {
                notify: false,
                ..settings()
            },
        );

        orchestrator.run_location(&loc).await;
        let outcome = orchestrator.run_location(&loc).await;
        assert_eq!(outcome.state, PassState::Done);
        assert_eq!(outcome.events_detected, 1);
        assert!(notifier.sent.borrow().is_empty());
        assert!(store
            .alerts_for_location(loc.id, Utc::now() - Duration::days(1))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_discussion_failure_is_only_a_warning() {
        let store = SqliteStore::in_memory().unwrap();
        let loc = add_location(&store, "80424", "Breckenridge");
        let fetcher = FakeFetcher {
            discussion_fails: true,
            ..Default::default()
        };
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        let notifier = FakeNotifier::default();

        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());
        let outcome = orchestrator.run_location(&loc).await;
        assert_eq!(outcome.state, PassState::Done);
        assert_eq!(store.discussion_count(loc.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retention_purges_old_snapshots() {
        let store = SqliteStore::in_memory().unwrap();
        let loc = add_location(&store, "80424", "Breckenridge");
        let mut old = snapshot(0, 1.0);
        old.captured_at = Utc::now() - Duration::days(45);
        store.append_snapshot(loc.id, &old).unwrap();

        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 1.0)));
        let notifier = FakeNotifier::default();
        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());

        let outcome = orchestrator.run_location(&loc).await;
        assert_eq!(outcome.state, PassState::Done);
        assert_eq!(outcome.events_detected, 0);
        assert_eq!(store.snapshot_count(loc.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_record_is_benign() {
        let inner = SqliteStore::in_memory().unwrap();
        let loc = add_location(&inner, "80424", "Breckenridge");
        let store = FlakyLedger::new(inner);
        store.record_race.set(true);
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        fetcher.push(loc.id, Ok(snapshot(3, 6.5)));
        let notifier = FakeNotifier::default();
        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());

        orchestrator.run_location(&loc).await;
        let outcome = orchestrator.run_location(&loc).await;

        assert_eq!(outcome.state, PassState::Done);
        assert_eq!(outcome.events_notified, 1);
        assert_eq!(notifier.sent.borrow().len(), 1);
        assert_eq!(
            store
                .inner
                .alerts_for_location(loc.id, Utc::now() - Duration::days(1))
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_record_failure_retried_once() {
        let inner = SqliteStore::in_memory().unwrap();
        let loc = add_location(&inner, "80424", "Breckenridge");
        let store = FlakyLedger::new(inner);
        store.record_failures.set(1);
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        fetcher.push(loc.id, Ok(snapshot(3, 6.5)));
        let notifier = FakeNotifier::default();
        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());

        orchestrator.run_location(&loc).await;
        let outcome = orchestrator.run_location(&loc).await;

        assert_eq!(outcome.state, PassState::Done);
        assert_eq!(outcome.events_notified, 1);
        assert_eq!(store.record_failures.get(), 0);
    }

    #[tokio::test]
    async fn test_sent_but_unrecorded_fails_pass() {
        let inner = SqliteStore::in_memory().unwrap();
        let loc = add_location(&inner, "80424", "Breckenridge");
        let store = FlakyLedger::new(inner);
        store.record_failures.set(2);
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        fetcher.push(loc.id, Ok(snapshot(3, 6.5)));
        let notifier = FakeNotifier::default();
        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());

        orchestrator.run_location(&loc).await;
        let outcome = orchestrator.run_location(&loc).await;

        match &outcome.state {
            PassState::Failed(FailureReason::Notifying(message)) => {
                assert!(message.contains("sent but not recorded"))
            }
            other => panic!("expected notifying failure, got {:?}", other),
        }
        assert_eq!(outcome.events_notified, 0);
        assert_eq!(notifier.sent.borrow().len(), 1);

        // still pending, so a later run may send it again
        let history = store.latest_two(loc.id).unwrap();
        let events = ChangeDetector::default().detect(&history[1], &history[0]).events;
        assert_eq!(store.filter_unnotified(loc.id, &events).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_changes_beyond_message_limit_stay_pending() {
        let store = SqliteStore::in_memory().unwrap();
        let loc = add_location(&store, "80424", "Breckenridge");
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        let mut current = snapshot(3, 6.5);
        current.periods[0].temperature_f = Some(35.0);
        fetcher.push(loc.id, Ok(current));
        let notifier = FakeNotifier::default();
        let one_line = OrchestratorSettings {
            message: MessageLimits {
                max_lines: 1,
                max_length: 250,
            },
            ..settings()
        };
        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, one_line);

        orchestrator.run_location(&loc).await;
        let outcome = orchestrator.run_location(&loc).await;

        assert_eq!(outcome.state, PassState::Done);
        assert_eq!(outcome.events_detected, 2);
        assert_eq!(outcome.events_notified, 1);
        let sent = notifier.sent.borrow().clone();
        assert!(sent[0].1.contains("... and 1 more changes"));

        // only the snow change was shown, so only it is recorded
        let history = store.latest_two(loc.id).unwrap();
        let events = ChangeDetector::default().detect(&history[1], &history[0]).events;
        let pending = store.filter_unnotified(loc.id, &events).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, snowwatch_weather::ChangeKind::Temperature);
    }

    #[tokio::test]
    async fn test_storms_tracked_after_storing() {
        let store = SqliteStore::in_memory().unwrap();
        let loc = add_location(&store, "80424", "Breckenridge");
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        fetcher.push(loc.id, Ok(snapshot(3, 6.5)));
        let notifier = FakeNotifier::default();
        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());

        orchestrator.run_location(&loc).await;
        orchestrator.run_location(&loc).await;

        let tracked = store.detected_events(loc.id, Utc::now() - Duration::days(7)).unwrap();
        assert_eq!(tracked.len(), 2);
        assert_eq!(tracked[0].event_id, tracked[1].event_id);
        assert_eq!(tracked[0].event.snow_total_in, 4.0);
        assert_eq!(tracked[1].event.snow_total_in, 6.5);
        assert_eq!(tracked[1].event.periods, vec!["day-3"]);
    }

    #[tokio::test]
    async fn test_storm_tracking_failure_is_only_a_warning() {
        let inner = SqliteStore::in_memory().unwrap();
        let loc = add_location(&inner, "80424", "Breckenridge");
        let store = FlakyLedger::new(inner);
        store.storms_fail.set(true);
        let fetcher = FakeFetcher::default();
        fetcher.push(loc.id, Ok(snapshot(0, 4.0)));
        let notifier = FakeNotifier::default();

        let orchestrator = Orchestrator::new(&store, &fetcher, &notifier, settings());
        let outcome = orchestrator.run_location(&loc).await;

        assert_eq!(outcome.state, PassState::Done);
        assert_eq!(store.inner.snapshot_count(loc.id).unwrap(), 1);
        assert!(store
            .inner
            .detected_events(loc.id, Utc::now() - Duration::days(7))
            .unwrap()
            .is_empty());
    }
}
