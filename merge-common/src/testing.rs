//! In-memory implementations of the pipeline's storage and lookup traits, for tests that should
//! not need PostgreSQL or the network.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time;

use async_trait::async_trait;
use chrono::Utc;

use crate::address::{Geocode, GeocodeError, GeocodeRequest, ReferenceKey, ReferenceLookup};
use crate::classify::ErrorReport;
use crate::error::DatabaseError;
use crate::model::{BuildingReferenceMatch, Coordinate, NormalizedCustomer, StagingRow};
use crate::runs::{ImportRun, MergeStatus, NewImportRun, RunCounts, RunError, RunStore};
use crate::staging::StagingSource;
use crate::writer::{CustomerWriter, UpsertCounts};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unavailable(what: &str) -> DatabaseError {
    DatabaseError::Unavailable(format!("{what} is unavailable"))
}

#[derive(Default)]
pub struct InMemoryStagingSource {
    rows: Mutex<Vec<StagingRow>>,
}

impl InMemoryStagingSource {
    pub fn stage(&self, row: StagingRow) {
        lock(&self.rows).push(row);
    }
}

#[async_trait]
impl StagingSource for InMemoryStagingSource {
    async fn load(&self, import_id: i64) -> Result<Vec<StagingRow>, DatabaseError> {
        Ok(lock(&self.rows)
            .iter()
            .filter(|row| row.import_id == import_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryReferenceLookup {
    entries: Mutex<HashMap<ReferenceKey, BuildingReferenceMatch>>,
    failing: bool,
}

impl InMemoryReferenceLookup {
    /// A lookup whose every query fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn insert(&self, key: ReferenceKey, reference: BuildingReferenceMatch) {
        lock(&self.entries).insert(key, reference);
    }
}

#[async_trait]
impl ReferenceLookup for InMemoryReferenceLookup {
    async fn find(&self, key: &ReferenceKey) -> Result<Option<BuildingReferenceMatch>, DatabaseError> {
        if self.failing {
            return Err(unavailable("building reference"));
        }
        Ok(lock(&self.entries).get(key).cloned())
    }
}

enum GeocoderBehavior {
    Hit(Coordinate),
    Miss,
    Fail,
}

/// Answers every request the same way and counts the requests.
pub struct StaticGeocoder {
    behavior: GeocoderBehavior,
    calls: AtomicUsize,
}

impl StaticGeocoder {
    fn with(behavior: GeocoderBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn hit(coordinate: Coordinate) -> Self {
        Self::with(GeocoderBehavior::Hit(coordinate))
    }

    pub fn miss() -> Self {
        Self::with(GeocoderBehavior::Miss)
    }

    pub fn failing() -> Self {
        Self::with(GeocoderBehavior::Fail)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Geocode for StaticGeocoder {
    async fn geocode(&self, _request: &GeocodeRequest) -> Result<Coordinate, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            GeocoderBehavior::Hit(coordinate) => Ok(*coordinate),
            GeocoderBehavior::Miss => Err(GeocodeError::NoResults),
            GeocoderBehavior::Fail => Err(GeocodeError::StatusError(503)),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    /// Customer and its `aktiv` flag.
    customers: BTreeMap<String, (NormalizedCustomer, bool)>,
    reports: BTreeMap<String, ErrorReport>,
    upsert_calls: usize,
    fail_upsert_call: Option<usize>,
    fail_reports: bool,
    fail_deactivate: bool,
}

/// A customer registry with the same insert/update/no-op accounting as the database writer.
#[derive(Default)]
pub struct InMemoryCustomerWriter {
    state: Mutex<RegistryState>,
}

impl InMemoryCustomerWriter {
    /// Fail the `call`-th customer upsert (1-based) and every one after it.
    pub fn fail_upsert_from_call(self, call: usize) -> Self {
        lock(&self.state).fail_upsert_call = Some(call);
        self
    }

    pub fn fail_error_reports(self) -> Self {
        lock(&self.state).fail_reports = true;
        self
    }

    pub fn fail_deactivation(self) -> Self {
        lock(&self.state).fail_deactivate = true;
        self
    }

    /// Seed the registry with a customer from an earlier run.
    pub fn insert_existing(&self, customer: NormalizedCustomer, active: bool) {
        lock(&self.state)
            .customers
            .insert(customer.customer_number.clone(), (customer, active));
    }

    pub fn customer(&self, customer_number: &str) -> Option<NormalizedCustomer> {
        lock(&self.state)
            .customers
            .get(customer_number)
            .map(|(customer, _)| customer.clone())
    }

    pub fn customers(&self) -> Vec<NormalizedCustomer> {
        lock(&self.state)
            .customers
            .values()
            .map(|(customer, _)| customer.clone())
            .collect()
    }

    pub fn is_active(&self, customer_number: &str) -> Option<bool> {
        lock(&self.state)
            .customers
            .get(customer_number)
            .map(|(_, active)| *active)
    }

    pub fn report(&self, customer_number: &str) -> Option<ErrorReport> {
        lock(&self.state).reports.get(customer_number).cloned()
    }

    pub fn upsert_calls(&self) -> usize {
        lock(&self.state).upsert_calls
    }
}

#[async_trait]
impl CustomerWriter for InMemoryCustomerWriter {
    async fn upsert_customers(
        &self,
        customers: &[NormalizedCustomer],
    ) -> Result<UpsertCounts, DatabaseError> {
        if customers.is_empty() {
            return Ok(UpsertCounts::default());
        }
        let mut state = lock(&self.state);
        state.upsert_calls += 1;
        if state.fail_upsert_call.is_some_and(|call| state.upsert_calls >= call) {
            return Err(unavailable("customer registry"));
        }

        let mut latest: BTreeMap<&str, &NormalizedCustomer> = BTreeMap::new();
        for customer in customers {
            latest.insert(customer.customer_number.as_str(), customer);
        }

        let mut counts = UpsertCounts::default();
        for (number, customer) in latest {
            match state.customers.get(number) {
                None => counts.inserted += 1,
                Some((stored, active)) if stored == customer && *active => continue,
                Some(_) => counts.updated += 1,
            }
            state
                .customers
                .insert(number.to_owned(), (customer.clone(), true));
        }

        Ok(counts)
    }

    async fn upsert_error_reports(&self, reports: &[ErrorReport]) -> Result<(), DatabaseError> {
        let mut state = lock(&self.state);
        if state.fail_reports {
            return Err(unavailable("error report table"));
        }
        for report in reports {
            state
                .reports
                .insert(report.customer_number.clone(), report.clone());
        }
        Ok(())
    }

    async fn deactivate_unseen(&self, seen: &HashSet<String>) -> Result<u64, DatabaseError> {
        let mut state = lock(&self.state);
        if state.fail_deactivate {
            return Err(unavailable("customer registry"));
        }
        if seen.is_empty() {
            return Ok(0);
        }

        let mut deactivated = 0;
        for (number, (_, active)) in state.customers.iter_mut() {
            if *active && !seen.contains(number) {
                *active = false;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }
}

/// Run bookkeeping with the same state transitions as the database store.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: Mutex<BTreeMap<i64, ImportRun>>,
}

impl InMemoryRunStore {
    pub fn register(&self, run: NewImportRun) {
        let run = ImportRun {
            import_id: run.import_id,
            imported_at: run.imported_at,
            imported_by: run.imported_by,
            file_name: run.file_name,
            staged_rows: run.staged_rows,
            inserted_rows: 0,
            updated_rows: 0,
            deactivated_rows: 0,
            error_rows: 0,
            merged: false,
            merge_status: MergeStatus::Pending,
            merge_started_at: None,
            merged_at: None,
            failed_stage: None,
            failure_reason: None,
        };
        lock(&self.runs).insert(run.import_id, run);
    }

    pub fn run(&self, import_id: i64) -> Option<ImportRun> {
        lock(&self.runs).get(&import_id).cloned()
    }

    fn running(&self, import_id: i64) -> Result<MutexGuard<'_, BTreeMap<i64, ImportRun>>, RunError> {
        let runs = lock(&self.runs);
        let is_running = runs
            .get(&import_id)
            .is_some_and(|run| run.merge_status == MergeStatus::Running);
        if is_running {
            Ok(runs)
        } else {
            Err(RunError::NotRunning(import_id))
        }
    }
}

fn record_counts(run: &mut ImportRun, counts: &RunCounts) {
    let to_db = |count: u64| i64::try_from(count).unwrap_or(i64::MAX);
    run.inserted_rows = to_db(counts.inserted);
    run.updated_rows = to_db(counts.updated);
    run.deactivated_rows = to_db(counts.deactivated);
    run.error_rows = to_db(counts.with_errors);
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn claim(&self, import_id: i64) -> Result<ImportRun, RunError> {
        let mut runs = lock(&self.runs);
        let run = runs.get_mut(&import_id).ok_or(RunError::NotFound(import_id))?;

        match run.merge_status {
            MergeStatus::Merged => Err(RunError::AlreadyMerged(import_id)),
            MergeStatus::Running => Err(RunError::InProgress(import_id)),
            MergeStatus::Pending | MergeStatus::Failed => {
                run.merge_status = MergeStatus::Running;
                run.merge_started_at = Some(Utc::now());
                run.failed_stage = None;
                run.failure_reason = None;
                Ok(run.clone())
            }
        }
    }

    async fn claim_next(&self) -> Result<Option<ImportRun>, RunError> {
        let mut runs = lock(&self.runs);
        let next = runs
            .values_mut()
            .filter(|run| run.merge_status == MergeStatus::Pending)
            .min_by_key(|run| run.imported_at);

        Ok(next.map(|run| {
            run.merge_status = MergeStatus::Running;
            run.merge_started_at = Some(Utc::now());
            run.clone()
        }))
    }

    async fn complete(&self, import_id: i64, counts: &RunCounts) -> Result<(), RunError> {
        let mut runs = self.running(import_id)?;
        if let Some(run) = runs.get_mut(&import_id) {
            run.merge_status = MergeStatus::Merged;
            run.merged = true;
            run.merged_at = Some(Utc::now());
            record_counts(run, counts);
        }
        Ok(())
    }

    async fn fail(
        &self,
        import_id: i64,
        stage: &str,
        reason: &str,
        counts: &RunCounts,
    ) -> Result<(), RunError> {
        let mut runs = self.running(import_id)?;
        if let Some(run) = runs.get_mut(&import_id) {
            run.merge_status = MergeStatus::Failed;
            run.merged = false;
            run.failed_stage = Some(stage.to_owned());
            run.failure_reason = Some(reason.to_owned());
            record_counts(run, counts);
        }
        Ok(())
    }

    async fn release_stalled(&self, timeout: time::Duration) -> Result<u64, RunError> {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Ok(0);
        };
        let cutoff = Utc::now() - timeout;

        let mut released = 0;
        for run in lock(&self.runs).values_mut() {
            let stalled = run.merge_status == MergeStatus::Running
                && run.merge_started_at.is_some_and(|started| started <= cutoff);
            if stalled {
                run.merge_status = MergeStatus::Pending;
                run.merge_started_at = None;
                released += 1;
            }
        }
        Ok(released)
    }
}
