use std::sync::Arc;
use std::time;

use merge_common::health::HealthHandle;
use merge_common::runs::RunStore;
use tracing::{error, info, warn};

use crate::merger::Merger;

/// Polls the run table for staged imports and merges them one at a time.
pub struct MergeWorker {
    /// An identifier for this worker, used in logs.
    name: String,
    merger: Merger,
    runs: Arc<dyn RunStore + Send + Sync>,
    /// The interval for polling the run table.
    poll_interval: time::Duration,
    /// Claimed runs older than this are assumed dead and released.
    stalled_run_timeout: time::Duration,
    /// Reported healthy on every tick and after every merged import.
    liveness: HealthHandle,
}

impl MergeWorker {
    pub fn new(
        name: &str,
        merger: Merger,
        runs: Arc<dyn RunStore + Send + Sync>,
        poll_interval: time::Duration,
        stalled_run_timeout: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            merger,
            runs,
            poll_interval,
            stalled_run_timeout,
            liveness,
        }
    }

    /// Run the poll loop forever.
    pub async fn run(&self) {
        info!(worker = %self.name, "starting merge worker");
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;
            self.poll().await;
        }
    }

    /// Release stalled runs, then merge pending imports until none are left.
    /// Returns how many imports were picked up.
    pub async fn poll(&self) -> usize {
        match self.runs.release_stalled(self.stalled_run_timeout).await {
            Ok(0) => (),
            Ok(released) => warn!(released, "released stalled merge runs"),
            Err(error) => error!("failed to release stalled merge runs: {}", error),
        }

        let mut picked_up = 0;
        loop {
            let run = match self.runs.claim_next().await {
                Ok(Some(run)) => run,
                Ok(None) => break,
                Err(error) => {
                    error!("failed to claim next import: {}", error);
                    break;
                }
            };
            picked_up += 1;

            // Failures are recorded on the run by the merger.
            if let Ok(summary) = self.merger.merge_claimed(&run).await {
                info!(worker = %self.name, import_id = summary.import_id, "merged import");
            }
            self.liveness.report_healthy().await;
        }

        picked_up
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use merge_common::address::AddressResolver;
    use merge_common::health::HealthRegistry;
    use merge_common::model::StagingRow;
    use merge_common::runs::{MergeStatus, NewImportRun};
    use merge_common::testing::{
        InMemoryCustomerWriter, InMemoryReferenceLookup, InMemoryRunStore, InMemoryStagingSource,
    };

    use super::*;
    use crate::merger::DEFAULT_BATCH_SIZE;

    async fn worker(
        staging: Arc<InMemoryStagingSource>,
        runs: Arc<InMemoryRunStore>,
    ) -> MergeWorker {
        let resolver = AddressResolver::new(Arc::new(InMemoryReferenceLookup::default()), None);
        let merger = Merger::new(
            staging,
            resolver,
            Arc::new(InMemoryCustomerWriter::default()),
            runs.clone(),
            DEFAULT_BATCH_SIZE,
        );
        let liveness = HealthRegistry::new("liveness")
            .register("merge_worker", ::time::Duration::seconds(30))
            .await;

        MergeWorker::new(
            "test-worker",
            merger,
            runs,
            time::Duration::from_millis(10),
            time::Duration::from_secs(3600),
            liveness,
        )
    }

    fn register(runs: &InMemoryRunStore, import_id: i64, minutes_ago: i64) {
        runs.register(NewImportRun {
            import_id,
            imported_at: Utc::now() - Duration::minutes(minutes_ago),
            imported_by: "test".to_owned(),
            file_name: None,
            staged_rows: 1,
        });
    }

    fn row(id: i64, import_id: i64) -> StagingRow {
        StagingRow {
            id,
            import_id,
            imported_at: Utc::now(),
            customer: Some("Mustermann, Max".to_owned()),
            street: Some("Musterstraße 12".to_owned()),
            postal_code: Some("47051".to_owned()),
            city: Some("Duisburg".to_owned()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_poll_merges_all_pending_imports() {
        let staging = Arc::new(InMemoryStagingSource::default());
        let runs = Arc::new(InMemoryRunStore::default());
        register(&runs, 1, 10);
        register(&runs, 2, 5);
        staging.stage(row(1, 1));
        staging.stage(row(2, 2));
        let worker = worker(staging, runs.clone()).await;

        assert_eq!(worker.poll().await, 2);
        assert_eq!(worker.poll().await, 0);

        assert_eq!(runs.run(1).unwrap().merge_status, MergeStatus::Merged);
        assert_eq!(runs.run(2).unwrap().merge_status, MergeStatus::Merged);
    }

    #[tokio::test]
    async fn test_poll_records_failed_imports_and_continues() {
        let staging = Arc::new(InMemoryStagingSource::default());
        let runs = Arc::new(InMemoryRunStore::default());
        register(&runs, 1, 10);
        register(&runs, 2, 5);
        staging.stage(row(2, 2));
        let worker = worker(staging, runs.clone()).await;

        assert_eq!(worker.poll().await, 2);

        let empty = runs.run(1).unwrap();
        assert_eq!(empty.merge_status, MergeStatus::Failed);
        assert_eq!(empty.failed_stage.as_deref(), Some("load_staging"));
        assert_eq!(runs.run(2).unwrap().merge_status, MergeStatus::Merged);
    }

    #[tokio::test]
    async fn test_poll_releases_stalled_runs() {
        let staging = Arc::new(InMemoryStagingSource::default());
        let runs = Arc::new(InMemoryRunStore::default());
        register(&runs, 1, 120);
        staging.stage(row(1, 1));
        runs.claim(1).await.unwrap();
        let worker = MergeWorker {
            stalled_run_timeout: time::Duration::ZERO,
            ..worker(staging, runs.clone()).await
        };

        assert_eq!(worker.poll().await, 1);
        assert_eq!(runs.run(1).unwrap().merge_status, MergeStatus::Merged);
    }
}
