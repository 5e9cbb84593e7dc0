use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use serde::Serialize;

use crate::asserter::{self, Diff, Options};
use crate::config::Config;
use crate::db::Snapshotter;
use crate::httpclient;
use crate::mock::MockServer;
use crate::service::{self, ManagedService};
use crate::snapshot::Snapshot;

/// Outcome of replaying a single snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub snapshot_id: String,
    pub snapshot_path: String,
    pub passed: bool,
    pub diffs: Vec<Diff>,
    #[serde(serialize_with = "serialize_duration_ms", rename = "duration_ms")]
    pub duration: Duration,
    pub error: String,
}

fn serialize_duration_ms<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// Replays snapshots against a running (or supervised) service and asserts
/// both the wire response and the resulting database state.
pub struct Replayer {
    config: Config,
    snapshotter: Snapshotter,
}

impl Replayer {
    /// Connects to the test database (the replay override when configured).
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let snapshotter =
            Snapshotter::connect(&config.database, config.replay_connection_string())
                .await
                .context("connect to test database")?;
        Ok(Self {
            config: config.clone(),
            snapshotter,
        })
    }

    pub async fn close(&self) {
        self.snapshotter.close().await;
    }

    /// Replays one snapshot: restore, (mock + service), fire, resnapshot,
    /// assert.
    pub async fn replay_one(&self, snap: &Snapshot, path: &str) -> TestResult {
        let started = Instant::now();
        let mut result = TestResult {
            snapshot_id: snap.id.clone(),
            snapshot_path: path.to_owned(),
            passed: false,
            diffs: Vec::new(),
            duration: Duration::ZERO,
            error: String::new(),
        };

        if let Err(err) = self.snapshotter.restore_all(&snap.db_state_before).await {
            result.error = format!("Failed to restore DB state: {err:#}");
            result.duration = started.elapsed();
            return result;
        }

        let mut mock_server: Option<MockServer> = None;
        let mut managed_service: Option<ManagedService> = None;

        if !snap.outgoing_requests.is_empty() {
            let mut mock = MockServer::new(&snap.outgoing_requests);
            match mock.start().await {
                Ok(addr) => {
                    let extra_env = vec![(
                        self.config.service.mock_env_var.clone(),
                        format!("http://{addr}"),
                    )];
                    mock_server = Some(mock);

                    match service::start_service(&self.config, &extra_env).await {
                        Ok(service) => managed_service = service,
                        Err(err) => {
                            result.error = format!("Failed to start service: {err:#}");
                        }
                    }
                }
                Err(err) => {
                    result.error = format!("Failed to start mock server: {err:#}");
                }
            }
        }

        if result.error.is_empty() {
            match self.fire_and_assert(snap).await {
                Ok(diffs) => result.diffs = diffs,
                Err(err) => result.error = err,
            }
        }

        if let Some(service) = managed_service.take() {
            service.stop().await;
        }
        if let Some(mut mock) = mock_server.take() {
            mock.stop().await;
        }

        result.passed = result.diffs.is_empty() && result.error.is_empty();
        result.duration = started.elapsed();
        result
    }

    async fn fire_and_assert(&self, snap: &Snapshot) -> Result<Vec<Diff>, String> {
        let actual_response = httpclient::fire_request(
            &self.config.service.base_url,
            &snap.request,
            self.config.replay.timeout_ms,
        )
        .await
        .map_err(|err| format!("Failed to send request: {err:#}"))?;

        let actual_db_after = self
            .snapshotter
            .snapshot_all()
            .await
            .map_err(|err| format!("Failed to snapshot DB after: {err:#}"))?;

        let opts = Options {
            ignore_fields: self.config.recording.ignore_fields.clone(),
            order_insensitive: HashSet::new(),
        };

        let mut diffs = asserter::assert_response(&snap.response, &actual_response, &opts);
        diffs.extend(asserter::assert_db_state(
            &snap.db_state_after,
            &actual_db_after,
            &opts,
        ));
        Ok(diffs)
    }

    /// Replays many snapshots. With `replay.parallel` the replays run as
    /// independent tasks against the shared database (isolation is the
    /// caller's responsibility); results keep the input order either way.
    pub async fn replay_all(
        self: &Arc<Self>,
        snapshots: Vec<Snapshot>,
        paths: Vec<String>,
    ) -> Vec<TestResult> {
        if !self.config.replay.parallel {
            let mut results = Vec::with_capacity(snapshots.len());
            for (snap, path) in snapshots.iter().zip(&paths) {
                results.push(self.replay_one(snap, path).await);
            }
            return results;
        }

        let mut handles = Vec::with_capacity(snapshots.len());
        for (index, (snap, path)) in snapshots.into_iter().zip(paths).enumerate() {
            let replayer = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                (index, replayer.replay_one(&snap, &path).await)
            }));
        }

        let mut results: Vec<Option<TestResult>> = Vec::new();
        results.resize_with(handles.len(), || None);
        for handle in handles {
            match handle.await {
                Ok((index, result)) => results[index] = Some(result),
                Err(err) => tracing::error!("replay task panicked: {err}"),
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.unwrap_or_else(|| TestResult {
                    snapshot_id: String::new(),
                    snapshot_path: String::new(),
                    passed: false,
                    diffs: Vec::new(),
                    duration: Duration::ZERO,
                    error: format!("replay task {index} did not complete"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::TestResult;

    #[test]
    fn test_result_serializes_duration_as_milliseconds() {
        let result = TestResult {
            snapshot_id: "abc".to_owned(),
            snapshot_path: "p".to_owned(),
            passed: true,
            diffs: Vec::new(),
            duration: Duration::from_millis(1500),
            error: String::new(),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["duration_ms"], json!(1500.0));
        assert_eq!(value["passed"], json!(true));
    }
}
