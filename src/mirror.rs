//! Redis write-through of job snapshots.
//!
//! The mirror is for observability only: other processes can read
//! `export:status:<job_id>` to see what the service is doing. Nothing is
//! ever read back at startup.

use crate::broadcast::Subscription;
use crate::job::{JobId, JobStatus};
use crate::snapshot::Snapshot;
use anyhow::{Context, Result};
use redis::{aio::ConnectionManager, AsyncCommands};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Status key prefix for mirrored snapshots.
const STATUS_KEY_PREFIX: &str = "export:status";

/// Snapshot TTL in seconds (24 hours).
const STATUS_TTL_SECONDS: u64 = 86400;

/// Decides which snapshots are worth a Redis round trip.
///
/// Progress ticks within one status are limited to one per `interval` per
/// job. Every other snapshot is written.
#[derive(Debug)]
struct Throttle {
    interval: Duration,
    last: HashMap<JobId, (Instant, JobStatus)>,
}

impl Throttle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
        }
    }

    fn should_write(&mut self, snapshot: &Snapshot, now: Instant) -> bool {
        if snapshot.is_terminal() {
            self.last.remove(&snapshot.job_id);
            return true;
        }
        if snapshot.status == JobStatus::Queued {
            // Position changes are rare and each one matters.
            return true;
        }
        let write = match self.last.get(&snapshot.job_id) {
            Some((at, status)) => {
                *status != snapshot.status || now.duration_since(*at) >= self.interval
            }
            None => true,
        };
        if write {
            self.last
                .insert(snapshot.job_id.clone(), (now, snapshot.status));
        }
        write
    }
}

/// Writes snapshots to Redis status keys.
pub struct StatusMirror {
    conn: ConnectionManager,
    throttle: Throttle,
}

impl StatusMirror {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection string
    /// * `write_interval` - Minimum spacing of progress writes per job
    pub async fn connect(redis_url: &str, write_interval: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!("Connected to Redis status mirror");
        Ok(Self {
            conn,
            throttle: Throttle::new(write_interval),
        })
    }

    pub fn status_key(job_id: &JobId) -> String {
        format!("{}:{}", STATUS_KEY_PREFIX, job_id)
    }

    /// Writes `snapshot` to its status key with a 24h TTL.
    pub async fn write(&mut self, snapshot: &Snapshot) -> Result<()> {
        let key = Self::status_key(&snapshot.job_id);
        let json = serde_json::to_string(snapshot).context("Failed to serialize snapshot")?;

        self.conn
            .set_ex::<_, _, ()>(&key, &json, STATUS_TTL_SECONDS)
            .await
            .context("Failed to write job status")?;

        debug!(job_id = %snapshot.job_id, status = %snapshot.status, "Mirrored snapshot");
        Ok(())
    }

    /// Reads a mirrored snapshot back. The service itself never does.
    ///
    /// # Returns
    ///
    /// Returns `Ok(Some(snapshot))` if the key exists, `Ok(None)` if not.
    #[cfg(test)]
    async fn read(&mut self, job_id: &JobId) -> Result<Option<Snapshot>> {
        let json: Option<String> = self
            .conn
            .get(Self::status_key(job_id))
            .await
            .context("Failed to get job status")?;

        json.map(|json| serde_json::from_str(&json).context("Failed to deserialize job status"))
            .transpose()
    }

    /// Mirrors every snapshot delivered to `subscription` until it closes.
    /// Write failures are logged and never reach the job.
    pub fn spawn(mut self, mut subscription: Subscription) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(snapshot) = subscription.recv().await {
                if !self.throttle.should_write(&snapshot, Instant::now()) {
                    continue;
                }
                if let Err(e) = self.write(&snapshot).await {
                    warn!(job_id = %snapshot.job_id, error = ?e, "Status mirror write failed");
                }
            }
            if subscription.dropped() > 0 {
                debug!(dropped = subscription.dropped(), "Status mirror skipped snapshots");
            }
            info!("Status mirror stopped");
        })
    }
}
