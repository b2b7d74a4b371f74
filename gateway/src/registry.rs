//! Connection registry.
//!
//! Maps opaque connection ids to live backend handles. The registry is the
//! only owner of connection records; handlers receive it through the
//! application state. Idle records are reaped by [`spawn_reaper`] and every
//! remaining record is closed by [`ConnectionRegistry::close_all`] at
//! shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use common::errors::{AppError, AppResult};
use common::models::DbType;
use common::utils::IdGenerator;

use crate::connectors::{ConnectionHandle, ConnectorRegistry};

/// One open connection.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: String,
    pub db_type: DbType,
    pub handle: ConnectionHandle,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl ConnectionRecord {
    /// Time since the record was last used, zero if the clock went backwards.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_used_at).to_std().unwrap_or_default()
    }
}

/// Process-wide table of open connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    records: RwLock<HashMap<String, ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a freshly opened handle under a new id.
    pub async fn register(&self, db_type: DbType, handle: ConnectionHandle) -> String {
        let mut records = self.records.write().await;
        let mut id = IdGenerator::connection_id();
        while records.contains_key(&id) {
            id = IdGenerator::connection_id();
        }

        let now = Utc::now();
        records.insert(
            id.clone(),
            ConnectionRecord {
                id: id.clone(),
                db_type,
                handle,
                created_at: now,
                last_used_at: now,
            },
        );
        id
    }

    /// Returns a copy of the record; the handle inside shares the live resource.
    pub async fn resolve(&self, id: &str) -> AppResult<ConnectionRecord> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::ConnectionNotFound(id.to_string()))
    }

    pub async fn touch(&self, id: &str) -> AppResult<()> {
        match self.records.write().await.get_mut(id) {
            Some(record) => {
                record.last_used_at = Utc::now();
                Ok(())
            }
            None => Err(AppError::ConnectionNotFound(id.to_string())),
        }
    }

    pub async fn remove(&self, id: &str) -> Option<ConnectionRecord> {
        self.records.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Removes and returns every record idle for at least `max_idle` at `now`.
    pub async fn take_idle(&self, max_idle: Duration, now: DateTime<Utc>) -> Vec<ConnectionRecord> {
        let mut records = self.records.write().await;
        let expired: Vec<String> = records
            .values()
            .filter(|r| r.idle_for(now) >= max_idle)
            .map(|r| r.id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| records.remove(id))
            .collect()
    }

    /// Removes and returns every record.
    pub async fn drain(&self) -> Vec<ConnectionRecord> {
        self.records.write().await.drain().map(|(_, r)| r).collect()
    }

    /// Closes and removes connections idle for at least `max_idle`.
    pub async fn reap_idle(&self, connectors: &ConnectorRegistry, max_idle: Duration) -> usize {
        let expired = self.take_idle(max_idle, Utc::now()).await;
        let count = expired.len();
        for record in expired {
            tracing::info!(
                connection_id = %record.id,
                db_type = %record.db_type,
                idle_secs = record.idle_for(Utc::now()).as_secs(),
                "Reaping idle connection"
            );
            close_record(connectors, &record).await;
        }
        count
    }

    /// Closes and removes every remaining connection.
    pub async fn close_all(&self, connectors: &ConnectorRegistry) {
        let records = self.drain().await;
        if !records.is_empty() {
            tracing::info!(count = records.len(), "Closing open connections");
        }
        for record in records {
            close_record(connectors, &record).await;
        }
    }
}

async fn close_record(connectors: &ConnectorRegistry, record: &ConnectionRecord) {
    let result = match connectors.get(record.db_type) {
        Ok(connector) => connector.close_connection(&record.handle).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::warn!(connection_id = %record.id, error = %e, "Failed to close connection");
    }
}

/// Starts the idle-connection sweep. Returns `None` when reaping is disabled.
pub fn spawn_reaper(
    registry: Arc<ConnectionRegistry>,
    connectors: Arc<ConnectorRegistry>,
    max_idle: Option<Duration>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    let max_idle = max_idle?;
    tracing::info!(
        idle_timeout_secs = max_idle.as_secs(),
        interval_secs = interval.as_secs(),
        "Idle connection reaper started"
    );
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reaped = registry.reap_idle(&connectors, max_idle).await;
            if reaped > 0 {
                let remaining = registry.len().await;
                tracing::debug!(reaped, remaining, "Reaper sweep finished");
            }
        }
    }))
}
