//! Agent liveness sweep.
//!
//! Periodically walks the agent table and ages statuses: past the timeout an
//! agent goes offline, past 70% of it a healthy agent drops to warning. A
//! warning set by event ingest is never upgraded here; only a fresh
//! `healthy` heartbeat restores an agent.

use std::time::Duration;

use hg_store::{AgentStatus, Store, StoreError};
use time::OffsetDateTime;
use tracing::{error, info, warn};

const WARNING_FRACTION: f64 = 0.7;

/// One pass over the agent table against the given clock.
pub async fn sweep_once(store: &Store, agent_timeout: i64, now: i64) -> Result<(), StoreError> {
    for agent in store.get_all_agents().await? {
        if agent.status == AgentStatus::Offline {
            continue;
        }
        let silent_for = now - agent.last_seen;
        if silent_for > agent_timeout {
            warn!(
                agent = %agent.agent_id,
                silent_for,
                "agent timed out, marking offline"
            );
            store
                .update_agent_status(&agent.agent_id, AgentStatus::Offline)
                .await?;
        } else if silent_for as f64 > agent_timeout as f64 * WARNING_FRACTION
            && agent.status == AgentStatus::Healthy
        {
            info!(agent = %agent.agent_id, silent_for, "agent entering warning state");
            store
                .update_agent_status(&agent.agent_id, AgentStatus::Warning)
                .await?;
        }
    }
    Ok(())
}

/// The periodic sweep task; runs until the collector shuts down.
pub async fn run(store: Store, agent_timeout: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        if let Err(err) = sweep_once(&store, agent_timeout.as_secs() as i64, now).await {
            error!(error = %err, "liveness sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::TempDir;

    async fn store_with_agent(status: AgentStatus) -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("test.db"), "pw").await.unwrap();
        store
            .register_agent("agent-001", None, None, Map::new())
            .await
            .unwrap();
        store
            .update_agent_status("agent-001", status)
            .await
            .unwrap();
        (dir, store)
    }

    async fn status(store: &Store) -> AgentStatus {
        store.get_agent("agent-001").await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn silent_agent_goes_offline_after_timeout() {
        let (_dir, store) = store_with_agent(AgentStatus::Healthy).await;
        let last_seen = store.get_agent("agent-001").await.unwrap().unwrap().last_seen;
        sweep_once(&store, 90, last_seen + 91).await.unwrap();
        assert_eq!(status(&store).await, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn healthy_agent_warns_past_seventy_percent() {
        let (_dir, store) = store_with_agent(AgentStatus::Healthy).await;
        let last_seen = store.get_agent("agent-001").await.unwrap().unwrap().last_seen;
        sweep_once(&store, 90, last_seen + 70).await.unwrap();
        assert_eq!(status(&store).await, AgentStatus::Warning);
    }

    #[tokio::test]
    async fn fresh_agent_left_alone() {
        let (_dir, store) = store_with_agent(AgentStatus::Healthy).await;
        let last_seen = store.get_agent("agent-001").await.unwrap().unwrap().last_seen;
        sweep_once(&store, 90, last_seen + 10).await.unwrap();
        assert_eq!(status(&store).await, AgentStatus::Healthy);
    }

    #[tokio::test]
    async fn ingest_warning_not_touched_by_recency() {
        // A warning set because an event fired stays a warning inside the
        // timeout; only a healthy heartbeat may clear it.
        let (_dir, store) = store_with_agent(AgentStatus::Warning).await;
        let last_seen = store.get_agent("agent-001").await.unwrap().unwrap().last_seen;
        sweep_once(&store, 90, last_seen + 70).await.unwrap();
        assert_eq!(status(&store).await, AgentStatus::Warning);
    }

    #[tokio::test]
    async fn offline_agents_skipped() {
        let (_dir, store) = store_with_agent(AgentStatus::Offline).await;
        let last_seen = store.get_agent("agent-001").await.unwrap().unwrap().last_seen;
        sweep_once(&store, 90, last_seen + 1000).await.unwrap();
        assert_eq!(status(&store).await, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn healthy_heartbeat_restores_after_offline() {
        let (_dir, store) = store_with_agent(AgentStatus::Healthy).await;
        let last_seen = store.get_agent("agent-001").await.unwrap().unwrap().last_seen;
        sweep_once(&store, 90, last_seen + 200).await.unwrap();
        assert_eq!(status(&store).await, AgentStatus::Offline);

        // The reconnecting agent's heartbeat path.
        store
            .update_agent_status("agent-001", AgentStatus::Healthy)
            .await
            .unwrap();
        assert_eq!(status(&store).await, AgentStatus::Healthy);
    }
}
