//! The market side of the bridge, kept behind traits: snapshots and
//! action outcomes flow out, action items flow in through a channel
//! owned by the task layer.

use async_trait::async_trait;
use tracing::info;

use crate::actions::types::ActionOutcome;
use crate::dto::Snapshot;

#[async_trait]
pub trait MarketTransport: Send + Sync {
    /// Transmits one full-discovery snapshot.
    async fn send_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()>;

    /// Reports the outcome of one executed action.
    async fn report_outcome(&self, outcome: &ActionOutcome) -> anyhow::Result<()>;
}

/// Stand-in transport used until a wire transport is plugged in; logs
/// what would be sent. Also convenient in tests.
#[derive(Default)]
pub struct LoggingTransport;

#[async_trait]
impl MarketTransport for LoggingTransport {
    async fn send_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        info!(
            cluster = %snapshot.cluster_name,
            entities = snapshot.entities.len(),
            "snapshot ready for the market"
        );
        Ok(())
    }

    async fn report_outcome(&self, outcome: &ActionOutcome) -> anyhow::Result<()> {
        info!(
            action_id = outcome.action_id,
            succeeded = outcome.succeeded,
            "action outcome: {}",
            outcome.message
        );
        Ok(())
    }
}
