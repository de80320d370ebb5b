//! Retention manager for deleting records past the retention horizon.

use crate::clock::Clock;
use crate::db::{CleanupReport, DbError, Gateway};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;

/// Deletes samples and resolved outages older than the retention horizon.
pub struct RetentionManager {
    gateway: Arc<dyn Gateway>,
    clock: Arc<dyn Clock>,
}

impl RetentionManager {
    pub fn new(gateway: Arc<dyn Gateway>, clock: Arc<dyn Clock>) -> Self {
        Self { gateway, clock }
    }

    /// Delete everything older than `retention_days`. Ongoing outages are kept
    /// whatever their age.
    pub fn cleanup(&self, retention_days: u32) -> Result<CleanupReport, DbError> {
        let now = self.clock.now();
        let cutoff = ChronoDuration::try_days(i64::from(retention_days))
            .and_then(|horizon| now.checked_sub_signed(horizon))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let report = CleanupReport {
            cutoff: Some(cutoff),
            connectivity_samples: self.gateway.delete_connectivity_before(cutoff)?,
            speed_samples: self.gateway.delete_speed_before(cutoff)?,
            outage_events: self.gateway.delete_resolved_outages_before(cutoff)?,
        };

        if report.total() > 0 {
            tracing::info!(
                "RetentionManager: deleted {} connectivity samples, {} speed samples, {} outages older than {}",
                report.connectivity_samples,
                report.speed_samples,
                report.outage_events,
                cutoff
            );
        } else {
            tracing::debug!("RetentionManager: nothing older than {}", cutoff);
        }

        Ok(report)
    }
}
