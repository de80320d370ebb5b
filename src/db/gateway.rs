//! Storage contract the monitoring engine depends on.

use chrono::{DateTime, Utc};

use super::models::*;
use super::store::DbError;

/// Durable storage for samples and outage events.
///
/// Implementations must tolerate concurrent calls from the reachability,
/// speed-test and retention loops. Each call is all-or-nothing.
pub trait Gateway: Send + Sync {
    // --- Append ---

    /// Append one probe round. Either every sample is written or none is.
    fn append_connectivity(&self, samples: &[ConnectivitySample]) -> Result<(), DbError>;

    fn append_speed(&self, sample: &SpeedSample) -> Result<(), DbError>;

    /// Record a new ongoing outage and return its id.
    fn append_outage(&self, outage: &NewOutage) -> Result<i64, DbError>;

    // --- Mutate ---

    /// Close the ongoing outage `id` at `end`.
    fn resolve_outage(&self, id: i64, end: DateTime<Utc>) -> Result<(), DbError>;

    // --- Query by time range ---

    fn connectivity_in(&self, window: &TimeWindow) -> Result<Vec<ConnectivitySample>, DbError>;

    fn speed_in(&self, window: &TimeWindow) -> Result<Vec<SpeedSample>, DbError>;

    /// Outages overlapping the window, ongoing ones included.
    fn outages_in(&self, window: &TimeWindow) -> Result<Vec<OutageEvent>, DbError>;

    // --- Delete older than ---

    fn delete_connectivity_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError>;

    fn delete_speed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError>;

    /// Delete resolved outages that ended before `cutoff`. Ongoing outages are never touched.
    fn delete_resolved_outages_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError>;

    // --- Latest ---

    fn latest_connectivity(&self) -> Result<Option<ConnectivitySample>, DbError>;

    /// Every sample of the most recent probe round.
    fn latest_round(&self) -> Result<Vec<ConnectivitySample>, DbError>;

    fn latest_speed(&self) -> Result<Option<SpeedSample>, DbError>;

    fn ongoing_outage(&self) -> Result<Option<OutageEvent>, DbError>;
}
