/// Tunables for one trace scan. All values are fixed for the lifetime of a
/// scan; the defaults match the collector that emits the traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileConfig {
    /// A decode-blocked sample this many cycles (or fewer) after a flush is
    /// attributed to that flush.
    pub post_flush_window_cycles: u64,
    /// Pending-replay source count at which the rename queue is considered full.
    pub pending_replay_full_lanes: u64,
    /// Number of PC / instruction hotspots kept from commit detail.
    pub hotspot_limit: usize,
    /// Commit-width histogram always carries keys `0..min_commit_width_buckets`.
    pub min_commit_width_buckets: u32,
    /// Occupancy bins for the sampled fetch-queue reconstruction.
    pub fq_occ_bins: u64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        ProfileConfig {
            post_flush_window_cycles: 16,
            pending_replay_full_lanes: 4,
            hotspot_limit: 10,
            min_commit_width_buckets: 5,
            fq_occ_bins: 16,
        }
    }
}
