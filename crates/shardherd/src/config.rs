//! Tunables for the team collection and its background tasks.
//!
//! Defaults match production settings; tests shrink the delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::ReplicationPolicy;
use crate::types::EngineType;

/// How storage-engine migration interacts with the wrong-engine remover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationMode {
    /// Only the perpetual wiggle replaces wrong-engine servers.
    Gradual,
    /// The wrong-engine remover may also delete them directly.
    Aggressive,
}

#[derive(Debug, Clone)]
pub struct TeamCollectionConfig {
    /// Number of servers in every server team (and machines in every machine
    /// team).
    pub team_size: usize,
    /// Replication policy every team must satisfy.
    pub policy: ReplicationPolicy,
    /// Storage engine newly recruited servers must run.
    pub engine: EngineType,
    /// Engine used for test storage servers.
    pub tss_engine: EngineType,
    /// Target number of paired test storage servers across the cluster.
    pub desired_tss_count: usize,
    /// Number of usable regions (1 or 2); TSS targets are split across them.
    pub usable_regions: usize,
    pub migration_mode: MigrationMode,

    /// Desired healthy teams per healthy server (and machine teams per
    /// healthy machine).
    pub desired_teams_per_server: usize,
    /// Hard cap on total teams per server.
    pub max_teams_per_server: usize,
    /// Candidate attempts per team built; extended on full overlap.
    pub build_attempts: usize,
    /// Score penalty per overlapping member with an existing team.
    pub overlap_penalty: usize,

    /// Random candidate teams drawn by `get_team`.
    pub best_team_option_count: usize,
    /// Bound on draws while collecting those candidates.
    pub best_team_max_tries: usize,
    /// Floor applied to the median available-space ratio.
    pub min_available_space_ratio: f64,
    /// Ceiling applied to the median available-space ratio, and the point
    /// below which low space is logged.
    pub target_available_space_ratio: f64,
    /// Ratio at which the free-space multiplier starts penalizing a team.
    pub available_space_ratio_cutoff: f64,
    /// Absolute free-byte floor for a team to count as having healthy space.
    pub min_available_space_bytes: i64,
    /// Refresh interval for the median available-space estimate.
    pub available_space_update_delay: Duration,

    /// Grace period after startup before team degradation triggers
    /// relocations.
    pub initial_failure_reaction_delay: Duration,
    /// How long an endpoint must look down before a server counts as failed.
    pub failure_reaction_time: Duration,
    /// Poll interval while waiting for a removed server's data to drain.
    pub all_data_removed_delay: Duration,
    /// Versions a server's added-version must age before its record may be
    /// deleted; guards against racing a master recovery.
    pub max_read_transaction_life_versions: u64,
    /// Durable-version lag at which a server becomes undesired.
    pub max_version_lag: u64,
    /// Delay before the zero-server-left diagnostic sums lost bytes.
    pub zero_server_left_log_delay: Duration,

    /// Back-off after a failed recruitment attempt.
    pub storage_recruitment_delay: Duration,
    /// How long a storage server waits for its TSS pair before proceeding.
    pub tss_recruitment_timeout: Duration,
    /// Re-check interval for TSS cancellation / excess-kill decisions.
    pub tss_check_interval: Duration,
    /// Poll interval for server-list changes.
    pub server_list_delay: Duration,
    /// Base interval between per-server metrics polls.
    pub metrics_polling_delay: Duration,
    /// Random extra delay added to each metrics poll.
    pub metrics_polling_jitter: Duration,

    /// Delay between machine-team remover passes.
    pub remove_machine_team_delay: Duration,
    /// Delay between server-team remover passes.
    pub remove_server_team_delay: Duration,
    /// Extra settling time the removers wait after the cluster looks healthy.
    pub remove_team_extra_delay: Duration,
    /// Delay between wrong-engine remover passes.
    pub remove_wrong_engine_delay: Duration,
    /// Disable switches mirroring the production escape hatches.
    pub disable_machine_team_remover: bool,
    pub disable_server_team_remover: bool,
    /// When true the removers target the machine/server team whose members
    /// sit on the most teams; when false, the one with the fewest server
    /// teams.
    pub remove_team_with_most_teams: bool,

    /// Jittered rest between wiggle steps.
    pub perpetual_wiggle_delay: Duration,
    /// Interval of the wiggle health guard.
    pub check_team_delay: Duration,
    /// Unhealthy-relocation count in the move queue that pauses the wiggle.
    pub wiggle_pause_threshold: usize,
    /// Best-team-stuck count that pauses the wiggle.
    pub wiggle_stuck_threshold: usize,

    /// Interval of the stalled-build watchdog.
    pub stall_check_delay: Duration,
    /// Seed for the collection's RNG; fixed in tests, randomized in
    /// production wiring.
    pub rng_seed: u64,
}

impl TeamCollectionConfig {
    /// Production defaults for a triple-replicated cluster.
    pub fn triple() -> Self {
        TeamCollectionConfig {
            team_size: 3,
            policy: ReplicationPolicy::across_zones(3),
            engine: EngineType::LsmTree,
            tss_engine: EngineType::LsmTree,
            desired_tss_count: 0,
            usable_regions: 1,
            migration_mode: MigrationMode::Gradual,
            desired_teams_per_server: 5,
            max_teams_per_server: 10,
            build_attempts: 4,
            overlap_penalty: 10_000,
            best_team_option_count: 10,
            best_team_max_tries: 64,
            min_available_space_ratio: 0.05,
            target_available_space_ratio: 0.30,
            available_space_ratio_cutoff: 0.30,
            min_available_space_bytes: 1_000_000_000,
            available_space_update_delay: Duration::from_secs(5),
            initial_failure_reaction_delay: Duration::from_secs(30),
            failure_reaction_time: Duration::from_secs(60),
            all_data_removed_delay: Duration::from_secs(1),
            max_read_transaction_life_versions: 5_000_000,
            max_version_lag: 200_000_000,
            zero_server_left_log_delay: Duration::from_secs(120),
            storage_recruitment_delay: Duration::from_secs(10),
            tss_recruitment_timeout: Duration::from_secs(60),
            tss_check_interval: Duration::from_secs(60),
            server_list_delay: Duration::from_secs(1),
            metrics_polling_delay: Duration::from_secs(2),
            metrics_polling_jitter: Duration::from_millis(200),
            remove_machine_team_delay: Duration::from_secs(60),
            remove_server_team_delay: Duration::from_secs(60),
            remove_team_extra_delay: Duration::from_secs(5),
            remove_wrong_engine_delay: Duration::from_secs(60),
            disable_machine_team_remover: false,
            disable_server_team_remover: false,
            remove_team_with_most_teams: true,
            perpetual_wiggle_delay: Duration::from_secs(60),
            check_team_delay: Duration::from_secs(30),
            wiggle_pause_threshold: 10,
            wiggle_stuck_threshold: 20,
            stall_check_delay: Duration::from_millis(400),
            rng_seed: 0,
        }
    }

    /// Team count this collection tries to keep per healthy server, padded so
    /// that removing one team does not immediately re-trigger the builder.
    pub fn target_teams_per_server(&self) -> usize {
        (self.desired_teams_per_server * (self.team_size + 1)) / 2
    }
}
