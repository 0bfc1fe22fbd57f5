//! Centralized constants for the warren daemon.

// ============================================================================
// Size constants
// ============================================================================

pub const KB: u64 = 1024;
pub const MB: u64 = KB * 1024;
pub const GB: u64 = MB * 1024;

/// Smallest loop volume mkfs.ext4 handles reliably.
pub const MIN_LOOP_VOLUME_BYTES: u64 = 4 * MB;

/// Upper bound on a single loop volume backing file.
pub const MAX_LOOP_VOLUME_BYTES: u64 = 64 * GB;

// ============================================================================
// Path constants
// ============================================================================

/// Daemon state directory. Must NOT be under /tmp — systemd-tmpfiles-clean
/// will wipe it.
pub const WARREN_BASE_DIR: &str = "/var/lib/warren";

/// Default place for volume backing storage.
pub const DEFAULT_PLACE: &str = "/var/lib/warren/volumes";

/// Daemon pidfile.
pub const PIDFILE_PATH: &str = "/run/warren.pid";

/// Conventional tmpfs holder for per-controller-set cgroup mounts.
pub const CGROUP_TMPFS: &str = "/sys/fs/cgroup";

/// Subtree under every controller root that holds container leaf cgroups.
pub const CGROUP_PREFIX: &str = "warren";

// ============================================================================
// Network constants
// ============================================================================

/// Default bridge the host side of container veth pairs is enslaved to.
pub const DEFAULT_BRIDGE: &str = "warren0";

/// Priority of the cgroup classifier filter on container-facing links.
pub const CGROUP_FILTER_PRIO: u16 = 10;

/// Minor id of the HTB default class.
pub const HTB_DEFAULT_CLASS: u16 = 0x2;

// ============================================================================
// Timing constants
// ============================================================================

/// Stage-ack deadline for the task launcher, seconds.
pub const LAUNCHER_STAGE_TIMEOUT_S: u64 = 60;

/// Freezer state polling deadline, milliseconds.
pub const FREEZER_DEADLINE_MS: u64 = 1000;

/// Bounded retries used when emptying and removing cgroups.
pub const CGROUP_REMOVE_RETRIES: u32 = 20;
pub const CGROUP_REMOVE_PERIOD_MS: u64 = 25;

/// OOM score applied to the daemon itself.
pub const DAEMON_OOM_SCORE_ADJ: i32 = -1000;
