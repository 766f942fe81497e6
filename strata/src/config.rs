//! Tuning parameters for the collective engine.
//!
//! All values have defaults matching the shipped tuning tables. Override via
//! environment variables (prefixed `STRATA_`) or by constructing a custom
//! `EngineConfig`. The configuration is immutable once an `Engine` holds it.

use crate::error::{Result, StrataError};

/// Node sizes the multi-node subgroup rule knows how to scale to.
const SUPPORTED_NODE_SIZES: [usize; 5] = [32, 64, 96, 128, 192];

/// Tuning parameters for the hierarchical broadcast and allreduce paths.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base subgroup size (8 or 16).
    pub sg_size: usize,

    /// Divisor applied to `sg_size`; the subgroup partition uses
    /// `sg_size / sg_scale` ranks, which must be a power of two in 1..=16.
    pub sg_scale: usize,

    /// Expected ranks per node, used as the subgroup size for multi-node
    /// dynamic rules when `bcast_nonsg` is set.
    pub node_size: usize,

    /// Force the NUMA tier on or off for broadcast, overriding the table.
    pub force_numa: Option<bool>,

    /// Force the socket tier on or off for broadcast, overriding the table.
    pub bcast_socket: Option<bool>,

    /// Never use the shared-memory broadcast path.
    pub disable_shmbcast: bool,

    /// Take broadcast fan-out flags from `bcast_lin*` instead of the table.
    pub use_dynamic_rules: bool,

    /// Flat (`true`) or binomial (`false`) fan-out among node leaders.
    pub bcast_lin0: bool,

    /// Flat (`true`) or binomial (`false`) fan-out to subgroup base ranks.
    pub bcast_lin1: bool,

    /// Flat (`true`) or binomial (`false`) fan-out inside a subgroup.
    pub bcast_lin2: bool,

    /// Use `node_size` rather than the subgroup size for multi-node
    /// dynamic rules.
    pub bcast_nonsg: bool,

    /// Maximum number of communicators that get a cached hierarchy.
    pub max_comms: usize,

    /// Number of distinct broadcast roots after which a communicator stops
    /// rebuilding its hierarchy and broadcasts with the k-nomial fallback.
    pub root_change_thresh: usize,

    /// Disable the single-copy allreduce paths.
    pub without_smsc: bool,

    /// Map user send/receive buffers directly instead of staging through
    /// the per-communicator scratch buffer.
    pub smsc_use_sr_buf: bool,

    /// Size of the scratch buffer used when `smsc_use_sr_buf` is off.
    pub smsc_buf_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sg_size: 8,
            sg_scale: 1,
            node_size: 128,
            force_numa: None,
            bcast_socket: None,
            disable_shmbcast: false,
            use_dynamic_rules: false,
            bcast_lin0: false,
            bcast_lin1: false,
            bcast_lin2: false,
            bcast_nonsg: false,
            max_comms: 10,
            root_change_thresh: 10,
            without_smsc: false,
            smsc_use_sr_buf: true,
            smsc_buf_size: 4 * 1024 * 1024, // 4 MiB
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `STRATA_*` variables that are set.
    ///
    /// Variables read:
    /// - `STRATA_SG_SIZE`, `STRATA_SG_SCALE`, `STRATA_NODE_SIZE`
    /// - `STRATA_FORCE_NUMA`, `STRATA_BCAST_SOCKET` (`-1` leaves the table in charge)
    /// - `STRATA_DISABLE_SHMBCAST`, `STRATA_USE_DYNAMIC_RULES`
    /// - `STRATA_BCAST_LIN0`, `STRATA_BCAST_LIN1`, `STRATA_BCAST_LIN2`
    /// - `STRATA_BCAST_NONSG`, `STRATA_MAX_COMMS`, `STRATA_ROOT_CHANGE_THRESH`
    /// - `STRATA_WITHOUT_SMSC`, `STRATA_SMSC_USE_SR_BUF`, `STRATA_SMSC_BUF_SIZE`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_parse::<usize>("STRATA_SG_SIZE") {
            cfg.sg_size = n;
        }
        if let Some(n) = env_parse::<usize>("STRATA_SG_SCALE") {
            cfg.sg_scale = n;
        }
        if let Some(n) = env_parse::<usize>("STRATA_NODE_SIZE") {
            cfg.node_size = n;
        }
        if let Some(v) = env_parse::<i32>("STRATA_FORCE_NUMA") {
            cfg.force_numa = tristate(v);
        }
        if let Some(v) = env_parse::<i32>("STRATA_BCAST_SOCKET") {
            cfg.bcast_socket = tristate(v);
        }
        if let Some(b) = env_flag("STRATA_DISABLE_SHMBCAST") {
            cfg.disable_shmbcast = b;
        }
        if let Some(b) = env_flag("STRATA_USE_DYNAMIC_RULES") {
            cfg.use_dynamic_rules = b;
        }
        if let Some(b) = env_flag("STRATA_BCAST_LIN0") {
            cfg.bcast_lin0 = b;
        }
        if let Some(b) = env_flag("STRATA_BCAST_LIN1") {
            cfg.bcast_lin1 = b;
        }
        if let Some(b) = env_flag("STRATA_BCAST_LIN2") {
            cfg.bcast_lin2 = b;
        }
        if let Some(b) = env_flag("STRATA_BCAST_NONSG") {
            cfg.bcast_nonsg = b;
        }
        if let Some(n) = env_parse::<usize>("STRATA_MAX_COMMS") {
            cfg.max_comms = n;
        }
        if let Some(n) = env_parse::<usize>("STRATA_ROOT_CHANGE_THRESH") {
            cfg.root_change_thresh = n;
        }
        if let Some(b) = env_flag("STRATA_WITHOUT_SMSC") {
            cfg.without_smsc = b;
        }
        if let Some(b) = env_flag("STRATA_SMSC_USE_SR_BUF") {
            cfg.smsc_use_sr_buf = b;
        }
        if let Some(n) = env_parse::<usize>("STRATA_SMSC_BUF_SIZE") {
            cfg.smsc_buf_size = n;
        }

        cfg
    }

    /// Ranks per subgroup partition.
    pub fn sg_count(&self) -> usize {
        self.sg_size / self.sg_scale.max(1)
    }

    /// Subgroup size used by the multi-node dynamic rules.
    pub fn mnode_sg_size(&self) -> usize {
        if self.bcast_nonsg {
            self.node_size
        } else {
            self.sg_count()
        }
    }

    /// Reject combinations the hierarchy builder cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.sg_size != 8 && self.sg_size != 16 {
            return Err(StrataError::InvalidConfig(format!(
                "sg_size must be 8 or 16, got {}",
                self.sg_size
            )));
        }
        if self.sg_scale == 0 || self.sg_size % self.sg_scale != 0 {
            return Err(StrataError::InvalidConfig(format!(
                "sg_scale {} does not divide sg_size {}",
                self.sg_scale, self.sg_size
            )));
        }
        let sg = self.sg_count();
        if !sg.is_power_of_two() || sg > 16 {
            return Err(StrataError::InvalidConfig(format!(
                "subgroup size {sg} must be a power of two no larger than 16"
            )));
        }
        if !SUPPORTED_NODE_SIZES.contains(&self.node_size) {
            return Err(StrataError::InvalidConfig(format!(
                "node_size must be one of {SUPPORTED_NODE_SIZES:?}, got {}",
                self.node_size
            )));
        }
        if self.max_comms == 0 {
            return Err(StrataError::InvalidConfig("max_comms must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// `0`/`1` or `false`/`true`.
fn env_flag(key: &str) -> Option<bool> {
    let v = std::env::var(key).ok()?;
    match v.trim() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

/// `-1` means "not forced".
fn tristate(v: i32) -> Option<bool> {
    match v {
        v if v < 0 => None,
        0 => Some(false),
        _ => Some(true),
    }
}
