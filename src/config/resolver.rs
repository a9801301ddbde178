//! Detection-engine tunables resolved from the configuration tree
//!
//! Structural options (`sgh-mpm-context`) are strict: an unknown value is a
//! configuration error. Numeric group ceilings are lenient and fall back to
//! profile defaults when a leaf is missing or unparsable.

use crate::config::{ConfTree, ConfigError};
use crate::detect::mpm::MpmAlgo;
use std::fmt;
use tracing::{debug, warn};

pub const DEFAULT_INSPECTION_RECURSION_LIMIT: i32 = 3000;
pub const INSPECTION_RECURSION_UNLIMITED: i32 = -1;

/// Value used for a `custom` ceiling that is absent or unparsable
pub const CUSTOM_GROUP_FALLBACK: u16 = 2;

/// Default number of staged match queues per worker
pub const DEFAULT_STAGED_QUEUE_SLOTS: usize = 256;
/// Upper bound for `detect-engine.staged-queue-slots`
pub const MAX_STAGED_QUEUE_SLOTS: usize = 4096;

const PROFILE_KEY: &str = "detect-engine.profile";
const SGH_MPM_CONTEXT_KEY: &str = "detect-engine.sgh-mpm-context";
const RECURSION_LIMIT_KEY: &str = "detect-engine.inspection-recursion-limit";
const MPM_ALGO_KEY: &str = "detect-engine.mpm-algo";
const STAGED_QUEUE_SLOTS_KEY: &str = "detect-engine.staged-queue-slots";
const CUSTOM_VALUES_KEY: &str = "detect-engine.custom-values";
const FAILURE_FATAL_KEY: &str = "engine.init-failure-fatal";

/// Signature grouping profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineProfile {
    Low,
    Medium,
    High,
    Custom,
}

impl fmt::Display for EngineProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineProfile::Low => write!(f, "low"),
            EngineProfile::Medium => write!(f, "medium"),
            EngineProfile::High => write!(f, "high"),
            EngineProfile::Custom => write!(f, "custom"),
        }
    }
}

/// How pattern-matcher contexts are shared between signature groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SghMpmContext {
    /// One matcher context for the whole detection context
    Single,
    /// One matcher context per group
    Full,
}

/// Upper bounds on the number of unique address/port groups, per direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLimits {
    pub toclient_src: u16,
    pub toclient_dst: u16,
    pub toclient_sp: u16,
    pub toclient_dp: u16,
    pub toserver_src: u16,
    pub toserver_dst: u16,
    pub toserver_sp: u16,
    pub toserver_dp: u16,
}

impl GroupLimits {
    pub const LOW: GroupLimits = GroupLimits {
        toclient_src: 2,
        toclient_dst: 2,
        toclient_sp: 2,
        toclient_dp: 3,
        toserver_src: 2,
        toserver_dst: 2,
        toserver_sp: 2,
        toserver_dp: 3,
    };

    pub const MEDIUM: GroupLimits = GroupLimits {
        toclient_src: 4,
        toclient_dst: 4,
        toclient_sp: 4,
        toclient_dp: 6,
        toserver_src: 4,
        toserver_dst: 8,
        toserver_sp: 4,
        toserver_dp: 30,
    };

    pub const HIGH: GroupLimits = GroupLimits {
        toclient_src: 15,
        toclient_dst: 15,
        toclient_sp: 15,
        toclient_dp: 20,
        toserver_src: 15,
        toserver_dst: 15,
        toserver_sp: 15,
        toserver_dp: 40,
    };

    /// Read the eight `custom-values` leaves, each falling back independently
    fn custom(tree: &ConfTree) -> Self {
        let field = |name: &str| -> u16 {
            let key: String = format!("{}.{}_groups", CUSTOM_VALUES_KEY, name);
            match tree.get(&key) {
                Some(raw) => raw.trim().parse::<u16>().unwrap_or_else(|_| {
                    debug!("Unparsable value \"{}\" for {}, using {}", raw, key, CUSTOM_GROUP_FALLBACK);
                    CUSTOM_GROUP_FALLBACK
                }),
                None => CUSTOM_GROUP_FALLBACK,
            }
        };

        Self {
            toclient_src: field("toclient_src"),
            toclient_dst: field("toclient_dst"),
            toclient_sp: field("toclient_sp"),
            toclient_dp: field("toclient_dp"),
            toserver_src: field("toserver_src"),
            toserver_dst: field("toserver_dst"),
            toserver_sp: field("toserver_sp"),
            toserver_dp: field("toserver_dp"),
        }
    }
}

/// Normalized detection-engine configuration snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectConfig {
    pub profile: EngineProfile,
    pub limits: GroupLimits,
    pub mpm_matcher: MpmAlgo,
    pub sgh_mpm_context: SghMpmContext,
    /// `-1` means unlimited
    pub inspection_recursion_limit: i32,
    pub failure_fatal: bool,
    pub staged_queue_slots: usize,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            profile: EngineProfile::Medium,
            limits: GroupLimits::MEDIUM,
            mpm_matcher: MpmAlgo::DEFAULT,
            sgh_mpm_context: SghMpmContext::Single,
            inspection_recursion_limit: DEFAULT_INSPECTION_RECURSION_LIMIT,
            failure_fatal: false,
            staged_queue_slots: DEFAULT_STAGED_QUEUE_SLOTS,
        }
    }
}

impl DetectConfig {
    /// Resolve the detection-engine options from a configuration tree
    pub fn resolve(tree: &ConfTree) -> Result<Self, ConfigError> {
        let failure_fatal: bool = tree.get_bool(FAILURE_FATAL_KEY).unwrap_or(false);
        let mpm_matcher: MpmAlgo = resolve_mpm_algo(tree);
        let sgh_mpm_context: SghMpmContext = resolve_sgh_mpm_context(tree, mpm_matcher)?;
        let inspection_recursion_limit: i32 = resolve_recursion_limit(tree);

        let profile: EngineProfile = match tree.get(PROFILE_KEY) {
            Some(name) => match name.trim() {
                "low" => EngineProfile::Low,
                "medium" => EngineProfile::Medium,
                "high" => EngineProfile::High,
                "custom" => EngineProfile::Custom,
                other => {
                    warn!("Unknown detect-engine profile \"{}\", using \"medium\"", other);
                    EngineProfile::Medium
                }
            },
            None => {
                debug!("Profile for detection engine groups not provided, using \"medium\"");
                EngineProfile::Medium
            }
        };

        let limits: GroupLimits = match profile {
            EngineProfile::Low => GroupLimits::LOW,
            EngineProfile::Medium => GroupLimits::MEDIUM,
            EngineProfile::High => GroupLimits::HIGH,
            EngineProfile::Custom => GroupLimits::custom(tree),
        };

        let config: DetectConfig = Self {
            profile,
            limits,
            mpm_matcher,
            sgh_mpm_context,
            inspection_recursion_limit,
            failure_fatal,
            staged_queue_slots: resolve_staged_queue_slots(tree),
        };
        debug!(?config, "Resolved detect-engine configuration");

        Ok(config)
    }
}

fn resolve_mpm_algo(tree: &ConfTree) -> MpmAlgo {
    match tree.get(MPM_ALGO_KEY) {
        Some(name) => MpmAlgo::from_name(&name).unwrap_or_else(|| {
            warn!("Unknown mpm-algo \"{}\", using \"{}\"", name, MpmAlgo::DEFAULT);
            MpmAlgo::DEFAULT
        }),
        None => MpmAlgo::DEFAULT,
    }
}

fn resolve_sgh_mpm_context(tree: &ConfTree, matcher: MpmAlgo) -> Result<SghMpmContext, ConfigError> {
    let value: Option<String> = tree.get(SGH_MPM_CONTEXT_KEY);
    match value.as_deref().map(str::trim) {
        None | Some("auto") => {
            if matcher.supports_single_context() {
                Ok(SghMpmContext::Single)
            } else {
                Ok(SghMpmContext::Full)
            }
        }
        Some("single") => Ok(SghMpmContext::Single),
        Some("full") => Ok(SghMpmContext::Full),
        Some(other) => Err(ConfigError::InvalidValue {
            key: SGH_MPM_CONTEXT_KEY.to_string(),
            value: other.to_string(),
        }),
    }
}

/// Absent means the default. A present value that does not parse reads as 0,
/// and 0 or below means unlimited.
fn resolve_recursion_limit(tree: &ConfTree) -> i32 {
    let limit: i32 = match tree.get(RECURSION_LIMIT_KEY) {
        Some(raw) => raw.trim().parse::<i32>().unwrap_or(0),
        None => DEFAULT_INSPECTION_RECURSION_LIMIT,
    };

    if limit <= 0 {
        INSPECTION_RECURSION_UNLIMITED
    } else {
        limit
    }
}

fn resolve_staged_queue_slots(tree: &ConfTree) -> usize {
    let Some(raw) = tree.get(STAGED_QUEUE_SLOTS_KEY) else {
        return DEFAULT_STAGED_QUEUE_SLOTS;
    };

    match raw.trim().parse::<usize>() {
        Ok(slots) if (1..=MAX_STAGED_QUEUE_SLOTS).contains(&slots) => slots,
        Ok(slots) => {
            let clamped: usize = slots.clamp(1, MAX_STAGED_QUEUE_SLOTS);
            warn!("staged-queue-slots {} out of range, using {}", slots, clamped);
            clamped
        }
        Err(_) => {
            warn!("Unparsable staged-queue-slots \"{}\", using {}", raw, DEFAULT_STAGED_QUEUE_SLOTS);
            DEFAULT_STAGED_QUEUE_SLOTS
        }
    }
}
