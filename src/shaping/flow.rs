//! Flow Identity and Per-Flow State

use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use super::bucket::TokenBucket;
use super::clock::Timestamp;

/// Size of a [`FlowKey`] in bytes
pub const FLOW_KEY_LEN: usize = 40;

/// Opaque identifier of a traffic flow
///
/// The attachment layer decides the granularity: a full 5-tuple, a pod-level
/// key, or anything else that fits in [`FLOW_KEY_LEN`] bytes. The shaping core
/// only hashes and compares keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey([u8; FLOW_KEY_LEN]);

impl FlowKey {
    /// Build from raw bytes
    pub const fn from_bytes(bytes: [u8; FLOW_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Key for a transport 5-tuple
    ///
    /// Layout: source address (16), destination address (16), source port,
    /// destination port (big endian), protocol, address family.
    /// IPv4 addresses are stored IPv6-mapped.
    pub fn from_tuple(src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16, proto: u8) -> Self {
        let mut bytes = [0u8; FLOW_KEY_LEN];
        bytes[0..16].copy_from_slice(&to_v6_octets(src));
        bytes[16..32].copy_from_slice(&to_v6_octets(dst));
        bytes[32..34].copy_from_slice(&src_port.to_be_bytes());
        bytes[34..36].copy_from_slice(&dst_port.to_be_bytes());
        bytes[36] = proto;
        bytes[37] = match src {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        };
        Self(bytes)
    }

    /// Coarse key for a whole pod or any numeric id
    pub fn from_id(id: u64) -> Self {
        let mut bytes = [0u8; FLOW_KEY_LEN];
        bytes[..8].copy_from_slice(&id.to_be_bytes());
        bytes[FLOW_KEY_LEN - 1] = 0xff;
        Self(bytes)
    }

    /// Key from a short text label, zero padded
    ///
    /// Returns `None` if the label is longer than [`FLOW_KEY_LEN`] bytes.
    pub fn from_label(label: &str) -> Option<Self> {
        let raw = label.as_bytes();
        if raw.len() > FLOW_KEY_LEN {
            return None;
        }
        let mut bytes = [0u8; FLOW_KEY_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self(bytes))
    }

    /// Raw key bytes
    pub const fn as_bytes(&self) -> &[u8; FLOW_KEY_LEN] {
        &self.0
    }
}

fn to_v6_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

impl fmt::Debug for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlowKey({self})")
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // printable labels read better in logs than hex
        let end = self.0.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        let used = &self.0[..end];
        if !used.is_empty() && used.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return f.write_str(&String::from_utf8_lossy(used));
        }
        for b in used {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Escalation phase of a flow
///
/// Deadlines are carried in the variant so a phase and its timer can never
/// disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum FlowPhase {
    /// Below the heavy-hitter threshold
    Normal,

    /// Identified as a heavy hitter; returns to normal once it has stayed below
    /// the threshold until `until`
    Flagged {
        /// End of the current flag window
        until: Timestamp,
    },

    /// Heavy hitter that exhausted the pod bucket; must also pass its own
    /// bucket until the cool-down deadline has passed
    Throttled {
        /// Earliest time the flow may return to normal
        cool_down_until: Timestamp,
    },
}

impl FlowPhase {
    /// Short lowercase name, used for logs and metric labels
    pub fn name(&self) -> &'static str {
        match self {
            FlowPhase::Normal => "normal",
            FlowPhase::Flagged { .. } => "flagged",
            FlowPhase::Throttled { .. } => "throttled",
        }
    }

    /// Push the deadline of an escalated phase out to `deadline`
    ///
    /// Deadlines never move backwards; `Normal` is unchanged.
    pub fn extend(self, deadline: Timestamp) -> Self {
        match self {
            FlowPhase::Normal => FlowPhase::Normal,
            FlowPhase::Flagged { until } => FlowPhase::Flagged {
                until: until.max(deadline),
            },
            FlowPhase::Throttled { cool_down_until } => FlowPhase::Throttled {
                cool_down_until: cool_down_until.max(deadline),
            },
        }
    }

    /// Whether an escalated phase has run out its deadline at `now`
    pub fn expired(&self, now: Timestamp) -> bool {
        match self {
            FlowPhase::Normal => false,
            FlowPhase::Flagged { until } => now >= *until,
            FlowPhase::Throttled { cool_down_until } => now >= *cool_down_until,
        }
    }
}

impl fmt::Display for FlowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State the engine keeps for one flow
#[derive(Debug)]
pub struct FlowState {
    /// Current escalation phase
    pub phase: FlowPhase,

    /// Per-flow bucket, consulted while throttled
    pub bucket: TokenBucket,

    /// First event seen for this flow
    pub first_seen: Timestamp,

    /// Most recent event seen for this flow
    pub last_seen: Timestamp,

    /// Bytes reported for this flow since it was created
    pub bytes_seen: u64,

    /// Start of the current run of heavy observations
    pub heavy_since: Option<Timestamp>,

    /// Decay epoch of the most recent heavy observation
    pub heavy_epoch: u64,
}

impl FlowState {
    /// Fresh state for a newly-seen flow; always starts `Normal`
    pub fn new(bucket: TokenBucket, now: Timestamp) -> Self {
        Self {
            phase: FlowPhase::Normal,
            bucket,
            first_seen: now,
            last_seen: now,
            bytes_seen: 0,
            heavy_since: None,
            heavy_epoch: 0,
        }
    }

    /// Whether the flow has been silent for at least `idle_timeout`
    pub fn is_idle(&self, now: Timestamp, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= idle_timeout
    }

    /// Record one heavy-hitter verdict taken in decay epoch `epoch`
    ///
    /// Returns how long the current heavy run has lasted, or `None` for a
    /// light verdict. A run survives light verdicts in an epoch that has not
    /// yet seen a heavy one, since counters restart low after a decay. It
    /// ends on a light verdict after a heavy one in the same epoch, or when
    /// a whole epoch passes without a heavy verdict.
    pub fn observe_heavy(&mut self, heavy: bool, epoch: u64, now: Timestamp) -> Option<Duration> {
        if !heavy {
            if self.heavy_epoch >= epoch {
                self.heavy_since = None;
            }
            return None;
        }
        let carried = self
            .heavy_since
            .filter(|_| self.heavy_epoch.saturating_add(1) >= epoch);
        let since = carried.unwrap_or(now);
        self.heavy_since = Some(since);
        self.heavy_epoch = epoch;
        Some(now.saturating_duration_since(since))
    }
}

/// Point-in-time view of a tracked flow
#[derive(Debug, Clone, Serialize)]
pub struct FlowSnapshot {
    /// Flow key rendered for display
    pub flow: String,

    /// Escalation phase
    #[serde(flatten)]
    pub phase: FlowPhase,

    /// Tokens left in the per-flow bucket
    pub tokens: u64,

    /// Bytes reported since the flow was created
    pub bytes_seen: u64,

    /// Most recent event
    pub last_seen: Timestamp,
}
