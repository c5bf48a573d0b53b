//! natra
//!
//! Per-pod bandwidth enforcement for container networking. A pod's bandwidth
//! declaration is parsed into a [`policy::PolicyConfig`]; a
//! [`shaping::CoreHandle`] built from it decides, for every observed unit of
//! traffic, whether to admit, delay, throttle or drop it.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod replay;
pub mod shaping;

pub use policy::{parse_policy, PolicyConfig};
pub use shaping::{CoreError, CoreHandle, Decision, EngineSettings, FlowKey, Timestamp};
