//! Deployer for a centralized Spark observability platform on AWS
//!
//! Provisions, inspects, and tears down the platform in six ordered,
//! independently re-runnable stages: network and log storage, EMR-on-EKS
//! data planes, the custom Spark image and demo jobs, the Private CA and
//! DNS zone, the Spark History Server, and the mutual-TLS Client VPN.

pub mod aws;
pub mod config;
pub mod error;
pub mod stage;
pub mod templates;
pub mod util;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
