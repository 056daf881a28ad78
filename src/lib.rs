mod core;
pub mod dht;
pub mod nat;
pub mod protocol;

// Re-export commonly used types for consumers and integration tests
pub use crate::core::identifier::{DhtKey, NodeId, NodeInfo};
pub use crate::core::storage::Value;
pub use crate::nat::{NatType, PunchOutcome};

#[cfg(test)]
use ctor::ctor;

// Test-only: the binary installs its own subscriber from --log-level.
#[cfg(test)]
#[ctor]
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    // Avoid duplicate initialization if multiple tests run in parallel
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_target(false)
        .compact()
        .try_init();
}
