//! Test helpers shared by unit and integration tests
//!
//! - [`TestContext`] owns a temporary directory removed on drop
//! - [`wait_until`] polls a condition under a deadline
//! - The topology helpers start relays and directory server domains with
//!   short retry delays on loopback addresses
//!
//! ```rust,no_run
//! use dirsync_core::testing::{TestContext, start_relay};
//!
//! # async fn demo() -> dirsync_core::Result<()> {
//! let ctx = TestContext::new();
//! let relay = start_relay(&ctx, 1, &[]).await?;
//! assert_eq!(relay.server_id(), 1);
//! # Ok(())
//! # }
//! ```

mod context;
mod topology;

pub use context::{TestContext, wait_until};
pub use topology::{
    add_entry_request, base_entry, domain_config, relay_config, reserve_addrs, start_domain,
    start_relay, start_relay_at,
};
