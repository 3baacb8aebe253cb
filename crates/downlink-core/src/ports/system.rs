//! Network information port, input of the metered-data policy.

use crate::state::NetworkMode;

#[cfg_attr(feature = "mock", mockall::automock)]
pub trait SystemNetworkInfo: Send + Sync {
    fn is_online(&self) -> bool;

    fn current_network_mode(&self) -> NetworkMode;
}
