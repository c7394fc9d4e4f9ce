//! Provider adapter implementations.

pub mod simulated;

use switchboard_core::provider::box_adapter::BoxProviderAdapter;
use switchboard_types::config::SimulatedProviderConfig;

use self::simulated::{ScriptError, SimulatedAdapter};

/// Build boxed simulated adapters in configuration order.
pub fn simulated_adapters(
    configs: &[SimulatedProviderConfig],
) -> Result<Vec<BoxProviderAdapter>, ScriptError> {
    configs
        .iter()
        .map(|c| SimulatedAdapter::from_config(c).map(BoxProviderAdapter::new))
        .collect()
}
