use std::sync::Arc;

use tripwire_core::config::GatewayConfig;
use tripwire_engine::Engine;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Arc<Engine>,
}
