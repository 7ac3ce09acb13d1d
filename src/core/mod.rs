use std::sync::Arc;
use tracing::warn;

use crate::config::{self, ApiConfig, ConfigError};
use crate::lb::{PickError, PickInfo, PickResult, Picker};
use crate::pool::{Address, Clock, ConnectivityState, PoolManager, PoolStats, Transport};

/// Input delivered by the name-resolution layer on every update
#[derive(Debug, Clone, Default)]
pub struct ClientConnState {
    /// Backend addresses for new connections
    pub addresses: Vec<Address>,

    /// Balancer configuration, `None` meaning "use defaults"
    pub config: Option<ApiConfig>,
}

/// Balancer facade used by the calling layer
///
/// Owns the pool manager and hands out a picker over it. All entry points
/// take `&self` and may be called concurrently.
pub struct Balancer<T: Transport> {
    pool: Arc<PoolManager<T>>,
    picker: Picker<T>,
}

impl<T: Transport> Balancer<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self::from_pool(Arc::new(PoolManager::new(transport)))
    }

    pub fn with_clock(transport: Arc<T>, clock: Arc<dyn Clock>) -> Self {
        Self::from_pool(Arc::new(PoolManager::with_clock(transport, clock)))
    }

    fn from_pool(pool: Arc<PoolManager<T>>) -> Self {
        let picker = Picker::new(Arc::clone(&pool));
        Self { pool, picker }
    }

    /// Apply a resolver update; a missing config resolves to defaults
    pub fn update_client_conn_state(&self, state: ClientConnState) {
        let config = config::apply_defaults(state.config.unwrap_or_default());
        self.pool.on_config_update(state.addresses, config);
    }

    /// Apply a JSON-encoded configuration.
    ///
    /// A malformed document is rejected and the previous state is kept.
    pub fn update_raw_config(
        &self,
        addresses: Vec<Address>,
        raw: &[u8],
    ) -> Result<(), ConfigError> {
        let config = config::parse(raw).map_err(|e| {
            warn!(error = %e, "Rejected configuration update");
            e
        })?;
        self.pool.on_config_update(addresses, config);
        Ok(())
    }

    /// Forward a connection state notification from the transport
    pub fn on_connection_state_change(&self, handle: &T::Handle, state: ConnectivityState) {
        self.pool.on_connection_state_change(handle, state);
    }

    /// Pick a connection for one call
    pub fn pick(&self, info: PickInfo<'_>) -> Result<PickResult<T::Handle>, PickError> {
        self.picker.pick(info)
    }

    pub fn pool(&self) -> &Arc<PoolManager<T>> {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
