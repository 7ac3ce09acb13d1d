//! Pool lifecycle management
//!
//! The [`PoolManager`] owns the connection reference table and the affinity
//! table. It keeps the pool between `minSize` and `maxSize`, grows it when
//! READY connections run above the low watermark, and swaps out connections
//! flagged as unresponsive once their replacement reports READY.
//!
//! Table structure is guarded by a single `RwLock`; per-connection counters
//! live on [`ConnectionRef`] and are updated without taking it.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::connection::ConnectionRef;
use super::transport::{Address, ConnectivityState, Transport};
use crate::config::{AffinityConfig, ApiConfig};
use crate::lb::affinity::AffinityTable;
use crate::lb::detector::{DetectionConfig, DetectionState};

/// Resolved configuration plus lookup structures derived from it
#[derive(Debug, Clone)]
pub struct PoolSettings {
    config: ApiConfig,
    affinity: HashMap<String, AffinityConfig>,
    detection: DetectionConfig,
}

impl PoolSettings {
    pub fn new(config: ApiConfig) -> Self {
        Self {
            affinity: config.affinity_table(),
            detection: DetectionConfig::from_pool(&config.channel_pool),
            config,
        }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn method_binding(&self, method: &str) -> Option<&AffinityConfig> {
        self.affinity.get(method)
    }

    pub fn detection(&self) -> DetectionConfig {
        self.detection
    }

    pub fn min_size(&self) -> usize {
        self.config.channel_pool.min_size as usize
    }

    pub fn max_size(&self) -> usize {
        self.config.channel_pool.max_size as usize
    }

    pub fn low_watermark(&self) -> u64 {
        u64::from(self.config.channel_pool.max_concurrent_streams_low_watermark)
    }

    pub fn fallback_to_ready(&self) -> bool {
        self.config.channel_pool.fallback_to_ready
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::new(ApiConfig::defaults())
    }
}

/// Statistics for the pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections in the reference table
    pub connections: usize,

    /// Connections currently READY
    pub ready: usize,

    /// In-flight calls across all connections
    pub active_calls: u64,

    /// Live affinity bindings
    pub affinity_keys: usize,

    /// Replacements requested by unresponsive detection
    pub replacements_requested: u64,

    /// Connections removed after their replacement became READY
    pub connections_removed: u64,

    /// Connections created to absorb load above the low watermark
    pub overflow_created: u64,

    /// One entry per connection in the table, in insertion order
    pub per_connection: Vec<ConnectionStats>,
}

/// Snapshot of a single pooled connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub connection: String,
    pub state: &'static str,
    pub active_calls: u32,
    pub consecutive_failures: u32,
    pub threshold_ms: u64,
    pub detection: DetectionState,
    pub age_ms: u128,
}

type Conn<T> = Arc<ConnectionRef<<T as Transport>::Handle>>;

/// Connection pool manager
pub struct PoolManager<T: Transport> {
    transport: Arc<T>,
    clock: Arc<dyn Clock>,

    /// Current resolved configuration
    settings: RwLock<Arc<PoolSettings>>,

    /// Addresses handed to newly created connections
    addresses: RwLock<Vec<Address>>,

    /// Reference table, in insertion order
    connections: RwLock<Vec<Conn<T>>>,

    /// Affinity key table
    affinity: AffinityTable<T::Handle>,

    /// Whether a configuration has been applied yet
    configured: AtomicBool,

    /// Aggregated connectivity state of the pool
    aggregate: AtomicU8,

    replacements_requested: AtomicU64,
    connections_removed: AtomicU64,
    overflow_created: AtomicU64,
}

impl<T: Transport> PoolManager<T> {
    /// Create a pool manager using the system clock
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_clock(transport, Arc::new(SystemClock))
    }

    /// Create a pool manager with an explicit time source
    pub fn with_clock(transport: Arc<T>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            settings: RwLock::new(Arc::new(PoolSettings::default())),
            addresses: RwLock::new(Vec::new()),
            connections: RwLock::new(Vec::new()),
            affinity: AffinityTable::new(),
            configured: AtomicBool::new(false),
            aggregate: AtomicU8::new(ConnectivityState::Shutdown as u8),
            replacements_requested: AtomicU64::new(0),
            connections_removed: AtomicU64::new(0),
            overflow_created: AtomicU64::new(0),
        }
    }

    /// Apply a resolved configuration and address list.
    ///
    /// The first update creates `minSize` connections. Later updates push the
    /// new addresses to existing connections and only ever grow the pool.
    pub fn on_config_update(&self, addresses: Vec<Address>, config: ApiConfig) {
        let settings = Arc::new(PoolSettings::new(config));
        let first = !self.configured.swap(true, Ordering::AcqRel);

        *self.settings.write() = Arc::clone(&settings);
        *self.addresses.write() = addresses.clone();

        let mut conns = self.connections.write();

        if !first {
            for conn in conns.iter() {
                self.transport.update_addresses(conn.handle(), &addresses);
            }
        }

        let target = settings.min_size();
        let before = conns.len();
        while conns.len() < target {
            self.create_locked(&mut conns, None, settings.detection().detection_ms);
        }

        info!(
            first_update = first,
            min_size = settings.min_size(),
            max_size = settings.max_size(),
            created = conns.len() - before,
            connections = conns.len(),
            "Applied pool configuration"
        );
        drop(conns);

        self.update_aggregate_state();
    }

    /// Record a readiness change reported by the transport
    pub fn on_connection_state_change(&self, handle: &T::Handle, state: ConnectivityState) {
        let Some(conn) = self.connection(handle) else {
            debug!(connection = ?handle, state = state.name(), "State change for unknown connection");
            return;
        };

        let previous = conn.set_state(state);
        debug!(
            connection = ?handle,
            from = previous.name(),
            to = state.name(),
            "Connection state changed"
        );

        match state {
            ConnectivityState::Ready => {
                if conn.replaced_by().is_none() {
                    if let Some(stale) = conn.replaces() {
                        self.retire(stale, &conn);
                    }
                }
            }
            ConnectivityState::Shutdown => self.drop_connection(&conn),
            ConnectivityState::Idle => self.transport.connect(handle),
            ConnectivityState::Connecting | ConnectivityState::TransientFailure => {}
        }

        self.update_aggregate_state();
    }

    /// Grow the pool by one connection when READY connections are overloaded.
    ///
    /// Growth happens when the average in-flight count across `ready` exceeds
    /// the low watermark and the pool is below `maxSize`. Returns whether a
    /// connection was created.
    pub fn select_or_create_overflow(&self, ready: &[Conn<T>]) -> bool {
        if ready.is_empty() {
            return false;
        }

        let settings = self.settings();
        let total: u64 = ready.iter().map(|c| u64::from(c.active_calls())).sum();
        if total <= settings.low_watermark() * ready.len() as u64 {
            return false;
        }

        let mut conns = self.connections.write();
        if conns.len() >= settings.max_size() {
            debug!(
                connections = conns.len(),
                max_size = settings.max_size(),
                "Pool at max size, not growing"
            );
            return false;
        }

        let conn = self.create_locked(&mut conns, None, settings.detection().detection_ms);
        self.overflow_created.fetch_add(1, Ordering::Relaxed);
        info!(
            connection = ?conn.handle(),
            active_calls = total,
            ready = ready.len(),
            connections = conns.len(),
            "Created overflow connection"
        );
        true
    }

    /// Ask for a fresh connection to take over from `stale`.
    ///
    /// At most one replacement is outstanding per stale connection, and a
    /// connection that has already left the table is ignored. The successor
    /// starts with twice the stale connection's detection threshold. Returns
    /// whether a replacement was created.
    pub fn request_replacement(&self, stale: &Conn<T>) -> bool {
        let mut conns = self.connections.write();

        if stale.replaced_by().is_some() || !conns.iter().any(|c| Arc::ptr_eq(c, stale)) {
            return false;
        }

        let threshold = stale.threshold_ms().saturating_mul(2);
        let successor = self.create_locked(&mut conns, Some(stale.handle().clone()), threshold);
        stale.set_replaced_by(successor.handle().clone());
        drop(conns);

        self.replacements_requested.fetch_add(1, Ordering::Relaxed);
        info!(
            stale = ?stale.handle(),
            successor = ?successor.handle(),
            failures = stale.consecutive_failures(),
            threshold_ms = threshold,
            "Replacing unresponsive connection"
        );
        true
    }

    /// READY connections in insertion order
    pub fn ready_connections(&self) -> Vec<Conn<T>> {
        self.connections
            .read()
            .iter()
            .filter(|c| c.is_ready())
            .cloned()
            .collect()
    }

    /// All connections in insertion order
    pub fn connections(&self) -> Vec<Conn<T>> {
        self.connections.read().clone()
    }

    pub fn connection(&self, handle: &T::Handle) -> Option<Conn<T>> {
        self.connections
            .read()
            .iter()
            .find(|c| c.handle() == handle)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn settings(&self) -> Arc<PoolSettings> {
        Arc::clone(&self.settings.read())
    }

    pub fn affinity(&self) -> &AffinityTable<T::Handle> {
        &self.affinity
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Aggregated connectivity of the pool
    pub fn aggregate_state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.aggregate.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> PoolStats {
        let conns = self.connections.read();
        PoolStats {
            connections: conns.len(),
            ready: conns.iter().filter(|c| c.is_ready()).count(),
            active_calls: conns.iter().map(|c| u64::from(c.active_calls())).sum(),
            affinity_keys: self.affinity.len(),
            replacements_requested: self.replacements_requested.load(Ordering::Relaxed),
            connections_removed: self.connections_removed.load(Ordering::Relaxed),
            overflow_created: self.overflow_created.load(Ordering::Relaxed),
            per_connection: conns.iter().map(|c| self.connection_stats(c)).collect(),
        }
    }

    fn connection_stats(&self, conn: &Conn<T>) -> ConnectionStats {
        ConnectionStats {
            connection: format!("{:?}", conn.handle()),
            state: conn.state().name(),
            active_calls: conn.active_calls(),
            consecutive_failures: conn.consecutive_failures(),
            threshold_ms: conn.threshold_ms(),
            detection: conn.detection_state(),
            age_ms: self.age(conn).as_millis(),
        }
    }

    fn age(&self, conn: &Conn<T>) -> Duration {
        self.clock.now().saturating_duration_since(conn.created_at())
    }

    /// Create a connection, add it to the table and request a connect.
    /// Caller holds the table write lock.
    fn create_locked(
        &self,
        conns: &mut Vec<Conn<T>>,
        replaces: Option<T::Handle>,
        threshold_ms: u64,
    ) -> Conn<T> {
        let addresses = self.addresses.read().clone();
        let handle = self.transport.create_connection(&addresses);
        let conn = Arc::new(ConnectionRef::new(
            handle,
            replaces,
            self.clock.now(),
            threshold_ms,
        ));
        conns.push(Arc::clone(&conn));
        self.transport.connect(conn.handle());

        debug!(connection = ?conn.handle(), connections = conns.len(), "Created connection");
        conn
    }

    /// Remove `stale` now that `successor` is READY
    fn retire(&self, stale: &T::Handle, successor: &Conn<T>) {
        let removed = {
            let mut conns = self.connections.write();
            match conns.iter().position(|c| c.handle() == stale) {
                Some(idx) => conns.remove(idx),
                None => return,
            }
        };

        removed.mark_retired();
        let moved = self.affinity.rebind(stale, successor.handle());
        self.transport.remove_connection(stale);
        self.connections_removed.fetch_add(1, Ordering::Relaxed);

        info!(
            stale = ?stale,
            successor = ?successor.handle(),
            affinity_keys_moved = moved,
            in_flight = removed.active_calls(),
            age_ms = self.age(&removed).as_millis() as u64,
            "Retired replaced connection"
        );
    }

    /// Drop a connection that reported SHUTDOWN
    fn drop_connection(&self, conn: &Conn<T>) {
        let removed = {
            let mut conns = self.connections.write();
            let before = conns.len();
            conns.retain(|c| !Arc::ptr_eq(c, conn));
            before != conns.len()
        };
        if !removed {
            return;
        }

        conn.mark_retired();
        let dropped = self.affinity.forget_connection(conn.handle());

        // A successor that died before becoming READY frees its stale
        // connection for another replacement attempt.
        if let Some(stale) = conn.replaces().and_then(|h| self.connection(h)) {
            stale.clear_replaced_by(conn.handle());
        }

        warn!(
            connection = ?conn.handle(),
            affinity_keys_dropped = dropped,
            "Connection shut down"
        );
    }

    fn update_aggregate_state(&self) {
        let state = {
            let conns = self.connections.read();
            aggregate(conns.iter().map(|c| c.state()))
        };

        let previous =
            ConnectivityState::from_u8(self.aggregate.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            info!(from = previous.name(), to = state.name(), "Pool connectivity changed");
        }
    }
}

/// READY beats CONNECTING/IDLE beats TRANSIENT_FAILURE; an empty pool is SHUTDOWN
fn aggregate(states: impl Iterator<Item = ConnectivityState>) -> ConnectivityState {
    let mut result = ConnectivityState::Shutdown;
    for state in states {
        match state {
            ConnectivityState::Ready => return ConnectivityState::Ready,
            ConnectivityState::Connecting | ConnectivityState::Idle => {
                result = ConnectivityState::Connecting;
            }
            ConnectivityState::TransientFailure => {
                if result == ConnectivityState::Shutdown {
                    result = ConnectivityState::TransientFailure;
                }
            }
            ConnectivityState::Shutdown => {}
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::clock::ManualClock;
    use crate::sim::{SimHandle, SimulatedTransport, TransportEvent};
    use std::time::Duration;

    fn config(min: u32, max: u32, watermark: u32) -> ApiConfig {
        let mut cfg = ApiConfig::default();
        cfg.channel_pool.min_size = min;
        cfg.channel_pool.max_size = max;
        cfg.channel_pool.max_concurrent_streams_low_watermark = watermark;
        crate::config::apply_defaults(cfg)
    }

    fn setup() -> (Arc<SimulatedTransport>, PoolManager<SimulatedTransport>) {
        let transport = Arc::new(SimulatedTransport::new());
        let pool = PoolManager::new(Arc::clone(&transport));
        (transport, pool)
    }

    #[test]
    fn test_first_update_creates_min_size() {
        let (transport, pool) = setup();
        pool.on_config_update(vec!["backend:443".to_string()], config(3, 10, 50));

        assert_eq!(pool.len(), 3);
        let created = transport.created();
        assert_eq!(created.len(), 3);
        for handle in &created {
            assert!(transport.connect_count(handle) >= 1);
            assert!(pool.connection(handle).is_some());
        }
        assert_eq!(pool.aggregate_state(), ConnectivityState::Connecting);
    }

    #[test]
    fn test_connect_follows_create() {
        let (transport, pool) = setup();
        pool.on_config_update(vec![], config(2, 10, 50));

        let events = transport.events();
        assert!(matches!(
            events.as_slice(),
            [
                TransportEvent::Created(a),
                TransportEvent::Connected(b),
                TransportEvent::Created(c),
                TransportEvent::Connected(d),
            ] if a == b && c == d
        ));
    }

    #[test]
    fn test_later_updates_only_grow() {
        let (transport, pool) = setup();
        pool.on_config_update(vec!["a".to_string()], config(3, 10, 50));
        pool.on_config_update(vec!["b".to_string()], config(2, 10, 50));
        assert_eq!(pool.len(), 3);
        assert_eq!(transport.address_updates(), 3);

        pool.on_config_update(vec!["b".to_string()], config(5, 10, 50));
        assert_eq!(pool.len(), 5);
        assert_eq!(transport.created().len(), 5);
    }

    #[test]
    fn test_shutdown_drops_connection() {
        let (transport, pool) = setup();
        pool.on_config_update(vec![], config(2, 10, 50));
        let handle = transport.created()[0];

        pool.affinity().bind("k".to_string(), handle);
        pool.on_connection_state_change(&handle, ConnectivityState::Shutdown);

        assert_eq!(pool.len(), 1);
        assert!(pool.connection(&handle).is_none());
        assert!(pool.affinity().get("k").is_none());
        assert!(transport.removed().is_empty());
    }

    #[test]
    fn test_idle_requests_reconnect() {
        let (transport, pool) = setup();
        pool.on_config_update(vec![], config(1, 10, 50));
        let handle = transport.created()[0];
        assert_eq!(transport.connect_count(&handle), 1);

        pool.on_connection_state_change(&handle, ConnectivityState::Idle);
        assert_eq!(transport.connect_count(&handle), 2);
    }

    #[test]
    fn test_unknown_connection_ignored() {
        let (_transport, pool) = setup();
        pool.on_config_update(vec![], config(1, 10, 50));
        pool.on_connection_state_change(&SimHandle(999), ConnectivityState::Ready);
        assert_eq!(pool.stats().ready, 0);
    }

    #[test]
    fn test_overflow_above_watermark() {
        let (transport, pool) = setup();
        pool.on_config_update(vec![], config(2, 3, 1));
        for handle in transport.created() {
            pool.on_connection_state_change(&handle, ConnectivityState::Ready);
        }

        let ready = pool.ready_connections();
        ready[0].increment_calls();
        ready[1].increment_calls();
        // average == watermark
        assert!(!pool.select_or_create_overflow(&ready));

        ready[0].increment_calls();
        assert!(pool.select_or_create_overflow(&ready));
        assert_eq!(pool.len(), 3);

        // at max size
        assert!(!pool.select_or_create_overflow(&ready));
        assert_eq!(pool.stats().overflow_created, 1);
    }

    #[test]
    fn test_replacement_is_idempotent_and_doubles_threshold() {
        let transport = Arc::new(SimulatedTransport::new());
        let clock = Arc::new(ManualClock::new());
        let pool = PoolManager::with_clock(Arc::clone(&transport), clock.clone());

        let mut cfg = config(1, 10, 50);
        cfg.channel_pool.unresponsive_detection_ms = 100;
        pool.on_config_update(vec![], cfg);

        let stale = pool.connections()[0].clone();
        pool.on_connection_state_change(stale.handle(), ConnectivityState::Ready);

        assert!(pool.request_replacement(&stale));
        assert!(!pool.request_replacement(&stale));
        assert_eq!(pool.len(), 2);

        let successor = pool.connection(&stale.replaced_by().unwrap()).unwrap();
        assert_eq!(successor.threshold_ms(), 200);
        assert_eq!(successor.replaces(), Some(stale.handle()));

        // stale keeps serving until the successor is READY
        assert_eq!(pool.ready_connections().len(), 1);
        assert!(Arc::ptr_eq(&pool.ready_connections()[0], &stale));

        pool.affinity().bind("session".to_string(), *stale.handle());
        clock.advance(Duration::from_millis(5));
        pool.on_connection_state_change(successor.handle(), ConnectivityState::Ready);

        assert_eq!(pool.len(), 1);
        assert!(stale.is_retired());
        assert_eq!(transport.removed(), vec![*stale.handle()]);
        assert_eq!(pool.affinity().get("session"), Some(*successor.handle()));

        // READY again must not remove anything twice
        pool.on_connection_state_change(successor.handle(), ConnectivityState::Ready);
        assert_eq!(transport.removed().len(), 1);

        // a retired connection can no longer be replaced
        assert!(!pool.request_replacement(&stale));
        assert_eq!(pool.stats().replacements_requested, 1);
        assert_eq!(pool.stats().connections_removed, 1);
    }

    #[test]
    fn test_successor_shutdown_allows_new_replacement() {
        let (_transport, pool) = setup();
        pool.on_config_update(vec![], config(1, 10, 50));
        let stale = pool.connections()[0].clone();

        assert!(pool.request_replacement(&stale));
        let successor = stale.replaced_by().unwrap();

        pool.on_connection_state_change(&successor, ConnectivityState::Shutdown);
        assert!(stale.replaced_by().is_none());
        assert!(pool.request_replacement(&stale));
    }

    #[test]
    fn test_stats_report_each_connection() {
        let transport = Arc::new(SimulatedTransport::new());
        let clock = Arc::new(ManualClock::new());
        let pool = PoolManager::with_clock(Arc::clone(&transport), clock.clone());

        let mut cfg = config(2, 10, 50);
        cfg.channel_pool.unresponsive_detection_ms = 100;
        pool.on_config_update(vec![], cfg);

        let first = pool.connections()[0].clone();
        pool.on_connection_state_change(first.handle(), ConnectivityState::Ready);
        first.increment_calls();
        clock.advance(Duration::from_millis(40));
        assert!(pool.request_replacement(&first));

        let stats = pool.stats();
        assert_eq!(stats.per_connection.len(), 3);

        let entry = &stats.per_connection[0];
        assert_eq!(entry.connection, format!("{:?}", first.handle()));
        assert_eq!(entry.state, "READY");
        assert_eq!(entry.active_calls, 1);
        assert_eq!(entry.threshold_ms, 100);
        assert_eq!(entry.detection, DetectionState::Replacing);
        assert_eq!(entry.age_ms, 40);

        let successor = &stats.per_connection[2];
        assert_eq!(successor.threshold_ms, 200);
        assert_eq!(successor.detection, DetectionState::Responsive);
        assert_eq!(successor.age_ms, 0);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["per_connection"][0]["detection"], "Replacing");
    }

    #[test]
    fn test_aggregate_state() {
        use ConnectivityState::*;
        assert_eq!(aggregate([].into_iter()), Shutdown);
        assert_eq!(aggregate([TransientFailure, Ready].into_iter()), Ready);
        assert_eq!(aggregate([TransientFailure, Idle].into_iter()), Connecting);
        assert_eq!(aggregate([TransientFailure].into_iter()), TransientFailure);
    }
}
