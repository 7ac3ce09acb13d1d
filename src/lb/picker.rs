use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::affinity::{extract_key, AffinityRouter, Route};
use super::detector::DetectionConfig;
use crate::config::AffinityCommand;
use crate::pool::{ConnectionRef, PoolManager, Transport};

/// Why no connection could be selected for a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    /// No connection in the pool is READY
    NoReadyConnection,
    /// No connection is READY and the call's deadline has already passed
    DeadlineExpired,
    /// The call's affinity key is bound to a connection that is not READY
    BoundNotReady,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::NoReadyConnection => write!(f, "no READY connection"),
            UnavailableReason::DeadlineExpired => write!(f, "deadline expired before a connection was READY"),
            UnavailableReason::BoundNotReady => write!(f, "bound connection is not READY"),
        }
    }
}

/// Pick errors. The caller owns retry and backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PickError {
    #[error("Unavailable: {0}")]
    Unavailable(UnavailableReason),
}

/// What the caller knows about a call at pick time
#[derive(Debug, Clone, Copy)]
pub struct PickInfo<'a> {
    /// Fully-qualified method name
    pub method: &'a str,

    /// Request payload, used to read the affinity key
    pub request: Option<&'a Value>,

    /// Whether the call's deadline has already passed
    pub deadline_expired: bool,
}

impl<'a> PickInfo<'a> {
    pub fn new(method: &'a str) -> Self {
        Self {
            method,
            request: None,
            deadline_expired: false,
        }
    }

    pub fn with_request(mut self, request: &'a Value) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_deadline_expired(mut self, expired: bool) -> Self {
        self.deadline_expired = expired;
        self
    }
}

/// How a call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    DeadlineExceeded,
    /// Any other error. Counts as a response for detection purposes.
    Failed(String),
}

/// Completion report passed to the done callback
#[derive(Debug, Clone)]
pub struct DoneInfo {
    pub outcome: CallOutcome,

    /// Response payload, preferred over the request for BIND keys
    pub response: Option<Value>,
}

impl DoneInfo {
    pub fn ok() -> Self {
        Self {
            outcome: CallOutcome::Ok,
            response: None,
        }
    }

    pub fn deadline_exceeded() -> Self {
        Self {
            outcome: CallOutcome::DeadlineExceeded,
            response: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            outcome: CallOutcome::Failed(message.into()),
            response: None,
        }
    }

    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }
}

/// Completion callback returned with every pick
pub type DoneCallback = Box<dyn FnOnce(DoneInfo) + Send + 'static>;

/// Selected connection plus its completion callback
pub struct PickResult<H> {
    pub connection: H,
    pub done: DoneCallback,
}

impl<H: fmt::Debug> fmt::Debug for PickResult<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickResult")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Per-call connection selection
pub struct Picker<T: Transport> {
    pool: Arc<PoolManager<T>>,
}

impl<T: Transport> Clone for Picker<T> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<T: Transport> Picker<T> {
    pub fn new(pool: Arc<PoolManager<T>>) -> Self {
        Self { pool }
    }

    /// Choose a connection for a call.
    ///
    /// A READY connection bound to the call's affinity key wins. Otherwise
    /// the READY connection with the fewest in-flight calls is used, ties
    /// going to the oldest. Never waits for a connection to become READY.
    pub fn pick(&self, info: PickInfo<'_>) -> Result<PickResult<T::Handle>, PickError> {
        let settings = self.pool.settings();
        let router = AffinityRouter::new(&self.pool);
        let resolution = router.resolve(&settings, info.method, info.request);

        let bound = match resolution.route {
            Route::Bound(conn) => Some(conn),
            Route::BoundNotReady if !settings.fallback_to_ready() => {
                debug!(method = %info.method, key = ?resolution.key, "Bound connection not READY");
                return Err(PickError::Unavailable(UnavailableReason::BoundNotReady));
            }
            Route::BoundNotReady | Route::Unbound => None,
        };

        let conn = match bound {
            Some(conn) => conn,
            None => {
                let ready = self.pool.ready_connections();
                let Some(conn) = least_loaded(&ready) else {
                    let reason = if info.deadline_expired {
                        UnavailableReason::DeadlineExpired
                    } else {
                        UnavailableReason::NoReadyConnection
                    };
                    warn!(method = %info.method, connections = self.pool.len(), reason = %reason, "No connection available");
                    return Err(PickError::Unavailable(reason));
                };
                self.pool.select_or_create_overflow(&ready);
                conn
            }
        };

        let active = conn.increment_calls();
        debug!(
            method = %info.method,
            connection = ?conn.handle(),
            active_calls = active,
            command = ?resolution.command,
            "Picked connection"
        );

        let done = completion(
            Arc::downgrade(&self.pool),
            Arc::clone(&conn),
            settings.detection(),
            resolution.command,
            resolution.key_path,
            resolution.key,
        );

        Ok(PickResult {
            connection: conn.handle().clone(),
            done,
        })
    }
}

/// READY connection with the fewest in-flight calls, first in order on ties
fn least_loaded<H: Clone + PartialEq>(ready: &[Arc<ConnectionRef<H>>]) -> Option<Arc<ConnectionRef<H>>> {
    ready.iter().min_by_key(|c| c.active_calls()).cloned()
}

/// Build the done callback for a picked connection.
///
/// Captures only the connection, a weak pool handle and config snapshots, so
/// it can outlive both the picker and the connection's time in the table.
fn completion<T: Transport>(
    pool: Weak<PoolManager<T>>,
    conn: Arc<ConnectionRef<T::Handle>>,
    detection: DetectionConfig,
    command: AffinityCommand,
    key_path: Option<String>,
    request_key: Option<String>,
) -> DoneCallback {
    Box::new(move |info: DoneInfo| {
        conn.decrement_calls();

        let Some(pool) = pool.upgrade() else {
            return;
        };
        let now = pool.clock().now();

        match &info.outcome {
            CallOutcome::DeadlineExceeded => {
                if conn.record_deadline_exceeded(now, &detection) {
                    pool.request_replacement(&conn);
                }
            }
            CallOutcome::Ok | CallOutcome::Failed(_) => {
                conn.record_success(now, detection.detection_ms);
            }
        }

        let router = AffinityRouter::new(&pool);
        match command {
            AffinityCommand::Bind if info.outcome == CallOutcome::Ok => {
                let key = info
                    .response
                    .as_ref()
                    .zip(key_path.as_deref())
                    .and_then(|(response, path)| extract_key(response, path).ok())
                    .or(request_key);
                if let Some(key) = key {
                    router.bind(key, &conn);
                }
            }
            AffinityCommand::Unbind => {
                if let Some(key) = request_key {
                    router.unbind(&key);
                }
            }
            _ => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{apply_defaults, AffinityConfig, ApiConfig, MethodConfig};
    use crate::pool::clock::Clock;
    use crate::pool::{ConnectivityState, ManualClock};
    use crate::sim::{SimHandle, SimulatedTransport};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        transport: Arc<SimulatedTransport>,
        clock: Arc<ManualClock>,
        pool: Arc<PoolManager<SimulatedTransport>>,
        picker: Picker<SimulatedTransport>,
    }

    impl Harness {
        fn new(config: ApiConfig) -> Self {
            let transport = Arc::new(SimulatedTransport::new());
            let clock = Arc::new(ManualClock::new());
            let pool = Arc::new(PoolManager::with_clock(Arc::clone(&transport), clock.clone()));
            pool.on_config_update(vec!["backend:443".to_string()], apply_defaults(config));
            let picker = Picker::new(Arc::clone(&pool));
            Self {
                transport,
                clock,
                pool,
                picker,
            }
        }

        fn ready(&self, idx: usize) -> SimHandle {
            let handle = self.transport.created()[idx];
            self.pool
                .on_connection_state_change(&handle, ConnectivityState::Ready);
            handle
        }
    }

    fn pool_config(min: u32) -> ApiConfig {
        let mut cfg = ApiConfig::default();
        cfg.channel_pool.min_size = min;
        cfg
    }

    fn affinity_config(fallback_to_ready: bool) -> ApiConfig {
        let mut cfg = pool_config(2);
        cfg.channel_pool.fallback_to_ready = fallback_to_ready;
        cfg.method = vec![
            MethodConfig {
                name: vec!["svc/Open".to_string()],
                affinity: Some(AffinityConfig {
                    command: AffinityCommand::Bind,
                    affinity_key: "session.name".to_string(),
                }),
            },
            MethodConfig {
                name: vec!["svc/Read".to_string()],
                affinity: Some(AffinityConfig {
                    command: AffinityCommand::Bound,
                    affinity_key: "session".to_string(),
                }),
            },
            MethodConfig {
                name: vec!["svc/Close".to_string()],
                affinity: Some(AffinityConfig {
                    command: AffinityCommand::Unbind,
                    affinity_key: "session".to_string(),
                }),
            },
        ];
        cfg
    }

    #[test]
    fn test_unavailable_without_ready_connection() {
        let h = Harness::new(pool_config(2));

        let err = h.picker.pick(PickInfo::new("svc/Get")).unwrap_err();
        assert_eq!(err, PickError::Unavailable(UnavailableReason::NoReadyConnection));

        let err = h
            .picker
            .pick(PickInfo::new("svc/Get").with_deadline_expired(true))
            .unwrap_err();
        assert_eq!(err, PickError::Unavailable(UnavailableReason::DeadlineExpired));
    }

    #[test]
    fn test_expired_deadline_still_uses_ready_connection() {
        let h = Harness::new(pool_config(1));
        let a = h.ready(0);

        let result = h
            .picker
            .pick(PickInfo::new("svc/Get").with_deadline_expired(true))
            .unwrap();
        assert_eq!(result.connection, a);
    }

    #[test]
    fn test_least_loaded_with_stable_tie_break() {
        let h = Harness::new(pool_config(3));
        let a = h.ready(0);
        let b = h.ready(1);
        let c = h.ready(2);

        let first = h.picker.pick(PickInfo::new("m")).unwrap();
        assert_eq!(first.connection, a);
        let second = h.picker.pick(PickInfo::new("m")).unwrap();
        assert_eq!(second.connection, b);
        let third = h.picker.pick(PickInfo::new("m")).unwrap();
        assert_eq!(third.connection, c);

        (second.done)(DoneInfo::ok());
        let fourth = h.picker.pick(PickInfo::new("m")).unwrap();
        assert_eq!(fourth.connection, b);

        (first.done)(DoneInfo::ok());
        (third.done)(DoneInfo::ok());
        (fourth.done)(DoneInfo::ok());
        assert_eq!(h.pool.stats().active_calls, 0);
    }

    #[test]
    fn test_skips_connections_that_are_not_ready() {
        let h = Harness::new(pool_config(3));
        let b = h.ready(1);

        for _ in 0..3 {
            let result = h.picker.pick(PickInfo::new("m")).unwrap();
            assert_eq!(result.connection, b);
        }
        assert_eq!(h.pool.connection(&b).unwrap().active_calls(), 3);
    }

    #[test]
    fn test_bind_then_bound_routes_to_same_connection() {
        let h = Harness::new(affinity_config(false));
        let _a = h.ready(0);
        let b = h.ready(1);

        // load the first connection so the BIND call lands on the second
        let busy = h.picker.pick(PickInfo::new("other")).unwrap();

        let open = h.picker.pick(PickInfo::new("svc/Open")).unwrap();
        assert_eq!(open.connection, b);
        (open.done)(DoneInfo::ok().with_response(json!({"session": {"name": "s1"}})));
        assert_eq!(h.pool.affinity().get("s1"), Some(b));
        (busy.done)(DoneInfo::ok());

        let request = json!({"session": "s1"});
        for _ in 0..3 {
            let read = h
                .picker
                .pick(PickInfo::new("svc/Read").with_request(&request))
                .unwrap();
            assert_eq!(read.connection, b);
        }
    }

    #[test]
    fn test_bind_falls_back_to_request_key() {
        let h = Harness::new(affinity_config(false));
        let a = h.ready(0);

        let request = json!({"session": {"name": "from-request"}});
        let open = h
            .picker
            .pick(PickInfo::new("svc/Open").with_request(&request))
            .unwrap();
        (open.done)(DoneInfo::ok());

        assert_eq!(h.pool.affinity().get("from-request"), Some(a));
    }

    #[test]
    fn test_failed_call_does_not_bind() {
        let h = Harness::new(affinity_config(false));
        h.ready(0);

        let request = json!({"session": {"name": "s1"}});
        let open = h
            .picker
            .pick(PickInfo::new("svc/Open").with_request(&request))
            .unwrap();
        (open.done)(DoneInfo::failed("permission denied"));

        assert!(h.pool.affinity().is_empty());
    }

    #[test]
    fn test_unbind_removes_key_after_call() {
        let h = Harness::new(affinity_config(false));
        h.ready(0);
        let b = h.ready(1);
        h.pool.affinity().bind("s1".to_string(), b);

        let request = json!({"session": "s1"});
        let close = h
            .picker
            .pick(PickInfo::new("svc/Close").with_request(&request))
            .unwrap();
        assert_eq!(close.connection, b);
        assert_eq!(h.pool.affinity().get("s1"), Some(b));

        (close.done)(DoneInfo::deadline_exceeded());
        assert!(h.pool.affinity().get("s1").is_none());
    }

    #[test]
    fn test_bound_not_ready_without_fallback() {
        let h = Harness::new(affinity_config(false));
        h.ready(0);
        let b = h.transport.created()[1];
        h.pool.affinity().bind("s1".to_string(), b);

        let request = json!({"session": "s1"});
        let err = h
            .picker
            .pick(PickInfo::new("svc/Read").with_request(&request))
            .unwrap_err();
        assert_eq!(err, PickError::Unavailable(UnavailableReason::BoundNotReady));
    }

    #[test]
    fn test_bound_not_ready_with_fallback() {
        let h = Harness::new(affinity_config(true));
        let a = h.ready(0);
        let b = h.transport.created()[1];
        h.pool.affinity().bind("s1".to_string(), b);

        let request = json!({"session": "s1"});
        let read = h
            .picker
            .pick(PickInfo::new("svc/Read").with_request(&request))
            .unwrap();
        assert_eq!(read.connection, a);
    }

    #[test]
    fn test_missing_key_routes_normally() {
        let h = Harness::new(affinity_config(false));
        let a = h.ready(0);

        let request = json!({"unrelated": 1});
        let read = h
            .picker
            .pick(PickInfo::new("svc/Read").with_request(&request))
            .unwrap();
        assert_eq!(read.connection, a);

        let read = h.picker.pick(PickInfo::new("svc/Read")).unwrap();
        assert_eq!(read.connection, a);
    }

    #[test]
    fn test_overflow_connection_created_under_load() {
        let mut cfg = pool_config(1);
        cfg.channel_pool.max_size = 2;
        cfg.channel_pool.max_concurrent_streams_low_watermark = 2;
        let h = Harness::new(cfg);
        h.ready(0);

        let mut in_flight = Vec::new();
        for _ in 0..3 {
            in_flight.push(h.picker.pick(PickInfo::new("m")).unwrap());
        }
        assert_eq!(h.pool.len(), 1);

        // average of 3 in-flight calls exceeds the watermark of 2
        in_flight.push(h.picker.pick(PickInfo::new("m")).unwrap());
        assert_eq!(h.pool.len(), 2);
        assert_eq!(h.transport.created().len(), 2);

        for result in in_flight {
            (result.done)(DoneInfo::ok());
        }
    }

    #[test]
    fn test_success_resets_detection() {
        let mut cfg = pool_config(1);
        cfg.channel_pool.unresponsive_detection_ms = 100;
        cfg.channel_pool.unresponsive_calls = 3;
        let h = Harness::new(cfg);
        let a = h.ready(0);

        for _ in 0..2 {
            let r = h.picker.pick(PickInfo::new("m")).unwrap();
            (r.done)(DoneInfo::deadline_exceeded());
        }
        let conn = h.pool.connection(&a).unwrap();
        assert_eq!(conn.consecutive_failures(), 2);

        h.clock.advance(Duration::from_millis(30));
        let r = h.picker.pick(PickInfo::new("m")).unwrap();
        (r.done)(DoneInfo::failed("not found"));

        assert_eq!(conn.consecutive_failures(), 0);
        assert_eq!(conn.threshold_ms(), 100);
        assert_eq!(conn.last_response(), h.clock.now());
    }

    #[test]
    fn test_done_after_pool_dropped_is_noop() {
        let h = Harness::new(pool_config(1));
        h.ready(0);

        let result = h.picker.pick(PickInfo::new("m")).unwrap();
        let Harness { pool, picker, .. } = h;
        drop(picker);
        drop(pool);

        (result.done)(DoneInfo::deadline_exceeded());
    }
}
