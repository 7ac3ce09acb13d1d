use anyhow::{Context, Result};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::transport::{SimulatedTransport, TransportEvent};
use crate::config::ApiConfig;
use crate::core::{Balancer, ClientConnState};
use crate::lb::{DoneInfo, PickInfo};
use crate::pool::{Address, ConnectivityState};

/// Method name used for simulated calls
pub const SIM_METHOD: &str = "chanpool.sim/Call";

/// Give up on a call after this many failed picks
const MAX_PICK_ATTEMPTS: usize = 500;

/// Pause between failed picks
const PICK_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Knobs for a simulation run
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Total calls to issue
    pub calls: usize,

    /// Number of concurrent callers
    pub concurrency: usize,

    /// Probability that a call ends with deadline exceeded
    pub deadline_rate: f64,

    /// Time a connection spends CONNECTING before it is READY
    pub connect_delay: Duration,

    /// Time each call holds its connection
    pub call_latency: Duration,

    /// Number of distinct affinity keys carried by requests
    pub sessions: usize,

    /// Addresses handed to the pool
    pub addresses: Vec<Address>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            calls: 1000,
            concurrency: 16,
            deadline_rate: 0.0,
            connect_delay: Duration::from_millis(20),
            call_latency: Duration::from_millis(2),
            sessions: 16,
            addresses: vec!["127.0.0.1:50051".to_string()],
        }
    }
}

/// Summary of a simulation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationReport {
    pub calls_completed: u64,
    pub deadline_exceeded: u64,
    pub unavailable_picks: u64,
    pub abandoned_calls: u64,
    pub elapsed_ms: u128,
    pub pool: crate::pool::PoolStats,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    deadline_exceeded: AtomicU64,
    unavailable: AtomicU64,
    abandoned: AtomicU64,
}

/// Drive a balancer over a simulated network and report what happened
pub async fn run_simulation(config: ApiConfig, options: SimulationOptions) -> Result<SimulationReport> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let transport = Arc::new(SimulatedTransport::with_notifier(tx));
    let balancer = Arc::new(Balancer::new(transport));

    // Network: every connect request turns READY after the delay
    let network_balancer = Arc::clone(&balancer);
    let connect_delay = options.connect_delay;
    let network = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let TransportEvent::Connected(handle) = event {
                let balancer = Arc::clone(&network_balancer);
                tokio::spawn(async move {
                    balancer.on_connection_state_change(&handle, ConnectivityState::Connecting);
                    tokio::time::sleep(connect_delay).await;
                    balancer.on_connection_state_change(&handle, ConnectivityState::Ready);
                });
            }
        }
    });

    balancer.update_client_conn_state(ClientConnState {
        addresses: options.addresses.clone(),
        config: Some(config),
    });

    info!(
        calls = options.calls,
        concurrency = options.concurrency,
        deadline_rate = options.deadline_rate,
        "Starting simulation"
    );

    let start = Instant::now();
    let counters = Arc::new(Counters::default());
    let next_call = Arc::new(AtomicUsize::new(0));
    let deadline_rate = options.deadline_rate.clamp(0.0, 1.0);
    let sessions = options.sessions.max(1);

    let mut workers = Vec::with_capacity(options.concurrency);
    for _ in 0..options.concurrency.max(1) {
        let balancer = Arc::clone(&balancer);
        let counters = Arc::clone(&counters);
        let next_call = Arc::clone(&next_call);
        let total = options.calls;
        let latency = options.call_latency;

        workers.push(tokio::spawn(async move {
            loop {
                let n = next_call.fetch_add(1, Ordering::Relaxed);
                if n >= total {
                    break;
                }

                let request = json!({ "session": format!("session-{}", n % sessions) });
                let mut picked = None;
                for _ in 0..MAX_PICK_ATTEMPTS {
                    match balancer.pick(PickInfo::new(SIM_METHOD).with_request(&request)) {
                        Ok(result) => {
                            picked = Some(result);
                            break;
                        }
                        Err(e) => {
                            counters.unavailable.fetch_add(1, Ordering::Relaxed);
                            debug!(call = n, error = %e, "Pick failed, retrying");
                            tokio::time::sleep(PICK_RETRY_DELAY).await;
                        }
                    }
                }

                let Some(result) = picked else {
                    counters.abandoned.fetch_add(1, Ordering::Relaxed);
                    continue;
                };

                tokio::time::sleep(latency).await;

                let timed_out = rand::thread_rng().gen_bool(deadline_rate);
                if timed_out {
                    counters.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
                    (result.done)(DoneInfo::deadline_exceeded());
                } else {
                    (result.done)(DoneInfo::ok().with_response(request));
                }
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    for worker in workers {
        worker.await.context("Simulation worker panicked")?;
    }
    network.abort();

    let report = SimulationReport {
        calls_completed: counters.completed.load(Ordering::Relaxed),
        deadline_exceeded: counters.deadline_exceeded.load(Ordering::Relaxed),
        unavailable_picks: counters.unavailable.load(Ordering::Relaxed),
        abandoned_calls: counters.abandoned.load(Ordering::Relaxed),
        elapsed_ms: start.elapsed().as_millis(),
        pool: balancer.stats(),
    };

    info!(
        completed = report.calls_completed,
        elapsed_ms = report.elapsed_ms,
        connections = report.pool.connections,
        "Simulation finished"
    );
    Ok(report)
}
