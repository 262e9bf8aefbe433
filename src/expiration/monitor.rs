//! Background quota monitor
//!
//! Polls the accountant on a fixed interval and starts an enforcement task
//! for every layer over its quota, plus one for the global quota. At most
//! `maxConcurrentCleanUps` tasks run at once and a layer never has two
//! sweeps in flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::accountant::QuotaAccountant;
use crate::error::{Error, Result};

/// In-flight key of the global sweep
const GLOBAL_SWEEP: &str = "<global>";

/// Periodic quota enforcement
pub struct QuotaMonitor {
    accountant: Arc<QuotaAccountant>,
    interval: Duration,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
}

impl QuotaMonitor {
    /// Monitor driven by the accountant's configured interval and
    /// concurrency
    pub fn new(accountant: Arc<QuotaAccountant>) -> Result<Self> {
        let config = accountant.config();
        let interval = config.cleanup_interval()?;
        let max_clean_ups = usize::try_from(config.max_concurrent_clean_ups)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| Error::Config("maxConcurrentCleanUps must be > 0".into()))?;

        Ok(Self {
            accountant,
            interval,
            permits: Arc::new(Semaphore::new(max_clean_ups)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cancel: CancellationToken::new(),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the loop and every running sweep to stop
    pub fn shutdown(&self) {
        info!("Stopping quota monitor");
        self.cancel.cancel();
    }

    /// Layers with a sweep currently running
    pub fn in_flight(&self) -> Vec<String> {
        self.in_flight.lock().iter().cloned().collect()
    }

    /// Start enforcement for everything over quota that is not already
    /// being swept
    pub fn poll_once(&self) -> Vec<JoinHandle<()>> {
        let mut targets = self.accountant.layers_over_quota();
        if self.accountant.global_excess().is_positive() {
            targets.push(GLOBAL_SWEEP.to_string());
        }

        let mut handles = Vec::new();
        for target in targets {
            if !self.in_flight.lock().insert(target.clone()) {
                debug!("Sweep of {} still running, skipping", target);
                continue;
            }
            handles.push(self.spawn_sweep(target));
        }
        handles
    }

    fn spawn_sweep(&self, target: String) -> JoinHandle<()> {
        let accountant = Arc::clone(&self.accountant);
        let permits = Arc::clone(&self.permits);
        let in_flight = Arc::clone(&self.in_flight);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };

            if permit.is_some() {
                let result = if target == GLOBAL_SWEEP {
                    accountant.enforce_global(&cancel).await
                } else {
                    accountant.enforce(&target, &cancel).await
                };
                match result {
                    Ok(outcome) => debug!(
                        "Sweep of {} truncated {} pages",
                        target, outcome.pages_truncated
                    ),
                    Err(Error::Cancelled(reason)) => info!("Sweep of {} stopped: {}", target, reason),
                    Err(e) => error!("Sweep of {} failed: {}", target, e),
                }
            }
            drop(permit);
            in_flight.lock().remove(&target);
        })
    }

    /// Run the poll loop until cancelled, then wait for running sweeps
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting quota monitor, polling every {:?}", self.interval);
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut running: Vec<JoinHandle<()>> = Vec::new();

            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        running.retain(|h| !h.is_finished());
                        running.extend(self.poll_once());
                    }
                }
            }

            for result in join_all(running).await {
                if let Err(e) = result {
                    warn!("Sweep task ended abnormally: {}", e);
                }
            }
            info!("Quota monitor stopped");
        })
    }
}
