//! Value producer
//!
//! Once per tick:
//! 1. Load the calendar (missing or unreadable means no events)
//! 2. Evaluate coefficients and log any change
//! 3. Draw jitter and compute the price
//! 4. Hand the point to the store on a blocking thread
//! 5. Broadcast to every registered connection without waiting for the store
//! 6. Collect the store result; a failed or panicked append is logged and
//!    counted, the tick still succeeds
//!
//! A tick that fails outright, including by panicking, puts the loop into
//! backoff instead of ending it. Only a shutdown signal stops the loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, Utc};
use futures::FutureExt;
use persistence::PriceStore;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use types::point::PointValue;

use crate::calendar::{parse_events, Coefficients};
use crate::metrics::FeedMetrics;
use crate::registry::{BroadcastReport, ConnectionRegistry};
use crate::source::CalendarSource;

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerConfig {
    pub tick_interval: Duration,
    /// Pause after a failed tick.
    pub backoff: Duration,
    pub base_price: f64,
    pub jitter_min: f64,
    pub jitter_max: f64,
    /// Fixed seed for reproducible jitter; entropy when `None`.
    pub rng_seed: Option<u64>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            backoff: Duration::from_secs(60),
            base_price: 5.0,
            jitter_min: 0.01,
            jitter_max: 1.5,
            rng_seed: None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("tick interval must be non-zero")]
    ZeroTickInterval,

    #[error("invalid jitter range {min}..={max}")]
    InvalidJitter { min: f64, max: f64 },

    #[error("base price must be finite, got {0}")]
    InvalidBasePrice(f64),
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroTickInterval);
        }
        if !self.base_price.is_finite() {
            return Err(ConfigError::InvalidBasePrice(self.base_price));
        }
        let (min, max) = (self.jitter_min, self.jitter_max);
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(ConfigError::InvalidJitter { min, max });
        }
        Ok(())
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Last coefficients seen, kept only to log changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoefficientState {
    pub last_egorov: Option<f64>,
    pub last_lesson: Option<f64>,
}

impl CoefficientState {
    /// Record `current`; returns true if it differs from the previous tick.
    pub fn observe(&mut self, current: Coefficients) -> bool {
        let changed = self.last_egorov != Some(current.egorov)
            || self.last_lesson != Some(current.lesson);
        if changed {
            info!(
                old_egorov = ?self.last_egorov,
                new_egorov = current.egorov,
                old_lesson = ?self.last_lesson,
                new_lesson = current.lesson,
                "Coefficients changed"
            );
            self.last_egorov = Some(current.egorov);
            self.last_lesson = Some(current.lesson);
        }
        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerPhase {
    /// Executing a tick.
    Running,
    /// Sleeping until the next tick.
    Waiting,
    /// Sleeping after a failed tick.
    Backoff,
    /// Shut down; no further ticks.
    Stopped,
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub point: PointValue,
    pub coefficients: Coefficients,
    pub jitter: f64,
    pub broadcast: BroadcastReport,
}

#[derive(Debug, Error)]
pub enum TickError {
    #[error("failed to serialize broadcast message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("tick panicked: {0}")]
    Panicked(String),
}

// ── Producer ────────────────────────────────────────────────────────

pub struct ValueProducer {
    config: ProducerConfig,
    calendar: Arc<dyn CalendarSource>,
    store: Arc<dyn PriceStore>,
    registry: ConnectionRegistry,
    metrics: Arc<FeedMetrics>,
    coefficients: CoefficientState,
    rng: ChaCha8Rng,
    phase: watch::Sender<ProducerPhase>,
}

impl ValueProducer {
    pub fn new(
        config: ProducerConfig,
        calendar: Arc<dyn CalendarSource>,
        store: Arc<dyn PriceStore>,
        registry: ConnectionRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = match config.rng_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let metrics = Arc::clone(registry.metrics());
        let (phase, _) = watch::channel(ProducerPhase::Running);

        Ok(Self {
            config,
            calendar,
            store,
            registry,
            metrics,
            coefficients: CoefficientState::default(),
            rng,
            phase,
        })
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn phase(&self) -> ProducerPhase {
        *self.phase.borrow()
    }

    pub fn coefficient_state(&self) -> &CoefficientState {
        &self.coefficients
    }

    /// Produce, persist and broadcast one value for the instant `now`.
    ///
    /// The calendar is evaluated in `now`'s local wall-clock time; the stored
    /// timestamp is `now` in UTC.
    pub async fn tick_at(&mut self, now: DateTime<FixedOffset>) -> Result<TickReport, TickError> {
        let text = match self.calendar.load().await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "Calendar unavailable, using neutral coefficients");
                self.metrics.record_calendar_failure();
                String::new()
            }
        };

        let events = parse_events(&text);
        let coefficients = Coefficients::evaluate(&events, now.naive_local());
        self.coefficients.observe(coefficients);

        let jitter = self
            .rng
            .gen_range(self.config.jitter_min..=self.config.jitter_max);
        let price = self.config.base_price * coefficients.product() + jitter;
        let point = PointValue::new(now.with_timezone(&Utc), price);

        let store = Arc::clone(&self.store);
        let persist = tokio::task::spawn_blocking(move || store.append(&point));

        let broadcast = self.registry.broadcast(&point)?;
        self.metrics.record_tick(price);

        // Awaited only so appends land in tick order; delivery is already done.
        let failure = match persist.await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(err) => Some(err.to_string()),
        };
        if let Some(error) = failure {
            warn!(%error, price, "Failed to persist point");
            self.metrics.record_persistence_failure();
        }

        debug!(
            price,
            egorov = coefficients.egorov,
            lesson = coefficients.lesson,
            events = events.len(),
            delivered = broadcast.delivered,
            dropped = broadcast.dropped.len(),
            "Tick complete"
        );

        Ok(TickReport {
            point,
            coefficients,
            jitter,
            broadcast,
        })
    }

    /// Run one tick and return how long to sleep before the next.
    pub async fn step(&mut self, now: DateTime<FixedOffset>) -> Duration {
        self.phase.send_replace(ProducerPhase::Running);

        let outcome = match AssertUnwindSafe(self.tick_at(now)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(TickError::Panicked(panic_message(panic.as_ref()))),
        };

        match outcome {
            Ok(_) => {
                self.phase.send_replace(ProducerPhase::Waiting);
                self.config.tick_interval
            }
            Err(err) => {
                error!(
                    error = %err,
                    backoff_secs = self.config.backoff.as_secs(),
                    "Tick failed, backing off"
                );
                self.metrics.record_tick_failure();
                self.phase.send_replace(ProducerPhase::Backoff);
                self.config.backoff
            }
        }
    }

    /// Tick until `shutdown` flips to true or its sender is dropped.
    ///
    /// Ticks start on a fixed period regardless of how long each one takes.
    /// A tick that overruns the period pushes the schedule back instead of
    /// firing a burst. After a failed tick the schedule restarts once the
    /// backoff has elapsed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            backoff_secs = self.config.backoff.as_secs(),
            "Value producer started"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let now: DateTime<FixedOffset> = Local::now().into();
            let pause = self.step(now).await;
            if self.phase() != ProducerPhase::Backoff {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            ticker.reset_immediately();
        }

        self.phase.send_replace(ProducerPhase::Stopped);
        info!(
            ticks = self.metrics.snapshot().ticks_produced,
            "Value producer stopped"
        );
        self
    }

    /// Start the loop on the runtime.
    pub fn spawn(self) -> ProducerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let phase = self.phase.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));
        ProducerHandle {
            shutdown_tx,
            phase,
            task,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a spawned producer.
pub struct ProducerHandle {
    shutdown_tx: watch::Sender<bool>,
    phase: watch::Receiver<ProducerPhase>,
    task: JoinHandle<ValueProducer>,
}

impl ProducerHandle {
    pub fn phase(&self) -> ProducerPhase {
        *self.phase.borrow()
    }

    /// Stop ticking and wait for the loop to exit. Pending sends are not drained.
    pub async fn shutdown(self) -> Result<ValueProducer, JoinError> {
        let _ = self.shutdown_tx.send(true);
        self.task.await
    }
}
