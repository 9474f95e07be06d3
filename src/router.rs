// Strategy-driven backend selection with health tracking and fallback. The
// router is itself a Backend, so a Bridge holds a router and a single backend
// through the same trait object.

use async_trait::async_trait;
use futures::StreamExt;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::adapter::{
    AdapterMetadata, Backend, Capabilities, CostEstimate, ListModelsResult, ModelFilter,
    ModelSource,
};
use crate::error::GatewayError;
use crate::ir::stream::{boxed, ChunkStream, StreamChunk};
use crate::ir::{ChatRequest, ChatResponse};

// ============================================================================
// Configuration
// ============================================================================

/// Selection strategy. `complexity`- or cost-driven selection is expressed
/// through `Custom` with a caller-supplied selector.
#[derive(Clone)]
pub enum Strategy {
    RoundRobin,
    Priority,
    Random,
    LeastLatency,
    Custom(Arc<dyn Fn(&ChatRequest, &[BackendStats]) -> usize + Send + Sync>),
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::RoundRobin => write!(f, "RoundRobin"),
            Strategy::Priority => write!(f, "Priority"),
            Strategy::Random => write!(f, "Random"),
            Strategy::LeastLatency => write!(f, "LeastLatency"),
            Strategy::Custom(_) => write!(f, "Custom"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub strategy: Strategy,
    pub fallback_on_error: bool,
    /// Consecutive failures before a backend leaves rotation.
    pub unhealthy_threshold: u32,
    /// How long an unhealthy backend stays out before being retried.
    pub cooldown: Duration,
    /// Interval for the optional background health-check loop.
    pub health_check_interval: Option<Duration>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Priority,
            fallback_on_error: true,
            unhealthy_threshold: 3,
            cooldown: Duration::from_secs(60),
            health_check_interval: None,
        }
    }
}

/// Observable side effects of routing decisions.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    Selected {
        backend: String,
    },
    Failed {
        backend: String,
        code: String,
        message: String,
    },
    Switched {
        from: String,
        to: String,
    },
    Health {
        backend: String,
        healthy: bool,
    },
}

/// A snapshot of one backend's health counters, handed to custom selectors.
#[derive(Debug, Clone)]
pub struct BackendStats {
    pub name: String,
    pub total: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub healthy: bool,
    pub average_latency_ms: Option<f64>,
}

// ============================================================================
// Health tracking
// ============================================================================

struct HealthState {
    total: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
    last_failure_at: Mutex<Option<Instant>>,
    // EWMA over observed request latencies, for leastLatency.
    latency_ms: Mutex<Option<f64>>,
}

impl HealthState {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_failure_at: Mutex::new(None),
            latency_ms: Mutex::new(None),
        }
    }

    fn is_healthy(&self, threshold: u32, cooldown: Duration) -> bool {
        if self.consecutive_failures.load(Ordering::SeqCst) < threshold {
            return true;
        }
        // Out of rotation until the cooldown expires.
        self.last_failure_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|at| at.elapsed() >= cooldown)
            .unwrap_or(true)
    }

    fn average_latency(&self) -> Option<f64> {
        *self.latency_ms.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Entry {
    name: String,
    backend: Arc<dyn Backend>,
    health: Arc<HealthState>,
}

fn record_success(
    entry: &Entry,
    events: &broadcast::Sender<RouterEvent>,
    threshold: u32,
    latency_ms: u64,
) {
    entry.health.total.fetch_add(1, Ordering::SeqCst);
    let was_failing = entry.health.consecutive_failures.swap(0, Ordering::SeqCst);
    {
        let mut latency = entry
            .health
            .latency_ms
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let sample = latency_ms as f64;
        *latency = Some(match *latency {
            Some(current) => current * 0.8 + sample * 0.2,
            None => sample,
        });
    }
    if was_failing >= threshold {
        let _ = events.send(RouterEvent::Health {
            backend: entry.name.clone(),
            healthy: true,
        });
    }
}

fn record_failure(entry: &Entry, events: &broadcast::Sender<RouterEvent>, threshold: u32) {
    entry.health.total.fetch_add(1, Ordering::SeqCst);
    entry.health.failures.fetch_add(1, Ordering::SeqCst);
    let consecutive = entry.health.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
    *entry
        .health
        .last_failure_at
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    if consecutive == threshold {
        let _ = events.send(RouterEvent::Health {
            backend: entry.name.clone(),
            healthy: false,
        });
    }
}

/// Errors worth trying another backend for: every retryable class, plus
/// network / rate-limit / provider regardless of their retryability.
fn fallback_worthy(err: &GatewayError) -> bool {
    err.is_retryable()
        || matches!(
            err,
            GatewayError::Network(_) | GatewayError::RateLimit { .. } | GatewayError::Provider { .. }
        )
}

fn chunk_code_fallback_worthy(code: &str) -> bool {
    matches!(code, "network" | "rate_limit" | "provider" | "stream" | "timeout")
}

// ============================================================================
// Router
// ============================================================================

pub struct Router {
    entries: Vec<Entry>,
    config: RouterConfig,
    round_robin: AtomicUsize,
    events: broadcast::Sender<RouterEvent>,
    metadata: AdapterMetadata,
}

impl Router {
    pub fn new(
        backends: Vec<Arc<dyn Backend>>,
        config: RouterConfig,
    ) -> Result<Self, GatewayError> {
        if backends.is_empty() {
            return Err(GatewayError::Config(
                "router requires at least one backend".to_string(),
            ));
        }
        let (events, _) = broadcast::channel(64);
        let entries = backends
            .into_iter()
            .map(|backend| Entry {
                name: backend.metadata().name.clone(),
                backend,
                health: Arc::new(HealthState::new()),
            })
            .collect();
        Ok(Self {
            entries,
            config,
            round_robin: AtomicUsize::new(0),
            events,
            metadata: AdapterMetadata::new("router", "router", Capabilities::default()),
        })
    }

    /// Subscribe to routing events. Missed events are dropped, not buffered
    /// indefinitely.
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    /// Health counters per backend, in registration order.
    pub fn stats(&self) -> Vec<BackendStats> {
        self.entries
            .iter()
            .map(|entry| BackendStats {
                name: entry.name.clone(),
                total: entry.health.total.load(Ordering::SeqCst),
                failures: entry.health.failures.load(Ordering::SeqCst),
                consecutive_failures: entry.health.consecutive_failures.load(Ordering::SeqCst),
                healthy: entry
                    .health
                    .is_healthy(self.config.unhealthy_threshold, self.config.cooldown),
                average_latency_ms: entry.health.average_latency(),
            })
            .collect()
    }

    /// Candidate indices in attempt order: a permutation of the healthy
    /// backends under the strategy, ties broken by registration order. When
    /// every backend is unhealthy, all are tried anyway.
    fn candidate_order(&self, request: &ChatRequest) -> Vec<usize> {
        let mut healthy: Vec<usize> = (0..self.entries.len())
            .filter(|&i| {
                self.entries[i]
                    .health
                    .is_healthy(self.config.unhealthy_threshold, self.config.cooldown)
            })
            .collect();
        if healthy.is_empty() {
            healthy = (0..self.entries.len()).collect();
        }

        match &self.config.strategy {
            Strategy::Priority => healthy,
            Strategy::RoundRobin => {
                let start = self.round_robin.fetch_add(1, Ordering::SeqCst) % healthy.len();
                healthy.rotate_left(start);
                healthy
            }
            Strategy::Random => {
                healthy.shuffle(&mut rand::thread_rng());
                healthy
            }
            Strategy::LeastLatency => {
                // Unmeasured backends sort last; stable sort keeps
                // registration order within ties.
                healthy.sort_by(|&a, &b| {
                    let la = self.entries[a].health.average_latency();
                    let lb = self.entries[b].health.average_latency();
                    match (la, lb) {
                        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
                        (Some(_), None) => std::cmp::Ordering::Less,
                        (None, Some(_)) => std::cmp::Ordering::Greater,
                        (None, None) => std::cmp::Ordering::Equal,
                    }
                });
                healthy
            }
            Strategy::Custom(selector) => {
                let stats = self.stats();
                let primary = selector(request, &stats).min(self.entries.len() - 1);
                let mut order = vec![primary];
                order.extend(healthy.into_iter().filter(|&i| i != primary));
                order
            }
        }
    }

    /// Spawn the background health-check loop, if an interval is configured.
    /// Aborting the returned handle stops the loop.
    pub fn start_health_checks(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.config.health_check_interval?;
        let router = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for entry in &router.entries {
                    let healthy = entry.backend.health_check().await;
                    if healthy {
                        let was_failing =
                            entry.health.consecutive_failures.swap(0, Ordering::SeqCst);
                        if was_failing >= router.config.unhealthy_threshold {
                            let _ = router.events.send(RouterEvent::Health {
                                backend: entry.name.clone(),
                                healthy: true,
                            });
                        }
                    } else {
                        record_failure(entry, &router.events, router.config.unhealthy_threshold);
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl Backend for Router {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn execute(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, GatewayError> {
        let order = self.candidate_order(&request);
        let total = order.len();
        let mut previous: Option<String> = None;
        let mut last_error: Option<GatewayError> = None;

        for (attempt, idx) in order.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            let entry = &self.entries[idx];
            if let Some(from) = previous.take() {
                let _ = self.events.send(RouterEvent::Switched {
                    from,
                    to: entry.name.clone(),
                });
            }
            let _ = self.events.send(RouterEvent::Selected {
                backend: entry.name.clone(),
            });

            let started = Instant::now();
            match entry.backend.execute(request.clone(), cancel.clone()).await {
                Ok(response) => {
                    record_success(
                        entry,
                        &self.events,
                        self.config.unhealthy_threshold,
                        started.elapsed().as_millis() as u64,
                    );
                    return Ok(response);
                }
                Err(err) => {
                    record_failure(entry, &self.events, self.config.unhealthy_threshold);
                    let _ = self.events.send(RouterEvent::Failed {
                        backend: entry.name.clone(),
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                    log::warn!("backend '{}' failed: {}", entry.name, err);
                    let exhausted = attempt + 1 >= total;
                    if !self.config.fallback_on_error || !fallback_worthy(&err) || exhausted {
                        return Err(err);
                    }
                    previous = Some(entry.name.clone());
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| GatewayError::Config("no backends available".to_string())))
    }

    async fn execute_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, GatewayError> {
        let order = self.candidate_order(&request);
        let candidates: Vec<(String, Arc<dyn Backend>, Arc<HealthState>)> = order
            .into_iter()
            .map(|idx| {
                let entry = &self.entries[idx];
                (
                    entry.name.clone(),
                    Arc::clone(&entry.backend),
                    Arc::clone(&entry.health),
                )
            })
            .collect();
        let events = self.events.clone();
        let threshold = self.config.unhealthy_threshold;
        let fallback_on_error = self.config.fallback_on_error;

        Ok(boxed(async_stream::stream! {
            let total = candidates.len();
            let mut sequence: u64 = 0;
            let mut started_downstream = false;
            let mut delivered_content = false;
            let mut previous: Option<String> = None;

            for (attempt, (name, backend, health)) in candidates.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    yield StreamChunk::aborted(sequence);
                    return;
                }
                let entry_like = Entry {
                    name: name.clone(),
                    backend: Arc::clone(&backend),
                    health: Arc::clone(&health),
                };
                if let Some(from) = previous.take() {
                    let _ = events.send(RouterEvent::Switched {
                        from,
                        to: name.clone(),
                    });
                }
                let _ = events.send(RouterEvent::Selected {
                    backend: name.clone(),
                });

                let exhausted = attempt + 1 >= total;
                let started_at = Instant::now();
                let mut inner = match backend
                    .execute_stream(request.clone(), cancel.clone())
                    .await
                {
                    Ok(stream) => stream,
                    Err(err) => {
                        record_failure(&entry_like, &events, threshold);
                        let _ = events.send(RouterEvent::Failed {
                            backend: name.clone(),
                            code: err.code().to_string(),
                            message: err.to_string(),
                        });
                        if fallback_on_error && fallback_worthy(&err) && !exhausted {
                            previous = Some(name);
                            continue;
                        }
                        yield StreamChunk::error(sequence, &err);
                        return;
                    }
                };

                let mut retrying = false;
                while let Some(chunk) = inner.next().await {
                    match chunk {
                        StreamChunk::Start { metadata, .. } => {
                            // A fallback candidate's start is suppressed so the
                            // downstream stream keeps a single `start`.
                            if started_downstream {
                                continue;
                            }
                            started_downstream = true;
                            yield StreamChunk::Start { sequence, metadata };
                            sequence += 1;
                        }
                        StreamChunk::Done { finish_reason, usage, message, .. } => {
                            record_success(
                                &entry_like,
                                &events,
                                threshold,
                                started_at.elapsed().as_millis() as u64,
                            );
                            yield StreamChunk::Done { sequence, finish_reason, usage, message };
                            return;
                        }
                        StreamChunk::Error { code, message, .. } => {
                            record_failure(&entry_like, &events, threshold);
                            let _ = events.send(RouterEvent::Failed {
                                backend: name.clone(),
                                code: code.clone(),
                                message: message.clone(),
                            });
                            // Fallback applies only before the first content
                            // chunk reached the consumer; after that the
                            // error is terminal (streams are never spliced).
                            if fallback_on_error
                                && !delivered_content
                                && chunk_code_fallback_worthy(&code)
                                && !exhausted
                            {
                                retrying = true;
                                break;
                            }
                            yield StreamChunk::Error { sequence, code, message };
                            return;
                        }
                        other => {
                            if other.is_content() {
                                delivered_content = true;
                            }
                            yield other.with_sequence(sequence);
                            sequence += 1;
                        }
                    }
                }

                if retrying {
                    previous = Some(name);
                    continue;
                }
                // Candidate stream ended without a terminal chunk.
                yield StreamChunk::Error {
                    sequence,
                    code: "stream".to_string(),
                    message: "backend stream ended without a terminal chunk".to_string(),
                };
                return;
            }
        }))
    }

    /// Union of every backend's models; per-backend failures are logged and
    /// skipped.
    async fn list_models(
        &self,
        filter: Option<&ModelFilter>,
    ) -> Result<ListModelsResult, GatewayError> {
        let mut models = Vec::new();
        for entry in &self.entries {
            match entry.backend.list_models(filter).await {
                Ok(result) => models.extend(result.models),
                Err(err) => log::warn!("list_models failed on '{}': {}", entry.name, err),
            }
        }
        Ok(ListModelsResult {
            models,
            source: ModelSource::Hybrid,
        })
    }

    fn estimate_cost(&self, request: &ChatRequest) -> Option<CostEstimate> {
        self.entries
            .iter()
            .find_map(|entry| entry.backend.estimate_cost(request))
    }

    async fn health_check(&self) -> bool {
        for entry in &self.entries {
            if entry.backend.health_check().await {
                return true;
            }
        }
        false
    }
}
