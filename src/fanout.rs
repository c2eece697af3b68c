use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context as _, anyhow};
use bytes::Bytes;
use hickory_proto::op::{Message, ResponseCode};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{DnsClient, Net, TlsSetup};
use crate::config::{FanoutConfig, PolicyConfig, Transport};
use crate::metrics::{DnsTap, LogTap, Metrics};
use crate::policy::{Picker, SelectionPolicy, SequentialPolicy, WeightedPolicy};
use crate::proto;
use crate::scope::QueryScope;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ATTEMPTS: usize = 3;
pub const DEFAULT_ATTEMPT_DELAY: Duration = Duration::from_millis(100);

/// Result of one client exchange. Owned by the producing worker until handed
/// off on the result channel, then by the aggregator.
pub struct Outcome {
    pub client: Arc<DnsClient>,
    pub response: Option<Message>,
    pub start: SystemTime,
    pub err: Option<anyhow::Error>,
}

/// Terminal state of a dispatch cycle.
pub enum DispatchResult {
    /// Query name is outside the configured scope; the host pipeline takes
    /// over.
    Skipped,
    Answered {
        response: Bytes,
        upstream: String,
    },
    /// The winning outcome failed the response-validity check; a FORMERR
    /// reply is substituted for the upstream answer.
    FormatError {
        response: Bytes,
    },
    /// No usable outcome before the deadline, or the winner carried an error.
    ServerFailure {
        response: Bytes,
        cause: anyhow::Error,
    },
}

/// Fans one query out to every configured upstream concurrently and returns
/// the best answer under a deadline.
#[derive(Clone)]
pub struct Fanout {
    clients: Arc<Vec<Arc<DnsClient>>>,
    policy: Arc<dyn SelectionPolicy>,
    scope: Arc<QueryScope>,
    timeout: Duration,
    race: bool,
    // 0 = unlimited
    attempts: usize,
    attempt_delay: Duration,
    // 0 = one worker per upstream
    worker_count: usize,
    tap: Option<Arc<dyn DnsTap>>,
}

impl Fanout {
    pub fn new(clients: Vec<Arc<DnsClient>>) -> Self {
        Self {
            clients: Arc::new(clients),
            policy: Arc::new(SequentialPolicy),
            scope: Arc::new(QueryScope::default()),
            timeout: DEFAULT_TIMEOUT,
            race: false,
            attempts: DEFAULT_ATTEMPTS,
            attempt_delay: DEFAULT_ATTEMPT_DELAY,
            worker_count: 0,
            tap: None,
        }
    }

    /// Builds the full dispatch engine from a validated configuration. Every
    /// client shares the given metrics sink.
    pub fn from_config(cfg: &FanoutConfig, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let ca_file = cfg.tls.as_ref().and_then(|t| t.ca_file.as_deref());
        let mut clients = Vec::with_capacity(cfg.upstreams.len());
        for upstream in &cfg.upstreams {
            let addr = upstream
                .address
                .parse()
                .with_context(|| format!("upstream address: {}", upstream.address))?;
            let net = match upstream.transport {
                Transport::Udp => Net::Udp,
                Transport::Tcp | Transport::TcpTls => Net::Tcp,
            };
            let mut client = DnsClient::new(addr, net)
                .with_udp_buffer_size(cfg.settings.min_udp_buffer_size)
                .with_metrics(Arc::clone(&metrics));
            if upstream.transport == Transport::TcpTls {
                let server_name = upstream
                    .tls_server_name
                    .as_deref()
                    .with_context(|| format!("tls_server_name for {}", upstream.address))?;
                client.set_tls(TlsSetup::new(server_name, ca_file)?);
            }
            clients.push(Arc::new(client));
        }

        let policy: Arc<dyn SelectionPolicy> = match &cfg.settings.policy {
            PolicyConfig::Sequential => Arc::new(SequentialPolicy),
            PolicyConfig::WeightedRandom { load_factor } => {
                Arc::new(WeightedPolicy::new(load_factor.clone()))
            }
        };

        Ok(Self::new(clients)
            .with_policy(policy)
            .with_scope(QueryScope::new(&cfg.settings.from, &cfg.settings.exclude))
            .with_timeout(Duration::from_millis(cfg.settings.timeout_ms))
            .with_race(cfg.settings.race)
            .with_attempts(cfg.settings.attempts)
            .with_attempt_delay(Duration::from_millis(cfg.settings.attempt_delay_ms))
            .with_worker_count(cfg.settings.worker_count)
            .with_tap(Arc::new(LogTap)))
    }

    pub fn with_policy(mut self, policy: Arc<dyn SelectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_scope(mut self, scope: QueryScope) -> Self {
        self.scope = Arc::new(scope);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_race(mut self, race: bool) -> Self {
        self.race = race;
        self
    }

    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_attempt_delay(mut self, delay: Duration) -> Self {
        self.attempt_delay = delay;
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_tap(mut self, tap: Arc<dyn DnsTap>) -> Self {
        self.tap = Some(tap);
        self
    }

    /// Entry point for one query. `cancel` is the caller's cancellation
    /// scope; the dispatch derives a child token so stragglers are stopped
    /// once a winner is chosen.
    pub async fn dispatch(&self, req: &Message, cancel: &CancellationToken) -> DispatchResult {
        let qname = req
            .queries()
            .first()
            .map(|q| q.name().to_string())
            .unwrap_or_default();
        if !self.scope.matches(&qname) {
            return DispatchResult::Skipped;
        }
        if self.clients.is_empty() {
            return self.server_failure(req, anyhow!("no upstreams configured"));
        }

        let started = Instant::now();
        let cancel = cancel.child_token();
        let deadline = tokio::time::Instant::now() + self.timeout;
        let query = Arc::new(req.clone());

        let mut results = self.run_workers(&cancel, query);
        let best = self.collect(&cancel, deadline, &mut results).await;
        // stop the feeder and any workers still mid-retry
        cancel.cancel();

        let outcome = match best {
            Some(outcome) => outcome,
            None => {
                return self.server_failure(
                    req,
                    anyhow!("no upstream response within {:?}", self.timeout),
                );
            }
        };
        if let Some(err) = outcome.err {
            return self.server_failure(req, err);
        }
        let Some(response) = outcome.response else {
            return self.server_failure(req, anyhow!("upstream produced no response"));
        };

        let upstream = outcome.client.endpoint();
        if let Some(tap) = &self.tap {
            tap.tap(&upstream, req, &response, outcome.start);
        }

        if !proto::response_matches(req, &response) {
            warn!(
                event = "dns_response",
                upstream = %upstream,
                qname = %qname,
                reply_id = response.id(),
                query_id = req.id(),
                "wrong reply for query, substituting formerr"
            );
            return match proto::build_reply(req, ResponseCode::FormErr) {
                Ok(bytes) => DispatchResult::FormatError { response: bytes },
                Err(err) => self.server_failure(req, err),
            };
        }

        match proto::encode(&response) {
            Ok(bytes) => {
                info!(
                    event = "dns_response",
                    upstream = %upstream,
                    qname = %qname,
                    rcode = ?response.response_code(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    race = self.race,
                    "answered"
                );
                DispatchResult::Answered {
                    response: bytes,
                    upstream,
                }
            }
            Err(err) => self.server_failure(req, err),
        }
    }

    fn server_failure(&self, req: &Message, cause: anyhow::Error) -> DispatchResult {
        let response = match proto::build_reply(req, ResponseCode::ServFail) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to build servfail reply");
                Bytes::new()
            }
        };
        DispatchResult::ServerFailure { response, cause }
    }

    fn effective_worker_count(&self) -> usize {
        let server_count = self.clients.len();
        if self.worker_count == 0 {
            server_count
        } else {
            self.worker_count.min(server_count).max(1)
        }
    }

    /// Spins up the feeder and the bounded worker pool. One dispatch slot per
    /// configured client; the returned channel closes once every worker has
    /// finished.
    fn run_workers(
        &self,
        cancel: &CancellationToken,
        query: Arc<Message>,
    ) -> mpsc::Receiver<Outcome> {
        let server_count = self.clients.len();
        let worker_count = self.effective_worker_count();
        let picker: Arc<dyn Picker> = self.policy.selector(&self.clients).into();

        let (work_tx, work_rx) = mpsc::channel::<Arc<DnsClient>>(worker_count);
        let (result_tx, result_rx) = mpsc::channel::<Outcome>(server_count);
        let work_rx = Arc::new(Mutex::new(work_rx));

        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for _ in 0..server_count {
                    let client = picker.pick();
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        res = work_tx.send(client) => {
                            if res.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        for _ in 0..worker_count {
            let this = self.clone();
            let cancel = cancel.clone();
            let work_rx = Arc::clone(&work_rx);
            let result_tx = result_tx.clone();
            let query = Arc::clone(&query);
            tokio::spawn(async move {
                loop {
                    let client = {
                        let mut rx = work_rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            client = rx.recv() => client,
                        }
                    };
                    let Some(client) = client else { return };
                    let outcome = this.process_client(&cancel, client, &query).await;
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        res = result_tx.send(outcome) => {
                            if res.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        result_rx
    }

    /// Per-client retry loop. Only transport errors are retried; a response
    /// with a failing rcode counts as a successful exchange here and is
    /// weighed by the aggregator instead.
    async fn process_client(
        &self,
        cancel: &CancellationToken,
        client: Arc<DnsClient>,
        query: &Message,
    ) -> Outcome {
        let start = SystemTime::now();
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Outcome {
                    client,
                    response: None,
                    start,
                    err: Some(anyhow!("dispatch cancelled")),
                };
            }
            match client.request(cancel, query).await {
                Ok(response) => {
                    return Outcome {
                        client,
                        response: Some(response),
                        start,
                        err: None,
                    };
                }
                Err(err) => {
                    attempt += 1;
                    if self.attempts != 0 && attempt >= self.attempts {
                        return Outcome {
                            client,
                            response: None,
                            start,
                            err: Some(err.context("attempt limit has been reached")),
                        };
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Outcome {
                                client,
                                response: None,
                                start,
                                err: Some(anyhow!("dispatch cancelled")),
                            };
                        }
                        _ = tokio::time::sleep(self.attempt_delay) => {}
                    }
                }
            }
        }
    }

    /// Consumes outcomes until the deadline fires, the caller cancels, or the
    /// stream closes, returning the best outcome seen.
    async fn collect(
        &self,
        cancel: &CancellationToken,
        deadline: tokio::time::Instant,
        results: &mut mpsc::Receiver<Outcome>,
    ) -> Option<Outcome> {
        let mut best: Option<Outcome> = None;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return best,
                _ = tokio::time::sleep_until(deadline) => return best,
                r = results.recv() => match r {
                    Some(outcome) => outcome,
                    None => return best,
                },
            };
            let errored = outcome.err.is_some();
            let rcode = outcome.response.as_ref().map(|m| m.response_code());
            if is_better(best.as_ref(), &outcome) {
                best = Some(outcome);
            }
            if errored {
                continue;
            }
            // first-response-wins: any error-free outcome ends the wait
            if self.race {
                return best;
            }
            if rcode != Some(ResponseCode::NoError) {
                continue;
            }
            return best;
        }
    }
}

/// Total order over outcomes, evaluated incrementally. An error-free outcome
/// is never displaced by an errored one; among error-free outcomes only a
/// clean success displaces the holder; among errored outcomes the first one
/// is retained.
fn is_better(current: Option<&Outcome>, candidate: &Outcome) -> bool {
    let Some(current) = current else { return true };
    if candidate.err.is_some() {
        return false;
    }
    if current.err.is_some() {
        return true;
    }
    let current_rcode = current.response.as_ref().map(|m| m.response_code());
    let candidate_rcode = candidate.response.as_ref().map(|m| m.response_code());
    candidate_rcode == Some(ResponseCode::NoError) && current_rcode != Some(ResponseCode::NoError)
}
