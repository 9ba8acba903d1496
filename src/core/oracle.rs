//! External advisory oracle (component C5, Layer C): verification of
//! ambiguous candidates under throttling, a persistent cache, and
//! resumable runs. The oracle is advisory only -- its verdict never
//! authorizes injection by itself (spec.md §4.5).

use crate::core::broker::DbBroker;
use crate::core::error::IbpError;
use crate::core::manifest::sha256_hex;
use crate::core::time;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OracleReason {
    Title,
    Metadata,
    Footnote,
    Pagehead,
    BodyLine,
}

/// Strict verdict JSON shape (spec.md §4.5, §6.6). Every field is
/// mandatory; a reply missing or nulling any of them is a protocol
/// failure, not a partially-usable result (no `Option` fields here by
/// design -- see spec.md Data Model's "nullable fields forbidden").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleResult {
    pub is_heading: bool,
    pub level: u8,
    pub normalized_title: String,
    pub confidence: f64,
    pub reason: OracleReason,
}

impl OracleResult {
    fn validate(&self) -> Result<(), IbpError> {
        if !(self.level == 2 || self.level == 3) {
            return Err(IbpError::OracleProtocolError(format!(
                "level must be 2 or 3, got {}",
                self.level
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(IbpError::OracleProtocolError(format!(
                "confidence out of [0,1]: {}",
                self.confidence
            )));
        }
        if self.normalized_title.trim().is_empty() {
            return Err(IbpError::OracleProtocolError(
                "normalized_title is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the oracle is asked about one candidate.
#[derive(Debug, Clone, Serialize)]
pub struct OracleRequest {
    pub candidate_id: String,
    pub text: String,
    pub html_excerpt: String,
    pub context_before: String,
    pub context_after: String,
}

/// Abstracts the actual network call so the throttle/cache/backoff logic
/// is fully testable without a live oracle endpoint. The production
/// implementation (`HttpOracleClient`) uses `reqwest`'s blocking client;
/// tests substitute a scripted fake.
pub trait OracleClient {
    fn model_id(&self) -> &str;
    fn call(&self, request: &OracleRequest) -> Result<OracleResult, IbpError>;
}

/// Production oracle client: calls the external advisory service over
/// HTTPS with a fixed prompt template, expecting strict JSON back
/// (spec.md §6.6). `reqwest` blocking is the one dependency this crate
/// adds beyond the teacher's stack -- see DESIGN.md.
pub struct HttpOracleClient {
    pub endpoint: String,
    pub api_key: String,
    pub model_id: String,
    pub timeout: Duration,
}

/// The fixed prompt template hashed into the cache key (spec.md §4.5).
/// Changing this string invalidates every existing cache entry.
pub const PROMPT_TEMPLATE: &str = "ibp-heading-verdict-v1";

impl OracleClient for HttpOracleClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn call(&self, request: &OracleRequest) -> Result<OracleResult, IbpError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(IbpError::OracleTransport)?;

        let body = serde_json::json!({
            "model": self.model_id,
            "prompt_template": PROMPT_TEMPLATE,
            "candidate_id": request.candidate_id,
            "text": request.text,
            "html_excerpt": request.html_excerpt,
            "context_before": request.context_before,
            "context_after": request.context_after,
        });

        let resp = client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(IbpError::OracleTransport)?;

        if !resp.status().is_success() {
            return Err(IbpError::OracleTransientError(format!(
                "oracle returned HTTP {}",
                resp.status()
            )));
        }

        let result: OracleResult = resp
            .json()
            .map_err(|e| IbpError::OracleProtocolError(format!("malformed JSON: {}", e)))?;
        result.validate()?;
        Ok(result)
    }
}

/// `cache_key = (candidate_id, model_id, sha256(prompt_template || candidate_payload))`.
pub fn cache_key(candidate_id: &str, model_id: &str, request: &OracleRequest) -> (String, String, String) {
    let payload = format!(
        "{}\u{1}{}\u{1}{}\u{1}{}",
        request.text, request.html_excerpt, request.context_before, request.context_after
    );
    let prompt_hash = sha256_hex(format!("{}\u{1}{}", PROMPT_TEMPLATE, payload).as_bytes());
    (candidate_id.to_string(), model_id.to_string(), prompt_hash)
}

/// Token-bucket throttle: blocks callers until a token is available,
/// refilling at a configured rate. A `Mutex<TokenBucketState>` behind an
/// `Arc`, not an async runtime -- consistent with spec.md §5's
/// "cooperative, mostly single-threaded" model (see DESIGN.md A.6).
pub struct TokenBucket {
    state: Mutex<TokenBucketState>,
    capacity: f64,
    refill_per_sec: f64,
}

struct TokenBucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_per_sec,
        }
    }

    /// Blocks the calling thread until one token is available, then
    /// consumes it.
    pub fn acquire(&self) {
        loop {
            let wait = {
                let mut s = self.state.lock().expect("token bucket lock poisoned");
                let elapsed = s.last_refill.elapsed().as_secs_f64();
                s.tokens = (s.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                s.last_refill = Instant::now();
                if s.tokens >= 1.0 {
                    s.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - s.tokens;
                    Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => thread::sleep(d),
            }
        }
    }
}

/// Exponential backoff with jitter: base 2, capped, up to a configured
/// attempt count (spec.md §4.5).
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            cap: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry attempt `attempt` (1-indexed), including jitter
    /// in `[0, delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.min(16));
        let raw = self.base_delay.saturating_mul(exp).min(self.cap);
        let jitter_frac: f64 = rand::random::<f64>();
        Duration::from_secs_f64(raw.as_secs_f64() * jitter_frac)
    }
}

/// Verifier: owns the cache, throttle, and backoff policy for one run.
/// `--dry-run` disables Layer C entirely (spec.md §6.2): every `unknown`
/// candidate short-circuits straight to an oracle-free `unknown` result
/// with no cache writes.
pub struct OracleVerifier<C: OracleClient> {
    client: Option<C>,
    bucket: Arc<TokenBucket>,
    backoff: BackoffPolicy,
    cache_db_path: std::path::PathBuf,
    broker: DbBroker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleOutcome {
    pub candidate_id: String,
    pub result: Option<OracleResult>,
    pub from_cache: bool,
    pub oracle_error: bool,
}

impl<C: OracleClient> OracleVerifier<C> {
    pub fn new(root: &Path, client: Option<C>, bucket: Arc<TokenBucket>, backoff: BackoffPolicy) -> Self {
        Self {
            client,
            bucket,
            backoff,
            cache_db_path: crate::core::db::oracle_db_path(root),
            broker: DbBroker::new(root),
        }
    }

    /// Verifies one candidate. Cache hits bypass the oracle entirely.
    /// On exhausted retries the candidate is marked `oracle_error` and
    /// left `unknown` (never fatal, spec.md §7).
    pub fn verify(&self, request: &OracleRequest) -> Result<OracleOutcome, IbpError> {
        let Some(client) = &self.client else {
            return Ok(OracleOutcome {
                candidate_id: request.candidate_id.clone(),
                result: None,
                from_cache: false,
                oracle_error: false,
            });
        };

        let (candidate_id, model_id, prompt_hash) = cache_key(&request.candidate_id, client.model_id(), request);

        if let Some(cached) = self.read_cache(&candidate_id, &model_id, &prompt_hash)? {
            return Ok(OracleOutcome {
                candidate_id,
                result: Some(cached),
                from_cache: true,
                oracle_error: false,
            });
        }

        let mut last_err: Option<IbpError> = None;
        for attempt in 1..=self.backoff.max_attempts {
            self.bucket.acquire();
            match client.call(request) {
                Ok(result) => {
                    self.write_cache(&candidate_id, &model_id, &prompt_hash, &result)?;
                    return Ok(OracleOutcome {
                        candidate_id,
                        result: Some(result),
                        from_cache: false,
                        oracle_error: false,
                    });
                }
                Err(e @ IbpError::OracleProtocolError(_)) | Err(e @ IbpError::OracleTransientError(_)) => {
                    last_err = Some(e);
                    if attempt < self.backoff.max_attempts {
                        thread::sleep(self.backoff.delay_for(attempt));
                    }
                }
                Err(other) => return Err(other),
            }
        }

        let _ = last_err;
        Ok(OracleOutcome {
            candidate_id,
            result: None,
            from_cache: false,
            oracle_error: true,
        })
    }

    fn read_cache(&self, candidate_id: &str, model_id: &str, prompt_hash: &str) -> Result<Option<OracleResult>, IbpError> {
        let path = self.cache_db_path.clone();
        self.broker.with_conn(&path, "oracle", None, "oracle.cache.read", |conn| {
            let row: Option<(bool, u8, String, f64, String)> = conn
                .query_row(
                    "SELECT is_heading, level, normalized_title, confidence, reason
                     FROM oracle_cache WHERE candidate_id = ?1 AND model_id = ?2 AND prompt_hash = ?3",
                    params![candidate_id, model_id, prompt_hash],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
                )
                .optional()?;
            Ok(row.map(|(is_heading, level, normalized_title, confidence, reason)| OracleResult {
                is_heading,
                level,
                normalized_title,
                confidence,
                reason: parse_reason(&reason),
            }))
        })
    }

    /// Atomically records a verdict (single INSERT under the broker's
    /// serialized connection -- "in-flight records written atomically"
    /// per spec.md §4.5 is satisfied by the broker's single-writer lock
    /// plus SQLite's own durability, rather than a separate temp+rename
    /// step needed for flat-file artifacts).
    fn write_cache(&self, candidate_id: &str, model_id: &str, prompt_hash: &str, result: &OracleResult) -> Result<(), IbpError> {
        let path = self.cache_db_path.clone();
        self.broker.with_conn(&path, "oracle", None, "oracle.cache.write", |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO oracle_cache
                 (candidate_id, model_id, prompt_hash, is_heading, level, normalized_title, confidence, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    candidate_id,
                    model_id,
                    prompt_hash,
                    result.is_heading,
                    result.level,
                    result.normalized_title,
                    result.confidence,
                    reason_str(result.reason),
                    time::now_epoch_z(),
                ],
            )?;
            Ok(())
        })
    }
}

fn reason_str(r: OracleReason) -> &'static str {
    match r {
        OracleReason::Title => "title",
        OracleReason::Metadata => "metadata",
        OracleReason::Footnote => "footnote",
        OracleReason::Pagehead => "pagehead",
        OracleReason::BodyLine => "body_line",
    }
}

fn parse_reason(s: &str) -> OracleReason {
    match s {
        "title" => OracleReason::Title,
        "metadata" => OracleReason::Metadata,
        "footnote" => OracleReason::Footnote,
        "pagehead" => OracleReason::Pagehead,
        _ => OracleReason::BodyLine,
    }
}
