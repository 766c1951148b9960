//! DNS answer cache (spec.md §4.4).
//!
//! Caches whole-message DNS responses keyed on the first question's
//! `(Name, RecordType)`, using `hickory-proto`'s wire-format parser rather
//! than hand-rolling one (the corpus's own DNS client, `hickory-dns`,
//! is sampled in this pack for exactly this reason). A hit rewrites only
//! the two transaction-id bytes in the cached wire response; everything
//! else about the cached answer is returned untouched.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use parking_lot::Mutex;

type CacheKey = (Name, RecordType);

struct CacheEntry {
    response: Vec<u8>,
    expires_at: Instant,
}

/// A single-question DNS answer cache shared across flows.
///
/// Guarded by one `parking_lot::Mutex` rather than a sharded map: DNS lookup
/// traffic through a gateway is low enough volume that a sharded cache would
/// be premature, and `query`/`store` both need a single atomically-consistent
/// view (a hit that races a concurrent expiry-driven delete must see one or
/// the other, never a half-updated entry).
pub struct DnsCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry, ahash::RandomState>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::default()),
        }
    }

    /// Looks up a cached answer for the question carried in `query_bytes`
    /// (a raw DNS message as it arrived from TUN). Returns the cached wire
    /// response with its transaction id rewritten to match the query, or
    /// `None` on a miss, a malformed query, or an expired entry (which is
    /// evicted as a side effect).
    pub fn query(&self, query_bytes: &[u8]) -> Option<Vec<u8>> {
        let message = Message::from_vec(query_bytes).ok()?;
        let question = message.queries().first()?;
        let key = (question.name().clone(), question.query_type());

        let mut entries = self.entries.lock();
        let entry = entries.get(&key)?;
        if Instant::now() >= entry.expires_at {
            entries.remove(&key);
            return None;
        }

        let mut response = entry.response.clone();
        if response.len() >= 2 {
            response[0..2].copy_from_slice(&query_bytes[0..2]);
        }
        Some(response)
    }

    /// Records a successful DNS response for future [`DnsCache::query`]
    /// calls. Ignores malformed messages, non-`NOERROR` responses, and
    /// responses with no question or no answer — none of those are
    /// servable as a future cache hit. The expiry is taken from the first
    /// answer's TTL; a later `store` for the same question overwrites an
    /// earlier one outright.
    pub fn store(&self, response_bytes: &[u8]) {
        let Ok(message) = Message::from_vec(response_bytes) else {
            return;
        };
        if message.response_code() != ResponseCode::NoError {
            return;
        }
        let Some(question) = message.queries().first() else {
            return;
        };
        let Some(first_answer) = message.answers().first() else {
            return;
        };

        let key = (question.name().clone(), question.query_type());
        let expires_at = Instant::now() + Duration::from_secs(u64::from(first_answer.ttl()));

        self.entries.lock().insert(
            key,
            CacheEntry {
                response: response_bytes.to_vec(),
                expires_at,
            },
        );
    }

    /// Number of cached answers, expired or not.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}
