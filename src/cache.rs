use std::time::Duration;

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{DNSClass, RecordType};
use moka::sync::Cache;
use tokio::time::Instant;

use crate::proto_utils;

/// Identity of a question for caching purposes: lowercased qname plus
/// query type and class. Two requests with equal fingerprints are
/// interchangeable.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Fingerprint {
    name: String,
    qtype: RecordType,
    qclass: DNSClass,
}

impl Fingerprint {
    pub fn of(msg: &Message) -> Option<Self> {
        let question = msg.queries().first()?;
        Some(Self {
            name: question.name().to_string().to_ascii_lowercase(),
            qtype: question.query_type(),
            qclass: question.query_class(),
        })
    }
}

#[derive(Clone)]
struct CacheEntry {
    response: Message,
    stored_at: Instant,
    expires_at: Instant,
}

/// Response cache keyed by question fingerprint. Entry deadlines are
/// derived from answer TTLs and checked on read; moka only bounds the
/// entry count.
pub struct DnsCache {
    entries: Cache<Fingerprint, CacheEntry>,
    min_ttl: Duration,
    max_ttl: Duration,
    negative_ttl: Duration,
}

impl DnsCache {
    pub fn new(capacity: u64, min_ttl: Duration, max_ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            entries: Cache::builder().max_capacity(capacity).build(),
            min_ttl,
            max_ttl,
            negative_ttl,
        }
    }

    /// Cached response for `request`, with answer TTLs decreased by the
    /// time the entry has spent in the cache. Expired entries are
    /// dropped on read.
    pub fn get(&self, request: &Message) -> Option<Message> {
        let key = Fingerprint::of(request)?;
        let entry = self.entries.get(&key)?;
        let now = Instant::now();
        if now >= entry.expires_at {
            self.entries.invalidate(&key);
            return None;
        }
        let mut response = entry.response.clone();
        let elapsed = now.duration_since(entry.stored_at).as_secs() as u32;
        proto_utils::decrement_ttls(&mut response, elapsed);
        Some(response)
    }

    /// Store `response` for `request`. The deadline is the minimum
    /// answer TTL clamped to the configured window; negative responses
    /// (no answers, or rcode other than NOERROR) use the negative TTL,
    /// with zero disabling negative storage. An absent response is a
    /// no-op.
    pub fn set(&self, request: &Message, response: Option<&Message>) {
        let Some(response) = response else { return };
        let Some(key) = Fingerprint::of(request) else {
            return;
        };

        let negative =
            response.answers().is_empty() || response.response_code() != ResponseCode::NoError;
        let ttl = if negative {
            if self.negative_ttl.is_zero() {
                return;
            }
            self.negative_ttl
        } else {
            let answer_ttl = proto_utils::min_answer_ttl(response).unwrap_or(0);
            Duration::from_secs(u64::from(answer_ttl)).clamp(self.min_ttl, self.max_ttl)
        };

        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                response: response.clone(),
                stored_at: now,
                expires_at: now + ttl,
            },
        );
    }
}
