//! Captured webhook deliveries and their identifiers.
//!
//! Every delivery becomes one immutable [`CapturedEvent`].  Its [`EventId`]
//! is a UUIDv7 whose text form sorts in creation order, which makes it
//! usable as a pagination cursor.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest sequence value that fits below the UUID variant bits.
const SEQ_MAX: u64 = (1 << 62) - 1;

/// Sortable unique identifier of a captured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Milliseconds since the Unix epoch encoded in the id.
    fn millis(&self) -> u64 {
        let b = self.0.as_bytes();
        u64::from_be_bytes([0, 0, b[0], b[1], b[2], b[3], b[4], b[5]])
    }

    /// The 62-bit sequence stored in the low bytes.
    fn sequence(&self) -> u64 {
        let b = self.0.as_bytes();
        let mut low = [0u8; 8];
        low.copy_from_slice(&b[8..16]);
        u64::from_be_bytes(low) & SEQ_MAX
    }

    /// Whether the 12 bits following the version nibble are zero, as they
    /// are for every id produced by [`IdGenerator`].
    fn has_plain_rand_a(&self) -> bool {
        let b = self.0.as_bytes();
        b[6] & 0x0F == 0 && b[7] == 0
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        EventId(uuid)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Lowercase hyphenated text keeps lexical order equal to numeric order.
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Error returned when a string is not a valid event id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid event id: {0:?}")]
pub struct InvalidEventId(pub String);

impl FromStr for EventId {
    type Err = InvalidEventId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::try_parse(s.trim())
            .map(EventId)
            .map_err(|_| InvalidEventId(s.to_string()))
    }
}

/// Strictly monotonic UUIDv7 generator.
///
/// Layout: 48-bit millisecond timestamp, version nibble, 12 zero bits,
/// variant bits, 62-bit sequence.  A new millisecond restarts the sequence
/// at a random 32-bit value; a frozen or regressing clock keeps the last
/// timestamp and increments the sequence instead.
#[derive(Debug, Default)]
pub struct IdGenerator {
    state: Mutex<GeneratorState>,
}

#[derive(Debug, Default, Clone, Copy)]
struct GeneratorState {
    millis: u64,
    seq: u64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id based on the current wall clock.
    pub fn next_id(&self) -> EventId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.next_at(now)
    }

    /// Next id for an explicit clock reading.
    pub fn next_at(&self, now_millis: u64) -> EventId {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if now_millis > state.millis {
            state.millis = now_millis;
            state.seq = fresh_sequence();
        } else if state.seq >= SEQ_MAX {
            state.millis += 1;
            state.seq = 0;
        } else {
            state.seq += 1;
        }
        encode(state.millis, state.seq)
    }

    /// Raise the floor so every later id sorts after `id`.
    pub fn observe(&self, id: &EventId) {
        let (millis, seq) = if id.has_plain_rand_a() {
            (id.millis(), id.sequence())
        } else {
            // Foreign v7 layout: the next millisecond is always greater.
            (id.millis() + 1, 0)
        };

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if (millis, seq) > (state.millis, state.seq) {
            state.millis = millis;
            state.seq = seq;
        }
    }
}

fn fresh_sequence() -> u64 {
    let random = Uuid::new_v4();
    let b = random.as_bytes();
    u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64
}

fn encode(millis: u64, seq: u64) -> EventId {
    let mut tail = [0u8; 10];
    tail[2..].copy_from_slice(&seq.to_be_bytes());
    EventId(uuid::Builder::from_unix_timestamp_millis(millis, &tail).into_uuid())
}

/// One immutable record of an inbound webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedEvent {
    pub id: EventId,
    pub method: String,
    pub path: String,
    pub source_ip: String,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub query_params: BTreeMap<String, String>,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Compact listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub id: EventId,
    pub method: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

impl From<&CapturedEvent> for EventSummary {
    fn from(e: &CapturedEvent) -> Self {
        EventSummary {
            id: e.id,
            method: e.method.clone(),
            path: e.path.clone(),
            created_at: e.created_at,
        }
    }
}

/// A delivery about to be stored.  `id` and `created_at` are assigned by
/// the store when absent.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub id: Option<EventId>,
    pub method: String,
    pub path: String,
    pub source_ip: String,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub query_params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewEvent {
    pub fn new(method: &str, path: &str, body: impl Into<String>) -> Self {
        NewEvent {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            status_code: 200,
            body: body.into(),
            ..Default::default()
        }
    }

    /// Add a header under its lowercase name.  Repeated headers are
    /// joined with `", "`.
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers
            .entry(name.to_ascii_lowercase())
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_increase_with_frozen_clock() {
        let gen = IdGenerator::new();
        let a = gen.next_at(1_700_000_000_000);
        let b = gen.next_at(1_700_000_000_000);
        let c = gen.next_at(1_700_000_000_000);
        assert!(a < b && b < c);
        assert!(a.to_string() < b.to_string());
        assert!(b.to_string() < c.to_string());
    }

    #[test]
    fn test_ids_increase_when_clock_regresses() {
        let gen = IdGenerator::new();
        let a = gen.next_at(1_700_000_000_500);
        let b = gen.next_at(1_700_000_000_000);
        assert!(b > a);
        assert_eq!(b.millis(), a.millis());
    }

    #[test]
    fn test_observe_raises_floor() {
        let first = IdGenerator::new();
        let seen = first.next_at(1_800_000_000_000);

        let second = IdGenerator::new();
        second.observe(&seen);
        let next = second.next_at(1_700_000_000_000);
        assert!(next > seen);
    }

    #[test]
    fn test_observe_foreign_uuid() {
        let foreign = EventId::from(Uuid::now_v7());
        let gen = IdGenerator::new();
        gen.observe(&foreign);
        assert!(gen.next_at(0) > foreign);
    }

    #[test]
    fn test_id_text_roundtrip() {
        let id = IdGenerator::new().next_id();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.as_uuid().get_version_num(), 7);
        assert!("not-an-id".parse::<EventId>().is_err());
    }

    #[test]
    fn test_headers_lowercased_and_joined() {
        let mut e = NewEvent::new("post", "/stripe", "{}");
        e.add_header("Content-Type", "application/json");
        e.add_header("X-Trace", "a");
        e.add_header("x-trace", "b");
        assert_eq!(e.method, "POST");
        assert_eq!(e.headers["content-type"], "application/json");
        assert_eq!(e.headers["x-trace"], "a, b");
    }
}
