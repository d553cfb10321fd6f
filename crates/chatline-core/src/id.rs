//! Time-Sorted Message Identifiers
//!
//! Message ids are 64-bit integers laid out like a TSID:
//!
//! ```text
//!  63                    22 21        12 11          0
//! ┌────────────────────────┬────────────┬─────────────┐
//! │ millis since EPOCH_MS  │  node (10) │ counter (12)│
//! └────────────────────────┴────────────┴─────────────┘
//! ```
//!
//! - Ordering by id equals ordering by generation time, so the id doubles as the
//!   primary key and as the "created before/after" proxy.
//! - The node discriminator keeps ids unique across processes without any
//!   coordination. It is fixed when the generator is built.
//! - The textual form is 13 Crockford base32 characters, which sort the same way
//!   as the numeric value.
//!
//! Within one generator ids are strictly increasing. When the 12-bit counter is
//! exhausted inside a single millisecond the generator moves on to the next
//! millisecond instead of wrapping, and a clock that steps backwards is ignored
//! (the last issued millisecond keeps being used).

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IdError;

/// Bits reserved for the node discriminator (1024 nodes)
pub const NODE_BITS: u32 = 10;
/// Bits reserved for the per-millisecond counter
pub const COUNTER_BITS: u32 = 12;
/// Largest valid node id
pub const MAX_NODE: u16 = (1 << NODE_BITS) - 1;
/// Custom epoch: 2020-01-01T00:00:00Z
pub const EPOCH_MS: u64 = 1_577_836_800_000;

const TIMESTAMP_SHIFT: u32 = NODE_BITS + COUNTER_BITS;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// `last` before the first id; an all-ones id is out of reach before 2159
const UNUSED: u64 = u64::MAX;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ENCODED_LEN: usize = 13;

/// Globally unique, time-sortable message identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(u64);

impl MessageId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Signed view used as the `BIGINT` primary key.
    ///
    /// The timestamp field leaves the top bit clear for the next ~69 years, so
    /// the cast is lossless and preserves ordering.
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub const fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }

    /// Milliseconds since the Unix epoch at which this id was generated
    pub fn timestamp_ms(self) -> u64 {
        (self.0 >> TIMESTAMP_SHIFT) + EPOCH_MS
    }

    pub fn timestamp(self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp_ms() as i64)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn node(self) -> u16 {
        ((self.0 >> COUNTER_BITS) & NODE_MASK) as u16
    }

    pub fn counter(self) -> u16 {
        (self.0 & COUNTER_MASK) as u16
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; ENCODED_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = 60 - 5 * i as u32;
            *slot = ALPHABET[((self.0 >> shift) & 0x1F) as usize];
        }
        // ALPHABET is ASCII
        f.write_str(std::str::from_utf8(&out).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

impl FromStr for MessageId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ENCODED_LEN {
            return Err(IdError::InvalidFormat(s.to_string()));
        }

        let mut value: u64 = 0;
        for (i, ch) in s.bytes().enumerate() {
            let digit = decode_char(ch).ok_or_else(|| IdError::InvalidFormat(s.to_string()))?;
            // First character only carries the top 4 bits
            if i == 0 && digit > 0x0F {
                return Err(IdError::InvalidFormat(s.to_string()));
            }
            value = (value << 5) | digit as u64;
        }
        Ok(Self(value))
    }
}

fn decode_char(ch: u8) -> Option<u8> {
    let upper = ch.to_ascii_uppercase();
    ALPHABET.iter().position(|&c| c == upper).map(|p| p as u8)
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Lock-free id generator
///
/// Safe to share between threads and tasks; `next_id` never blocks and never
/// fails.
pub struct IdGenerator {
    node: u64,
    /// Last issued id (raw)
    last: AtomicU64,
}

static GLOBAL: OnceLock<IdGenerator> = OnceLock::new();

impl IdGenerator {
    pub fn new(node: u16) -> Result<Self, IdError> {
        if node > MAX_NODE {
            return Err(IdError::NodeOutOfRange {
                node,
                max: MAX_NODE,
            });
        }
        Ok(Self {
            node: node as u64,
            last: AtomicU64::new(UNUSED),
        })
    }

    /// Configure the process-wide generator. Only the first call succeeds.
    pub fn init_global(node: u16) -> Result<&'static IdGenerator, IdError> {
        let generator = IdGenerator::new(node)?;
        GLOBAL
            .set(generator)
            .map_err(|_| IdError::AlreadyInitialized)?;
        Ok(Self::global())
    }

    /// Process-wide generator, node 0 unless `init_global` ran first
    pub fn global() -> &'static IdGenerator {
        GLOBAL.get_or_init(|| IdGenerator {
            node: 0,
            last: AtomicU64::new(UNUSED),
        })
    }

    pub fn node(&self) -> u16 {
        self.node as u16
    }

    pub fn next_id(&self) -> MessageId {
        let now = (Utc::now().timestamp_millis() as u64).saturating_sub(EPOCH_MS);
        self.next_at(now)
    }

    fn next_at(&self, now: u64) -> MessageId {
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let last_time = last >> TIMESTAMP_SHIFT;
            let last_counter = last & COUNTER_MASK;

            let (time, counter) = if last == UNUSED || now > last_time {
                (now, 0)
            } else if last_counter < COUNTER_MASK {
                (last_time, last_counter + 1)
            } else {
                (last_time + 1, 0)
            };

            let next = (time << TIMESTAMP_SHIFT) | (self.node << COUNTER_BITS) | counter;
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return MessageId(next),
                Err(actual) => last = actual,
            }
        }
    }
}
