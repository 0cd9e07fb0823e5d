//! Change Sequence Numbers
//!
//! A CSN is the logical clock value stamped on every replicated change:
//! `(timestamp, sequence number, replica id)`. CSNs are totally ordered by
//! timestamp first, then sequence number, then replica id.
//!
//! Text form is 28 hex digits: `tttttttttttttttt` `rrrr` `ssssssss`.

use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Length of the binary key form
pub const CSN_KEY_LEN: usize = 16;

/// Change Sequence Number
///
/// Field order matters: the derived `Ord` compares timestamp, then sequence
/// number, then replica id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Csn {
    /// Wall clock milliseconds since the UNIX epoch
    pub timestamp: u64,
    /// Disambiguates changes issued within the same millisecond
    pub seq: u32,
    /// Replica (server id) that issued the change
    pub replica_id: i32,
}

impl Csn {
    /// Create a CSN from its components
    pub const fn new(timestamp: u64, seq: u32, replica_id: i32) -> Self {
        Self {
            timestamp,
            seq,
            replica_id,
        }
    }

    /// Smallest CSN a replica can ever issue
    pub const fn min_for(replica_id: i32) -> Self {
        Self::new(0, 0, replica_id)
    }

    /// Whether this CSN is strictly newer than `other`
    pub fn is_newer_than(&self, other: &Csn) -> bool {
        self > other
    }

    /// Order-preserving binary form used as a storage key suffix
    ///
    /// Big-endian timestamp, sequence number and sign-flipped replica id, so
    /// byte-wise comparison matches `Ord`.
    pub fn to_key(&self) -> [u8; CSN_KEY_LEN] {
        let mut key = [0u8; CSN_KEY_LEN];
        key[..8].copy_from_slice(&self.timestamp.to_be_bytes());
        key[8..12].copy_from_slice(&self.seq.to_be_bytes());
        key[12..].copy_from_slice(&flip_sign(self.replica_id).to_be_bytes());
        key
    }

    /// Parse the binary key form
    pub fn from_key(key: &[u8]) -> Result<Self> {
        if key.len() != CSN_KEY_LEN {
            return Err(Error::codec(format!(
                "CSN key must be {} bytes, got {}",
                CSN_KEY_LEN,
                key.len()
            )));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&key[..8]);
        let mut seq = [0u8; 4];
        seq.copy_from_slice(&key[8..12]);
        let mut rid = [0u8; 4];
        rid.copy_from_slice(&key[12..]);
        Ok(Self {
            timestamp: u64::from_be_bytes(ts),
            seq: u32::from_be_bytes(seq),
            replica_id: unflip_sign(u32::from_be_bytes(rid)),
        })
    }
}

/// Map i32 onto u32 so that unsigned big-endian order matches signed order
pub(crate) fn flip_sign(value: i32) -> u32 {
    (value as u32) ^ 0x8000_0000
}

pub(crate) fn unflip_sign(value: u32) -> i32 {
    (value ^ 0x8000_0000) as i32
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:08x}",
            self.timestamp, self.replica_id as u16, self.seq
        )
    }
}

impl FromStr for Csn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 28 || !s.is_ascii() {
            return Err(Error::codec(format!("Invalid CSN string: {:?}", s)));
        }
        let bad = |_| Error::codec(format!("Invalid CSN string: {:?}", s));
        let timestamp = u64::from_str_radix(&s[..16], 16).map_err(bad)?;
        let replica_id = u16::from_str_radix(&s[16..20], 16).map_err(bad)? as i16 as i32;
        let seq = u32::from_str_radix(&s[20..], 16).map_err(bad)?;
        Ok(Self {
            timestamp,
            seq,
            replica_id,
        })
    }
}

/// Clock source in milliseconds
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Current wall clock in milliseconds since the UNIX epoch
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_timestamp: u64,
    last_seq: u32,
}

/// Per-replica CSN generator
///
/// Safe to call from many writer tasks at once. Never returns a CSN less than
/// or equal to one it returned before.
pub struct CsnGenerator {
    replica_id: i32,
    state: Mutex<GeneratorState>,
    clock: Clock,
}

impl CsnGenerator {
    /// Create a generator backed by the wall clock
    pub fn new(replica_id: i32) -> Self {
        Self::with_clock(replica_id, Arc::new(current_time_ms))
    }

    /// Create a generator with an injected clock
    pub fn with_clock(replica_id: i32, clock: Clock) -> Self {
        Self {
            replica_id,
            state: Mutex::new(GeneratorState::default()),
            clock,
        }
    }

    /// Replica id stamped on every CSN
    pub fn replica_id(&self) -> i32 {
        self.replica_id
    }

    /// Issue a fresh CSN
    pub fn new_csn(&self) -> Csn {
        let mut state = self.state.lock();
        loop {
            let now = (self.clock)();
            if now > state.last_timestamp {
                state.last_timestamp = now;
                state.last_seq = 0;
                break;
            }
            if state.last_seq < u32::MAX {
                state.last_seq += 1;
                break;
            }
            // Sequence space for this millisecond is exhausted.
            std::thread::sleep(Duration::from_millis(1));
        }
        Csn::new(state.last_timestamp, state.last_seq, self.replica_id)
    }

    /// Move past a CSN observed from another replica
    ///
    /// Local changes issued afterwards sort after the observed one.
    pub fn adjust(&self, observed: &Csn) {
        let mut state = self.state.lock();
        if observed.timestamp > state.last_timestamp {
            state.last_timestamp = observed.timestamp;
            state.last_seq = observed.seq;
        } else if observed.timestamp == state.last_timestamp && observed.seq > state.last_seq {
            state.last_seq = observed.seq;
        }
    }
}

impl fmt::Debug for CsnGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsnGenerator")
            .field("replica_id", &self.replica_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_ordering_by_fields() {
        let a = Csn::new(100, 0, 9);
        let b = Csn::new(100, 1, 1);
        let c = Csn::new(101, 0, 1);
        assert!(a < b);
        assert!(b < c);
        assert!(Csn::new(100, 0, 1) < Csn::new(100, 0, 2));
    }

    #[test]
    fn test_string_form_round_trip() {
        let csn = Csn::new(0x0000_0190_1234_5678, 42, 3);
        let text = csn.to_string();
        assert_eq!(text.len(), 28);
        assert_eq!(text, "000001901234567800030000002a");
        assert_eq!(text.parse::<Csn>().unwrap(), csn);
        assert!("zz".parse::<Csn>().is_err());
    }

    #[test]
    fn test_string_form_covers_every_valid_server_id() {
        for replica_id in [1, 0x7F, 0x80, 0xFF, 0x1000, crate::config::MAX_SERVER_ID] {
            let csn = Csn::new(77, 1, replica_id);
            assert_eq!(csn.to_string().parse::<Csn>().unwrap(), csn);
        }
    }

    #[test]
    fn test_key_round_trip_negative_replica() {
        let csn = Csn::new(5, 6, -3);
        assert_eq!(Csn::from_key(&csn.to_key()).unwrap(), csn);
        assert!(Csn::from_key(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_generator_stalled_clock_bumps_sequence() {
        let generator = CsnGenerator::with_clock(1, Arc::new(|| 1_000));
        let first = generator.new_csn();
        let second = generator.new_csn();
        let third = generator.new_csn();
        assert_eq!(first, Csn::new(1_000, 0, 1));
        assert_eq!(second, Csn::new(1_000, 1, 1));
        assert!(third > second);
    }

    #[test]
    fn test_generator_resets_sequence_when_clock_advances() {
        let now = Arc::new(AtomicU64::new(10));
        let clock_now = now.clone();
        let generator = CsnGenerator::with_clock(4, Arc::new(move || clock_now.load(Ordering::SeqCst)));
        generator.new_csn();
        generator.new_csn();
        now.store(11, Ordering::SeqCst);
        assert_eq!(generator.new_csn(), Csn::new(11, 0, 4));
    }

    #[test]
    fn test_generator_clock_going_backwards() {
        let now = Arc::new(AtomicU64::new(500));
        let clock_now = now.clone();
        let generator = CsnGenerator::with_clock(2, Arc::new(move || clock_now.load(Ordering::SeqCst)));
        let before = generator.new_csn();
        now.store(100, Ordering::SeqCst);
        let after = generator.new_csn();
        assert!(after > before);
    }

    #[test]
    fn test_generator_adjust_after_remote_csn() {
        let generator = CsnGenerator::with_clock(1, Arc::new(|| 50));
        generator.adjust(&Csn::new(900, 7, 2));
        let next = generator.new_csn();
        assert!(next > Csn::new(900, 7, 2));
        assert_eq!(next.replica_id, 1);
    }

    #[test]
    fn test_generator_concurrent_callers_unique_and_monotonic() {
        let generator = Arc::new(CsnGenerator::with_clock(7, Arc::new(|| 42)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    let mut out = Vec::with_capacity(1000);
                    for _ in 0..1000 {
                        out.push(generator.new_csn());
                    }
                    out
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            let csns = handle.join().unwrap();
            // Each caller sees strictly increasing values
            for pair in csns.windows(2) {
                assert!(pair[1] > pair[0]);
            }
            for csn in csns {
                assert!(all.insert(csn), "duplicate CSN {}", csn);
            }
        }
        assert_eq!(all.len(), 8000);
    }

    proptest! {
        #[test]
        fn prop_key_order_matches_csn_order(
            a in (any::<u64>(), any::<u32>(), any::<i32>()),
            b in (any::<u64>(), any::<u32>(), any::<i32>()),
        ) {
            let x = Csn::new(a.0, a.1, a.2);
            let y = Csn::new(b.0, b.1, b.2);
            prop_assert_eq!(x.cmp(&y), x.to_key().cmp(&y.to_key()));
        }

        #[test]
        fn prop_generator_strictly_increasing(ticks in proptest::collection::vec(0u64..5, 1..200)) {
            let now = Arc::new(AtomicU64::new(1));
            let clock_now = now.clone();
            let generator = CsnGenerator::with_clock(3, Arc::new(move || clock_now.load(Ordering::SeqCst)));
            let mut last = generator.new_csn();
            for tick in ticks {
                now.fetch_add(tick, Ordering::SeqCst);
                let next = generator.new_csn();
                prop_assert!(next > last);
                last = next;
            }
        }
    }
}
