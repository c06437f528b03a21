use crate::record::RecordKey;
use chrono::Utc;
use dyn_clone::DynClone;
use log::trace;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of UTC wall-clock milliseconds.
pub trait Clock: DynClone + Debug + Send + Sync {
    fn now_millis(&self) -> i64;
}

dyn_clone::clone_trait_object!(Clock);

#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(millis: i64) -> Self {
        ManualClock {
            millis: Arc::new(AtomicI64::new(millis)),
        }
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Hands out strictly increasing record keys.
///
/// The clock is sampled a bounded number of times looking for a millisecond later than the
/// last key. If it does not advance (same millisecond, or the clock went backwards) the key
/// falls back to the last millisecond with the next sequence number.
#[derive(Clone, Debug)]
pub struct KeyGenerator {
    clock: Box<dyn Clock>,
    sample_attempts: u32,
    last: Option<RecordKey>,
}

impl KeyGenerator {
    pub fn new(clock: Box<dyn Clock>, sample_attempts: u32) -> Self {
        KeyGenerator {
            clock,
            sample_attempts: sample_attempts.max(1),
            last: None,
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Make sure every future key is greater than `key`.
    pub fn observe(&mut self, key: RecordKey) {
        if self.last.map_or(true, |last| key > last) {
            self.last = Some(key);
        }
    }

    pub fn next_key(&mut self) -> RecordKey {
        let key = match self.last {
            None => RecordKey::first_at(self.clock.now_millis()),
            Some(last) => self.after(last),
        };
        self.last = Some(key);
        key
    }

    fn after(&self, last: RecordKey) -> RecordKey {
        for _ in 0..self.sample_attempts {
            let now = self.clock.now_millis();
            if now > last.millis {
                return RecordKey::first_at(now);
            }
            std::hint::spin_loop();
        }
        trace!("clock did not advance past {last}, using composite key");
        match last.seq.checked_add(1) {
            Some(seq) => RecordKey::new(last.millis, seq),
            None => RecordKey::first_at(last.millis + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_the_clock() {
        let clock = ManualClock::new(1_000);
        let mut keys = KeyGenerator::new(Box::new(clock.clone()), 4);
        assert_eq!(keys.next_key(), RecordKey::new(1_000, 0));
        clock.advance(5);
        assert_eq!(keys.next_key(), RecordKey::new(1_005, 0));
    }

    #[test]
    fn same_millisecond_gets_a_sequence() {
        let clock = ManualClock::new(1_000);
        let mut keys = KeyGenerator::new(Box::new(clock.clone()), 4);
        let a = keys.next_key();
        let b = keys.next_key();
        let c = keys.next_key();
        assert_eq!(a, RecordKey::new(1_000, 0));
        assert_eq!(b, RecordKey::new(1_000, 1));
        assert_eq!(c, RecordKey::new(1_000, 2));
        clock.advance(1);
        assert_eq!(keys.next_key(), RecordKey::new(1_001, 0));
    }

    #[test]
    fn clock_going_backwards_stays_monotonic() {
        let clock = ManualClock::new(5_000);
        let mut keys = KeyGenerator::new(Box::new(clock.clone()), 2);
        let a = keys.next_key();
        clock.set(4_000);
        let b = keys.next_key();
        assert!(b > a);
        assert_eq!(b, RecordKey::new(5_000, 1));
    }

    #[test]
    fn observed_keys_are_skipped() {
        let clock = ManualClock::new(10);
        let mut keys = KeyGenerator::new(Box::new(clock.clone()), 2);
        keys.observe(RecordKey::new(10, 0));
        assert_eq!(keys.next_key(), RecordKey::new(10, 1));
        keys.observe(RecordKey::new(3, 0));
        assert_eq!(keys.next_key(), RecordKey::new(10, 2));
    }

    #[test]
    fn sequence_overflow_moves_to_next_millisecond() {
        let clock = ManualClock::new(10);
        let mut keys = KeyGenerator::new(Box::new(clock), 1);
        keys.observe(RecordKey::last_at(10));
        assert_eq!(keys.next_key(), RecordKey::new(11, 0));
    }

    #[test]
    fn generator_clones_share_the_manual_clock() {
        let clock = ManualClock::new(1);
        let boxed: Box<dyn Clock> = Box::new(clock.clone());
        let copy = boxed.clone();
        clock.set(42);
        assert_eq!(copy.now_millis(), 42);
    }
}
