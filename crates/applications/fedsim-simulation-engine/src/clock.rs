//! Discrete-event virtual clock
//!
//! Holds `(payload, arrival_time)` elements in a min-heap and an integer
//! current time. Advancing the clock runs the registered flush hook once per
//! unit step, which is how client states evolve between rounds.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

use fedsim_core::{FlushHook, Result, SimError, Time};
use tracing::trace;

/// Queued element; `seq` keeps same-time elements in insertion order
#[derive(Debug)]
struct Elem<T> {
    time: Time,
    seq: u64,
    payload: T,
}

// Priority queue orders by time (earliest first), then by insertion
impl<T> Ord for Elem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse comparison for min-heap (BinaryHeap is max-heap by default)
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Elem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Eq for Elem<T> {}

impl<T> PartialEq for Elem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

/// Virtual clock with a time-ordered element queue
pub struct VirtualClock<T> {
    queue: BinaryHeap<Elem<T>>,
    time: Time,
    next_seq: u64,
    hook: Option<Rc<RefCell<dyn FlushHook>>>,
}

impl<T> Default for VirtualClock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> VirtualClock<T> {
    /// Clock at time 0 with an empty queue and no hook
    pub fn new() -> Self {
        VirtualClock {
            queue: BinaryHeap::new(),
            time: 0,
            next_seq: 0,
            hook: None,
        }
    }

    pub fn current_time(&self) -> Time {
        self.time
    }

    /// Bind the hook run on every unit step, replacing any previous one
    pub fn register_flush_hook(&mut self, hook: Rc<RefCell<dyn FlushHook>>) {
        self.hook = Some(hook);
    }

    /// Queue `payload` to arrive at `time`
    pub fn put(&mut self, payload: T, time: Time) -> Result<()> {
        if time < 0 {
            return Err(SimError::InvalidTime(time));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Elem { time, seq, payload });
        Ok(())
    }

    /// Move forward `delta` units, flushing once before each unit
    ///
    /// The hook must not be borrowed by the caller while the clock advances.
    pub fn advance(&mut self, delta: Time) -> Result<()> {
        if delta < 0 {
            return Err(SimError::TimeInversion {
                current: self.time,
                requested: self.time + delta,
            });
        }
        for _ in 0..delta {
            if let Some(hook) = &self.hook {
                hook.borrow_mut().flush();
            }
            self.time += 1;
        }
        trace!(time = self.time, delta, "virtual clock advanced");
        Ok(())
    }

    pub fn step(&mut self) -> Result<()> {
        self.advance(1)
    }

    /// Jump to `t` without flushing
    pub fn set_time(&mut self, t: Time) -> Result<()> {
        if t < self.time {
            return Err(SimError::TimeInversion {
                current: self.time,
                requested: t,
            });
        }
        self.time = t;
        Ok(())
    }

    /// Earliest queued payload
    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop().map(|elem| elem.payload)
    }

    /// Arrival time of the earliest queued payload
    pub fn peek_time(&self) -> Option<Time> {
        self.queue.peek().map(|elem| elem.time)
    }

    /// Remove every element arriving at or before `t`, earliest first
    pub fn pop_until(&mut self, t: Time) -> Vec<T> {
        let mut res = Vec::new();
        while self.queue.peek().is_some_and(|elem| elem.time <= t) {
            if let Some(elem) = self.queue.pop() {
                res.push(elem.payload);
            }
        }
        res
    }

    /// Everything that has arrived by now
    pub fn pop_ready(&mut self) -> Vec<T> {
        self.pop_until(self.time)
    }

    /// Remove every element regardless of time, earliest first
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut res = Vec::with_capacity(self.queue.len());
        while let Some(elem) = self.queue.pop() {
            res.push(elem.payload);
        }
        res
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Discard every element whose payload matches `predicate`
    pub fn remove_if<F>(&mut self, mut predicate: F)
    where
        F: FnMut(&T) -> bool,
    {
        self.queue.retain(|elem| !predicate(&elem.payload));
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct CountingHook {
        flushes: u64,
    }

    impl FlushHook for CountingHook {
        fn flush(&mut self) {
            self.flushes += 1;
        }
    }

    #[test]
    fn test_clock_creation() {
        let clock: VirtualClock<u32> = VirtualClock::new();
        assert_eq!(clock.current_time(), 0);
        assert!(clock.is_empty());
    }

    #[test]
    fn test_put_rejects_negative_time() {
        let mut clock = VirtualClock::new();
        assert_eq!(clock.put("a", -1), Err(SimError::InvalidTime(-1)));
        assert!(clock.is_empty());
    }

    #[test]
    fn test_advance_flushes_once_per_unit() {
        let hook = Rc::new(RefCell::new(CountingHook::default()));
        let mut clock: VirtualClock<u32> = VirtualClock::new();
        clock.register_flush_hook(hook.clone());

        clock.advance(3).unwrap();
        assert_eq!(clock.current_time(), 3);
        assert_eq!(hook.borrow().flushes, 3);

        clock.advance(0).unwrap();
        assert_eq!(hook.borrow().flushes, 3);
    }

    #[test]
    fn test_register_replaces_hook() {
        let first = Rc::new(RefCell::new(CountingHook::default()));
        let second = Rc::new(RefCell::new(CountingHook::default()));
        let mut clock: VirtualClock<u32> = VirtualClock::new();
        clock.register_flush_hook(first.clone());
        clock.register_flush_hook(second.clone());

        clock.step().unwrap();
        assert_eq!(first.borrow().flushes, 0);
        assert_eq!(second.borrow().flushes, 1);
    }

    #[test]
    fn test_time_inversion() {
        let mut clock: VirtualClock<u32> = VirtualClock::new();
        clock.set_time(10).unwrap();
        assert!(matches!(
            clock.advance(-1),
            Err(SimError::TimeInversion { current: 10, .. })
        ));
        assert_eq!(
            clock.set_time(9),
            Err(SimError::TimeInversion {
                current: 10,
                requested: 9
            })
        );
        assert_eq!(clock.current_time(), 10);
    }

    #[test]
    fn test_set_time_does_not_flush() {
        let hook = Rc::new(RefCell::new(CountingHook::default()));
        let mut clock: VirtualClock<u32> = VirtualClock::new();
        clock.register_flush_hook(hook.clone());
        clock.set_time(5).unwrap();
        assert_eq!(hook.borrow().flushes, 0);
    }

    #[test]
    fn test_pop_until_keeps_later_elements() {
        let mut clock = VirtualClock::new();
        clock.put("late", 8).unwrap();
        clock.put("early", 2).unwrap();
        clock.put("mid", 5).unwrap();

        assert_eq!(clock.pop_until(5), vec!["early", "mid"]);
        assert_eq!(clock.len(), 1);
        assert_eq!(clock.peek_time(), Some(8));
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut clock = VirtualClock::new();
        for name in ["a", "b", "c", "d"] {
            clock.put(name, 3).unwrap();
        }
        clock.put("z", 1).unwrap();
        assert_eq!(clock.drain_all(), vec!["z", "a", "b", "c", "d"]);
        assert!(clock.is_empty());
    }

    #[test]
    fn test_pop_ready_uses_current_time() {
        let mut clock = VirtualClock::new();
        clock.put(1, 0).unwrap();
        clock.put(2, 4).unwrap();
        assert_eq!(clock.pop_ready(), vec![1]);
        clock.advance(4).unwrap();
        assert_eq!(clock.pop_ready(), vec![2]);
    }

    #[test]
    fn test_remove_if_preserves_order() {
        let mut clock = VirtualClock::new();
        clock.put(10, 2).unwrap();
        clock.put(11, 2).unwrap();
        clock.put(12, 1).unwrap();
        clock.put(13, 2).unwrap();
        clock.remove_if(|x| *x == 11);
        assert_eq!(clock.drain_all(), vec![12, 10, 13]);
    }

    #[test]
    fn test_clear() {
        let mut clock = VirtualClock::new();
        clock.put(1, 1).unwrap();
        clock.put(2, 2).unwrap();
        clock.clear();
        assert!(clock.is_empty());
        assert_eq!(clock.pop(), None);
    }

    proptest! {
        #[test]
        fn prop_pop_until_sorted_and_bounded(
            times in proptest::collection::vec(0i64..50, 0..40),
            bound in 0i64..60,
        ) {
            let mut clock = VirtualClock::new();
            for (i, t) in times.iter().enumerate() {
                clock.put((*t, i), *t).unwrap();
            }
            let popped = clock.pop_until(bound);
            prop_assert!(popped.iter().all(|(t, _)| *t <= bound));
            prop_assert!(popped.windows(2).all(|w| w[0] <= w[1]));
            let rest = clock.drain_all();
            prop_assert!(rest.iter().all(|(t, _)| *t > bound));
            prop_assert_eq!(popped.len() + rest.len(), times.len());
        }

        #[test]
        fn prop_time_is_monotonic(ops in proptest::collection::vec((any::<bool>(), -5i64..20), 0..30)) {
            let mut clock: VirtualClock<()> = VirtualClock::new();
            for (is_advance, value) in ops {
                let before = clock.current_time();
                let outcome = if is_advance { clock.advance(value) } else { clock.set_time(value) };
                let after = clock.current_time();
                prop_assert!(after >= before);
                match outcome {
                    Ok(()) => {}
                    Err(SimError::TimeInversion { .. }) => prop_assert_eq!(after, before),
                    Err(other) => prop_assert!(false, "unexpected error {other}"),
                }
            }
        }
    }
}
