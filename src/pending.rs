use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

//------------ Deferred update scheduling ------------------------------------

/// How long an engine sits on a batch of updates before rebuilding the
/// affected chunks.
pub const UPDATE_HOLDDOWN: Duration = Duration::from_millis(200);

/// One-shot timer source driving deferred batched chunk rebuilds.
///
/// An engine arms the timer on the first update of a new batch; the
/// embedding framework fires it by calling the engine's `run_timer`.
/// Re-arming before the timer fired moves the deadline.
pub trait UpdateScheduler {
    /// True once the embedding framework has attached a live timer.
    fn is_initialized(&self) -> bool;

    /// Arm the timer to fire once, `delay` from now.
    fn arm_after(&mut self, delay: Duration);
}

/// Scheduler for drivers without a timer wheel: remembers the requested
/// deadline and leaves firing to the driver, which calls the engine's
/// `apply_pending` itself. Handles are cheap clones sharing one state.
#[derive(Clone, Debug, Default)]
pub struct ManualScheduler {
    armed: Rc<Cell<Option<Duration>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The delay last passed to `arm_after`, cleared by `take_armed`.
    pub fn take_armed(&self) -> Option<Duration> {
        self.armed.take()
    }
}

impl UpdateScheduler for ManualScheduler {
    fn is_initialized(&self) -> bool {
        true
    }

    fn arm_after(&mut self, delay: Duration) {
        self.armed.set(Some(delay));
    }
}

//------------ PendingSet ----------------------------------------------------

/// The set of chunk indices whose expansion is stale: a flat word
/// bitmask plus an envelope of the lowest and highest marked index, so
/// a batch apply only scans the words that can hold set bits.
pub(crate) struct PendingSet {
    bits: Vec<u32>,
    start: u32,
    end: u32,
    nchunks: u32,
}

impl PendingSet {
    pub fn new(nchunks: u32) -> Self {
        PendingSet {
            bits: vec![0; (nchunks >> 5) as usize],
            start: nchunks,
            end: 0,
            nchunks,
        }
    }

    /// Mark every chunk in `first..=last` stale.
    pub fn mark_range(&mut self, first: u32, last: u32) {
        for chunk in first..=last {
            self.bits[(chunk >> 5) as usize] |= 1 << (chunk & 0x1f);
        }
        if first < self.start {
            self.start = first;
        }
        if last > self.end {
            self.end = last;
        }
    }

    pub fn mark_all(&mut self) {
        self.bits.fill(u32::MAX);
        self.start = 0;
        self.end = self.nchunks - 1;
    }

    pub fn has_pending(&self) -> bool {
        self.start <= self.end
    }

    /// Collect all marked chunks in ascending order and reset the set.
    pub fn take_marked(&mut self) -> Vec<u32> {
        let mut chunks = Vec::new();
        if self.start <= self.end {
            for word in (self.start >> 5)..=(self.end >> 5) {
                let mut mask = self.bits[word as usize];
                if mask == 0 {
                    continue;
                }
                self.bits[word as usize] = 0;
                while mask != 0 {
                    let bit = mask.trailing_zeros();
                    chunks.push((word << 5) + bit);
                    mask &= mask - 1;
                }
            }
        }
        self.start = self.nchunks;
        self.end = 0;
        chunks
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.start = self.nchunks;
        self.end = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_and_draining() {
        let mut set = PendingSet::new(1 << 16);
        assert!(!set.has_pending());
        assert_eq!(set.take_marked(), Vec::<u32>::new());

        set.mark_range(3, 5);
        set.mark_range(4, 4);
        set.mark_range(40000, 40001);
        assert!(set.has_pending());
        assert_eq!(set.take_marked(), vec![3, 4, 5, 40000, 40001]);
        assert!(!set.has_pending());
        assert_eq!(set.take_marked(), Vec::<u32>::new());
    }

    #[test]
    fn mark_all_covers_everything() {
        let mut set = PendingSet::new(64);
        set.mark_all();
        assert_eq!(set.take_marked().len(), 64);
    }

    #[test]
    fn manual_scheduler_records_deadline() {
        let sched = ManualScheduler::new();
        let mut handle = sched.clone();
        assert!(handle.is_initialized());
        handle.arm_after(UPDATE_HOLDDOWN);
        assert_eq!(sched.take_armed(), Some(UPDATE_HOLDDOWN));
        assert_eq!(sched.take_armed(), None);
    }
}
