//! Backoff timing and the retry timer.
//!
//! The scheduler keeps an in-memory delay queue mirrored from the ledger's
//! retry tasks. The ledger row is authoritative; the queue only decides when
//! to look at it again.

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::fingerprint::Fingerprint;
use crate::ledger::{DedupLedger, FailureOutcome};
use crate::record::{ErrorKind, RetryTask};

/// Upper bound on a single timer wait, so shutdown and clock jumps are seen.
const MAX_TIMER_WAIT: Duration = Duration::from_millis(200);

/// Exponential backoff with additive jitter.
///
/// For the n-th consecutive failure (n >= 1):
/// `exp(n) = min(cap, base * 2^(n-1))` and
/// `delay(n) = min(cap, exp(n) + U[0, exp(n) / 2])`.
/// Since `exp(n+1) >= 1.5 * exp(n)` until the cap, delays never decrease.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Backoff {
    pub fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self {
            base_ms,
            cap_ms: cap_ms.max(base_ms),
        }
    }

    pub fn exponential_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(63);
        self.base_ms
            .checked_mul(1u64 << shift)
            .unwrap_or(u64::MAX)
            .min(self.cap_ms)
    }

    pub fn delay_ms<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> u64 {
        let exp = self.exponential_ms(attempt);
        let jitter = if exp >= 2 { rng.gen_range(0..=exp / 2) } else { 0 };
        exp.saturating_add(jitter).min(self.cap_ms)
    }
}

pub struct RetryScheduler {
    queue: Mutex<BinaryHeap<Reverse<(u64, Fingerprint)>>>,
    wake: Condvar,
    backoff: Backoff,
    rng: Mutex<StdRng>,
}

impl RetryScheduler {
    pub fn new(backoff: Backoff) -> Self {
        Self::with_rng(backoff, StdRng::from_entropy())
    }

    /// Deterministic jitter for tests.
    pub fn seeded(backoff: Backoff, seed: u64) -> Self {
        Self::with_rng(backoff, StdRng::seed_from_u64(seed))
    }

    fn with_rng(backoff: Backoff, rng: StdRng) -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            wake: Condvar::new(),
            backoff,
            rng: Mutex::new(rng),
        }
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Jittered delay for the given failure count.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        match self.rng.lock() {
            Ok(mut rng) => self.backoff.delay_ms(attempt, &mut *rng),
            Err(_) => self.backoff.exponential_ms(attempt),
        }
    }

    pub fn schedule(&self, task: RetryTask) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push(Reverse((task.next_attempt_ms, task.fingerprint)));
        }
        self.wake.notify_all();
    }

    /// Count a transient failure against the ledger record and schedule
    /// the retry, or dead-letter it once attempts are exhausted.
    pub fn on_transient_failure(
        &self,
        ledger: &DedupLedger,
        fingerprint: &Fingerprint,
        kind: ErrorKind,
    ) -> Result<FailureOutcome> {
        let outcome =
            ledger.record_transient_failure(fingerprint, kind, |attempt| self.delay_for(attempt))?;
        match outcome {
            FailureOutcome::Retry(task) => {
                log::info!(
                    "{}: {} (attempt {}/{}), retry at {}",
                    fingerprint.short(),
                    kind.as_str(),
                    task.backoff_level,
                    ledger.max_attempts(),
                    task.next_attempt_ms
                );
                self.schedule(task);
            }
            FailureOutcome::DeadLettered => {
                log::warn!(
                    "{}: {} after {} attempts, dead-lettered",
                    fingerprint.short(),
                    kind.as_str(),
                    ledger.max_attempts()
                );
            }
        }
        Ok(outcome)
    }

    /// Load every retry task the ledger holds after a restart.
    pub fn recover(&self, ledger: &DedupLedger) -> Result<usize> {
        let tasks = ledger.recover(|attempt| self.delay_for(attempt))?;
        let count = tasks.len();
        for task in tasks {
            self.schedule(task);
        }
        Ok(count)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn next_due(&self) -> Option<u64> {
        self.queue
            .lock()
            .ok()
            .and_then(|queue| queue.peek().map(|Reverse((due, _))| *due))
    }

    /// Pop every entry due at or before `now_ms`, earliest first.
    pub fn take_due(&self, now_ms: u64) -> Result<Vec<Fingerprint>> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| anyhow!("retry queue lock poisoned"))?;
        let mut due = Vec::new();
        while let Some(Reverse((at, _))) = queue.peek() {
            if *at > now_ms {
                break;
            }
            if let Some(Reverse((_, fingerprint))) = queue.pop() {
                due.push(fingerprint);
            }
        }
        Ok(due)
    }

    /// Timer loop. Calls `fire` for each due fingerprint until `shutdown`.
    pub fn run(&self, clock: &dyn Clock, shutdown: &AtomicBool, fire: impl Fn(Fingerprint)) {
        while !shutdown.load(Ordering::SeqCst) {
            let now = clock.now_ms();
            match self.take_due(now) {
                Ok(due) => due.into_iter().for_each(&fire),
                Err(err) => {
                    log::error!("retry timer stopped: {}", err);
                    return;
                }
            }
            let wait = self
                .next_due()
                .map(|due| Duration::from_millis(due.saturating_sub(now)))
                .unwrap_or(MAX_TIMER_WAIT)
                .min(MAX_TIMER_WAIT);
            if let Ok(queue) = self.queue.lock() {
                let _ = self.wake.wait_timeout(queue, wait);
            }
        }
    }

    /// Wake the timer so it notices shutdown or a new earliest task.
    pub fn notify(&self) {
        self.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::record::{CaptureEvent, ProcessingState};
    use std::path::PathBuf;
    use std::sync::Arc;

    #[test]
    fn exponential_doubles_until_cap() {
        let backoff = Backoff::new(1_000, 60_000);
        let steps: Vec<u64> = (1..=8).map(|n| backoff.exponential_ms(n)).collect();
        assert_eq!(
            steps,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000]
        );
        assert_eq!(backoff.exponential_ms(200), 60_000);
    }

    #[test]
    fn jittered_delays_are_non_decreasing_and_capped() {
        let backoff = Backoff::new(250, 20_000);
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut previous = 0;
            for attempt in 1..=12 {
                let delay = backoff.delay_ms(attempt, &mut rng);
                assert!(delay >= previous, "seed {seed} attempt {attempt}");
                assert!(delay <= 20_000);
                assert!(delay >= backoff.exponential_ms(attempt));
                previous = delay;
            }
        }
    }

    #[test]
    fn take_due_pops_in_time_order() {
        let scheduler = RetryScheduler::seeded(Backoff::new(10, 100), 7);
        let a = Fingerprint::of_bytes(b"a");
        let b = Fingerprint::of_bytes(b"b");
        let c = Fingerprint::of_bytes(b"c");
        for (fingerprint, at) in [(a, 300), (b, 100), (c, 200)] {
            scheduler.schedule(RetryTask {
                fingerprint,
                next_attempt_ms: at,
                backoff_level: 1,
            });
        }
        assert!(scheduler.take_due(99).unwrap().is_empty());
        assert_eq!(scheduler.take_due(200).unwrap(), vec![b, c]);
        assert_eq!(scheduler.next_due(), Some(300));
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn failures_dead_letter_after_max_attempts() {
        let clock = Arc::new(ManualClock::new(0));
        let ledger = DedupLedger::in_memory(clock.clone(), 3);
        let scheduler = RetryScheduler::seeded(Backoff::new(100, 1_000), 1);
        let fingerprint = Fingerprint::of_bytes(b"flaky");
        ledger
            .admit(&CaptureEvent {
                path: PathBuf::from("flaky.jpg"),
                size: 5,
                modified_ms: 0,
                fingerprint,
            })
            .unwrap();

        let mut delays = Vec::new();
        for _ in 0..3 {
            assert!(ledger.mark_queued(&fingerprint).unwrap());
            ledger.begin_detecting(&fingerprint).unwrap().unwrap();
            let now = clock.now_ms();
            match scheduler
                .on_transient_failure(&ledger, &fingerprint, ErrorKind::InferenceTimeout)
                .unwrap()
            {
                FailureOutcome::Retry(task) => {
                    delays.push(task.next_attempt_ms - now);
                    let due = scheduler.take_due(task.next_attempt_ms).unwrap();
                    assert_eq!(due, vec![fingerprint]);
                    clock.set_ms(task.next_attempt_ms);
                }
                FailureOutcome::DeadLettered => break,
            }
        }

        assert_eq!(delays.len(), 2);
        assert!(delays[0] <= delays[1]);
        let record = ledger.get(&fingerprint).unwrap().unwrap();
        assert_eq!(record.state, ProcessingState::DeadLettered);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.last_error, Some(ErrorKind::InferenceTimeout));
        assert!(ledger.retry_task(&fingerprint).unwrap().is_none());
    }

    #[test]
    fn timer_fires_due_work_and_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(1_000));
        let scheduler = Arc::new(RetryScheduler::seeded(Backoff::new(10, 100), 3));
        let fingerprint = Fingerprint::of_bytes(b"timer");
        scheduler.schedule(RetryTask {
            fingerprint,
            next_attempt_ms: 1_500,
            backoff_level: 1,
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam_channel::unbounded();

        let handle = {
            let scheduler = scheduler.clone();
            let clock = clock.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                scheduler.run(clock.as_ref(), &shutdown, |fp| {
                    let _ = tx.send(fp);
                })
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        clock.advance_ms(500);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), fingerprint);

        shutdown.store(true, Ordering::SeqCst);
        scheduler.notify();
        handle.join().unwrap();
    }
}
