//! Gapless playback scheduling with barge-in support.
//!
//! Decoded buffers are placed back-to-back on the output's clock. The
//! schedule is a single offset (`next_start_offset`) plus the set of sources
//! that have been handed to the output and not yet finished. Natural
//! completion removes a source; interruption stops and clears all of them.

use crate::{
    audio_io::{AudioOutput, Completion, ScheduledSource},
    codec::PlayableBuffer,
    error::PlaybackError,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tracing::debug;

/// Where a unit landed on the playback clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackUnit {
    pub id: u64,
    pub scheduled_start: f64,
    pub duration: f64,
}

impl PlaybackUnit {
    pub fn end(&self) -> f64 {
        self.scheduled_start + self.duration
    }
}

struct Schedule {
    next_start_offset: f64,
    next_id: u64,
    active: HashMap<u64, Box<dyn ScheduledSource>>,
}

/// Owns the output context and the schedule placed on it.
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    schedule: Arc<Mutex<Schedule>>,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            schedule: Arc::new(Mutex::new(Schedule {
                next_start_offset: 0.0,
                next_id: 0,
                active: HashMap::new(),
            })),
        }
    }

    /// Schedules `buffer` right after everything already queued, or now if
    /// the queue has drained. The schedule lock is held across the hand-off
    /// so an interrupt sees either all of this unit or none of it.
    pub fn enqueue(&self, buffer: PlayableBuffer) -> Result<PlaybackUnit, PlaybackError> {
        let mut schedule = self.lock();
        let now = self.output.current_time();
        let scheduled_start = schedule.next_start_offset.max(now);
        let duration = buffer.duration_seconds();

        let id = schedule.next_id;
        let source = self
            .output
            .start(buffer, scheduled_start, self.completion_for(id))?;
        schedule.next_id += 1;
        schedule.active.insert(id, source);
        schedule.next_start_offset = scheduled_start + duration;

        debug!(id, scheduled_start, duration, "scheduled playback unit");
        Ok(PlaybackUnit {
            id,
            scheduled_start,
            duration,
        })
    }

    /// Stops every scheduled source and resets the clock to zero.
    ///
    /// Units queued but not yet audible are discarded along with the playing
    /// one. Returns how many sources were stopped.
    pub fn interrupt(&self) -> usize {
        let mut schedule = self.lock();
        let stopped = schedule.active.len();
        for (_, mut source) in schedule.active.drain() {
            source.stop();
        }
        schedule.next_start_offset = 0.0;
        debug!(stopped, "playback interrupted");
        stopped
    }

    /// Stops all playback and releases the output context.
    pub fn close(&self) {
        self.interrupt();
        self.output.close();
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_active(&self, id: u64) -> bool {
        self.lock().active.contains_key(&id)
    }

    pub fn next_start_offset(&self) -> f64 {
        self.lock().next_start_offset
    }

    pub fn current_time(&self) -> f64 {
        self.output.current_time()
    }

    fn completion_for(&self, id: u64) -> Completion {
        let schedule: Weak<Mutex<Schedule>> = Arc::downgrade(&self.schedule);
        Box::new(move || {
            if let Some(schedule) = schedule.upgrade() {
                // Already gone if an interrupt cleared it first.
                let mut schedule = schedule.lock().unwrap_or_else(PoisonError::into_inner);
                schedule.active.remove(&id);
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeOutput, buffer_of};
    use approx::assert_abs_diff_eq;

    fn scheduler() -> (Arc<FakeOutput>, PlaybackScheduler) {
        let output = Arc::new(FakeOutput::default());
        let scheduler = PlaybackScheduler::new(output.clone());
        (output, scheduler)
    }

    #[test]
    fn test_back_to_back_units_have_no_gap() {
        let (_output, scheduler) = scheduler();
        let first = scheduler.enqueue(buffer_of(2.0)).unwrap();
        let second = scheduler.enqueue(buffer_of(1.5)).unwrap();

        assert_eq!(first.scheduled_start, 0.0);
        assert_eq!(second.scheduled_start, 2.0);
        assert_eq!(scheduler.next_start_offset(), 3.5);
    }

    #[test]
    fn test_units_never_overlap() {
        let (output, scheduler) = scheduler();
        let mut units = Vec::new();
        for (i, seconds) in [0.25, 0.5, 0.1, 1.0, 0.75].into_iter().enumerate() {
            output.set_time(i as f64 * 0.2);
            units.push(scheduler.enqueue(buffer_of(seconds)).unwrap());
        }
        for pair in units.windows(2) {
            assert!(pair[1].scheduled_start >= pair[0].end());
        }
    }

    #[test]
    fn test_late_arrival_starts_immediately() {
        let (output, scheduler) = scheduler();
        scheduler.enqueue(buffer_of(1.0)).unwrap();
        output.set_time(3.0);

        let late = scheduler.enqueue(buffer_of(0.5)).unwrap();
        assert_eq!(late.scheduled_start, 3.0);
        assert_eq!(scheduler.next_start_offset(), 3.5);
    }

    #[test]
    fn test_interrupt_clears_all_and_resets_clock() {
        let (output, scheduler) = scheduler();
        let first = scheduler.enqueue(buffer_of(2.0)).unwrap();
        let queued = scheduler.enqueue(buffer_of(2.0)).unwrap();
        output.set_time(0.5);

        assert_eq!(scheduler.interrupt(), 2);
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.next_start_offset(), 0.0);
        assert!(output.is_stopped(first.id as usize));
        assert!(output.is_stopped(queued.id as usize));

        let fresh = scheduler.enqueue(buffer_of(1.0)).unwrap();
        assert_abs_diff_eq!(fresh.scheduled_start, 0.5);
        assert_eq!(scheduler.active_count(), 1);
        assert!(scheduler.is_active(fresh.id));
    }

    #[test]
    fn test_completion_removes_only_its_own_unit() {
        let (output, scheduler) = scheduler();
        let first = scheduler.enqueue(buffer_of(1.0)).unwrap();
        let second = scheduler.enqueue(buffer_of(1.0)).unwrap();

        output.finish(first.id as usize);
        assert!(!scheduler.is_active(first.id));
        assert!(scheduler.is_active(second.id));
    }

    #[test]
    fn test_completion_after_interrupt_is_harmless() {
        let (output, scheduler) = scheduler();
        let old = scheduler.enqueue(buffer_of(1.0)).unwrap();
        scheduler.interrupt();
        let fresh = scheduler.enqueue(buffer_of(1.0)).unwrap();

        // A stale completion for the cleared unit must not touch the new one.
        output.finish(old.id as usize);
        assert_eq!(scheduler.active_count(), 1);
        assert!(scheduler.is_active(fresh.id));
    }

    #[test]
    fn test_device_error_does_not_advance_clock() {
        let (output, scheduler) = scheduler();
        scheduler.enqueue(buffer_of(1.0)).unwrap();
        output.set_failing(true);

        let err = scheduler.enqueue(buffer_of(1.0)).unwrap_err();
        assert!(matches!(err, PlaybackError::Device(_)));
        assert_eq!(scheduler.next_start_offset(), 1.0);
        assert_eq!(scheduler.active_count(), 1);
    }

    #[test]
    fn test_concurrent_enqueue_and_interrupt_never_drop_units() {
        let (_output, scheduler) = scheduler();
        let scheduler = Arc::new(scheduler);

        let producer = {
            let scheduler = scheduler.clone();
            std::thread::spawn(move || {
                (0..200)
                    .map(|_| scheduler.enqueue(buffer_of(0.01)).unwrap().id)
                    .collect::<Vec<_>>()
            })
        };
        let mut stopped = 0;
        for _ in 0..50 {
            stopped += scheduler.interrupt();
        }
        let ids = producer.join().unwrap();
        stopped += scheduler.interrupt();

        // Every unit was either interrupted exactly once or is still running.
        assert_eq!(ids.len(), 200);
        assert_eq!(stopped, 200);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_close_stops_and_releases_output() {
        let (output, scheduler) = scheduler();
        scheduler.enqueue(buffer_of(1.0)).unwrap();
        scheduler.close();
        scheduler.close();
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(output.close_count(), 2);
    }
}
