//! Named repeating jobs, one thread per job.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Shortest interval a job may run at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Longest uninterrupted sleep between cancellation checks.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

pub type JobError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Job '{0}' already exists")]
    DuplicateJob(String),

    #[error("Could not start job '{name}': {reason}")]
    Spawn { name: String, reason: String },
}

struct Job {
    cancelled: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl Job {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn cancel_and_join(self, name: &str) {
        self.cancel();
        if self.worker.thread().id() == thread::current().id() {
            return;
        }
        if self.worker.join().is_err() {
            log::error!("Scheduler job '{}' thread panicked", name);
        }
    }
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, Job>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.list_jobs())
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` every `interval` on its own thread.
    ///
    /// An existing job with the same name is stopped and replaced when
    /// `replace` is set; otherwise [`SchedulerError::DuplicateJob`] is
    /// returned. Errors and panics raised by the callback are logged and the
    /// job keeps running.
    pub fn add_job<F>(
        &self,
        name: &str,
        callback: F,
        interval: Duration,
        replace: bool,
    ) -> Result<(), SchedulerError>
    where
        F: FnMut() -> Result<(), JobError> + Send + 'static,
    {
        let previous = {
            let mut jobs = self.jobs.lock();
            if jobs.contains_key(name) && !replace {
                return Err(SchedulerError::DuplicateJob(name.to_string()));
            }
            jobs.remove(name)
        };
        if let Some(previous) = previous {
            log::debug!("Replacing scheduler job '{}'", name);
            previous.cancel_and_join(name);
        }

        let interval = interval.max(MIN_INTERVAL);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let job_name = name.to_string();

        let worker = thread::Builder::new()
            .name(format!("job {name}"))
            .spawn(move || run_job(&job_name, callback, interval, &flag))
            .map_err(|e| SchedulerError::Spawn {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let replaced = self
            .jobs
            .lock()
            .insert(name.to_string(), Job { cancelled, worker });
        // Lost a race with a concurrent add of the same name.
        if let Some(replaced) = replaced {
            replaced.cancel();
        }
        log::debug!("Started scheduler job '{}' every {:?}", name, interval);
        Ok(())
    }

    /// Cancel a job. Its thread exits within one sleep slice. Unknown names
    /// are ignored.
    pub fn remove_job(&self, name: &str) {
        if let Some(job) = self.jobs.lock().remove(name) {
            job.cancel();
            log::debug!("Removed scheduler job '{}'", name);
        }
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.jobs.lock().contains_key(name)
    }

    pub fn list_jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every job and wait for the threads to exit.
    pub fn stop_all(&self) {
        let jobs: Vec<(String, Job)> = self.jobs.lock().drain().collect();
        for (_, job) in &jobs {
            job.cancel();
        }
        for (name, job) in jobs {
            job.cancel_and_join(&name);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn run_job<F>(name: &str, mut callback: F, interval: Duration, cancelled: &AtomicBool)
where
    F: FnMut() -> Result<(), JobError>,
{
    let span = tracing::debug_span!("job", job = name);
    let _entered = span.enter();

    while !cancelled.load(Ordering::Acquire) {
        match panic::catch_unwind(AssertUnwindSafe(&mut callback)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Scheduler job '{}' failed: {}", name, e),
            Err(_) => log::error!("Scheduler job '{}' panicked", name),
        }

        let mut slept = Duration::ZERO;
        while slept < interval && !cancelled.load(Ordering::Acquire) {
            let slice = SLEEP_SLICE.min(interval - slept);
            thread::sleep(slice);
            slept += slice;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::wait_until;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() -> Result<(), JobError> + Send + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        (hits, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_job_runs_repeatedly() {
        let scheduler = Scheduler::new();
        let (hits, job) = counter();
        scheduler
            .add_job("poll", job, Duration::from_millis(20), true)
            .expect("add");

        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) >= 3));
        assert_eq!(scheduler.list_jobs(), vec!["poll".to_string()]);
    }

    #[test]
    fn test_duplicate_without_replace_fails() {
        let scheduler = Scheduler::new();
        let (_, first) = counter();
        let (_, second) = counter();
        scheduler
            .add_job("poll", first, Duration::from_millis(100), true)
            .expect("add");
        assert_eq!(
            scheduler.add_job("poll", second, Duration::from_millis(100), false),
            Err(SchedulerError::DuplicateJob("poll".to_string()))
        );
    }

    #[test]
    fn test_replacement_stops_old_job() {
        let scheduler = Scheduler::new();
        let (old_hits, old_job) = counter();
        let (new_hits, new_job) = counter();

        scheduler
            .add_job("poll", old_job, Duration::from_millis(100), true)
            .expect("add");
        assert!(wait_until(Duration::from_secs(1), || old_hits.load(Ordering::SeqCst) >= 1));

        scheduler
            .add_job("poll", new_job, Duration::from_millis(200), true)
            .expect("replace");
        let frozen = old_hits.load(Ordering::SeqCst);

        assert!(wait_until(Duration::from_secs(1), || new_hits.load(Ordering::SeqCst) >= 2));
        assert_eq!(old_hits.load(Ordering::SeqCst), frozen);
        assert_eq!(scheduler.list_jobs(), vec!["poll".to_string()]);
    }

    #[test]
    fn test_remove_job_interrupts_long_interval() {
        let scheduler = Scheduler::new();
        let (hits, job) = counter();
        scheduler
            .add_job("slow", job, Duration::from_secs(3600), true)
            .expect("add");
        assert!(wait_until(Duration::from_secs(1), || hits.load(Ordering::SeqCst) == 1));

        let started = Instant::now();
        scheduler.remove_job("slow");
        scheduler.remove_job("slow");
        assert!(!scheduler.has_job("slow"));
        scheduler.stop_all();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interval_is_clamped() {
        let scheduler = Scheduler::new();
        let (hits, job) = counter();
        scheduler
            .add_job("fast", job, Duration::ZERO, true)
            .expect("add");
        thread::sleep(Duration::from_millis(105));
        scheduler.stop_all();
        // At 10 ms per run this is roughly ten calls, never hundreds.
        let calls = hits.load(Ordering::SeqCst);
        assert!((1..=15).contains(&calls), "unexpected call count {calls}");
    }

    #[test]
    #[allow(clippy::panic)]
    fn test_failing_callback_keeps_running() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        scheduler
            .add_job(
                "flaky",
                move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    match n {
                        0 => Err("device busy".into()),
                        1 => panic!("callback bug"),
                        _ => Ok(()),
                    }
                },
                Duration::from_millis(10),
                true,
            )
            .expect("add");

        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) >= 4));
    }

    #[test]
    fn test_stop_all_clears_jobs() {
        let scheduler = Scheduler::new();
        for name in ["b", "a", "c"] {
            let (_, job) = counter();
            scheduler
                .add_job(name, job, Duration::from_millis(50), true)
                .expect("add");
        }
        assert_eq!(scheduler.list_jobs(), vec!["a", "b", "c"]);
        scheduler.stop_all();
        assert!(scheduler.list_jobs().is_empty());
    }
}
