use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use log::warn;

/// A periodic background thread with stop-and-join-on-drop semantics.
pub struct WorkerHandle {
    name: String,
    stop_flag: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            if let Err(err) = handle.join() {
                warn!("background worker {} terminated with panic: {:?}", self.name, err);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .finish()
    }
}

/// Runs `tick` every `interval` on a named thread until the handle asks it to
/// stop. Returns None when the interval is zero or the thread fails to spawn.
pub fn spawn_periodic_worker<F>(name: &str, interval: Duration, mut tick: F) -> Option<WorkerHandle>
where
    F: FnMut() + Send + 'static,
{
    if interval.is_zero() {
        return None;
    }
    let stop_flag = Arc::new(AtomicBool::new(false));
    let thread_flag = Arc::clone(&stop_flag);

    match thread::Builder::new().name(name.into()).spawn(move || {
        while !thread_flag.load(Ordering::Acquire) {
            tick();
            if thread_flag.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(interval);
        }
    }) {
        Ok(join_handle) => Some(WorkerHandle {
            name: name.to_string(),
            stop_flag,
            join_handle: Some(join_handle),
        }),
        Err(err) => {
            warn!("failed to spawn {}: {}", name, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn worker_ticks_and_stops_on_drop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        let handle = spawn_periodic_worker("test-worker", Duration::from_millis(5), move || {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(40));
        drop(handle);
        let observed = ticks.load(Ordering::SeqCst);
        assert!(observed >= 1);

        // no more ticks after the handle is gone
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), observed);
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(spawn_periodic_worker("noop", Duration::ZERO, || {}).is_none());
    }
}
