// src/worker.rs
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    tasks: VecDeque<Task>,
    stop: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    cv: Condvar,
}

/// Fixed pool of worker threads consuming tasks from one FIFO.
///
/// Handler work runs here so the event loop never blocks on it. Shutdown
/// sets a stop flag and wakes every worker; workers drain whatever is left
/// in the queue before exiting.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                stop: false,
            }),
            cv: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("tallyd-worker-{}", i))
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        debug!("worker pool started with {} threads", size);
        Self { shared, handles }
    }

    /// Push a task and wake one worker. After shutdown this is a no-op.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.queue.lock().unwrap();
        if state.stop {
            warn!("task submitted after worker pool shutdown, dropping");
            return;
        }
        state.tasks.push_back(Box::new(task));
        drop(state);
        self.shared.cv.notify_one();
    }

    /// Current queue depth. The queue is unbounded; connection limits bound
    /// memory instead.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().unwrap().tasks.len()
    }

    /// Stop accepting tasks, wake everyone, and join. Remaining queued tasks
    /// are executed before the workers exit.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.queue.lock().unwrap();
            if state.stop {
                return;
            }
            state.stop = true;
        }
        self.shared.cv.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut state = shared.queue.lock().unwrap();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break Some(task);
                }
                if state.stop {
                    break None;
                }
                state = shared.cv.wait(state).unwrap();
            }
        };
        match task {
            Some(task) => task(),
            None => return,
        }
    }
}
