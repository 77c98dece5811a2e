use crossbeam_channel::Sender;
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send>;

/// A fixed-size pool of worker threads that drains a shared task queue.
///
/// Each pipeline pass creates its own pool and closes it at the end of the
/// pass, so no worker thread outlives a pass. Closing (or dropping) the
/// pool waits for all queued tasks to finish.
pub struct TaskPool {
    sender: Option<Sender<Task>>,
    threads: Vec<JoinHandle<()>>,
}

impl TaskPool {
    pub fn new(num_threads: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let threads = (0..num_threads)
            .map(|_| {
                let receiver = receiver.clone();
                thread::spawn(move || {
                    for task in receiver.iter() {
                        task();
                    }
                })
            })
            .collect();
        TaskPool {
            sender: Some(sender),
            threads,
        }
    }

    /// Returns the number of worker threads to use for a pass.
    pub fn default_threads() -> usize {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn add<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .as_ref()
            .expect("task pool is closed")
            .send(Box::new(task))
            .expect("worker threads are gone");
    }

    /// Waits until all queued tasks have completed and joins the workers.
    pub fn close(mut self) {
        self.close_impl();
    }

    fn close_impl(&mut self) {
        // closing the channel makes the workers drain the queue and stop
        drop(self.sender.take());
        for handle in self.threads.drain(..) {
            handle.join().expect("worker thread panicked");
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.close_impl();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TaskPool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_all_tasks() {
        let pool = TaskPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.add(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            });
        }
        pool.close();
        assert_eq!(counter.load(Ordering::Acquire), 100);
    }

    #[test]
    fn drop_waits_for_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = TaskPool::new(2);
            for _ in 0..10 {
                let counter = Arc::clone(&counter);
                pool.add(move || {
                    counter.fetch_add(1, Ordering::AcqRel);
                });
            }
        }
        assert_eq!(counter.load(Ordering::Acquire), 10);
    }
}
