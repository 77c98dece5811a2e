use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Append-only writer that fans file writes out over a fixed number of
/// threads.
///
/// Writes to the same path are applied in the order they were enqueued:
/// a path is claimed by at most one thread at a time, and a claim takes
/// all currently pending buffers of that path at once. Writes to
/// different paths are unordered.
pub struct ConcurrentWriter {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    bytes_pending: AtomicU64,
    bytes_written: AtomicU64,
}

struct State {
    pending: HashMap<PathBuf, Vec<Vec<u8>>>,
    in_flight: HashSet<PathBuf>,
    closed: bool,
    error: Option<io::Error>,
}

impl ConcurrentWriter {
    pub fn new(num_threads: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                pending: HashMap::new(),
                in_flight: HashSet::new(),
                closed: false,
                error: None,
            }),
            bytes_pending: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        });

        let threads = (0..num_threads)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || Self::flush_thread(shared))
            })
            .collect();

        ConcurrentWriter { shared, threads }
    }

    /// Enqueues `data` to be appended to `path`.
    pub fn write(&self, path: PathBuf, data: Vec<u8>) {
        self.shared
            .bytes_pending
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        let mut state = self.shared.state.lock().unwrap();
        state.pending.entry(path).or_default().push(data);
    }

    pub fn pending_mb(&self) -> u64 {
        self.shared.bytes_pending.load(Ordering::Relaxed) / (1024 * 1024)
    }

    /// Blocks the caller until the write backlog drops below the given
    /// size. This is the backpressure hook for producers.
    pub fn wait_for_memory_threshold(&self, max_mb: u64) {
        while self.pending_mb() > max_mb {
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Waits until everything enqueued has been written and returns the
    /// total number of bytes on disk, or the first write error.
    pub fn join(mut self) -> io::Result<u64> {
        self.shared.state.lock().unwrap().closed = true;
        for handle in self.threads.drain(..) {
            handle.join().expect("writer thread panicked");
        }
        let mut state = self.shared.state.lock().unwrap();
        match state.error.take() {
            Some(error) => Err(error),
            None => Ok(self.shared.bytes_written.load(Ordering::Relaxed)),
        }
    }

    fn flush_thread(shared: Arc<Shared>) {
        loop {
            let claimed = {
                let mut state = shared.state.lock().unwrap();

                if state.error.is_some() {
                    // a failed writer drains the queue so producers and
                    // join() do not wait forever
                    let dropped: u64 = state
                        .pending
                        .values()
                        .flatten()
                        .map(|buffer| buffer.len() as u64)
                        .sum();
                    state.pending.clear();
                    shared.bytes_pending.fetch_sub(dropped, Ordering::Relaxed);
                }

                let available = state
                    .pending
                    .keys()
                    .find(|path| !state.in_flight.contains(*path))
                    .cloned();

                match available {
                    Some(path) => {
                        let work = state.pending.remove(&path).unwrap();
                        state.in_flight.insert(path.clone());
                        Some((path, work))
                    }
                    None => {
                        if state.pending.is_empty() && state.closed {
                            return;
                        }
                        None
                    }
                }
            };

            let (path, work) = match claimed {
                Some(claimed) => claimed,
                None => {
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
            };

            let result = Self::append_all(&path, &work);

            let written: u64 = work.iter().map(|b| b.len() as u64).sum();
            shared.bytes_pending.fetch_sub(written, Ordering::Relaxed);
            shared.bytes_written.fetch_add(written, Ordering::Relaxed);

            let mut state = shared.state.lock().unwrap();
            state.in_flight.remove(&path);
            if let Err(error) = result {
                if state.error.is_none() {
                    state.error = Some(error);
                }
            }
        }
    }

    fn append_all(path: &PathBuf, buffers: &[Vec<u8>]) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for buffer in buffers {
            file.write_all(buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ConcurrentWriter;

    #[test]
    fn appends_in_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");

        let writer = ConcurrentWriter::new(4);
        for i in 0u8..100 {
            writer.write(path.clone(), vec![i; 3]);
        }
        let written = writer.join().unwrap();
        assert_eq!(written, 300);

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 300);
        for (i, chunk) in content.chunks(3).enumerate() {
            assert_eq!(chunk, &[i as u8; 3]);
        }
    }

    #[test]
    fn multiple_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ConcurrentWriter::new(2);
        for i in 0u8..10 {
            writer.write(dir.path().join(format!("{i}.bin")), vec![i; 10]);
        }
        writer.join().unwrap();
        for i in 0u8..10 {
            let content = std::fs::read(dir.path().join(format!("{i}.bin"))).unwrap();
            assert_eq!(content, vec![i; 10]);
        }
    }
}
