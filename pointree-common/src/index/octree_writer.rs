use crate::attributes::Attributes;
use crate::encoding::{compress_node, EncodeError, Encoding};
use crate::index::node::Node;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Default slab capacity. A slab grows beyond this only when a single
/// node payload does not fit.
const SLAB_CAPACITY: usize = 16 * 1024 * 1024;

/// Owns `octree.bin`.
///
/// `write_and_unload` assigns the node its byte range, copies the
/// (possibly compressed) payload into the active slab and releases the
/// node's point buffer. Full slabs are handed to a dedicated flush
/// thread that appends them to the file in FIFO order, so on-disk order
/// matches offset assignment order.
pub struct OctreeWriter {
    shared: Arc<Shared>,
    attributes: Attributes,
    encoding: Encoding,
    flush_thread: Option<JoinHandle<io::Result<()>>>,
}

struct Shared {
    state: Mutex<SlabState>,
    ready: Condvar,
    total_bytes: AtomicU64,
    backlog_bytes: AtomicU64,
}

struct SlabState {
    active: Vec<u8>,
    capacity: usize,
    backlog: VecDeque<Vec<u8>>,
    close_requested: bool,
}

impl OctreeWriter {
    pub fn create(
        path: &Path,
        attributes: Attributes,
        encoding: Encoding,
    ) -> io::Result<OctreeWriter> {
        let file = File::create(path)?;
        let shared = Arc::new(Shared {
            state: Mutex::new(SlabState {
                active: Vec::with_capacity(SLAB_CAPACITY),
                capacity: SLAB_CAPACITY,
                backlog: VecDeque::new(),
                close_requested: false,
            }),
            ready: Condvar::new(),
            total_bytes: AtomicU64::new(0),
            backlog_bytes: AtomicU64::new(0),
        });

        let flush_shared = Arc::clone(&shared);
        let flush_thread = std::thread::spawn(move || Self::flush_thread(flush_shared, file));

        Ok(OctreeWriter {
            shared,
            attributes,
            encoding,
            flush_thread: Some(flush_thread),
        })
    }

    /// Accepts the node's payload for write-out and releases its buffer.
    ///
    /// The assigned `byte_offset` is where the node WILL live once the
    /// flush thread catches up, not necessarily where bytes already are.
    pub fn write_and_unload(&self, node: &mut Node) -> Result<(), EncodeError> {
        if node.num_points == 0 {
            node.points = None;
            return Ok(());
        }

        let points = node.points.take().expect("node with points to write");
        let payload = match self.encoding {
            Encoding::Brotli => compress_node(&points, node.num_points, &self.attributes)?,
            Encoding::Default | Encoding::Uncompressed => points,
        };

        node.byte_size = payload.len() as u64;

        // offset assignment and slab placement must happen under one
        // lock, so that file order matches offset order
        let mut state = self.shared.state.lock().unwrap();
        node.byte_offset = self
            .shared
            .total_bytes
            .fetch_add(payload.len() as u64, Ordering::SeqCst);
        self.shared
            .backlog_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        if state.active.len() + payload.len() > state.capacity {
            let capacity = state.capacity.max(payload.len());
            let full = std::mem::replace(&mut state.active, Vec::with_capacity(capacity));
            state.capacity = capacity;
            state.backlog.push_back(full);
            self.shared.ready.notify_one();
        }
        state.active.extend_from_slice(&payload);
        Ok(())
    }

    pub fn backlog_mb(&self) -> u64 {
        self.shared.backlog_bytes.load(Ordering::Relaxed) / (1024 * 1024)
    }

    /// Blocks until the amount of buffered payload drops below the given
    /// size.
    pub fn wait_for_backlog_below(&self, max_mb: u64) {
        while self.backlog_mb() > max_mb {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Flushes the active slab, drains the backlog and closes the file.
    /// Returns the total number of payload bytes in `octree.bin`.
    pub fn close_and_wait(mut self) -> io::Result<u64> {
        {
            let mut state = self.shared.state.lock().unwrap();
            let last = std::mem::take(&mut state.active);
            if !last.is_empty() {
                state.backlog.push_back(last);
            }
            state.close_requested = true;
            self.shared.ready.notify_one();
        }

        let result = self
            .flush_thread
            .take()
            .unwrap()
            .join()
            .expect("flush thread panicked");
        result?;
        Ok(self.shared.total_bytes.load(Ordering::SeqCst))
    }

    fn flush_thread(shared: Arc<Shared>, mut file: File) -> io::Result<()> {
        loop {
            let slab = {
                let mut state = shared.state.lock().unwrap();
                loop {
                    if let Some(slab) = state.backlog.pop_front() {
                        break Some(slab);
                    }
                    if state.close_requested {
                        break None;
                    }
                    state = shared.ready.wait(state).unwrap();
                }
            };

            match slab {
                Some(slab) => {
                    file.write_all(&slab)?;
                    shared
                        .backlog_bytes
                        .fetch_sub(slab.len() as u64, Ordering::Relaxed);
                }
                None => {
                    file.flush()?;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{Attribute, AttributeType};
    use crate::geometry::bounding_box::Aabb;
    use nalgebra::Point3;

    fn test_attributes() -> Attributes {
        Attributes::new(vec![Attribute::new("position", AttributeType::Int32, 3)])
    }

    fn node_with_points(name: &str, payload: Vec<u8>) -> Node {
        let mut node = Node::new(
            name.to_string(),
            Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0)),
        );
        node.num_points = (payload.len() / 12) as u64;
        node.points = Some(payload);
        node
    }

    #[test]
    fn offsets_are_disjoint_and_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("octree.bin");
        let writer = OctreeWriter::create(&path, test_attributes(), Encoding::Default).unwrap();

        let mut nodes: Vec<Node> = (0u8..10)
            .map(|i| node_with_points(&format!("r{i}"), vec![i; 12 * (i as usize + 1)]))
            .collect();
        for node in &mut nodes {
            writer.write_and_unload(node).unwrap();
            assert!(node.points.is_none());
        }
        let total = writer.close_and_wait().unwrap();

        let expected: u64 = (1..=10).map(|i| 12 * i as u64).sum();
        assert_eq!(total, expected);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), total);

        let mut ranges: Vec<(u64, u64)> =
            nodes.iter().map(|n| (n.byte_offset, n.byte_size)).collect();
        ranges.sort();
        let mut cursor = 0;
        for (offset, size) in ranges {
            assert_eq!(offset, cursor, "ranges must be dense and disjoint");
            cursor = offset + size;
        }

        // payload actually lands at the assigned offset
        let content = std::fs::read(&path).unwrap();
        for node in &nodes {
            let at = node.byte_offset as usize;
            let first = content[at];
            assert_eq!(first as usize * 12 + 12, node.byte_size as usize);
        }
    }

    #[test]
    fn empty_nodes_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("octree.bin");
        let writer = OctreeWriter::create(&path, test_attributes(), Encoding::Default).unwrap();
        let mut node = node_with_points("r", Vec::new());
        node.num_points = 0;
        writer.write_and_unload(&mut node).unwrap();
        assert_eq!(writer.close_and_wait().unwrap(), 0);
    }

    #[test]
    fn payloads_larger_than_slab() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("octree.bin");
        let writer = OctreeWriter::create(&path, test_attributes(), Encoding::Default).unwrap();

        // larger than the slab capacity, forces a capacity grow
        let big = vec![1u8; SLAB_CAPACITY + 12];
        let mut node = node_with_points("r", big);
        writer.write_and_unload(&mut node).unwrap();
        let mut small = node_with_points("r0", vec![2u8; 12]);
        writer.write_and_unload(&mut small).unwrap();

        let total = writer.close_and_wait().unwrap();
        assert_eq!(total as usize, SLAB_CAPACITY + 24);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), total);
    }
}
