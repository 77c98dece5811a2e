use crate::attributes::Attributes;
use crate::chunking::counting::clamped_cell_index;
use crate::chunking::lut::LookupTable;
use crate::chunking::{load_chunks, ChunkError, ChunkFile, LoadedChunks};
use crate::encoding::{EncodeError, Encoding};
use crate::geometry::bounding_box::Aabb;
use crate::geometry::morton;
use crate::index::flusher::{FlushedNode, HierarchyFlusher};
use crate::index::hierarchy_builder::{HierarchyBuilder, HierarchyError};
use crate::index::metadata::{build_metadata, write_metadata, HierarchyMetadata, Metadata};
use crate::index::node::Node;
use crate::index::octree_writer::OctreeWriter;
use crate::index::sampler::{PoissonSampler, RandomSampler, Sampler, SamplingMethod};
use crate::status::Status;
use crate::utils::task_pool::TaskPool;
use log::{info, warn};
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Number of subdivision levels of the in-memory counting grid used by
/// `build_hierarchy` (32³ cells).
const SUBDIVISION_LEVELS: usize = 5;
const SUBDIVISION_GRID: usize = 1 << SUBDIVISION_LEVELS;

/// Chunks holding more points than this are split again before indexing.
pub const REFINE_THRESHOLD: u64 = 10_000_000;

/// Producers stall while the octree writer buffers more than this.
const MAX_BACKLOG_MB: u64 = 1024;

/// Producers also stall while the process itself holds more memory.
const MAX_PROCESS_MEMORY_MB: u64 = 32 * 1024;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),

    #[error("chunk file {0} does not hold a whole number of point records")]
    CorruptChunk(String),
}

#[derive(Clone, Debug)]
pub struct IndexingOptions {
    pub sampling: SamplingMethod,
    pub encoding: Encoding,
    pub step_size: usize,
    pub max_points_per_node: u64,
    pub refine_threshold: u64,
    pub name: String,
    pub projection: String,
    pub keep_chunks: bool,
}

impl Default for IndexingOptions {
    fn default() -> Self {
        IndexingOptions {
            sampling: SamplingMethod::Poisson,
            encoding: Encoding::Default,
            step_size: 4,
            max_points_per_node: crate::chunking::MAX_POINTS_PER_CHUNK,
            refine_threshold: REFINE_THRESHOLD,
            name: String::new(),
            projection: String::new(),
            keep_chunks: false,
        }
    }
}

struct FlushedChunkRoot {
    node: Box<Node>,
    offset: u64,
    size: u64,
}

struct RootsState {
    file: File,
    offset: u64,
    flushed: Vec<FlushedChunkRoot>,
}

struct Indexer {
    attributes: Attributes,
    writer: Arc<OctreeWriter>,
    flusher: Arc<HierarchyFlusher>,
    sampler: Box<dyn Sampler>,
    spacing: f64,
    max_points_per_node: u64,
    octree_depth: AtomicU64,
    dropped_points: AtomicU64,
    roots: Mutex<RootsState>,
}

/// Pass 3: builds a local octree per chunk file, samples it bottom-up,
/// writes node payloads to `octree.bin`, then runs one final sampling
/// pass over the chunk roots and serializes `hierarchy.bin` and
/// `metadata.json`.
pub fn do_indexing(
    target_dir: &Path,
    options: &IndexingOptions,
    status: &Arc<Status>,
) -> Result<Metadata, IndexError> {
    let mut loaded = load_chunks(target_dir)?;
    status.begin_pass(3, "INDEXING");

    refine_oversized_chunks(&mut loaded, target_dir, options)?;

    let spacing = loaded.cube.size().x / 128.0;
    let writer = Arc::new(OctreeWriter::create(
        &target_dir.join("octree.bin"),
        loaded.attributes.clone(),
        options.encoding,
    )?);
    let flusher = Arc::new(HierarchyFlusher::new(
        target_dir.join(".hierarchyChunks"),
        options.step_size,
    )?);
    let roots_path = target_dir.join("tmpChunkRoots.bin");

    let sampler: Box<dyn Sampler> = match options.sampling {
        SamplingMethod::Poisson => Box::new(PoissonSampler),
        SamplingMethod::Random => Box::new(RandomSampler),
    };

    let indexer = Arc::new(Indexer {
        attributes: loaded.attributes.clone(),
        writer: Arc::clone(&writer),
        flusher: Arc::clone(&flusher),
        sampler,
        spacing,
        max_points_per_node: options.max_points_per_node,
        octree_depth: AtomicU64::new(0),
        dropped_points: AtomicU64::new(0),
        roots: Mutex::new(RootsState {
            file: File::create(&roots_path)?,
            offset: 0,
            flushed: Vec::new(),
        }),
    });

    // every chunk builds and samples its subtree independently
    let error: Arc<Mutex<Option<IndexError>>> = Arc::new(Mutex::new(None));
    let pool = TaskPool::new(TaskPool::default_threads());
    for chunk in loaded.files.clone() {
        let indexer = Arc::clone(&indexer);
        let error = Arc::clone(&error);
        let status = Arc::clone(status);
        pool.add(move || {
            if error.lock().unwrap().is_some() {
                return;
            }
            if let Err(e) = indexer.process_chunk(&chunk, &status) {
                let mut slot = error.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(e);
                }
            }
        });
    }
    pool.close();
    if let Some(error) = error.lock().unwrap().take() {
        return Err(error);
    }

    // top of the tree: reload the chunk roots and sample up to "r"
    let mut root = indexer.assemble_root(&loaded.cube, &roots_path)?;
    {
        let callback_error: Mutex<Option<IndexError>> = Mutex::new(None);
        indexer.sampler.sample(
            &mut root,
            &indexer.attributes,
            indexer.spacing,
            &mut |node| {
                if let Err(e) = indexer.complete_node(node) {
                    let mut slot = callback_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
            },
            &mut |_| {},
        );
        if let Some(error) = callback_error.into_inner().unwrap() {
            return Err(error);
        }
    }
    indexer.complete_node(&mut root)?;
    drop(root);

    flusher.flush()?;

    let octree_depth = indexer.octree_depth.load(Ordering::Relaxed);
    let dropped_points = indexer.dropped_points.load(Ordering::Relaxed);
    drop(indexer);

    let writer = Arc::try_unwrap(writer).unwrap_or_else(|_| unreachable!());
    writer.close_and_wait()?;

    let flusher = Arc::try_unwrap(flusher).unwrap_or_else(|_| unreachable!());
    let hierarchy = HierarchyBuilder::new(flusher.path().clone(), options.step_size)
        .build(&target_dir.join("hierarchy.bin"))?;

    let points = status.points_total.load(Ordering::Relaxed) - dropped_points;
    if dropped_points > 0 {
        warn!("{dropped_points} dropped duplicates are excluded from the metadata point count");
    }

    let metadata = build_metadata(
        &options.name,
        &options.projection,
        points,
        HierarchyMetadata {
            first_chunk_size: hierarchy.first_chunk_size,
            step_size: hierarchy.step_size as u64,
            depth: octree_depth,
        },
        &loaded.attributes,
        &loaded.cube,
        spacing,
        options.encoding.as_str(),
    );
    write_metadata(&target_dir.join("metadata.json"), &metadata)?;

    std::fs::remove_file(&roots_path)?;
    if !options.keep_chunks {
        std::fs::remove_dir_all(target_dir.join("chunks"))?;
    }

    Ok(metadata)
}

impl Indexer {
    fn note_depth(&self, level: u64) {
        self.octree_depth.fetch_max(level, Ordering::Relaxed);
    }

    fn complete_node(&self, node: &mut Node) -> Result<(), IndexError> {
        self.writer.write_and_unload(node)?;
        self.flusher.write(FlushedNode::of(node))?;
        Ok(())
    }

    fn process_chunk(&self, chunk: &ChunkFile, status: &Status) -> Result<(), IndexError> {
        let buffer = std::fs::read(&chunk.path)?;
        let bytes_per_point = self.attributes.bytes_per_point;
        if buffer.len() % bytes_per_point != 0 {
            return Err(IndexError::CorruptChunk(chunk.id.clone()));
        }
        let num_points = (buffer.len() / bytes_per_point) as u64;

        let mut root = Box::new(Node::new(chunk.id.clone(), chunk.bounds));
        self.build_hierarchy(&mut root, buffer, num_points)?;

        let callback_error: Mutex<Option<IndexError>> = Mutex::new(None);
        self.sampler.sample(
            &mut root,
            &self.attributes,
            self.spacing,
            &mut |node| {
                if let Err(e) = self.complete_node(node) {
                    let mut slot = callback_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
            },
            &mut |_| {},
        );
        if let Some(error) = callback_error.into_inner().unwrap() {
            return Err(error);
        }

        self.flush_chunk_root(root)?;
        status.add_points(num_points);
        status.add_bytes(num_points * bytes_per_point as u64);

        self.writer.wait_for_backlog_below(MAX_BACKLOG_MB);
        crate::status::wait_for_memory_below(MAX_PROCESS_MEMORY_MB);
        Ok(())
    }

    /// Appends the chunk root's sampled payload to the scratch file and
    /// keeps only the skeleton in memory until the final pass.
    fn flush_chunk_root(&self, mut root: Box<Node>) -> Result<(), IndexError> {
        let points = root.points.take().unwrap_or_default();
        let mut roots = self.roots.lock().unwrap();
        roots.file.write_all(&points)?;
        let offset = roots.offset;
        roots.offset += points.len() as u64;
        roots.flushed.push(FlushedChunkRoot {
            node: root,
            offset,
            size: points.len() as u64,
        });
        Ok(())
    }

    /// Reloads all flushed chunk-root payloads and assembles the global
    /// tree below "r".
    fn assemble_root(&self, cube: &Aabb, roots_path: &Path) -> Result<Box<Node>, IndexError> {
        let mut roots = self.roots.lock().unwrap();
        roots.file.flush()?;
        let data = std::fs::read(roots_path)?;
        let flushed = std::mem::take(&mut roots.flushed);
        drop(roots);

        let mut nodes = Vec::with_capacity(flushed.len());
        for entry in flushed {
            let FlushedChunkRoot { mut node, offset, size } = entry;
            node.points = Some(data[offset as usize..(offset + size) as usize].to_vec());
            nodes.push(node);
        }

        if nodes.len() == 1 && nodes[0].name == "r" {
            return Ok(nodes.into_iter().next().unwrap());
        }

        let mut root = Box::new(Node::new("r".to_string(), *cube));
        for node in nodes {
            root.add_descendant(node);
        }
        Ok(root)
    }

    /// Recursive in-memory octree construction of one chunk.
    ///
    /// Counts the points into a Morton-ordered 32³ grid, reorders the
    /// buffer cell-wise with a counting sort, then cuts the summed
    /// pyramid into the coarsest cells that fit `max_points_per_node`.
    /// Oversized cells recurse; pathological duplicate clusters are
    /// tolerated or deduplicated.
    fn build_hierarchy(
        &self,
        node: &mut Node,
        points: Vec<u8>,
        num_points: u64,
    ) -> Result<(), IndexError> {
        self.note_depth(node.level() as u64);

        if num_points < self.max_points_per_node {
            node.index_start = 0;
            node.num_points = num_points;
            node.points = Some(points);
            return Ok(());
        }

        let bytes_per_point = self.attributes.bytes_per_point;
        let bounds = node.bounds;

        // counting
        let mut counters = vec![0u32; SUBDIVISION_GRID * SUBDIVISION_GRID * SUBDIVISION_GRID];
        for record in points.chunks_exact(bytes_per_point) {
            counters[self.subdivision_cell(record, &bounds)] += 1;
        }

        // cell-wise counting sort
        let mut cell_start = vec![0u64; counters.len() + 1];
        for (cell, &count) in counters.iter().enumerate() {
            cell_start[cell + 1] = cell_start[cell] + count as u64;
        }
        let mut write_heads = cell_start[..counters.len()].to_vec();
        let mut reordered = vec![0u8; points.len()];
        for record in points.chunks_exact(bytes_per_point) {
            let cell = self.subdivision_cell(record, &bounds);
            let target = write_heads[cell] as usize * bytes_per_point;
            reordered[target..target + bytes_per_point].copy_from_slice(record);
            write_heads[cell] += 1;
        }
        drop(points);

        let pyramid = pyramid_sum(&counters);
        let candidates =
            candidates_from_pyramid(&pyramid, &cell_start, self.max_points_per_node);

        let mut to_refine: Vec<Vec<u8>> = Vec::new();
        for candidate in &candidates {
            let realization = node.expand_to(&candidate.digits);
            realization.index_start = candidate.index_start;
            realization.num_points = candidate.num_points;
            let start = candidate.index_start as usize * bytes_per_point;
            let end = start + candidate.num_points as usize * bytes_per_point;
            realization.points = Some(reordered[start..end].to_vec());
            self.note_depth(realization.level() as u64);

            if candidate.num_points > self.max_points_per_node {
                to_refine.push(candidate.digits.clone());
            }
        }
        drop(reordered);

        for digits in to_refine {
            let subject = node.expand_to(&digits);
            let mut buffer = subject.points.take().unwrap_or_default();
            let mut count = subject.num_points;

            if count == num_points {
                // the subsplit did not separate anything: the cell is a
                // cluster of (near) identical positions
                let unique = count_unique_positions(&buffer, bytes_per_point);
                let duplicates = count - unique;

                if duplicates < self.max_points_per_node / 2 {
                    warn!(
                        "encountered unfavourable point distribution, conversion continues. \
                         #points in box: {count}, #unique: {unique}, node: {}",
                        subject.name
                    );
                    subject.points = Some(buffer);
                    continue;
                }

                let deduplicated = deduplicate_positions(&buffer, bytes_per_point);
                let kept = (deduplicated.len() / bytes_per_point) as u64;
                warn!(
                    "too many duplicate points, duplicates inside node {} will be dropped. \
                     #points: {count}, #unique: {kept}",
                    subject.name
                );
                self.dropped_points.fetch_add(count - kept, Ordering::Relaxed);
                buffer = deduplicated;
                count = kept;
            }

            subject.points = None;
            subject.num_points = 0;
            self.build_hierarchy(subject, buffer, count)?;
        }

        Ok(())
    }

    /// Morton index of a record in the 32³ subdivision grid of `bounds`.
    fn subdivision_cell(&self, record: &[u8], bounds: &Aabb) -> usize {
        let world = self.attributes.decode_position(record);
        let size = bounds.size();
        let g = SUBDIVISION_GRID as f64;
        let limit = SUBDIVISION_GRID as i64 - 1;

        let ix = ((g * (world.x - bounds.min.x) / size.x) as i64).clamp(0, limit) as u32;
        let iy = ((g * (world.y - bounds.min.y) / size.y) as i64).clamp(0, limit) as u32;
        let iz = ((g * (world.z - bounds.min.z) / size.z) as i64).clamp(0, limit) as u32;

        morton::encode_3d(iz, iy, ix) as usize
    }
}

#[derive(Clone, Debug)]
struct Candidate {
    digits: Vec<u8>,
    index_start: u64,
    num_points: u64,
}

/// Sums the Morton-ordered grid level-wise up to a single root cell.
/// `pyramid[0]` is the root, the last level is the input grid; the eight
/// children of cell `c` are the cells `8c..8c+8` one level deeper.
fn pyramid_sum(counters: &[u32]) -> Vec<Vec<u64>> {
    let mut levels = vec![counters.iter().map(|&c| c as u64).collect::<Vec<u64>>()];
    while levels.last().unwrap().len() > 1 {
        let finer = levels.last().unwrap();
        levels.push(finer.chunks(8).map(|block| block.iter().sum()).collect());
    }
    levels.reverse();
    levels
}

/// Cuts the pyramid into the coarsest cells that fit `max_points`.
/// Cells still over budget at the deepest level are emitted anyway and
/// handled by the caller's refinement path.
fn candidates_from_pyramid(
    pyramid: &[Vec<u64>],
    cell_start: &[u64],
    max_points: u64,
) -> Vec<Candidate> {
    let deepest = pyramid.len() - 1;
    let mut candidates = Vec::new();
    let mut stack: Vec<(usize, usize)> = vec![(0, 0)];

    while let Some((level, cell)) = stack.pop() {
        let count = pyramid[level][cell];
        if count == 0 {
            continue;
        }
        if count <= max_points || level == deepest {
            let mut digits = Vec::with_capacity(level);
            let mut c = cell;
            for _ in 0..level {
                digits.push((c & 0b111) as u8);
                c >>= 3;
            }
            digits.reverse();

            let first_fine_cell = cell << (3 * (deepest - level));
            candidates.push(Candidate {
                digits,
                index_start: cell_start[first_fine_cell],
                num_points: count,
            });
            continue;
        }
        for i in (0..8).rev() {
            stack.push((level + 1, cell * 8 + i));
        }
    }

    candidates
}

fn count_unique_positions(buffer: &[u8], bytes_per_point: usize) -> u64 {
    let mut seen = HashSet::new();
    for record in buffer.chunks_exact(bytes_per_point) {
        seen.insert(&record[0..12]);
    }
    seen.len() as u64
}

/// Keeps the first record of every distinct integer position.
fn deduplicate_positions(buffer: &[u8], bytes_per_point: usize) -> Vec<u8> {
    let mut seen: HashSet<[u8; 12]> = HashSet::new();
    let mut result = Vec::new();
    for record in buffer.chunks_exact(bytes_per_point) {
        let key: [u8; 12] = record[0..12].try_into().unwrap();
        if seen.insert(key) {
            result.extend_from_slice(record);
        }
    }
    result
}

/// Splits chunk files holding more than the refinement threshold into
/// sub-chunks by re-running the counting pyramid inside the chunk bounds.
fn refine_oversized_chunks(
    loaded: &mut LoadedChunks,
    target_dir: &Path,
    options: &IndexingOptions,
) -> Result<(), IndexError> {
    let bytes_per_point = loaded.attributes.bytes_per_point;
    let chunk_dir = target_dir.join("chunks");
    let mut result = Vec::new();

    for chunk in std::mem::take(&mut loaded.files) {
        let file_size = std::fs::metadata(&chunk.path)?.len();
        if file_size % bytes_per_point as u64 != 0 {
            return Err(IndexError::CorruptChunk(chunk.id.clone()));
        }
        let num_points = file_size / bytes_per_point as u64;
        if num_points <= options.refine_threshold {
            result.push(chunk);
            continue;
        }

        info!("refining large chunk file: {}", chunk.path.display());
        let buffer = std::fs::read(&chunk.path)?;
        let grid_size = 128;
        let mut counts = vec![0u32; grid_size * grid_size * grid_size];
        for record in buffer.chunks_exact(bytes_per_point) {
            let world = loaded.attributes.decode_position(record);
            let cell = clamped_cell_index(&world, &loaded.attributes, &chunk.bounds, grid_size);
            counts[cell] += 1;
        }

        let lut = LookupTable::create(&counts, grid_size, options.max_points_per_node);
        if lut.nodes.len() <= 1 {
            // nothing separates within this chunk, keep it as one piece
            result.push(chunk);
            continue;
        }

        let mut parts: Vec<Vec<u8>> = vec![Vec::new(); lut.nodes.len()];
        for record in buffer.chunks_exact(bytes_per_point) {
            let world = loaded.attributes.decode_position(record);
            let cell = clamped_cell_index(&world, &loaded.attributes, &chunk.bounds, grid_size);
            let part = lut
                .chunk_of(cell)
                .ok_or_else(|| IndexError::CorruptChunk(chunk.id.clone()))?;
            parts[part].extend_from_slice(record);
        }

        for (part, data) in parts.into_iter().enumerate() {
            if data.is_empty() {
                continue;
            }
            let id = format!("{}{}", chunk.id, &lut.nodes[part].id[1..]);
            let path = chunk_dir.join(format!("{id}.bin"));
            std::fs::write(&path, &data)?;
            result.push(ChunkFile {
                bounds: crate::chunking::chunk_bounds(&loaded.cube, &id),
                path,
                id,
            });
        }
        std::fs::remove_file(&chunk.path)?;
    }

    result.sort_by(|a, b| a.id.cmp(&b.id));
    loaded.files = result;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{Attribute, AttributeType};
    use nalgebra::{Point3, Vector3};

    #[test]
    fn pyramid_sums_up_to_root() {
        let mut counters = vec![0u32; 32 * 32 * 32];
        counters[0] = 10;
        counters[32767] = 20;
        let pyramid = pyramid_sum(&counters);
        assert_eq!(pyramid.len(), 6);
        assert_eq!(pyramid[0], vec![30]);
        assert_eq!(pyramid[1][0], 10);
        assert_eq!(pyramid[1][7], 20);
        assert_eq!(pyramid[5][32767], 20);
    }

    #[test]
    fn candidates_cut_at_coarsest_fitting_level() {
        let mut counters = vec![0u32; 32 * 32 * 32];
        counters[0] = 10;
        counters[32767] = 20;
        let pyramid = pyramid_sum(&counters);

        let mut cell_start = vec![0u64; counters.len() + 1];
        for (cell, &count) in counters.iter().enumerate() {
            cell_start[cell + 1] = cell_start[cell] + count as u64;
        }

        let candidates = candidates_from_pyramid(&pyramid, &cell_start, 15);
        assert_eq!(candidates.len(), 2);

        // the small cluster fits one level below the root
        assert_eq!(candidates[0].digits, vec![0]);
        assert_eq!(candidates[0].num_points, 10);
        assert_eq!(candidates[0].index_start, 0);

        // the large one never fits and surfaces at the deepest level
        assert_eq!(candidates[1].digits, vec![7, 7, 7, 7, 7]);
        assert_eq!(candidates[1].num_points, 20);
        assert_eq!(candidates[1].index_start, 10);
    }

    #[test]
    fn duplicate_counting_and_dedup() {
        let bytes_per_point = 16;
        let mut buffer = Vec::new();
        for position in [1i32, 1, 2, 1, 3] {
            let mut record = vec![0u8; bytes_per_point];
            record[0..4].copy_from_slice(&position.to_le_bytes());
            buffer.extend(record);
        }
        assert_eq!(count_unique_positions(&buffer, bytes_per_point), 3);

        let deduplicated = deduplicate_positions(&buffer, bytes_per_point);
        assert_eq!(deduplicated.len(), 3 * bytes_per_point);
        let first = i32::from_le_bytes(deduplicated[0..4].try_into().unwrap());
        assert_eq!(first, 1);
    }

    fn test_indexer(dir: &std::path::Path, max_points_per_node: u64) -> Indexer {
        let mut attributes =
            Attributes::new(vec![Attribute::new("position", AttributeType::Int32, 3)]);
        attributes.pos_scale = Vector3::new(0.001, 0.001, 0.001);
        attributes.pos_offset = Vector3::new(0.0, 0.0, 0.0);

        Indexer {
            attributes: attributes.clone(),
            writer: Arc::new(
                OctreeWriter::create(&dir.join("octree.bin"), attributes, Encoding::Default)
                    .unwrap(),
            ),
            flusher: Arc::new(
                HierarchyFlusher::new(dir.join(".hierarchyChunks"), 4).unwrap(),
            ),
            sampler: Box::new(PoissonSampler),
            spacing: 1.0 / 128.0,
            max_points_per_node,
            octree_depth: AtomicU64::new(0),
            dropped_points: AtomicU64::new(0),
            roots: Mutex::new(RootsState {
                file: File::create(dir.join("tmpChunkRoots.bin")).unwrap(),
                offset: 0,
                flushed: Vec::new(),
            }),
        }
    }

    fn encode_points(points: &[(f64, f64, f64)]) -> Vec<u8> {
        let mut buffer = Vec::new();
        for &(x, y, z) in points {
            buffer.extend_from_slice(&(((x / 0.001).round()) as i32).to_le_bytes());
            buffer.extend_from_slice(&(((y / 0.001).round()) as i32).to_le_bytes());
            buffer.extend_from_slice(&(((z / 0.001).round()) as i32).to_le_bytes());
        }
        buffer
    }

    #[test]
    fn build_hierarchy_splits_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = test_indexer(dir.path(), 50);

        // two spatial clusters of 40 points each force a subdivision into
        // one child per cluster
        let mut points = Vec::new();
        for i in 0..40 {
            points.push((0.1 + 0.0001 * i as f64, 0.1, 0.1));
            points.push((0.9 + 0.0001 * i as f64, 0.9, 0.9));
        }
        let buffer = encode_points(&points);

        let mut root = Node::new(
            "r".to_string(),
            crate::geometry::bounding_box::Aabb::new(
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 1.0),
            ),
        );
        indexer.build_hierarchy(&mut root, buffer, 80).unwrap();

        assert!(!root.is_leaf());
        assert!(root.points.is_none());
        assert_eq!(root.child_mask(), 0b1000_0001);

        let mut total = 0;
        let mut leaves = 0;
        root.traverse(&mut |node| {
            total += node.num_points;
            if node.points.is_some() {
                leaves += 1;
                assert!(node.num_points <= 50);
                // every point of a node lies inside its bounds
                let buffer = node.points.as_ref().unwrap();
                for record in buffer.chunks_exact(12) {
                    let world = indexer.attributes.decode_position(record);
                    assert!(node.bounds.contains(&world), "{world:?} outside {}", node.name);
                }
            }
        });
        assert_eq!(total, 80);
        assert_eq!(leaves, 2);
        assert!(indexer.octree_depth.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn build_hierarchy_small_input_is_a_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = test_indexer(dir.path(), 50);
        let buffer = encode_points(&[(0.5, 0.5, 0.5)]);

        let mut root = Node::new(
            "r".to_string(),
            crate::geometry::bounding_box::Aabb::new(
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 1.0),
            ),
        );
        indexer.build_hierarchy(&mut root, buffer, 1).unwrap();
        assert!(root.is_leaf());
        assert_eq!(root.num_points, 1);
    }
}
