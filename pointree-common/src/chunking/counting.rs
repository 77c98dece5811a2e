use crate::attributes::Attributes;
use crate::chunking::ChunkError;
use crate::geometry::bounding_box::Aabb;
use crate::las::FileSource;
use crate::status::Status;
use crate::utils::task_pool::TaskPool;
use las::Read;
use nalgebra::Point3;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Number of points one counting/distribution task processes.
pub const BATCH_SIZE: u64 = 1_000_000;

/// Counting grid resolution by total point count.
pub fn grid_size_for(total_points: u64) -> usize {
    if total_points < 100_000_000 {
        128
    } else if total_points < 500_000_000 {
        256
    } else {
        512
    }
}

/// Computes the counting-grid cell of a world-space position.
///
/// The position is first snapped to the output integer grid so that the
/// cell matches what a reader of the converted data would compute.
/// Returns None for points outside the cube, which is fatal for the
/// caller.
pub fn cell_index(
    world: &Point3<f64>,
    attributes: &Attributes,
    cube: &Aabb,
    grid_size: usize,
) -> Option<usize> {
    if !cube.contains(world) {
        return None;
    }
    Some(clamped_cell_index(world, attributes, cube, grid_size))
}

/// Like [cell_index], but clamps positions into the bounds instead of
/// rejecting them. Used when re-partitioning a chunk, where coordinate
/// snapping may put a raw position just outside the chunk cell.
pub fn clamped_cell_index(
    world: &Point3<f64>,
    attributes: &Attributes,
    bounds: &Aabb,
    grid_size: usize,
) -> usize {
    let scale = attributes.pos_scale;
    let offset = attributes.pos_offset;
    let size = bounds.size();
    let g = grid_size as f64;

    let x = ((world.x - offset.x) / scale.x).round() * scale.x + offset.x;
    let y = ((world.y - offset.y) / scale.y).round() * scale.y + offset.y;
    let z = ((world.z - offset.z) / scale.z).round() * scale.z + offset.z;

    let ux = (x - bounds.min.x) / size.x;
    let uy = (y - bounds.min.y) / size.y;
    let uz = (z - bounds.min.z) / size.z;

    let limit = grid_size as i64 - 1;
    let ix = ((g * ux).floor() as i64).clamp(0, limit) as usize;
    let iy = ((g * uy).floor() as i64).clamp(0, limit) as usize;
    let iz = ((g * uz).floor() as i64).clamp(0, limit) as usize;

    ix + iy * grid_size + iz * grid_size * grid_size
}

/// Splits the sources into batches of [BATCH_SIZE] points.
pub fn batches(sources: &[FileSource]) -> Vec<(FileSource, u64, u64)> {
    let mut result = Vec::new();
    for source in sources {
        let mut first = 0;
        while first < source.num_points {
            let count = BATCH_SIZE.min(source.num_points - first);
            result.push((source.clone(), first, count));
            first += count;
        }
    }
    result
}

/// Pass 1: counts all input points into a uniform grid of atomic
/// counters.
pub struct CountingGrid {
    pub grid_size: usize,
    counters: Vec<AtomicU32>,
}

impl CountingGrid {
    pub fn count(
        sources: &[FileSource],
        attributes: &Attributes,
        cube: &Aabb,
        grid_size: usize,
        status: &Arc<Status>,
    ) -> Result<CountingGrid, ChunkError> {
        let counters: Arc<Vec<AtomicU32>> = Arc::new(
            (0..grid_size * grid_size * grid_size)
                .map(|_| AtomicU32::new(0))
                .collect(),
        );
        let error: Arc<Mutex<Option<ChunkError>>> = Arc::new(Mutex::new(None));
        let attributes = Arc::new(attributes.clone());
        let cube = *cube;

        let pool = TaskPool::new(TaskPool::default_threads());
        for (source, first, count) in batches(sources) {
            let counters = Arc::clone(&counters);
            let error = Arc::clone(&error);
            let attributes = Arc::clone(&attributes);
            let status = Arc::clone(status);

            pool.add(move || {
                if error.lock().unwrap().is_some() {
                    return;
                }
                let result = count_batch(
                    &source,
                    first,
                    count,
                    &attributes,
                    &cube,
                    grid_size,
                    &counters,
                    &status,
                );
                if let Err(e) = result {
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

        let counters = Arc::try_unwrap(counters).unwrap_or_else(|_| unreachable!());
        Ok(CountingGrid {
            grid_size,
            counters,
        })
    }

    /// Snapshot of the counters; only meaningful after all workers joined.
    pub fn counts(&self) -> Vec<u32> {
        self.counters
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
fn count_batch(
    source: &FileSource,
    first: u64,
    count: u64,
    attributes: &Attributes,
    cube: &Aabb,
    grid_size: usize,
    counters: &[AtomicU32],
    status: &Status,
) -> Result<(), ChunkError> {
    let mut reader = las::Reader::from_path(&source.path)?;
    reader.seek(first)?;

    for point in reader.points().take(count as usize) {
        let point = point?;
        let world = Point3::new(point.x, point.y, point.z);
        let index = cell_index(&world, attributes, cube, grid_size)
            .ok_or(ChunkError::PointOutsideBounds(point.x, point.y, point.z))?;
        counters[index].fetch_add(1, Ordering::Relaxed);
    }

    status.add_points(count);
    status.add_bytes(count * source.record_len as u64);
    Ok(())
}
