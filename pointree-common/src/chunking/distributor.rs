use crate::attributes::extractors::{build_extractors, Extractor};
use crate::attributes::Attributes;
use crate::chunking::counting::{batches, cell_index};
use crate::chunking::lut::LookupTable;
use crate::chunking::writer::ConcurrentWriter;
use crate::chunking::ChunkError;
use crate::geometry::bounding_box::Aabb;
use crate::las::FileSource;
use crate::status::Status;
use crate::utils::task_pool::TaskPool;
use las::Read;
use nalgebra::Point3;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Producers block while the writer backlog is above this size.
const MAX_PENDING_MB: u64 = 1024;

/// Pass 2: streams all input points again and routes each into the
/// append-only file of its chunk, while accumulating per-attribute
/// statistics.
pub fn distribute_points(
    sources: &[FileSource],
    target_dir: &Path,
    cube: &Aabb,
    lut: Arc<LookupTable>,
    attributes: &mut Attributes,
    status: &Arc<Status>,
) -> Result<(), ChunkError> {
    let num_threads = TaskPool::default_threads();
    let writer = Arc::new(ConcurrentWriter::new(num_threads));
    let master: Arc<Mutex<Attributes>> = Arc::new(Mutex::new(attributes.clone()));
    let error: Arc<Mutex<Option<ChunkError>>> = Arc::new(Mutex::new(None));
    let schema = Arc::new(attributes.clone());
    let chunk_dir = target_dir.join("chunks");
    let cube = *cube;

    // chunk file paths, precomputed once
    let paths: Arc<Vec<PathBuf>> = Arc::new(
        lut.nodes
            .iter()
            .map(|node| chunk_dir.join(format!("{}.bin", node.id)))
            .collect(),
    );

    let pool = TaskPool::new(num_threads);
    for (source, first, count) in batches(sources) {
        let extractors: Arc<Vec<Extractor>> =
            Arc::new(build_extractors(&schema, &source.extra));
        let lut = Arc::clone(&lut);
        let writer = Arc::clone(&writer);
        let master = Arc::clone(&master);
        let error = Arc::clone(&error);
        let schema = Arc::clone(&schema);
        let status = Arc::clone(status);
        let paths = Arc::clone(&paths);

        pool.add(move || {
            if error.lock().unwrap().is_some() {
                return;
            }
            let result = distribute_batch(
                &source, first, count, &schema, &cube, &lut, &extractors, &writer, &master,
                &status, &paths,
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

    let writer = Arc::try_unwrap(writer).unwrap_or_else(|_| unreachable!());
    writer.join()?;

    if let Some(error) = error.lock().unwrap().take() {
        return Err(error);
    }

    *attributes = Arc::try_unwrap(master)
        .unwrap_or_else(|_| unreachable!())
        .into_inner()
        .unwrap();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn distribute_batch(
    source: &FileSource,
    first: u64,
    count: u64,
    schema: &Attributes,
    cube: &Aabb,
    lut: &LookupTable,
    extractors: &[Extractor],
    writer: &ConcurrentWriter,
    master: &Mutex<Attributes>,
    status: &Status,
    paths: &[PathBuf],
) -> Result<(), ChunkError> {
    let bytes_per_point = schema.bytes_per_point;
    let mut staged = schema.fresh_stats();
    let mut buckets: Vec<Vec<u8>> = vec![Vec::new(); lut.nodes.len()];
    let mut record = vec![0u8; bytes_per_point];

    let mut reader = las::Reader::from_path(&source.path)?;
    reader.seek(first)?;

    for point in reader.points().take(count as usize) {
        let point = point?;
        let world = Point3::new(point.x, point.y, point.z);
        let cell = cell_index(&world, schema, cube, lut.grid_size)
            .ok_or(ChunkError::PointOutsideBounds(point.x, point.y, point.z))?;
        let chunk = lut
            .chunk_of(cell)
            .ok_or(ChunkError::PointOutsideBounds(point.x, point.y, point.z))?;

        record.iter_mut().for_each(|b| *b = 0);
        for extractor in extractors {
            let staged_attr = &mut staged.list[extractor.attribute_index];
            extractor.extract(&point, schema, &mut record, staged_attr);
        }
        buckets[chunk].extend_from_slice(&record);
    }

    for (chunk, bucket) in buckets.into_iter().enumerate() {
        if bucket.is_empty() {
            continue;
        }
        writer.write(paths[chunk].clone(), bucket);
    }

    master.lock().unwrap().merge_stats(&staged);
    status.add_points(count);
    status.add_bytes(count * source.record_len as u64);

    // throttle while the writer backlog is too large
    writer.wait_for_memory_threshold(MAX_PENDING_MB);
    Ok(())
}
