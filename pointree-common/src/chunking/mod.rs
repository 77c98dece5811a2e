pub mod counting;
pub mod distributor;
pub mod lut;
pub mod writer;

use crate::attributes::{Attribute, Attributes};
use crate::geometry::bounding_box::Aabb;
use crate::las::{FileSource, SourceSummary};
use crate::status::Status;
use counting::CountingGrid;
use log::info;
use lut::LookupTable;
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Default upper bound on points per chunk and per octree leaf.
pub const MAX_POINTS_PER_CHUNK: u64 = 5_000_000;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bad LAS file: {0}")]
    Las(#[from] las::Error),

    #[error("point ({0}, {1}, {2}) is outside of the declared bounding box")]
    PointOutsideBounds(f64, f64, f64),

    #[error("bad chunk metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Schema descriptor that bridges pass 2 and pass 3 on disk, stored as
/// `chunks/metadata.json`.
#[derive(Serialize, Deserialize)]
struct ChunkMetadata {
    min: [f64; 3],
    max: [f64; 3],
    attributes: Vec<Attribute>,
    scale: [f64; 3],
    offset: [f64; 3],
}

/// Passes 1 and 2: counts points into the grid, derives the chunk lookup
/// table and distributes all points into per-chunk files under
/// `<target_dir>/chunks/`. Attribute statistics accumulate into
/// `attributes`.
pub fn do_chunking(
    sources: &[FileSource],
    target_dir: &Path,
    summary: &SourceSummary,
    attributes: &mut Attributes,
    status: &Arc<Status>,
    max_points_per_chunk: u64,
) -> Result<(), ChunkError> {
    let chunk_dir = target_dir.join("chunks");
    std::fs::create_dir_all(&chunk_dir)?;
    for entry in std::fs::read_dir(&chunk_dir)? {
        std::fs::remove_file(entry?.path())?;
    }

    let grid_size = counting::grid_size_for(summary.total_points);
    info!("counting grid size: {grid_size}");

    status.begin_pass(1, "COUNTING");
    let grid = CountingGrid::count(sources, attributes, &summary.cube, grid_size, status)?;

    let lut = LookupTable::create(&grid.counts(), grid_size, max_points_per_chunk);
    info!("#chunks: {}", lut.nodes.len());

    status.begin_pass(2, "DISTRIBUTING");
    distributor::distribute_points(
        sources,
        target_dir,
        &summary.cube,
        Arc::new(lut),
        attributes,
        status,
    )?;

    write_chunk_metadata(&chunk_dir.join("metadata.json"), &summary.cube, attributes)?;
    Ok(())
}

fn write_chunk_metadata(
    path: &Path,
    cube: &Aabb,
    attributes: &Attributes,
) -> Result<(), ChunkError> {
    let metadata = ChunkMetadata {
        min: cube.min.coords.into(),
        max: cube.max.coords.into(),
        attributes: attributes.list.clone(),
        scale: attributes.pos_scale.into(),
        offset: attributes.pos_offset.into(),
    };
    let json = serde_json::to_string_pretty(&metadata)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// One chunk file on disk, with its octree cell bounds.
#[derive(Clone, Debug)]
pub struct ChunkFile {
    pub path: PathBuf,
    pub id: String,
    pub bounds: Aabb,
}

/// The chunk directory as read back at the start of pass 3.
pub struct LoadedChunks {
    pub cube: Aabb,
    pub attributes: Attributes,
    pub files: Vec<ChunkFile>,
}

/// Reads `chunks/metadata.json` and enumerates the chunk files written by
/// pass 2. Chunk bounds are recovered by descending the cube along the
/// octant digits of the file name.
pub fn load_chunks(target_dir: &Path) -> Result<LoadedChunks, ChunkError> {
    let chunk_dir = target_dir.join("chunks");
    let json = std::fs::read_to_string(chunk_dir.join("metadata.json"))?;
    let metadata: ChunkMetadata = serde_json::from_str(&json)?;

    let cube = Aabb::new(
        Point3::new(metadata.min[0], metadata.min[1], metadata.min[2]),
        Point3::new(metadata.max[0], metadata.max[1], metadata.max[2]),
    );
    let mut attributes = Attributes::new(metadata.attributes);
    attributes.pos_scale = Vector3::new(metadata.scale[0], metadata.scale[1], metadata.scale[2]);
    attributes.pos_offset =
        Vector3::new(metadata.offset[0], metadata.offset[1], metadata.offset[2]);

    let mut files = Vec::new();
    for entry in std::fs::read_dir(&chunk_dir)? {
        let path = entry?.path();
        let is_bin = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("bin"))
            .unwrap_or(false);
        if !is_bin {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        files.push(ChunkFile {
            bounds: chunk_bounds(&cube, &id),
            path,
            id,
        });
    }
    files.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(LoadedChunks {
        cube,
        attributes,
        files,
    })
}

/// Bounds of the octree cell named by `id` within the root cube.
pub fn chunk_bounds(cube: &Aabb, id: &str) -> Aabb {
    let mut bounds = *cube;
    for digit in id.chars().skip(1) {
        let index = digit as usize - '0' as usize;
        bounds = bounds.child(index);
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeType;

    #[test]
    fn chunk_bounds_follow_name_digits() {
        let cube = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(8.0, 8.0, 8.0));
        assert_eq!(chunk_bounds(&cube, "r"), cube);
        assert_eq!(
            chunk_bounds(&cube, "r4"),
            Aabb::new(Point3::new(4.0, 0.0, 0.0), Point3::new(8.0, 4.0, 4.0))
        );
        assert_eq!(
            chunk_bounds(&cube, "r40"),
            Aabb::new(Point3::new(4.0, 0.0, 0.0), Point3::new(6.0, 2.0, 2.0))
        );
    }

    #[test]
    fn chunk_metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cube = Aabb::new(Point3::new(1.0, 2.0, 3.0), Point3::new(11.0, 12.0, 13.0));
        let mut attributes = Attributes::new(vec![
            Attribute::new("position", AttributeType::Int32, 3),
            Attribute::new("classification", AttributeType::Uint8, 1),
        ]);
        attributes.pos_scale = Vector3::new(0.001, 0.001, 0.001);
        attributes.pos_offset = Vector3::new(1.0, 2.0, 3.0);
        attributes.list[1].record(0, 2.0);
        attributes.list[1].record_byte(2);

        let chunk_dir = dir.path().join("chunks");
        std::fs::create_dir_all(&chunk_dir).unwrap();
        write_chunk_metadata(&chunk_dir.join("metadata.json"), &cube, &attributes).unwrap();
        std::fs::write(chunk_dir.join("r.bin"), [0u8; 15]).unwrap();

        let loaded = load_chunks(dir.path()).unwrap();
        assert_eq!(loaded.cube, cube);
        assert_eq!(loaded.attributes.bytes_per_point, 13);
        assert_eq!(loaded.attributes.pos_offset, attributes.pos_offset);
        assert_eq!(loaded.attributes.list[1].min[0], 2.0);
        assert_eq!(loaded.attributes.list[1].histogram.as_ref().unwrap()[2], 1);
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files[0].id, "r");
        assert_eq!(loaded.files[0].bounds, cube);
    }
}
