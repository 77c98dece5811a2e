use las::{Builder, Color, Point, Transform, Vector, Write as LasWrite, Writer};
use nalgebra::Point3;
use pointree_common::chunking::do_chunking;
use pointree_common::converter::{convert, ConverterOptions};
use pointree_common::encoding::Encoding;
use pointree_common::index::indexer::{do_indexing, IndexingOptions};
use pointree_common::las::{compute_output_attributes, curate_sources, scan_sources, SourceSummary};
use pointree_common::status::Status;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

const RECORD_SIZE: usize = 22;

fn las_header(format: u8, extra_bytes: u16, vlrs: Vec<las::Vlr>) -> las::Header {
    let mut builder = Builder::from((1, 4));
    let mut point_format = las::point::Format::new(format).unwrap();
    point_format.extra_bytes = extra_bytes;
    builder.point_format = point_format;
    builder.transforms = Vector {
        x: Transform {
            scale: 0.001,
            offset: 0.0,
        },
        y: Transform {
            scale: 0.001,
            offset: 0.0,
        },
        z: Transform {
            scale: 0.001,
            offset: 0.0,
        },
    };
    builder.vlrs = vlrs;
    builder.into_header().unwrap()
}

fn write_las(path: &Path, format: u8, points: impl Iterator<Item = Point>) {
    let header = las_header(format, 0, Vec::new());
    let mut writer = Writer::from_path(path, header).unwrap();
    for point in points {
        writer.write(point).unwrap();
    }
    writer.close().unwrap();
}

fn corner_points() -> Vec<Point> {
    let mut points = Vec::new();
    for i in 0..8 {
        points.push(Point {
            x: (i >> 2 & 1) as f64,
            y: (i >> 1 & 1) as f64,
            z: (i & 1) as f64,
            intensity: 100,
            classification: las::point::Classification::Ground,
            color: Some(Color::new(65535, 65535, 65535)),
            ..Default::default()
        });
    }
    points
}

fn parse_records(buffer: &[u8]) -> Vec<(u8, u8, u32, u64, u64)> {
    buffer
        .chunks_exact(RECORD_SIZE)
        .map(|record| {
            (
                record[0],
                record[1],
                u32::from_le_bytes(record[2..6].try_into().unwrap()),
                u64::from_le_bytes(record[6..14].try_into().unwrap()),
                u64::from_le_bytes(record[14..22].try_into().unwrap()),
            )
        })
        .collect()
}

/// 8 points at the corners of a unit cube collapse into a single leaf.
#[test]
fn smoke_eight_corners() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("corners.las");
    write_las(&input, 2, corner_points().into_iter());

    let outdir = dir.path().join("out");
    let options = ConverterOptions::new(vec![input], outdir.clone());
    convert(&options).unwrap();

    // format 2 output stride:
    // position 12 + intensity 2 + returns 2 + classification 1
    // + scan angle rank 1 + user data 1 + point source id 2 + rgb 6
    let stride: u64 = 27;

    let hierarchy = std::fs::read(outdir.join("hierarchy.bin")).unwrap();
    assert_eq!(hierarchy.len(), RECORD_SIZE);
    let records = parse_records(&hierarchy);
    let (node_type, child_mask, num_points, byte_offset, byte_size) = records[0];
    assert_eq!(node_type, 1, "single node must be a leaf");
    assert_eq!(child_mask, 0);
    assert_eq!(num_points, 8);
    assert_eq!(byte_offset, 0);
    assert_eq!(byte_size, 8 * stride);

    let octree = std::fs::read(outdir.join("octree.bin")).unwrap();
    assert_eq!(octree.len(), 8 * stride as usize);

    // every input point appears exactly once
    let mut positions: Vec<(i32, i32, i32)> = octree
        .chunks_exact(stride as usize)
        .map(|record| {
            (
                i32::from_le_bytes(record[0..4].try_into().unwrap()),
                i32::from_le_bytes(record[4..8].try_into().unwrap()),
                i32::from_le_bytes(record[8..12].try_into().unwrap()),
            )
        })
        .collect();
    positions.sort();
    let mut expected = Vec::new();
    for i in 0..8 {
        expected.push((
            (i >> 2 & 1) * 1000,
            (i >> 1 & 1) * 1000,
            (i & 1) * 1000,
        ));
    }
    expected.sort();
    assert_eq!(positions, expected);

    let metadata: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(outdir.join("metadata.json")).unwrap())
            .unwrap();
    assert_eq!(metadata["version"], "2.0");
    assert_eq!(metadata["points"], 8);
    assert_eq!(metadata["hierarchy"]["firstChunkSize"], 22);
    assert_eq!(metadata["hierarchy"]["stepSize"], 4);
    assert_eq!(metadata["boundingBox"]["min"][0], 0.0);
    assert_eq!(metadata["boundingBox"]["max"][0], 1.0);
    assert_eq!(metadata["encoding"], "DEFAULT");
    assert_eq!(metadata["attributes"][0]["name"], "position");
    // intermediate data is cleaned up
    assert!(!outdir.join("chunks").exists());
    assert!(!outdir.join("tmpChunkRoots.bin").exists());
}

fn pseudo_random_points(count: usize) -> impl Iterator<Item = Point> {
    let mut state = 0x2545f4914f6cdd1d_u64;
    (0..count).map(move |_| {
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 11) as f64 / (1u64 << 53) as f64
        };
        Point {
            x: next(),
            y: next(),
            z: next(),
            ..Default::default()
        }
    })
}

/// Walks all hierarchy chunks from the root, following proxies, and
/// returns every non-proxy record.
fn collect_hierarchy(buffer: &[u8], first_chunk_size: u64) -> Vec<(u8, u8, u32, u64, u64)> {
    let mut result = Vec::new();
    let mut chunks = vec![(0u64, first_chunk_size)];
    while let Some((offset, size)) = chunks.pop() {
        let chunk = &buffer[offset as usize..(offset + size) as usize];
        for record in parse_records(chunk) {
            if record.0 == 2 {
                assert_eq!(record.4 % RECORD_SIZE as u64, 0, "proxy target must be records");
                chunks.push((record.3, record.4));
            } else {
                result.push(record);
            }
        }
    }
    result
}

/// With a tiny node capacity the root must subdivide; all points stay
/// accounted for across the tree.
#[test]
fn subdivision_preserves_all_points() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("uniform.las");
    // pairs of points 1 mm apart: the pair partner always loses the
    // poisson sampling at the upper levels, so inner nodes keep children
    let paired = pseudo_random_points(2000).flat_map(|point| {
        let mut partner = Point {
            x: (point.x + 0.001).min(0.999),
            ..Default::default()
        };
        partner.y = point.y;
        partner.z = point.z;
        [point, partner]
    });
    write_las(&input, 0, paired);
    let outdir = dir.path().join("out");
    std::fs::create_dir_all(&outdir).unwrap();

    let (_, files) = curate_sources(&[input]).unwrap();
    let sources = scan_sources(&files).unwrap();
    let mut attributes = compute_output_attributes(&sources, &[]).unwrap();
    let summary = SourceSummary::compute(&sources).unwrap();
    let status = Arc::new(Status::new(summary.total_points));

    do_chunking(&sources, &outdir, &summary, &mut attributes, &status, 500).unwrap();

    let indexing = IndexingOptions {
        max_points_per_node: 500,
        name: "uniform".to_string(),
        ..IndexingOptions::default()
    };
    let metadata = do_indexing(&outdir, &indexing, &status).unwrap();
    assert_eq!(metadata.points, 4000);

    let hierarchy = std::fs::read(outdir.join("hierarchy.bin")).unwrap();
    let first_chunk_size = metadata.hierarchy.first_chunk_size;
    let records = collect_hierarchy(&hierarchy, first_chunk_size);

    // the root of the first chunk subdivided
    let root = parse_records(&hierarchy[..RECORD_SIZE])[0];
    assert_eq!(root.0, 0, "root must be a normal node");
    assert_ne!(root.1, 0, "root must have children");

    let total: u64 = records.iter().map(|r| r.2 as u64).sum();
    assert_eq!(total, 4000, "no point may get lost or duplicated");

    // byte ranges are disjoint and inside octree.bin
    let octree_len = std::fs::metadata(outdir.join("octree.bin")).unwrap().len();
    let mut ranges: Vec<(u64, u64)> = records
        .iter()
        .filter(|r| r.4 > 0)
        .map(|r| (r.3, r.4))
        .collect();
    ranges.sort();
    let mut cursor = 0;
    for (offset, size) in ranges {
        assert!(offset >= cursor, "overlapping byte ranges");
        cursor = offset + size;
        assert!(cursor <= octree_len);
    }
}

/// A large cluster of identical positions trips the duplicate guard;
/// the dropped copies disappear from the metadata count too.
#[test]
fn duplicate_cluster_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("dupes.las");
    let duplicates = (0..1200).map(|_| Point {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        ..Default::default()
    });
    let scattered = pseudo_random_points(50).map(|mut p| {
        // keep the scatter away from the duplicate corner
        p.x = 0.5 + p.x * 0.5;
        p.y = 0.5 + p.y * 0.5;
        p.z = 0.5 + p.z * 0.5;
        p
    });
    write_las(&input, 0, duplicates.chain(scattered));
    let outdir = dir.path().join("out");
    std::fs::create_dir_all(&outdir).unwrap();

    let (_, files) = curate_sources(&[input]).unwrap();
    let sources = scan_sources(&files).unwrap();
    let mut attributes = compute_output_attributes(&sources, &[]).unwrap();
    let summary = SourceSummary::compute(&sources).unwrap();
    let status = Arc::new(Status::new(summary.total_points));

    do_chunking(&sources, &outdir, &summary, &mut attributes, &status, 500).unwrap();
    let indexing = IndexingOptions {
        max_points_per_node: 500,
        name: "dupes".to_string(),
        ..IndexingOptions::default()
    };
    let metadata = do_indexing(&outdir, &indexing, &status).unwrap();

    // 1199 of the 1200 identical points are dropped
    assert_eq!(metadata.points, 51);

    let hierarchy = std::fs::read(outdir.join("hierarchy.bin")).unwrap();
    let records = collect_hierarchy(&hierarchy, metadata.hierarchy.first_chunk_size);
    let total: u64 = records.iter().map(|r| r.2 as u64).sum();
    assert_eq!(total, 51);
}

/// BROTLI payloads decompress to the morton-ordered streams.
#[test]
fn brotli_encoding_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("corners.las");
    write_las(&input, 2, corner_points().into_iter());

    let outdir = dir.path().join("out");
    let mut options = ConverterOptions::new(vec![input], outdir.clone());
    options.encoding = Encoding::Brotli;
    convert(&options).unwrap();

    let hierarchy = std::fs::read(outdir.join("hierarchy.bin")).unwrap();
    let (_, _, num_points, byte_offset, byte_size) = parse_records(&hierarchy)[0];
    assert_eq!(num_points, 8);

    let octree = std::fs::read(outdir.join("octree.bin")).unwrap();
    assert_eq!(octree.len() as u64, byte_size);

    let compressed = &octree[byte_offset as usize..(byte_offset + byte_size) as usize];
    let mut decompressed = Vec::new();
    brotli::Decompressor::new(compressed, 4096)
        .read_to_end(&mut decompressed)
        .unwrap();

    // streams per point: 16 position morton + 2 intensity + 1+1 returns
    // + 1 classification + 1 scan angle + 1 user data + 2 source id
    // + 8 rgb morton
    assert_eq!(decompressed.len(), 8 * 33);

    let metadata: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(outdir.join("metadata.json")).unwrap())
            .unwrap();
    assert_eq!(metadata["encoding"], "BROTLI");
}

fn extra_bytes_vlr() -> las::Vlr {
    // two extra attributes: one f32 scalar, one u16 triple
    let mut data = vec![0u8; 2 * 192];
    data[2] = 9; // f32
    data[4..15].copy_from_slice(b"temperature");
    data[192 + 2] = 23; // u16[3]
    data[192 + 4..192 + 7].copy_from_slice(b"tag");
    las::Vlr {
        user_id: "LASF_Spec".to_string(),
        record_id: 4,
        description: "Extra Bytes Records".to_string(),
        data,
    }
}

/// Attribute selection controls the output schema order; statistics in
/// the metadata match the input values.
#[test]
fn attribute_selection_and_stats() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("extra.las");

    let header = las_header(3, 10, vec![extra_bytes_vlr()]);
    let mut writer = Writer::from_path(&input, header).unwrap();
    for i in 0..4u16 {
        let mut extra = Vec::new();
        extra.extend_from_slice(&(i as f32 * 1.5).to_le_bytes());
        for element in 0..3u16 {
            extra.extend_from_slice(&(i * 10 + element).to_le_bytes());
        }
        writer
            .write(Point {
                x: i as f64 * 0.1,
                y: 0.2 + i as f64 * 0.1,
                z: 0.3 + i as f64 * 0.05,
                gps_time: Some(100.0 + i as f64),
                color: Some(Color::new(i * 100, 0, 0)),
                extra_bytes: extra,
                ..Default::default()
            })
            .unwrap();
    }
    writer.close().unwrap();

    let outdir = dir.path().join("out");
    let mut options = ConverterOptions::new(vec![input], outdir.clone());
    options.attributes = vec![
        "rgb".to_string(),
        "gps-time".to_string(),
        "temperature".to_string(),
        "tag".to_string(),
    ];
    convert(&options).unwrap();

    let metadata: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(outdir.join("metadata.json")).unwrap())
            .unwrap();
    let names: Vec<&str> = metadata["attributes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["position", "rgb", "gps-time", "temperature", "tag"]);

    let attributes = metadata["attributes"].as_array().unwrap();
    let gps = &attributes[2];
    assert_eq!(gps["min"][0], 100.0);
    assert_eq!(gps["max"][0], 103.0);
    let temperature = &attributes[3];
    assert_eq!(temperature["type"], "float");
    assert_eq!(temperature["min"][0], 0.0);
    assert_eq!(temperature["max"][0], 4.5);
    let tag = &attributes[4];
    assert_eq!(tag["numElements"], 3);
    assert_eq!(tag["max"][2], 32.0);

    // output stride: 12 position + 6 rgb + 8 gps + 4 f32 + 6 u16[3]
    let octree = std::fs::read(outdir.join("octree.bin")).unwrap();
    assert_eq!(octree.len(), 4 * 36);
}

/// Requesting an attribute no input carries is a user error.
#[test]
fn unknown_attribute_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("corners.las");
    write_las(&input, 2, corner_points().into_iter());

    let outdir = dir.path().join("out");
    let mut options = ConverterOptions::new(vec![input], outdir);
    options.attributes = vec!["nonexistent".to_string()];
    assert!(convert(&options).is_err());
}
