use crate::attributes::{compute_scale_offset, Attribute, AttributeType, Attributes};
use crate::geometry::bounding_box::Aabb;
use las::Read;
use log::warn;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bad LAS file: {0}")]
    Las(#[from] las::Error),

    #[error("no .las/.laz input files found at {0}")]
    NoInputFiles(PathBuf),

    #[error("currently unsupported LAS point format: {0}")]
    UnsupportedFormat(u8),

    #[error("unknown attribute requested: {0}")]
    UnknownAttribute(String),

    #[error("invalid bounding box. at least one axis has a size of zero.")]
    EmptyBoundingBox,
}

/// Header-level description of one input file.
#[derive(Clone, Debug)]
pub struct FileSource {
    pub path: PathBuf,
    pub filesize: u64,
    pub num_points: u64,
    pub point_format: u8,
    pub record_len: u16,
    pub min: Point3<f64>,
    pub max: Point3<f64>,
    pub scale: Vector3<f64>,
    /// Extra-Bytes attributes of this file, in VLR order.
    pub extra: Vec<Attribute>,
}

/// Union of all sources: bounds grown to a cube, total counts.
#[derive(Clone, Debug)]
pub struct SourceSummary {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
    pub cube: Aabb,
    pub total_points: u64,
    pub total_bytes: u64,
}

impl SourceSummary {
    pub fn compute(sources: &[FileSource]) -> Result<SourceSummary, ScanError> {
        let mut bounds = Aabb::empty();
        let mut total_points = 0;
        let mut total_bytes = 0;

        for source in sources {
            bounds.extend(&source.min);
            bounds.extend(&source.max);
            total_points += source.num_points;
            total_bytes += source.filesize;
        }

        let size = bounds.size();
        if size.x == 0.0 || size.y == 0.0 || size.z == 0.0 {
            return Err(ScanError::EmptyBoundingBox);
        }

        Ok(SourceSummary {
            min: bounds.min,
            max: bounds.max,
            cube: bounds.cube(),
            total_points,
            total_bytes,
        })
    }
}

fn is_las_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("las") || e.eq_ignore_ascii_case("laz"))
        .unwrap_or(false)
}

/// Expands the `--source` arguments into a flat file list. Directory
/// entries are scanned for `.las`/`.laz` files; everything else is taken
/// as-is. Also derives the default dataset name from the first file.
pub fn curate_sources(sources: &[PathBuf]) -> Result<(String, Vec<PathBuf>), ScanError> {
    let mut files = Vec::new();

    for source in sources {
        if source.is_dir() {
            let mut entries = Vec::new();
            for entry in std::fs::read_dir(source)? {
                let path = entry?.path();
                if path.is_file() && is_las_file(&path) {
                    entries.push(path);
                }
            }
            entries.sort();
            if entries.is_empty() {
                return Err(ScanError::NoInputFiles(source.clone()));
            }
            files.extend(entries);
        } else if source.is_file() {
            files.push(source.clone());
        } else {
            return Err(ScanError::NoInputFiles(source.clone()));
        }
    }

    if files.is_empty() {
        return Err(ScanError::NoInputFiles(PathBuf::new()));
    }

    let name = files[0]
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("pointcloud")
        .to_string();

    Ok((name, files))
}

/// Parses the Extra-Bytes VLR (record id 4) into attribute definitions.
/// Each attribute is described by one 192 byte record.
pub fn parse_extra_attributes(vlrs: &[las::Vlr]) -> Vec<Attribute> {
    const RECORD_SIZE: usize = 192;
    let mut attributes = Vec::new();

    for vlr in vlrs {
        if vlr.record_id != 4 {
            continue;
        }
        let data = &vlr.data;
        let num_records = data.len() / RECORD_SIZE;

        for i in 0..num_records {
            let record = &data[i * RECORD_SIZE..(i + 1) * RECORD_SIZE];
            let type_id = record[2];
            let options = record[3];
            let name = c_string(&record[4..36]);
            let description = c_string(&record[160..192]);

            let (kind, num_elements) = match AttributeType::from_extra_bytes_type(type_id) {
                Some(parsed) => parsed,
                None => {
                    warn!("skipping extra attribute {name:?} with unknown type id {type_id}");
                    continue;
                }
            };

            let mut attribute = Attribute::new(&name, kind, num_elements);
            attribute.description = description;
            if options & 0b01000 != 0 {
                for element in 0..3 {
                    let at = 112 + element * 8;
                    attribute.scale[element] =
                        f64::from_le_bytes(record[at..at + 8].try_into().unwrap());
                }
            }
            if options & 0b10000 != 0 {
                for element in 0..3 {
                    let at = 136 + element * 8;
                    attribute.offset[element] =
                        f64::from_le_bytes(record[at..at + 8].try_into().unwrap());
                }
            }
            attributes.push(attribute);
        }
    }

    attributes
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// The fixed output attribute list for one LAS point format, with the
/// file's extra attributes appended.
pub fn output_attributes_for_format(
    format: u8,
    extra: &[Attribute],
) -> Result<Vec<Attribute>, ScanError> {
    use AttributeType::*;

    let position = Attribute::new("position", Int32, 3);
    let intensity = Attribute::new("intensity", Uint16, 1);
    let return_number = Attribute::new("return number", Uint8, 1);
    let number_of_returns = Attribute::new("number of returns", Uint8, 1);
    let classification = Attribute::new("classification", Uint8, 1);
    let scan_angle_rank = Attribute::new("scan angle rank", Int8, 1);
    let scan_angle = Attribute::new("scan angle", Int16, 1);
    let user_data = Attribute::new("user data", Uint8, 1);
    let point_source_id = Attribute::new("point source id", Uint16, 1);
    let gps_time = Attribute::new("gps-time", Double, 1);
    let rgb = Attribute::new("rgb", Uint16, 3);
    let classification_flags = Attribute::new("classification flags", Uint8, 1);
    let wave_descriptor = Attribute::new("wave packet descriptor index", Uint8, 1);
    let wave_offset = Attribute::new("byte offset to waveform data", Uint64, 1);
    let wave_size = Attribute::new("waveform packet size", Uint32, 1);
    let wave_location = Attribute::new("return point waveform location", Float, 1);
    let xyzt = Attribute::new("XYZ(t)", Float, 3);

    let mut list = match format {
        0 => vec![
            position,
            intensity,
            return_number,
            number_of_returns,
            classification,
            scan_angle_rank,
            user_data,
            point_source_id,
        ],
        1 => vec![
            position,
            intensity,
            return_number,
            number_of_returns,
            classification,
            scan_angle_rank,
            user_data,
            point_source_id,
            gps_time,
        ],
        2 => vec![
            position,
            intensity,
            return_number,
            number_of_returns,
            classification,
            scan_angle_rank,
            user_data,
            point_source_id,
            rgb,
        ],
        3 => vec![
            position,
            intensity,
            return_number,
            number_of_returns,
            classification,
            scan_angle_rank,
            user_data,
            point_source_id,
            gps_time,
            rgb,
        ],
        4 => vec![
            position,
            intensity,
            return_number,
            number_of_returns,
            classification,
            scan_angle_rank,
            user_data,
            point_source_id,
            gps_time,
            wave_descriptor,
            wave_offset,
            wave_size,
            wave_location,
            xyzt,
        ],
        5 => vec![
            position,
            intensity,
            return_number,
            number_of_returns,
            classification,
            scan_angle_rank,
            user_data,
            point_source_id,
            gps_time,
            rgb,
            wave_descriptor,
            wave_offset,
            wave_size,
            wave_location,
            xyzt,
        ],
        6 => vec![
            position,
            intensity,
            return_number,
            number_of_returns,
            classification_flags,
            classification,
            user_data,
            scan_angle,
            point_source_id,
            gps_time,
        ],
        7 => vec![
            position,
            intensity,
            return_number,
            number_of_returns,
            classification_flags,
            classification,
            user_data,
            scan_angle,
            point_source_id,
            gps_time,
            rgb,
        ],
        other => return Err(ScanError::UnsupportedFormat(other)),
    };

    list.extend(extra.iter().cloned());
    Ok(list)
}

/// Reads the headers of all input files in parallel.
pub fn scan_sources(paths: &[PathBuf]) -> Result<Vec<FileSource>, ScanError> {
    paths
        .par_iter()
        .map(|path| {
            let reader = las::Reader::from_path(path)?;
            let header = reader.header();
            let bounds = header.bounds();
            let transforms = header.transforms();
            let format = header.point_format();

            Ok(FileSource {
                path: path.clone(),
                filesize: std::fs::metadata(path)?.len(),
                num_points: header.number_of_points(),
                point_format: format.to_u8()?,
                record_len: format.len(),
                min: Point3::new(bounds.min.x, bounds.min.y, bounds.min.z),
                max: Point3::new(bounds.max.x, bounds.max.y, bounds.max.z),
                scale: Vector3::new(
                    transforms.x.scale,
                    transforms.y.scale,
                    transforms.z.scale,
                ),
                extra: parse_extra_attributes(header.vlrs()),
            })
        })
        .collect()
}

/// Unifies the attribute schema over all sources and fits the global
/// position scale/offset.
///
/// Attributes are deduplicated by name, position first; extra attributes
/// keep their source order. A non-empty `requested` list filters the
/// result (position is always kept).
pub fn compute_output_attributes(
    sources: &[FileSource],
    requested: &[String],
) -> Result<Attributes, ScanError> {
    let mut full_list: Vec<Attribute> = Vec::new();
    let mut bounds = Aabb::empty();
    let mut scale_min = Vector3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY);

    for source in sources {
        for attribute in output_attributes_for_format(source.point_format, &source.extra)? {
            if !full_list.iter().any(|a| a.name == attribute.name) {
                full_list.push(attribute);
            }
        }
        bounds.extend(&source.min);
        bounds.extend(&source.max);
        scale_min.x = scale_min.x.min(source.scale.x);
        scale_min.y = scale_min.y.min(source.scale.y);
        scale_min.z = scale_min.z.min(source.scale.z);
    }

    let (scale, offset) = compute_scale_offset(bounds.min.coords, bounds.max.coords, scale_min);
    if scale != scale_min {
        warn!(
            "scale/offset were adjusted. new scale: [{}, {}, {}], new offset: [{}, {}, {}]",
            scale.x, scale.y, scale.z, offset.x, offset.y, offset.z
        );
    }

    let list = if requested.is_empty() {
        full_list
    } else {
        let mut names: Vec<&str> = vec!["position"];
        names.extend(requested.iter().map(|n| n.as_str()).filter(|n| *n != "position"));

        let mut filtered = Vec::new();
        for name in names {
            match full_list.iter().find(|a| a.name == name) {
                Some(attribute) => filtered.push(attribute.clone()),
                None => return Err(ScanError::UnknownAttribute(name.to_string())),
            }
        }
        filtered
    };

    let mut attributes = Attributes::new(list);
    attributes.pos_scale = scale;
    attributes.pos_offset = offset;
    Ok(attributes)
}
