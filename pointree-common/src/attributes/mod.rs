pub mod extractors;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Element type of a point attribute, named as it appears in the output
/// metadata.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float,
    Double,
    Undefined,
}

impl AttributeType {
    pub fn element_size(&self) -> usize {
        match self {
            AttributeType::Int8 | AttributeType::Uint8 => 1,
            AttributeType::Int16 | AttributeType::Uint16 => 2,
            AttributeType::Int32 | AttributeType::Uint32 | AttributeType::Float => 4,
            AttributeType::Int64 | AttributeType::Uint64 | AttributeType::Double => 8,
            AttributeType::Undefined => 0,
        }
    }

    /// Maps the data type id of a LAS Extra-Bytes record to the element
    /// type and element count. Ids 1..=10 are scalars, 11..=20 pairs,
    /// 21..=30 triples.
    pub fn from_extra_bytes_type(type_id: u8) -> Option<(AttributeType, usize)> {
        let kind = match type_id {
            0 => AttributeType::Undefined,
            1 | 11 | 21 => AttributeType::Uint8,
            2 | 12 | 22 => AttributeType::Int8,
            3 | 13 | 23 => AttributeType::Uint16,
            4 | 14 | 24 => AttributeType::Int16,
            5 | 15 | 25 => AttributeType::Uint32,
            6 | 16 | 26 => AttributeType::Int32,
            7 | 17 | 27 => AttributeType::Uint64,
            8 | 18 | 28 => AttributeType::Int64,
            9 | 19 | 29 => AttributeType::Float,
            10 | 20 | 30 => AttributeType::Double,
            _ => return None,
        };
        let num_elements = match type_id {
            0..=10 => 1,
            11..=20 => 2,
            _ => 3,
        };
        Some((kind, num_elements))
    }
}

/// A single named attribute of the output point record.
///
/// `min`/`max` and the histogram accumulate while points are distributed
/// and end up in the output metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub size: usize,
    pub num_elements: usize,
    pub element_size: usize,
    #[serde(rename = "type")]
    pub kind: AttributeType,
    #[serde(default = "unit_scale")]
    pub scale: [f64; 3],
    #[serde(default = "zero_offset")]
    pub offset: [f64; 3],
    #[serde(default = "stat_min")]
    pub min: [f64; 3],
    #[serde(default = "stat_max")]
    pub max: [f64; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub histogram: Option<Vec<u64>>,
}

fn unit_scale() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

fn zero_offset() -> [f64; 3] {
    [0.0, 0.0, 0.0]
}

fn stat_min() -> [f64; 3] {
    [f64::INFINITY; 3]
}

fn stat_max() -> [f64; 3] {
    [f64::NEG_INFINITY; 3]
}

impl Attribute {
    pub fn new(name: &str, kind: AttributeType, num_elements: usize) -> Self {
        let element_size = kind.element_size();
        let size = num_elements * element_size;
        Attribute {
            name: name.to_string(),
            description: String::new(),
            size,
            num_elements,
            element_size,
            kind,
            scale: unit_scale(),
            offset: zero_offset(),
            min: stat_min(),
            max: stat_max(),
            histogram: if size == 1 { Some(vec![0; 256]) } else { None },
        }
    }

    /// Folds one observed value of element `element` into the statistics.
    #[inline]
    pub fn record(&mut self, element: usize, value: f64) {
        self.min[element] = self.min[element].min(value);
        self.max[element] = self.max[element].max(value);
    }

    #[inline]
    pub fn record_byte(&mut self, byte: u8) {
        if let Some(histogram) = &mut self.histogram {
            histogram[byte as usize] += 1;
        }
    }

    /// Merges accumulated statistics of another copy of this attribute.
    pub fn merge_stats(&mut self, other: &Attribute) {
        for element in 0..3 {
            self.min[element] = self.min[element].min(other.min[element]);
            self.max[element] = self.max[element].max(other.max[element]);
        }
        if let (Some(own), Some(other)) = (&mut self.histogram, &other.histogram) {
            for (bin, count) in own.iter_mut().zip(other.iter()) {
                *bin += count;
            }
        }
    }
}

/// The ordered output schema plus the global position scale/offset.
/// Position is always the first attribute; the byte offset of every other
/// attribute is its prefix sum.
#[derive(Clone, Debug)]
pub struct Attributes {
    pub list: Vec<Attribute>,
    pub bytes_per_point: usize,
    pub pos_scale: Vector3<f64>,
    pub pos_offset: Vector3<f64>,
}

impl Attributes {
    pub fn new(list: Vec<Attribute>) -> Self {
        let bytes_per_point = list.iter().map(|a| a.size).sum();
        Attributes {
            list,
            bytes_per_point,
            pos_scale: Vector3::new(1.0, 1.0, 1.0),
            pos_offset: Vector3::new(0.0, 0.0, 0.0),
        }
    }

    pub fn offset_of(&self, name: &str) -> Option<usize> {
        let mut offset = 0;
        for attribute in &self.list {
            if attribute.name == name {
                return Some(offset);
            }
            offset += attribute.size;
        }
        None
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.list.iter().find(|a| a.name == name)
    }

    /// Decodes the integer position at the start of a point record back
    /// into world coordinates.
    #[inline]
    pub fn decode_position(&self, record: &[u8]) -> nalgebra::Point3<f64> {
        let x = i32::from_le_bytes(record[0..4].try_into().unwrap());
        let y = i32::from_le_bytes(record[4..8].try_into().unwrap());
        let z = i32::from_le_bytes(record[8..12].try_into().unwrap());
        nalgebra::Point3::new(
            x as f64 * self.pos_scale.x + self.pos_offset.x,
            y as f64 * self.pos_scale.y + self.pos_offset.y,
            z as f64 * self.pos_scale.z + self.pos_offset.z,
        )
    }

    /// Copy of the schema with cleared statistics, used as per-thread
    /// staging during distribution.
    pub fn fresh_stats(&self) -> Attributes {
        let mut copy = self.clone();
        for attribute in &mut copy.list {
            attribute.min = stat_min();
            attribute.max = stat_max();
            if let Some(histogram) = &mut attribute.histogram {
                histogram.iter_mut().for_each(|bin| *bin = 0);
            }
        }
        copy
    }

    /// Merges per-batch attribute statistics into this schema.
    /// Both sides must hold the same attribute list.
    pub fn merge_stats(&mut self, staged: &Attributes) {
        for (own, other) in self.list.iter_mut().zip(staged.list.iter()) {
            own.merge_stats(other);
        }
    }

    /// Log-friendly table of the schema: name, byte offset, size.
    pub fn describe(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let mut offset = 0;
        for attribute in &self.list {
            let _ = writeln!(out, "{:<30}{:>10}{:>8}", attribute.name, offset, attribute.size);
            offset += attribute.size;
        }
        let _ = writeln!(out, "bytes per point: {}", self.bytes_per_point);
        out
    }
}

/// Computes the global position scale/offset for the output.
///
/// The offset is the bounding box minimum (not the cube center) so that
/// all integer coordinates stay non-negative, and the scale per axis is
/// grown until the axis range fits in 30 bits.
pub fn compute_scale_offset(
    min: Vector3<f64>,
    max: Vector3<f64>,
    requested_scale: Vector3<f64>,
) -> (Vector3<f64>, Vector3<f64>) {
    let size = max - min;
    let limit = 2.0_f64.powi(30);
    let scale = Vector3::new(
        requested_scale.x.max(size.x / limit),
        requested_scale.y.max(size.y / limit),
        requested_scale.z.max(size.z / limit),
    );
    (scale, min)
}
