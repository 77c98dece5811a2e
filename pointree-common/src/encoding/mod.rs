use crate::attributes::Attributes;
use crate::geometry::morton;
use std::io::Cursor;
use thiserror::Error;

/// Output encoding of node payloads in `octree.bin`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Encoding {
    Default,
    Brotli,
    Uncompressed,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Default => "DEFAULT",
            Encoding::Brotli => "BROTLI",
            Encoding::Uncompressed => "UNCOMPRESSED",
        }
    }
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("failed to compress node payload: {0}")]
    Compression(#[from] std::io::Error),
}

const BROTLI_QUALITY: i32 = 6;

/// Reorders a node payload attribute-stream-wise along the Morton curve
/// and compresses it.
///
/// Streams, concatenated in schema order: 16 byte Morton codes for the
/// position, 8 byte Morton codes for rgb, and every other attribute in
/// its raw layout, all in Morton point order.
pub fn compress_node(
    points: &[u8],
    num_points: u64,
    attributes: &Attributes,
) -> Result<Vec<u8>, EncodeError> {
    let reordered = morton_ordered_streams(points, num_points, attributes);
    let mut output = Vec::with_capacity(reordered.len() / 2);
    let params = brotli::enc::BrotliEncoderParams {
        quality: BROTLI_QUALITY,
        ..Default::default()
    };
    brotli::BrotliCompress(&mut Cursor::new(&reordered), &mut output, &params)?;
    Ok(output)
}

struct MortonCode {
    upper: u64,
    lower: u64,
    index: usize,
}

/// Builds the concatenated attribute streams in Morton point order.
fn morton_ordered_streams(points: &[u8], num_points: u64, attributes: &Attributes) -> Vec<u8> {
    let num_points = num_points as usize;
    let bytes_per_point = attributes.bytes_per_point;

    // relative integer coordinates, so the codes use the full precision
    let mut coordinates = Vec::with_capacity(num_points);
    let mut min = [i32::MAX; 3];
    let position_offset = attributes.offset_of("position").unwrap_or(0);
    for i in 0..num_points {
        let record = &points[i * bytes_per_point + position_offset..];
        let x = i32::from_le_bytes(record[0..4].try_into().unwrap());
        let y = i32::from_le_bytes(record[4..8].try_into().unwrap());
        let z = i32::from_le_bytes(record[8..12].try_into().unwrap());
        min[0] = min[0].min(x);
        min[1] = min[1].min(y);
        min[2] = min[2].min(z);
        coordinates.push([x, y, z]);
    }

    let mut codes: Vec<MortonCode> = coordinates
        .iter()
        .enumerate()
        .map(|(index, c)| {
            let x = (c[0] - min[0]) as u32;
            let y = (c[1] - min[1]) as u32;
            let z = (c[2] - min[2]) as u32;
            // interleave the 16 bit halves separately so that no
            // precision is lost for coordinates above 21 bits
            let lower = morton::encode_3d(x & 0xffff, y & 0xffff, z & 0xffff);
            let upper = morton::encode_3d(x >> 16, y >> 16, z >> 16);
            MortonCode {
                upper,
                lower,
                index,
            }
        })
        .collect();
    codes.sort_by(|a, b| (a.upper, a.lower).cmp(&(b.upper, b.lower)));

    let mut merged = Vec::with_capacity(points.len() + 24 * num_points);

    let mut attribute_offset = 0;
    for attribute in &attributes.list {
        match attribute.name.as_str() {
            "position" => {
                for code in &codes {
                    merged.extend_from_slice(&code.upper.to_le_bytes());
                    merged.extend_from_slice(&code.lower.to_le_bytes());
                }
            }
            "rgb" => {
                for code in &codes {
                    let record = &points[code.index * bytes_per_point + attribute_offset..];
                    let r = u16::from_le_bytes(record[0..2].try_into().unwrap());
                    let g = u16::from_le_bytes(record[2..4].try_into().unwrap());
                    let b = u16::from_le_bytes(record[4..6].try_into().unwrap());
                    let code = morton::encode_3d(r as u32, g as u32, b as u32);
                    merged.extend_from_slice(&code.to_le_bytes());
                }
            }
            _ => {
                for code in &codes {
                    let record = &points[code.index * bytes_per_point + attribute_offset..];
                    merged.extend_from_slice(&record[..attribute.size]);
                }
            }
        }
        attribute_offset += attribute.size;
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{Attribute, AttributeType, Attributes};

    fn rgb_attributes() -> Attributes {
        Attributes::new(vec![
            Attribute::new("position", AttributeType::Int32, 3),
            Attribute::new("intensity", AttributeType::Uint16, 1),
            Attribute::new("rgb", AttributeType::Uint16, 3),
        ])
    }

    fn record(x: i32, y: i32, z: i32, intensity: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&x.to_le_bytes());
        out.extend_from_slice(&y.to_le_bytes());
        out.extend_from_slice(&z.to_le_bytes());
        out.extend_from_slice(&intensity.to_le_bytes());
        out.extend_from_slice(&[0u8; 6]);
        out
    }

    #[test]
    fn stream_layout_and_order() {
        let attributes = rgb_attributes();
        // two points, the second is closer to the node minimum
        let mut points = record(1000, 1000, 1000, 1);
        points.extend(record(2, 2, 2, 2));

        let streams = morton_ordered_streams(&points, 2, &attributes);
        // 16 bytes position codes + 2 bytes intensity + 8 bytes rgb codes, per point
        assert_eq!(streams.len(), 2 * (16 + 2 + 8));

        // morton order puts the near-minimum point first; its relative
        // coordinates are zero, so its code is zero
        assert_eq!(&streams[0..16], &[0u8; 16]);

        // intensity stream follows all position codes, in the new order
        let intensity = &streams[32..36];
        assert_eq!(
            intensity,
            &[2u8, 0, 1, 0],
            "intensity stream must follow morton order"
        );
    }

    #[test]
    fn compressed_payload_is_smaller_for_redundant_input() {
        let attributes = rgb_attributes();
        let mut points = Vec::new();
        for i in 0..1000 {
            points.extend(record(i, i, i, 7));
        }
        let compressed = compress_node(&points, 1000, &attributes).unwrap();
        assert!(!compressed.is_empty());
        assert!(compressed.len() < points.len());
    }

    #[test]
    fn decompression_recovers_the_streams_bytewise() {
        use std::io::Read;

        let attributes = rgb_attributes();
        let mut points = Vec::new();
        for i in 0..100 {
            points.extend(record(i * 3, 500 - i, i * i, i as u16));
        }

        let streams = morton_ordered_streams(&points, 100, &attributes);
        let compressed = compress_node(&points, 100, &attributes).unwrap();

        let mut decompressed = Vec::new();
        brotli::Decompressor::new(compressed.as_slice(), 4096)
            .read_to_end(&mut decompressed)
            .unwrap();
        assert_eq!(decompressed, streams);
    }
}
