use crate::attributes::{Attribute, AttributeType, Attributes};
use crate::geometry::bounding_box::Aabb;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

/// Top-level `metadata.json` document, as consumed by viewers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub version: String,
    pub name: String,
    pub description: String,
    pub points: u64,
    pub projection: String,
    pub hierarchy: HierarchyMetadata,
    pub offset: [f64; 3],
    pub scale: [f64; 3],
    pub spacing: f64,
    pub bounding_box: BoundingBoxMetadata,
    pub encoding: String,
    pub attributes: Vec<AttributeMetadata>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyMetadata {
    pub first_chunk_size: u64,
    pub step_size: u64,
    pub depth: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBoxMetadata {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttributeMetadata {
    pub name: String,
    pub description: String,
    pub size: usize,
    pub num_elements: usize,
    pub element_size: usize,
    #[serde(rename = "type")]
    pub kind: AttributeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub histogram: Option<Vec<u64>>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub scale: Vec<f64>,
    pub offset: Vec<f64>,
}

impl AttributeMetadata {
    fn of(attribute: &Attribute) -> AttributeMetadata {
        let n = attribute.num_elements.min(3);
        let histogram = match &attribute.histogram {
            Some(histogram)
                if attribute.size == 1 && histogram.iter().any(|&bin| bin != 0) =>
            {
                Some(histogram.clone())
            }
            _ => None,
        };
        AttributeMetadata {
            name: attribute.name.clone(),
            description: attribute.description.clone(),
            size: attribute.size,
            num_elements: attribute.num_elements,
            element_size: attribute.element_size,
            kind: attribute.kind,
            histogram,
            min: attribute.min[..n].to_vec(),
            max: attribute.max[..n].to_vec(),
            scale: attribute.scale[..n].to_vec(),
            offset: attribute.offset[..n].to_vec(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn build_metadata(
    name: &str,
    projection: &str,
    points: u64,
    hierarchy: HierarchyMetadata,
    attributes: &Attributes,
    bounds: &Aabb,
    spacing: f64,
    encoding: &str,
) -> Metadata {
    Metadata {
        version: "2.0".to_string(),
        name: name.to_string(),
        description: String::new(),
        points,
        projection: projection.to_string(),
        hierarchy,
        offset: attributes.pos_offset.into(),
        scale: attributes.pos_scale.into(),
        spacing,
        bounding_box: BoundingBoxMetadata {
            min: bounds.min.coords.into(),
            max: bounds.max.coords.into(),
        },
        encoding: encoding.to_string(),
        attributes: attributes.list.iter().map(AttributeMetadata::of).collect(),
    }
}

pub fn write_metadata(path: &Path, metadata: &Metadata) -> io::Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{Attribute, AttributeType};
    use nalgebra::{Point3, Vector3};

    fn sample_metadata() -> Metadata {
        let mut attributes = Attributes::new(vec![
            Attribute::new("position", AttributeType::Int32, 3),
            Attribute::new("classification", AttributeType::Uint8, 1),
        ]);
        attributes.pos_scale = Vector3::new(0.001, 0.001, 0.001);
        attributes.pos_offset = Vector3::new(1.0, 2.0, 3.0);
        attributes.list[1].record(0, 2.0);
        attributes.list[1].record_byte(2);

        build_metadata(
            "test cloud",
            "EPSG:25832",
            1234,
            HierarchyMetadata {
                first_chunk_size: 22,
                step_size: 4,
                depth: 3,
            },
            &attributes,
            &Aabb::new(Point3::new(1.0, 2.0, 3.0), Point3::new(2.0, 3.0, 4.0)),
            0.05,
            "DEFAULT",
        )
    }

    #[test]
    fn serializes_expected_keys() {
        let metadata = sample_metadata();
        let json = serde_json::to_string_pretty(&metadata).unwrap();

        for key in [
            "\"version\"",
            "\"name\"",
            "\"points\"",
            "\"projection\"",
            "\"hierarchy\"",
            "\"firstChunkSize\"",
            "\"stepSize\"",
            "\"depth\"",
            "\"offset\"",
            "\"scale\"",
            "\"spacing\"",
            "\"boundingBox\"",
            "\"encoding\"",
            "\"attributes\"",
            "\"numElements\"",
            "\"elementSize\"",
            "\"histogram\"",
        ] {
            assert!(json.contains(key), "missing key {key} in {json}");
        }
        assert!(json.contains("\"version\": \"2.0\""));
    }

    #[test]
    fn round_trip_is_stable() {
        let metadata = sample_metadata();
        let json = serde_json::to_string_pretty(&metadata).unwrap();
        let parsed: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, metadata);
        let rewritten = serde_json::to_string_pretty(&parsed).unwrap();
        assert_eq!(json, rewritten);
    }

    #[test]
    fn histogram_only_when_used() {
        let metadata = sample_metadata();
        // position has no histogram, classification has one
        assert!(metadata.attributes[0].histogram.is_none());
        assert_eq!(
            metadata.attributes[1].histogram.as_ref().unwrap()[2],
            1
        );
        // scalar attributes emit single element min/max
        assert_eq!(metadata.attributes[1].min.len(), 1);
        assert_eq!(metadata.attributes[0].min.len(), 3);
    }
}
