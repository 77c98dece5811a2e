use super::{Attribute, AttributeType, Attributes};

/// Which las point field an output attribute is fed from.
#[derive(Clone, Debug, PartialEq)]
pub enum Field {
    Position,
    Intensity,
    ReturnNumber,
    NumberOfReturns,
    Classification,
    ScanAngleRank,
    ScanAngle,
    UserData,
    PointSourceId,
    GpsTime,
    ClassificationFlags,
    Rgb,
    WavePacketDescriptorIndex,
    ByteOffsetToWaveformData,
    WaveformPacketSize,
    ReturnPointWaveformLocation,
    Xyzt,
    /// Extra-Bytes attribute, copied from the source point's extra data.
    ExtraBytes { source_offset: usize },
    /// Attribute that this particular source file does not carry.
    /// The output bytes stay zero.
    Missing,
}

/// One entry of the attribute handler table. Built once per source file
/// after the schema is unified; copies the typed value into the output
/// record at `offset` and folds it into the staged statistics.
#[derive(Clone, Debug)]
pub struct Extractor {
    pub attribute_index: usize,
    pub offset: usize,
    pub size: usize,
    pub num_elements: usize,
    pub element_size: usize,
    pub kind: AttributeType,
    pub field: Field,
}

fn field_for_name(name: &str) -> Option<Field> {
    let field = match name {
        "position" => Field::Position,
        "intensity" => Field::Intensity,
        "return number" => Field::ReturnNumber,
        "number of returns" => Field::NumberOfReturns,
        "classification" => Field::Classification,
        "scan angle rank" => Field::ScanAngleRank,
        "scan angle" => Field::ScanAngle,
        "user data" => Field::UserData,
        "point source id" => Field::PointSourceId,
        "gps-time" => Field::GpsTime,
        "classification flags" => Field::ClassificationFlags,
        "rgb" => Field::Rgb,
        "wave packet descriptor index" => Field::WavePacketDescriptorIndex,
        "byte offset to waveform data" => Field::ByteOffsetToWaveformData,
        "waveform packet size" => Field::WaveformPacketSize,
        "return point waveform location" => Field::ReturnPointWaveformLocation,
        "XYZ(t)" => Field::Xyzt,
        _ => return None,
    };
    Some(field)
}

/// Builds the handler table for one source file.
///
/// `input_extra` is the Extra-Bytes attribute list of that file, in VLR
/// order; it determines the byte offsets within the source point's extra
/// data, which may differ from the unified output schema when attributes
/// were filtered or come from other files.
pub fn build_extractors(output: &Attributes, input_extra: &[Attribute]) -> Vec<Extractor> {
    let mut extractors = Vec::with_capacity(output.list.len());
    let mut offset = 0;

    for (attribute_index, attribute) in output.list.iter().enumerate() {
        let field = match field_for_name(&attribute.name) {
            Some(field) => field,
            None => {
                let mut source_offset = 0;
                let mut found = None;
                for extra in input_extra {
                    if extra.name == attribute.name {
                        found = Some(Field::ExtraBytes { source_offset });
                        break;
                    }
                    source_offset += extra.size;
                }
                found.unwrap_or(Field::Missing)
            }
        };

        extractors.push(Extractor {
            attribute_index,
            offset,
            size: attribute.size,
            num_elements: attribute.num_elements,
            element_size: attribute.element_size,
            kind: attribute.kind,
            field,
        });
        offset += attribute.size;
    }

    extractors
}

#[inline]
fn read_element(bytes: &[u8], kind: AttributeType) -> f64 {
    match kind {
        AttributeType::Int8 => bytes[0] as i8 as f64,
        AttributeType::Uint8 => bytes[0] as f64,
        AttributeType::Int16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f64,
        AttributeType::Uint16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
        AttributeType::Int32 => i32::from_le_bytes(bytes[0..4].try_into().unwrap()) as f64,
        AttributeType::Uint32 => u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as f64,
        AttributeType::Int64 => i64::from_le_bytes(bytes[0..8].try_into().unwrap()) as f64,
        AttributeType::Uint64 => u64::from_le_bytes(bytes[0..8].try_into().unwrap()) as f64,
        AttributeType::Float => f32::from_le_bytes(bytes[0..4].try_into().unwrap()) as f64,
        AttributeType::Double => f64::from_le_bytes(bytes[0..8].try_into().unwrap()),
        AttributeType::Undefined => 0.0,
    }
}

impl Extractor {
    /// Fills this attribute's bytes of `record` from the decoded point and
    /// updates the staged statistics.
    pub fn extract(
        &self,
        point: &las::Point,
        attributes: &Attributes,
        record: &mut [u8],
        staged: &mut Attribute,
    ) {
        let out = &mut record[self.offset..self.offset + self.size];
        match &self.field {
            Field::Position => {
                let scale = attributes.pos_scale;
                let offset = attributes.pos_offset;
                let x = ((point.x - offset.x) / scale.x).round() as i32;
                let y = ((point.y - offset.y) / scale.y).round() as i32;
                let z = ((point.z - offset.z) / scale.z).round() as i32;
                out[0..4].copy_from_slice(&x.to_le_bytes());
                out[4..8].copy_from_slice(&y.to_le_bytes());
                out[8..12].copy_from_slice(&z.to_le_bytes());
                staged.record(0, point.x);
                staged.record(1, point.y);
                staged.record(2, point.z);
            }
            Field::Intensity => {
                out.copy_from_slice(&point.intensity.to_le_bytes());
                staged.record(0, point.intensity as f64);
            }
            Field::ReturnNumber => {
                out[0] = point.return_number;
                staged.record(0, point.return_number as f64);
                staged.record_byte(point.return_number);
            }
            Field::NumberOfReturns => {
                out[0] = point.number_of_returns;
                staged.record(0, point.number_of_returns as f64);
                staged.record_byte(point.number_of_returns);
            }
            Field::Classification => {
                let classification = u8::from(point.classification);
                out[0] = classification;
                staged.record(0, classification as f64);
                staged.record_byte(classification);
            }
            Field::ScanAngleRank => {
                let rank = point.scan_angle.round() as i8;
                out[0] = rank as u8;
                staged.record(0, rank as f64);
                staged.record_byte(rank as u8);
            }
            Field::ScanAngle => {
                // extended formats store the angle in 0.006 degree steps
                let angle = (point.scan_angle / 0.006).round() as i16;
                out.copy_from_slice(&angle.to_le_bytes());
                staged.record(0, angle as f64);
            }
            Field::UserData => {
                out[0] = point.user_data;
                staged.record(0, point.user_data as f64);
                staged.record_byte(point.user_data);
            }
            Field::PointSourceId => {
                out.copy_from_slice(&point.point_source_id.to_le_bytes());
                staged.record(0, point.point_source_id as f64);
            }
            Field::GpsTime => {
                let time = point.gps_time.unwrap_or(0.0);
                out.copy_from_slice(&time.to_le_bytes());
                staged.record(0, time);
            }
            Field::ClassificationFlags => {
                let mut flags = 0u8;
                if point.is_synthetic {
                    flags |= 1;
                }
                if point.is_key_point {
                    flags |= 2;
                }
                if point.is_withheld {
                    flags |= 4;
                }
                if point.is_overlap {
                    flags |= 8;
                }
                out[0] = flags;
                staged.record(0, flags as f64);
                staged.record_byte(flags);
            }
            Field::Rgb => {
                let color = point.color.unwrap_or(las::Color::new(0, 0, 0));
                out[0..2].copy_from_slice(&color.red.to_le_bytes());
                out[2..4].copy_from_slice(&color.green.to_le_bytes());
                out[4..6].copy_from_slice(&color.blue.to_le_bytes());
                staged.record(0, color.red as f64);
                staged.record(1, color.green as f64);
                staged.record(2, color.blue as f64);
            }
            Field::WavePacketDescriptorIndex => {
                let index = point
                    .waveform
                    .as_ref()
                    .map(|w| w.wave_packet_descriptor_index)
                    .unwrap_or(0);
                out[0] = index;
                staged.record(0, index as f64);
                staged.record_byte(index);
            }
            Field::ByteOffsetToWaveformData => {
                let value = point
                    .waveform
                    .as_ref()
                    .map(|w| w.byte_offset_to_waveform_data)
                    .unwrap_or(0);
                out.copy_from_slice(&value.to_le_bytes());
                staged.record(0, value as f64);
            }
            Field::WaveformPacketSize => {
                let value = point
                    .waveform
                    .as_ref()
                    .map(|w| w.waveform_packet_size_in_bytes)
                    .unwrap_or(0);
                out.copy_from_slice(&value.to_le_bytes());
                staged.record(0, value as f64);
            }
            Field::ReturnPointWaveformLocation => {
                let value = point
                    .waveform
                    .as_ref()
                    .map(|w| w.return_point_waveform_location)
                    .unwrap_or(0.0);
                out.copy_from_slice(&value.to_le_bytes());
                staged.record(0, value as f64);
            }
            Field::Xyzt => {
                let (x, y, z) = point
                    .waveform
                    .as_ref()
                    .map(|w| (w.x_t, w.y_t, w.z_t))
                    .unwrap_or((0.0, 0.0, 0.0));
                out[0..4].copy_from_slice(&x.to_le_bytes());
                out[4..8].copy_from_slice(&y.to_le_bytes());
                out[8..12].copy_from_slice(&z.to_le_bytes());
                staged.record(0, x as f64);
                staged.record(1, y as f64);
                staged.record(2, z as f64);
            }
            Field::ExtraBytes { source_offset } => {
                let source = &point.extra_bytes;
                let end = source_offset + self.size;
                if source.len() >= end {
                    out.copy_from_slice(&source[*source_offset..end]);
                    for element in 0..self.num_elements {
                        let bytes = &out[element * self.element_size..];
                        staged.record(element, read_element(bytes, self.kind));
                    }
                    if self.size == 1 {
                        staged.record_byte(out[0]);
                    }
                }
            }
            Field::Missing => {}
        }
    }
}
