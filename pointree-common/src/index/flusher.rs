use crate::index::node::Node;
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// Size of one on-disk record: 31 byte space-padded name, u32 numPoints,
/// u64 byteOffset, u32 byteSize, and a trailing newline.
pub const RECORD_SIZE: usize = 48;

/// Names longer than the record's name field would be truncated, which
/// corrupts the hierarchy; depth 30 is far beyond practical octrees.
pub const MAX_NAME_LEN: usize = 31;

/// Skeleton of a written node, as recorded for the hierarchy builder.
#[derive(Clone, Debug, PartialEq)]
pub struct FlushedNode {
    pub name: String,
    pub num_points: u64,
    pub byte_offset: u64,
    pub byte_size: u64,
}

impl FlushedNode {
    pub fn of(node: &Node) -> FlushedNode {
        FlushedNode {
            name: node.name.clone(),
            num_points: node.num_points,
            byte_offset: node.byte_offset,
            byte_size: node.byte_size,
        }
    }
}

/// Collects the skeletons of all written octree nodes and spills them
/// into per-batch files under `<outdir>/.hierarchyChunks/`, grouped by
/// the `step_size + 1` character prefix of the node name. The root batch
/// (all names of at most that length) is keyed "r"; nodes exactly at the
/// boundary length are written to both their own batch and the parent
/// one.
pub struct HierarchyFlusher {
    path: PathBuf,
    step_size: usize,
    buffer: Mutex<Vec<FlushedNode>>,
}

const BUFFER_LIMIT: usize = 10_000;

impl HierarchyFlusher {
    pub fn new(path: PathBuf, step_size: usize) -> io::Result<HierarchyFlusher> {
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(HierarchyFlusher {
            path,
            step_size,
            buffer: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn write(&self, node: FlushedNode) -> io::Result<()> {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.push(node);
        if buffer.len() > BUFFER_LIMIT {
            let drained = std::mem::take(&mut *buffer);
            drop(buffer);
            self.spill(drained)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> io::Result<()> {
        let drained = std::mem::take(&mut *self.buffer.lock().unwrap());
        self.spill(drained)?;
        Ok(())
    }

    fn spill(&self, nodes: Vec<FlushedNode>) -> io::Result<()> {
        let mut groups: std::collections::HashMap<String, Vec<&FlushedNode>> =
            std::collections::HashMap::new();

        for node in &nodes {
            if node.name.len() > MAX_NAME_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("node name too deep for hierarchy record: {}", node.name),
                ));
            }

            let key = if node.name.len() <= self.step_size + 1 {
                "r".to_string()
            } else {
                node.name[..self.step_size + 1].to_string()
            };
            groups.entry(key).or_default().push(node);

            // batch roots appear in their own batch as well
            if node.name.len() == self.step_size + 1 {
                groups.entry(node.name.clone()).or_default().push(node);
            }
        }

        for (key, group) in groups {
            let mut buffer = Vec::with_capacity(RECORD_SIZE * group.len());
            for node in group {
                let mut name = [b' '; MAX_NAME_LEN];
                name[..node.name.len()].copy_from_slice(node.name.as_bytes());
                buffer.write_all(&name)?;
                buffer.write_u32::<LittleEndian>(node.num_points as u32)?;
                buffer.write_u64::<LittleEndian>(node.byte_offset)?;
                buffer.write_u32::<LittleEndian>(node.byte_size as u32)?;
                buffer.write_u8(b'\n')?;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path.join(format!("{key}.bin")))?;
            file.write_all(&buffer)?;
        }

        Ok(())
    }
}
