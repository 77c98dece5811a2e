use crate::index::flusher::RECORD_SIZE;
use crate::index::node::NodeType;
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Size of one node record in `hierarchy.bin`:
/// u8 type, u8 childMask, u32 numPoints, u64 byteOffset, u64 byteSize.
pub const NODE_RECORD_SIZE: usize = 22;

#[derive(Error, Debug)]
pub enum HierarchyError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("could not find chunk {chunk} in batch {batch}")]
    MissingChunk { chunk: String, batch: String },

    #[error("hierarchy batch file is corrupt: {0}")]
    CorruptBatch(PathBuf),
}

#[derive(Debug)]
struct BatchNode {
    name: String,
    num_points: u32,
    byte_offset: u64,
    byte_size: u64,
    node_type: NodeType,
    child_mask: u8,
    proxy_byte_offset: u64,
    proxy_byte_size: u64,
}

#[derive(Debug)]
struct Chunk {
    name: String,
    byte_offset: u64,
    members: Vec<usize>,
}

#[derive(Debug)]
struct Batch {
    name: String,
    nodes: Vec<BatchNode>,
    node_map: HashMap<String, usize>,
    chunks: Vec<Chunk>,
    chunk_map: HashMap<String, usize>,
}

/// Builds `hierarchy.bin` from the batch files the flusher left under
/// `.hierarchyChunks/`.
///
/// Space for the root chunk is reserved at the start of the file and the
/// chunk is rewritten last, once the byte offsets of all later batches
/// are known and the root's proxy records can point at them.
pub struct HierarchyBuilder {
    path: PathBuf,
    step_size: usize,
}

/// Hierarchy facts that end up in `metadata.json`.
#[derive(Clone, Copy, Debug)]
pub struct HierarchyInfo {
    pub first_chunk_size: u64,
    pub step_size: usize,
}

impl HierarchyBuilder {
    pub fn new(path: PathBuf, step_size: usize) -> HierarchyBuilder {
        HierarchyBuilder { path, step_size }
    }

    pub fn build(&self, output: &Path) -> Result<HierarchyInfo, HierarchyError> {
        let mut file = std::fs::File::create(output)?;
        let mut bytes_written: u64;

        let mut root_batch = self.load_batch(&self.path.join("r.bin"))?;

        // reserve the first bytes of the file for the root chunk
        let reserved = NODE_RECORD_SIZE * root_batch.nodes.len();
        file.write_all(&vec![0u8; reserved])?;
        bytes_written = reserved as u64;

        // all other batches append in turn; the root's records for their
        // roots become proxies to the freshly assigned offsets
        let mut batch_files: Vec<PathBuf> = std::fs::read_dir(&self.path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                name.ends_with(".bin") && name != "r.bin"
            })
            .collect();
        batch_files.sort();

        for path in batch_files {
            let mut batch = self.load_batch(&path)?;
            self.assign_chunk_offsets(&mut batch)?;
            let buffer = serialize_batch(&batch, bytes_written);

            let root_index = *root_batch.node_map.get(&batch.name).ok_or_else(|| {
                HierarchyError::MissingChunk {
                    chunk: batch.name.clone(),
                    batch: "r".to_string(),
                }
            })?;

            if batch.nodes.len() > 1 {
                let root_chunk_index = *batch.chunk_map.get(&batch.name).ok_or_else(|| {
                    HierarchyError::MissingChunk {
                        chunk: batch.name.clone(),
                        batch: batch.name.clone(),
                    }
                })?;
                let root_chunk = &batch.chunks[root_chunk_index];
                let proxy = &mut root_batch.nodes[root_index];
                proxy.node_type = NodeType::Proxy;
                proxy.proxy_byte_offset = bytes_written;
                proxy.proxy_byte_size = (NODE_RECORD_SIZE * root_chunk.members.len()) as u64;
            } else {
                // a batch of one node is a plain leaf of the root chunk
                root_batch.nodes[root_index].node_type = NodeType::Leaf;
            }

            file.write_all(&buffer)?;
            bytes_written += buffer.len() as u64;
        }

        // now the root chunk content is final
        let buffer = serialize_batch(&root_batch, 0);
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buffer)?;
        file.flush()?;

        // the intermediate batch files are no longer needed
        if self.path.ends_with(".hierarchyChunks") {
            std::fs::remove_dir_all(&self.path)?;
        }

        Ok(HierarchyInfo {
            first_chunk_size: (NODE_RECORD_SIZE * root_batch.nodes.len()) as u64,
            step_size: self.step_size,
        })
    }

    fn load_batch(&self, path: &Path) -> Result<Batch, HierarchyError> {
        let buffer = std::fs::read(path)?;
        if buffer.len() % RECORD_SIZE != 0 {
            return Err(HierarchyError::CorruptBatch(path.to_path_buf()));
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        let mut batch = Batch {
            name,
            nodes: Vec::new(),
            node_map: HashMap::new(),
            chunks: Vec::new(),
            chunk_map: HashMap::new(),
        };

        for record in buffer.chunks_exact(RECORD_SIZE) {
            let node_name = String::from_utf8_lossy(&record[0..31]).trim_end().to_string();
            if node_name.is_empty() {
                return Err(HierarchyError::CorruptBatch(path.to_path_buf()));
            }
            let num_points = u32::from_le_bytes(record[31..35].try_into().unwrap());
            let byte_offset = u64::from_le_bytes(record[35..43].try_into().unwrap());
            let byte_size = u32::from_le_bytes(record[43..47].try_into().unwrap()) as u64;

            let index = batch.nodes.len();
            batch.nodes.push(BatchNode {
                name: node_name.clone(),
                num_points,
                byte_offset,
                byte_size,
                node_type: NodeType::Leaf,
                child_mask: 0,
                proxy_byte_offset: 0,
                proxy_byte_size: 0,
            });
            batch.node_map.insert(node_name.clone(), index);

            // chunk of this node within the batch, by step window
            let chunk_level = ((node_name.len() as i64 - 2) / self.step_size as i64).max(0);
            let key = if node_name == batch.name {
                node_name.clone()
            } else {
                node_name[..(self.step_size as i64 * chunk_level + 1) as usize].to_string()
            };
            push_to_chunk(&mut batch, &key, index);

            // nodes on a step boundary root a chunk of their own
            let is_chunk_key = (node_name.len() - 1) % self.step_size == 0;
            let is_batch_sub_chunk = node_name.len() > self.step_size + 1;
            if is_chunk_key && is_batch_sub_chunk {
                push_to_chunk(&mut batch, &node_name, index);
            }
        }

        // breadth-first chunk order: offsets are assigned in this order
        batch
            .chunks
            .sort_by(|a, b| (a.name.len(), &a.name).cmp(&(b.name.len(), &b.name)));
        batch.chunk_map = batch
            .chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| (chunk.name.clone(), index))
            .collect();

        // wire children to parents
        for index in 0..batch.nodes.len() {
            let name = batch.nodes[index].name.clone();
            let parent_name = &name[..name.len() - 1];
            if let Some(&parent) = batch.node_map.get(parent_name) {
                let child_index = name.as_bytes()[name.len() - 1] - b'0';
                batch.nodes[parent].node_type = NodeType::Normal;
                batch.nodes[parent].child_mask |= 1 << child_index;
            }
        }

        // roots of sub-chunks serialize as proxies in their parent chunk
        for chunk in &batch.chunks {
            if chunk.name == batch.name {
                continue;
            }
            match batch.node_map.get(&chunk.name) {
                Some(&index) => batch.nodes[index].node_type = NodeType::Proxy,
                None => {
                    return Err(HierarchyError::MissingChunk {
                        chunk: chunk.name.clone(),
                        batch: batch.name.clone(),
                    })
                }
            }
        }

        // breadth-first node order within each chunk
        for chunk in &mut batch.chunks {
            chunk.members.sort_by(|&a, &b| {
                let a = &batch.nodes[a].name;
                let b = &batch.nodes[b].name;
                (a.len(), a).cmp(&(b.len(), b))
            });
        }

        Ok(batch)
    }

    /// Computes every chunk's byte offset relative to the batch start and
    /// points the proxy node of each sub-chunk at it.
    fn assign_chunk_offsets(&self, batch: &mut Batch) -> Result<(), HierarchyError> {
        let mut byte_offset = 0u64;

        for index in 0..batch.chunks.len() {
            batch.chunks[index].byte_offset = byte_offset;
            let chunk_name = batch.chunks[index].name.clone();
            let chunk_size =
                (NODE_RECORD_SIZE * batch.chunks[index].members.len()) as u64;

            if chunk_name != batch.name {
                let parent_name = &chunk_name[..chunk_name.len() - self.step_size];
                if !batch.chunk_map.contains_key(parent_name) {
                    return Err(HierarchyError::MissingChunk {
                        chunk: parent_name.to_string(),
                        batch: batch.name.clone(),
                    });
                }
                let proxy =
                    *batch
                        .node_map
                        .get(&chunk_name)
                        .ok_or_else(|| HierarchyError::MissingChunk {
                            chunk: chunk_name.clone(),
                            batch: batch.name.clone(),
                        })?;
                batch.nodes[proxy].node_type = NodeType::Proxy;
                batch.nodes[proxy].proxy_byte_offset = byte_offset;
                batch.nodes[proxy].proxy_byte_size = chunk_size;
            }

            byte_offset += chunk_size;
        }

        Ok(())
    }
}

fn push_to_chunk(batch: &mut Batch, key: &str, index: usize) {
    if let Some(&chunk_index) = batch.chunk_map.get(key) {
        batch.chunks[chunk_index].members.push(index);
    } else {
        batch.chunk_map.insert(key.to_string(), batch.chunks.len());
        batch.chunks.push(Chunk {
            name: key.to_string(),
            byte_offset: 0,
            members: vec![index],
        });
    }
}

/// Serializes all chunks of a batch into consecutive 22 byte records.
///
/// A proxy node exists twice: in the parent chunk (as the proxy) and as
/// the root of its own chunk, where it serializes as a normal node.
fn serialize_batch(batch: &Batch, bytes_written: u64) -> Vec<u8> {
    let num_records: usize = batch.chunks.iter().map(|chunk| chunk.members.len()).sum();
    let mut buffer = Vec::with_capacity(NODE_RECORD_SIZE * num_records);

    for chunk in &batch.chunks {
        for &member in &chunk.members {
            let node = &batch.nodes[member];
            let is_proxy = node.node_type == NodeType::Proxy && node.name != chunk.name;
            let node_type = match node.node_type {
                NodeType::Proxy if !is_proxy => NodeType::Normal,
                other => other,
            };

            let (byte_offset, byte_size) = if is_proxy {
                (bytes_written + node.proxy_byte_offset, node.proxy_byte_size)
            } else {
                (node.byte_offset, node.byte_size)
            };

            buffer.write_u8(node_type as u8).unwrap();
            buffer.write_u8(node.child_mask).unwrap();
            buffer.write_u32::<LittleEndian>(node.num_points).unwrap();
            buffer.write_u64::<LittleEndian>(byte_offset).unwrap();
            buffer.write_u64::<LittleEndian>(byte_size).unwrap();
        }
    }

    buffer
}
