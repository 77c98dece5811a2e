use crate::attributes::Attributes;
use crate::chunking::{do_chunking, ChunkError, MAX_POINTS_PER_CHUNK};
use crate::encoding::Encoding;
use crate::index::indexer::{do_indexing, IndexError, IndexingOptions};
use crate::index::sampler::SamplingMethod;
use crate::las::{
    compute_output_attributes, curate_sources, scan_sources, ScanError, SourceSummary,
};
use crate::status::{Monitor, Status};
use crate::utils::task_pool::TaskPool;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Clone, Debug)]
pub struct ConverterOptions {
    pub sources: Vec<PathBuf>,
    pub outdir: PathBuf,
    pub name: Option<String>,
    pub sampling: SamplingMethod,
    pub encoding: Encoding,
    pub attributes: Vec<String>,
    pub projection: String,
    pub keep_chunks: bool,
    pub no_chunking: bool,
    pub no_indexing: bool,
}

impl ConverterOptions {
    pub fn new(sources: Vec<PathBuf>, outdir: PathBuf) -> Self {
        ConverterOptions {
            sources,
            outdir,
            name: None,
            sampling: SamplingMethod::Poisson,
            encoding: Encoding::Default,
            attributes: Vec::new(),
            projection: String::new(),
            keep_chunks: false,
            no_chunking: false,
            no_indexing: false,
        }
    }
}

/// Runs the full conversion: source scan, chunking passes and indexing.
pub fn convert(options: &ConverterOptions) -> Result<(), ConvertError> {
    info!("threads: {}", TaskPool::default_threads());

    let (default_name, files) = curate_sources(&options.sources)?;
    let sources = scan_sources(&files)?;
    let mut attributes: Attributes =
        compute_output_attributes(&sources, &options.attributes)?;
    info!("output attributes:\n{}", attributes.describe());

    let summary = SourceSummary::compute(&sources)?;
    info!(
        "cubicAABB: {{ \"min\": [{}, {}, {}], \"max\": [{}, {}, {}] }}",
        summary.cube.min.x,
        summary.cube.min.y,
        summary.cube.min.z,
        summary.cube.max.x,
        summary.cube.max.y,
        summary.cube.max.z,
    );
    info!(
        "#points: {}, total file size: {} MB",
        summary.total_points,
        summary.total_bytes / (1024 * 1024)
    );

    std::fs::create_dir_all(&options.outdir)?;
    info!("target directory: {}", options.outdir.display());

    let status = Arc::new(Status::new(summary.total_points));
    let monitor = Monitor::start(Arc::clone(&status));

    if !options.no_chunking {
        do_chunking(
            &sources,
            &options.outdir,
            &summary,
            &mut attributes,
            &status,
            MAX_POINTS_PER_CHUNK,
        )?;
    }

    if !options.no_indexing {
        let indexing = IndexingOptions {
            sampling: options.sampling,
            encoding: options.encoding,
            name: options
                .name
                .clone()
                .unwrap_or(default_name),
            projection: options.projection.clone(),
            keep_chunks: options.keep_chunks,
            ..IndexingOptions::default()
        };
        do_indexing(&options.outdir, &indexing, &status)?;
    }

    drop(monitor);
    Ok(())
}
