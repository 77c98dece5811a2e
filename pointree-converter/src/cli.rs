use clap::Parser;
use std::path::PathBuf;

/// Converts LAS/LAZ point clouds into a streamable octree
/// (octree.bin, hierarchy.bin, metadata.json).
#[derive(Debug, Parser)]
pub struct AppOptions {
    /// Verbosity of the command line output.
    #[clap(long, default_value = "info")]
    pub log_level: log::Level,

    /// Input las/laz files or directories containing them.
    #[clap(long, required = true, value_delimiter = ',')]
    pub source: Vec<PathBuf>,

    /// Output directory. Must be empty or not yet existing.
    #[clap(long)]
    pub outdir: PathBuf,

    /// Name of the dataset in the output metadata.
    /// Defaults to the name of the first input file.
    #[clap(long)]
    pub name: Option<String>,

    /// Sampling method: "poisson" or "random".
    #[clap(long, default_value = "poisson")]
    pub method: String,

    /// Payload encoding: DEFAULT, BROTLI or UNCOMPRESSED.
    #[clap(long, default_value = "DEFAULT")]
    pub encoding: String,

    /// How input files are read during chunking.
    #[clap(long, default_value = "LASZIP")]
    pub chunk_method: String,

    /// Restricts the output to the given attributes (comma separated).
    /// The position is always kept.
    #[clap(long, value_delimiter = ',')]
    pub attributes: Vec<String>,

    /// Projection (WKT or SRS string), copied into the metadata.
    #[clap(long, default_value = "")]
    pub projection: String,

    /// Keep the intermediate chunks/ directory after indexing.
    #[clap(long)]
    pub keep_chunks: bool,

    /// Skip the chunking passes (expects an existing chunks/ directory).
    #[clap(long)]
    pub no_chunking: bool,

    /// Stop after chunking, do not build the octree.
    #[clap(long)]
    pub no_indexing: bool,
}
