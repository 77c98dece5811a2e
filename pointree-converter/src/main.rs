use anyhow::{bail, Result};
use clap::Parser;
use cli::AppOptions;
use human_panic::setup_panic;
use log::{debug, error};
use pointree_common::converter::{convert, ConverterOptions};
use pointree_common::encoding::Encoding;
use pointree_common::index::sampler::SamplingMethod;
use std::process::ExitCode;

mod cli;

fn run(args: AppOptions) -> Result<()> {
    let sampling = match args.method.as_str() {
        "poisson" => SamplingMethod::Poisson,
        "random" => SamplingMethod::Random,
        other => bail!("unknown sampling method: {other}"),
    };
    let encoding = match args.encoding.as_str() {
        "DEFAULT" => Encoding::Default,
        "BROTLI" => Encoding::Brotli,
        "UNCOMPRESSED" => Encoding::Uncompressed,
        other => bail!("unknown encoding: {other}"),
    };
    if args.chunk_method != "LASZIP" {
        bail!("invalid chunk method provided: {}", args.chunk_method);
    }

    let mut options = ConverterOptions::new(args.source, args.outdir);
    options.name = args.name;
    options.sampling = sampling;
    options.encoding = encoding;
    options.attributes = args.attributes;
    options.projection = args.projection;
    options.keep_chunks = args.keep_chunks;
    options.no_chunking = args.no_chunking;
    options.no_indexing = args.no_indexing;

    convert(&options)?;
    Ok(())
}

fn main() -> ExitCode {
    setup_panic!();

    // arg parsing
    let args = AppOptions::parse();

    // logger
    simple_logger::init_with_level(args.log_level).unwrap();

    // run
    if let Err(e) = run(args) {
        error!("{e}");
        debug!("{e:?}");
        debug!("{}", pointree_common::status::memory_report());
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
