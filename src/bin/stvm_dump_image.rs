use std::path::PathBuf;

use clap::Parser as ClapParser;

use stvm::objectmemory::load_image;
use stvm::objectmemory::text_format::TextFormat;

/// Write a readable dump of every object in an image.
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// V3 or Spur image to read
    image: PathBuf,
    /// Where to write the dump
    output: PathBuf,
}

fn main() -> Result<(), failure::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let memory = load_image(&cli.image)?;
    TextFormat::save(&cli.output, &memory)?;
    Ok(())
}
