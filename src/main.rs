use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser as ClapParser;
use log::info;

use stvm::{Interpreter, RunState, VmConfig};

/// Time between returns to the host loop while the image is busy.
const SLICE: Duration = Duration::from_millis(20);
/// Longest nap when the image goes idle without naming a wake-up time.
const MAX_IDLE: Duration = Duration::from_millis(50);

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Run a Smalltalk-80 family image", long_about = None)]
struct Cli {
    /// Keep running when the image asks to quit
    #[arg(long)]
    ignore_quit: bool,

    /// Interpret every method instead of compiling hot ones
    #[arg(long)]
    no_jit: bool,

    /// Heap size limit in bytes
    #[arg(long, value_name = "BYTES")]
    memory_limit: Option<usize>,

    /// Raise the log level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// The image file to run
    image: PathBuf,
}

/// Accept the traditional single-dash spelling of long options.
fn normalize_args() -> Vec<String> {
    std::env::args()
        .map(|arg| match arg.as_str() {
            "-ignoreQuit" => "--ignore-quit".to_string(),
            _ => arg,
        })
        .collect()
}

fn main() -> Result<(), failure::Error> {
    let cli = Cli::parse_from(normalize_args());

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = VmConfig {
        ignore_quit: cli.ignore_quit,
        jit: !cli.no_jit,
        ..VmConfig::default()
    };
    if let Some(limit) = cli.memory_limit {
        config.memory_limit = limit;
    }

    let mut interpreter = Interpreter::load(&cli.image, config)?;
    let started = Instant::now();
    loop {
        match interpreter.interpret(SLICE)? {
            RunState::Running => {}
            RunState::Idle(deadline) => {
                let now = Instant::now();
                let nap = deadline
                    .map(|deadline| deadline.saturating_duration_since(now))
                    .unwrap_or(MAX_IDLE)
                    .min(MAX_IDLE);
                thread::sleep(nap);
            }
            RunState::Quit => break,
        }
    }
    info!(
        "{} cycles in {:.2?}",
        interpreter.cycles(),
        started.elapsed()
    );
    Ok(())
}
