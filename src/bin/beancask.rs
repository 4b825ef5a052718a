//! The beancask compactor CLI: compacts, indexes, and validates a
//! directory of append-only data files and their hint sidecars.

use beancask::errinput;
use beancask::error::{Error, Result};
use beancask::storage::{self, ExpiryPolicy};

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "beancask", version, about = "Data file compactor")]
struct Args {
    /// Data directory to operate on.
    #[arg(short = 'd', value_name = "PATH")]
    dir: Option<PathBuf>,

    /// Compact data and hint files.
    #[arg(short = 'm')]
    compact: bool,

    /// Print all live keys as key, version, and offset, tab-separated.
    #[arg(short = 'p')]
    print: bool,

    /// Rebuild the hint file for every data file, replacing existing ones.
    #[arg(short = 'b')]
    build_hints: bool,

    /// Validate hint files against a rescan of their data files.
    #[arg(short = 'c')]
    check_hints: bool,

    /// Validate hint files against leftover .tmp hints.
    #[arg(short = 't')]
    check_tmp_hints: bool,

    /// Expire records older than this many days (combined with -s).
    #[arg(short = 'e', value_name = "DAYS")]
    expire_days: Option<u32>,

    /// Minimum value size for -e expiry, e.g. 4096, 10K, or 2M.
    #[arg(short = 's', value_name = "SIZE")]
    expire_size: Option<String>,

    /// Tiered expiry as comma-separated SIZE:DAYS entries, e.g.
    /// 10K:30,10M:11.
    #[arg(short = 'r', value_name = "RANGES")]
    expire_ranges: Option<String>,

    /// Verbose logging.
    #[arg(short = 'v')]
    verbose: bool,

    /// Run a self-test in a temporary directory and exit.
    #[arg(long = "test")]
    selftest: bool,
}

fn main() {
    let args = Args::parse();
    let level = if args.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    if let Err(error) = simplelog::SimpleLogger::init(level, simplelog::Config::default()) {
        eprintln!("Error: failed to initialize logging: {error}");
        std::process::exit(1);
    }
    if let Err(error) = run(args) {
        log::error!("{error}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    // A malformed expiry option aborts before any file is touched.
    let policy = ExpiryPolicy::from_options(
        args.expire_ranges.as_deref(),
        args.expire_days,
        args.expire_size.as_deref(),
    )?;

    if args.selftest {
        return storage::self_test();
    }

    let Some(dir) = args.dir else {
        return errinput!("a data directory is required, pass -d PATH");
    };
    if !dir.is_dir() {
        return errinput!("{} is not a directory", dir.display());
    }
    if !(args.compact || args.print || args.build_hints || args.check_hints || args.check_tmp_hints)
    {
        return errinput!("nothing to do, pass one of -m, -p, -b, -c, or -t");
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0);

    if args.compact {
        let stats = storage::compact(&dir, policy.as_ref(), now)?;
        if stats.failed > 0 {
            return Err(Error::IO(format!("{} files failed to compact", stats.failed)));
        }
    }
    if args.build_hints {
        let (_, failed) = storage::build_hints(&dir)?;
        if failed > 0 {
            return Err(Error::IO(format!("{failed} hint files failed to build")));
        }
    }
    if args.check_hints {
        storage::validate_hints(&dir)?;
    }
    if args.check_tmp_hints {
        storage::validate_tmp_hints(&dir)?;
    }
    if args.print {
        let mut stdout = std::io::stdout().lock();
        storage::print_keys(&dir, &mut stdout)?;
    }
    Ok(())
}
