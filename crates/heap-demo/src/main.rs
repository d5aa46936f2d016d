use std::process;

use arena_alloc::Coalescing;
use argh::FromArgs;
use log::LevelFilter;

use self::report::Report;

mod logger;
mod report;
mod scenario;

/// Run the arena allocators through their demonstration scenarios.
#[derive(Debug, FromArgs)]
struct Args {
    /// maximum log level: off, error, warn, info, debug or trace
    #[argh(option, default = "LevelFilter::Info")]
    log_level: LevelFilter,
    #[argh(subcommand)]
    command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    FirstFit(FirstFitArgs),
    Bump(BumpArgs),
    Pages(PagesArgs),
}

/// Allocate, free and dump a first-fit heap.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "first-fit")]
struct FirstFitArgs {
    /// arena size in bytes
    #[argh(option, default = "16 * 1024 * 1024")]
    arena_size: usize,
    /// hand out region ids and free by id
    #[argh(switch)]
    ids: bool,
    /// coalescing strategy: sweep or neighbors
    #[argh(option, default = "Coalescing::Sweep", from_str_fn(parse_coalescing))]
    coalescing: Coalescing,
}

/// Allocate from a bump arena.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "bump")]
struct BumpArgs {
    /// arena size in bytes
    #[argh(option, default = "8 * 1024 * 1024")]
    arena_size: usize,
}

/// Take and return pages from a page pool.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "pages")]
struct PagesArgs {
    /// number of pages in the pool
    #[argh(option, default = "8")]
    pages: usize,
    /// keep page contents instead of overwriting them with fill bytes
    #[argh(switch)]
    no_fill: bool,
}

fn parse_coalescing(value: &str) -> Result<Coalescing, String> {
    match value {
        "sweep" => Ok(Coalescing::Sweep),
        "neighbors" => Ok(Coalescing::Neighbors),
        _ => Err(format!("unknown coalescing strategy `{value}`")),
    }
}

fn main() {
    let args: Args = argh::from_env();

    if let Err(err) = logger::init(args.log_level) {
        eprintln!("failed to install logger: {err}");
        process::exit(1);
    }

    let result = match &args.command {
        Command::FirstFit(args) => scenario::first_fit(args),
        Command::Bump(args) => scenario::bump(args),
        Command::Pages(args) => scenario::pages(args),
    };
    if let Err(err) = result {
        eprint!("{}", Report::new(err));
        process::exit(1);
    }
}
