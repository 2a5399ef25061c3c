pub mod args;

use clap::error::ErrorKind;
use clap::Parser;

pub use args::Arguments;

/// Parses the command line. Help and version exit 0, every other parse
/// failure exits 1.
pub fn parse() -> Arguments {
    match Arguments::try_parse() {
        Ok(args) => args,
        Err(e) => {
            if let Err(io) = e.print() {
                eprintln!("{}\n(could not write usage: {})", e, io);
            }
            std::process::exit(exit_code(e.kind()));
        }
    }
}

fn exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}
