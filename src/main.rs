use clap::Parser;

mod cli;
mod error;
mod filters;
mod geometry;
mod grid;
mod io;
mod line;
mod psa;
mod timeslice;
mod tools;

const PROGRAM_NAME: &str = env!("CARGO_PKG_NAME");
const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");
const PROGRAM_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

fn main() {
    let args = cli::Args::parse();

    std::process::exit(cli::main(args));
}
