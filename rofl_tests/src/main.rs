//! A target for the fork server tests. Links the runtime and does one thing per
//! execution, picked by its arguments.

use std::{hint::black_box, process};

use clap::{Parser, Subcommand};
use rofl_targets::coverage::__rofl_trace_edge;

#[ctor::ctor]
fn init() {
    rofl_targets::autorun();
}

#[derive(Debug, Parser)]
#[command(name = "rofl_test_target", about = "Target for the rofl fork server tests")]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Exit with `code`
    Exit { code: u8 },
    /// Burn CPU time until the timer fires
    Spin,
    /// Print `text` to stdout
    Echo { text: String },
    /// Print `text` to stderr
    Stderr { text: String },
    /// Record `count` edges
    Edges { count: u32 },
    /// Die from `SIGABRT`
    Abort,
}

fn main() {
    let args = Args::parse();
    match args.mode {
        Mode::Exit { code } => process::exit(code.into()),
        Mode::Spin => {
            let mut counter = 0u64;
            loop {
                counter = black_box(counter.wrapping_add(1));
            }
        }
        Mode::Echo { text } => println!("{text}"),
        Mode::Stderr { text } => eprintln!("{text}"),
        Mode::Edges { count } => {
            for loc in 0..count {
                __rofl_trace_edge(loc.wrapping_mul(0x9e37_79b9));
            }
        }
        Mode::Abort => process::abort(),
    }
}
