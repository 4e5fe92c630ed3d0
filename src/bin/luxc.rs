// luxc.rs - LUX batch compiler

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::Parser;

use nuxvm::compiler;

#[derive(Debug, Parser)]
#[command(name = "luxc")]
#[command(about = "Compile a LUX source file to NUX bytecode", version)]
struct Args {
    /// LUX source file
    source: PathBuf,

    /// Output path (defaults to the source path with a .bin extension)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let source = match fs::read_to_string(&args.source) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("Error reading {}: {}", args.source.display(), err);
            process::exit(1);
        }
    };

    let bytecode = match compiler::compile(&source) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Error: {}", err);
            process::exit(1);
        }
    };

    let out_path = args
        .output
        .unwrap_or_else(|| args.source.with_extension("bin"));

    if let Err(err) = fs::write(&out_path, &bytecode) {
        eprintln!("Error writing {}: {}", out_path.display(), err);
        process::exit(1);
    }

    println!("Compiled: {}", out_path.display());
}
