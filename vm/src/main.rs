use clap::Parser as ClapParser;
use std::{fs, process};

use vm::config::{VmConfig, DEFAULT_COMPILE_THRESHOLD};
use vm::ffi::ForeignRegistry;
use vm::VM;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Source file to execute
    file: String,

    /// Print bytecode and constants for every compiled function
    #[arg(long)]
    print_bytecode: bool,

    /// Print the IR graph when the optimizing tier runs
    #[arg(long)]
    print_graph: bool,

    /// Print generated code when the optimizing tier runs
    #[arg(long)]
    print_code: bool,

    /// Profiling ticks before a function is optimized
    #[arg(long, default_value_t = DEFAULT_COMPILE_THRESHOLD)]
    compile_threshold: u32,
}

fn main() {
    env_logger::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            process::exit(1);
        }
    };

    let source = match fs::read_to_string(&cli.file) {
        Ok(content) => content,
        Err(err) => {
            eprintln!("Could not read file \"{}\": {}", cli.file, err);
            process::exit(1);
        }
    };

    let mut registry = ForeignRegistry::new();
    registry.register("print", 1, |args| {
        println!("{}", args[0]);
        0.0
    });

    let config = VmConfig {
        print_bytecode: cli.print_bytecode,
        print_graph: cli.print_graph,
        print_code: cli.print_code,
        compile_threshold: cli.compile_threshold,
    };

    let mut vm = VM::new(config, &registry);
    if let Err(err) = vm.run_source(&source) {
        eprintln!("Error executing {}: {}", cli.file, err);
        process::exit(1);
    }
}
