use std::io::{self, Write};
use std::{fs, process};

use clap::Parser as ClapParser;
use tracing_subscriber::EnvFilter;

use wick::{compile, disassemble_chunk, Gc, HeapSettings, InterpretResult, ObjKind, Value, Vm};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Script files to execute in order
    #[arg(required = false, help = "The .wk files to execute")]
    files: Vec<String>,

    /// Start a REPL after executing files (default when no files given)
    #[arg(long)]
    repl: bool,

    /// Disassemble each file's bytecode instead of running it
    #[arg(long)]
    dump: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut vm = Vm::new(HeapSettings::default());

    for filename in &cli.files {
        let source = match fs::read_to_string(filename) {
            Ok(source) => source,
            Err(err) => {
                eprintln!("Error reading file '{filename}': {err}");
                process::exit(1);
            }
        };

        if cli.dump {
            match compile(&mut vm, &source) {
                Some(function) => dump_function(function),
                None => process::exit(65),
            }
            continue;
        }

        match vm.interpret(&source) {
            InterpretResult::Ok => {}
            InterpretResult::CompileError => process::exit(65),
            InterpretResult::RuntimeError => process::exit(70),
        }
    }

    if cli.repl || cli.files.is_empty() {
        run_repl(&mut vm);
    }
}

/// Disassemble a function and, recursively, every function in its
/// constant pool.
fn dump_function(function: Gc) {
    // SAFETY: dumping allocates nothing, so no collection can free this
    let function = unsafe { function.as_ref() }.as_function();
    let name = match function.name {
        // SAFETY: the function keeps its name alive
        Some(name) => unsafe { name.as_ref() }.as_string().chars.to_string(),
        None => String::from("script"),
    };
    print!("{}", disassemble_chunk(&function.chunk, &name));

    for constant in &function.chunk.constants {
        if let Value::Obj(obj) = constant {
            // SAFETY: constants are live
            if matches!(unsafe { obj.as_ref() }.kind, ObjKind::Function(_)) {
                dump_function(*obj);
            }
        }
    }
}

fn run_repl(vm: &mut Vm) {
    println!("wick repl");
    println!("Type 'exit' to quit.");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut line = String::new();

    loop {
        print!("> ");
        if let Err(err) = stdout.flush() {
            eprintln!("Error flushing stdout: {err}");
            break;
        }

        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let input = line.trim();
                if input == "exit" {
                    break;
                }
                if input.is_empty() {
                    continue;
                }
                // errors were already reported; the session continues
                vm.interpret(&line);
            }
            Err(err) => {
                eprintln!("Error reading input: {err}");
                break;
            }
        }
    }
}
