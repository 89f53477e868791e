use std::env;
use std::fs;
use std::process;

use tern_eval::eval_program;
use tern_object::{Environment, Value, BUILTINS};
use tern_parser::{parse, ParseError};
use tern_syntax::Program;
use tern_vm::{Compiler, SymbolTable, Vm, GLOBALS_SIZE};

fn print_usage() {
    eprintln!("tern - a small scripting language");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  tern [options] <file.tern>      Run a file");
    eprintln!("  tern --console                  Start an interactive REPL");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --engine <vm|eval>  Execution engine (default: vm)");
    eprintln!("  --ast               Print the parsed program as JSON and exit");
    eprintln!("  --bytecode          Print the compiled bytecode and exit");
    eprintln!("  -h, --help          Show this help message");
    eprintln!("  -V, --version       Show version information");
}

struct Options {
    engine: String,
    console: bool,
    show_ast: bool,
    show_bytecode: bool,
    file: Option<String>,
}

fn parse_args() -> Options {
    let mut options = Options {
        engine: "vm".to_string(),
        console: false,
        show_ast: false,
        show_bytecode: false,
        file: None,
    };

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--engine" => match args.next() {
                Some(value) => options.engine = value,
                None => {
                    eprintln!("--engine requires a value");
                    process::exit(1);
                }
            },
            value if value.starts_with("--engine=") => {
                options.engine = value["--engine=".len()..].to_string();
            }
            "--console" => options.console = true,
            "--ast" => options.show_ast = true,
            "--bytecode" => options.show_bytecode = true,
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-V" | "--version" => {
                println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
                process::exit(0);
            }
            flag if flag.starts_with('-') => {
                eprintln!("unknown flag: {flag}");
                print_usage();
                process::exit(1);
            }
            path => {
                if options.file.is_some() {
                    eprintln!("only one file may be given");
                    process::exit(1);
                }
                options.file = Some(path.to_string());
            }
        }
    }

    options
}

fn main() {
    let options = parse_args();

    if options.engine != "vm" && options.engine != "eval" {
        eprintln!(
            "engine must be either 'vm' or 'eval', got {}",
            options.engine
        );
        process::exit(1);
    }

    if options.console {
        run_repl(&options.engine);
        return;
    }

    let Some(path) = &options.file else {
        print_usage();
        process::exit(1);
    };
    run_file(path, &options);
}

fn print_parse_errors(errors: &[ParseError]) {
    for error in errors {
        eprintln!("{error}");
    }
}

fn load_program(path: &str) -> Program {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("failed to read {path}: {err}");
            process::exit(1);
        }
    };

    match parse(&source) {
        Ok(program) => program,
        Err(errors) => {
            print_parse_errors(&errors);
            process::exit(1);
        }
    }
}

fn run_file(path: &str, options: &Options) {
    let program = load_program(path);

    if options.show_ast {
        match serde_json::to_string_pretty(&program) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("failed to serialize program: {err}");
                process::exit(1);
            }
        }
        return;
    }

    if options.engine == "eval" {
        let env = Environment::new();
        let result = eval_program(&program, &env);
        if let Value::Error(message) = &result {
            eprintln!("ERROR: {message}");
            process::exit(1);
        }
        println!("{}", result.inspect());
        return;
    }

    let mut compiler = Compiler::new();
    let bytecode = match compiler.compile(&program) {
        Ok(bytecode) => bytecode,
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };

    if options.show_bytecode {
        print!("{}", bytecode.instructions);
        println!("constants:");
        for (index, constant) in bytecode.constants.iter().enumerate() {
            println!("  {index}: {}", constant.inspect());
        }
        return;
    }

    let mut vm = Vm::new(bytecode);
    if let Err(err) = vm.run() {
        eprintln!("{err}");
        process::exit(1);
    }
    println!("{}", vm.last_popped_stack_element().inspect());
}

/// REPL state persists across lines: the symbol table, constant pool, and
/// globals array for the VM engine, the environment for the eval engine.
fn run_repl(engine: &str) {
    let mut rl = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(_) => {
            eprintln!("failed to start line editor");
            return;
        }
    };
    let history_path = env::var("HOME")
        .ok()
        .map(|home| std::path::PathBuf::from(home).join(".tern_history"));
    if let Some(path) = history_path.as_ref() {
        let _ = rl.load_history(path);
    }

    let mut symbol_table = SymbolTable::new();
    for (index, builtin) in BUILTINS.iter().enumerate() {
        symbol_table.define_builtin(index, builtin.name);
    }
    let mut constants: Vec<Value> = Vec::new();
    let mut globals = vec![Value::Null; GLOBALS_SIZE];
    let env = Environment::new();

    loop {
        let line = match rl.readline(">> ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(_) => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "exit" || trimmed == ".exit" {
            break;
        }
        let _ = rl.add_history_entry(trimmed);

        let program = match parse(trimmed) {
            Ok(program) => program,
            Err(errors) => {
                print_parse_errors(&errors);
                continue;
            }
        };

        if engine == "eval" {
            let result = eval_program(&program, &env);
            println!("{}", result.inspect());
            continue;
        }

        let mut compiler = Compiler::new_with_state(symbol_table, constants);
        let compiled = compiler.compile(&program);
        (symbol_table, constants) = compiler.into_state();

        let bytecode = match compiled {
            Ok(bytecode) => bytecode,
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };

        let mut vm = Vm::new_with_globals_state(bytecode, globals);
        match vm.run() {
            Ok(()) => println!("{}", vm.last_popped_stack_element().inspect()),
            Err(err) => eprintln!("{err}"),
        }
        globals = vm.into_globals();
    }

    if let Some(path) = history_path.as_ref() {
        let _ = rl.append_history(path);
    }
}
