use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use marawacc::diag::{codes, DiagLevel, Diagnostic};
use marawacc::error::Error;
use marawacc::interp::Interpreter;
use marawacc::options::GeneratorOptions;
use marawacc::parray::PArray;
use marawacc::registry::StructRegistry;
use marawacc::request::{Compiled, KernelRequest, Offload};
use marawacc::samples;
use marawacc::types::Value;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DemoKind {
    /// Tuple2<Float,Float> -> Float, t -> t._1 * t._2
    MapMul,
    /// Integer -> Double, x -> x * 2.0
    MapDouble,
    /// map-mul followed by a sum reduction
    Reduce,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate the OpenCL translation unit for a JSON kernel request
    Kernel {
        /// Request file (JSON)
        request: PathBuf,
    },
    /// Parse a tuple-type grammar string and print its struct declaration
    ParseType {
        /// e.g. `Tuple2<Float,Integer>` or `Tuple3::Double`
        grammar: String,
    },
    /// Generate the kernels of a reference computation and run it on the host
    Demo {
        #[arg(value_enum)]
        which: DemoKind,
        /// Number of input elements
        #[arg(long, default_value_t = 10)]
        size: usize,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = "marawacc",
    version,
    about = "OpenCL JIT backend: portable arrays and kernel generation for map/reduce lambdas"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Pass tuple arrays as one struct buffer instead of one buffer per field
    #[arg(long, global = true)]
    no_soa: bool,

    /// Omit deoptimization guards and the deoptFlag parameter
    #[arg(long, global = true)]
    no_guards: bool,

    /// Emit visited-node comments into the kernel text
    #[arg(long, global = true)]
    comments: bool,

    /// Number of devices the input is sharded across
    #[arg(long, global = true)]
    devices: Option<usize>,

    /// Print phases and diagnostics
    #[arg(long, global = true)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let mut options = GeneratorOptions::from_env();
    if cli.no_soa {
        options.soa = false;
    }
    if cli.no_guards {
        options.deopt_guards = false;
    }
    if cli.comments {
        options.comments = true;
    }
    if let Some(n) = cli.devices {
        options.devices = n.max(1);
    }

    if cli.verbose {
        eprintln!(
            "marawacc: soa = {}, guards = {}, devices = {}",
            options.soa, options.deopt_guards, options.devices
        );
    }

    match &cli.command {
        Command::Kernel { request } => kernel(request, options, cli.verbose),
        Command::ParseType { grammar } => parse_type(grammar),
        Command::Demo { which, size } => demo(*which, *size, options, cli.verbose),
    }
}

fn kernel(path: &Path, options: GeneratorOptions, verbose: bool) {
    let request = match load_request(path) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("marawacc: error: {}: {}", path.display(), e);
            std::process::exit(2);
        }
    };
    let mut offload = Offload::new(options);
    let compiled = compile_or_exit(&mut offload, &request, verbose);
    print_kernels(&compiled);
}

fn load_request(path: &Path) -> Result<KernelRequest, Error> {
    let text = std::fs::read_to_string(path)?;
    KernelRequest::from_json(&text)
}

fn parse_type(grammar: &str) {
    let ty = match marawacc::parser::parse_type(grammar) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("marawacc: error: {}", e);
            std::process::exit(2);
        }
    };
    println!("{}", ty);
    let mut structs = StructRegistry::new();
    structs.register(&ty);
    if structs.is_empty() {
        println!("(no struct declaration needed)");
    } else {
        print!("{}", structs.render_all());
    }
}

fn demo(which: DemoKind, size: usize, options: GeneratorOptions, verbose: bool) {
    let mut offload = Offload::new(options);
    let result = match which {
        DemoKind::MapMul => samples::map_mul_request().map_err(Error::from).and_then(|req| {
            let compiled = compile_or_exit(&mut offload, &req, verbose);
            print_kernels(&compiled);
            let input = samples::pair_input(size)?;
            Interpreter::new([&req.lambda]).map("mul", &[], &input, &samples::float())
        }),
        DemoKind::MapDouble => samples::map_double_request().map_err(Error::from).and_then(|req| {
            let compiled = compile_or_exit(&mut offload, &req, verbose);
            print_kernels(&compiled);
            let input = samples::int_input(size)?;
            Interpreter::new([&req.lambda]).map("double", &[], &input, &req.types.output)
        }),
        DemoKind::Reduce => samples::map_mul_request()
            .and_then(|m| Ok((m, samples::reduce_sum_request()?)))
            .map_err(Error::from)
            .and_then(|(map_req, reduce_req)| {
                for req in [&map_req, &reduce_req] {
                    let compiled = compile_or_exit(&mut offload, req, verbose);
                    print_kernels(&compiled);
                }
                let input = samples::pair_input(size)?;
                let products =
                    Interpreter::new([&map_req.lambda]).map("mul", &[], &input, &samples::float())?;
                Interpreter::new([&reduce_req.lambda]).reduce("sum", &[], &products, Value::Float(0.0))
            }),
    };
    match result {
        Ok(out) => println!("// host result: [{}]", render(&out)),
        Err(e) => {
            eprintln!("marawacc: error: {}", e);
            std::process::exit(1);
        }
    }
}

fn compile_or_exit(offload: &mut Offload, request: &KernelRequest, verbose: bool) -> Compiled {
    match offload.compile(request) {
        Ok(c) => {
            if verbose {
                eprintln!(
                    "marawacc: request {} ({} device kernel(s){})",
                    c.id,
                    c.kernels.len(),
                    if c.cached { ", cached" } else { "" }
                );
                for d in &c.diagnostics {
                    eprintln!("marawacc: {}", d);
                }
            }
            c
        }
        Err(Error::Codegen(e)) => {
            let diag = Diagnostic::new(DiagLevel::Error, None, e.to_string())
                .with_code(codes::GENERATION_FAILED)
                .with_hint("run the computation on the host evaluator instead");
            eprintln!("marawacc: {}", diag);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("marawacc: error: {}", e);
            std::process::exit(2);
        }
    }
}

fn print_kernels(compiled: &Compiled) {
    let many = compiled.kernels.len() > 1;
    for k in &compiled.kernels {
        if many {
            println!("// device {}", k.device);
        }
        print!("{}", k.source);
    }
}

fn render(array: &PArray) -> String {
    array
        .to_vec()
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
