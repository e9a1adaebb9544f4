//! the demo driver. lowers one of a few built-in sample programs to x64
//! assembly text for the chosen target.
//!
//! the IR normally arrives from an external producer; the samples here are
//! hand-built linkage units kept around for eyeballing backend output.
//!
//! run with `--help` for more info.

use lir::back::{lower_to_x64, Target};
use lir::common::Id;
use lir::ir::*;

use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the sample program to lower
    #[arg(value_enum, default_value_t = Sample::Add)]
    sample: Sample,
    /// the target abi
    #[arg(value_enum, short, long, default_value_t = Flavor::Sysv)]
    target: Flavor,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Sample {
    /// add two integer parameters
    Add,
    /// count a parameter down through a compare-and-branch loop
    Countdown,
    /// pass a constant string to an external function
    Greet,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Flavor {
    /// unix-like targets, system v abi
    Sysv,
    /// windows targets, microsoft x64 abi
    Windows,
}

fn id(name: &str) -> Id {
    Id::new(name.to_string())
}

/// `s32 add(s32 a, s32 b) { return a + b; }`
fn add_sample() -> Linkage {
    Linkage {
        type_defs: vec![Primitive::S32],
        functions: vec![Function {
            link_name: Some(id("add")),
            calling_convention: CallingConvention::Default,
            parameter_count: 2,
            types: vec![0, 0, 0],
            constants: vec![],
            instructions: vec![
                Instruction::Arith {
                    op: ArithOp::Add,
                    dest: Operand::reg(2),
                    lhs: Operand::reg(0),
                    rhs: Operand::reg(1),
                },
                Instruction::Return {
                    value: Some(Operand::reg(2)),
                },
            ],
        }],
    }
}

/// `s64 countdown(s64 n) { while (n > 0) n = n - 1; return n; }`
fn countdown_sample() -> Linkage {
    Linkage {
        type_defs: vec![Primitive::S64, Primitive::Boolean],
        functions: vec![Function {
            link_name: Some(id("countdown")),
            calling_convention: CallingConvention::Default,
            parameter_count: 1,
            types: vec![0, 1],
            constants: vec![
                Constant {
                    type_id: 0,
                    value: Value::Integer(1),
                },
                Constant {
                    type_id: 0,
                    value: Value::Integer(0),
                },
            ],
            instructions: vec![
                Instruction::Label { id: 0 },
                Instruction::Compare {
                    op: Comparison::Gt,
                    dest: Operand::reg(1),
                    lhs: Operand::reg(0),
                    rhs: Operand::constant(1),
                },
                Instruction::BranchNot {
                    cond: Operand::reg(1),
                    to: 1,
                },
                Instruction::Arith {
                    op: ArithOp::Sub,
                    dest: Operand::reg(0),
                    lhs: Operand::reg(0),
                    rhs: Operand::constant(0),
                },
                Instruction::Jump { to: 0 },
                Instruction::Label { id: 1 },
                Instruction::Return {
                    value: Some(Operand::reg(0)),
                },
            ],
        }],
    }
}

/// `s32 greet() { return puts("hello, world"); }`
fn greet_sample() -> Linkage {
    Linkage {
        type_defs: vec![Primitive::S32, Primitive::Pointer],
        functions: vec![Function {
            link_name: Some(id("greet")),
            calling_convention: CallingConvention::Default,
            parameter_count: 0,
            types: vec![0],
            constants: vec![
                Constant {
                    type_id: 1,
                    value: Value::String(b"hello, world".to_vec()),
                },
                Constant {
                    type_id: 1,
                    value: Value::Symbol(id("puts")),
                },
            ],
            instructions: vec![
                Instruction::Call {
                    dest: Some(Operand::reg(0)),
                    callee: Operand::constant(1),
                    conv: CallingConvention::Default,
                    arg_count: 1,
                },
                Instruction::Arg {
                    args: [Operand::constant(0); 3],
                },
                Instruction::Return {
                    value: Some(Operand::reg(0)),
                },
            ],
        }],
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let linkage = match args.sample {
        Sample::Add => add_sample(),
        Sample::Countdown => countdown_sample(),
        Sample::Greet => greet_sample(),
    };
    let target = match args.target {
        Flavor::Sysv => Target::SysV64,
        Flavor::Windows => Target::Windows,
    };

    let mut out = String::new();
    if let Err(error) = lower_to_x64(&linkage, target, &mut out) {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
    print!("{out}");
}
