mod common;

use anyhow::{ensure, Context as _, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use ssa_codegen::{
    ir::{BinOp, Type, Value},
    validate, Arch, Compiler, Config, Error, Function, FunctionBuilder, Location, Output, Profile,
    Program, Strategy,
};
use strum::IntoEnumIterator;

use common::{init_logger, Machine};

fn configs() -> Vec<(Arch, Strategy)> {
    Arch::iter()
        .flat_map(|arch| Strategy::iter().map(move |strategy| (arch, strategy)))
        .collect()
}

fn compiler(arch: Arch, strategy: Strategy) -> Compiler {
    Compiler::new(Config::default().with_arch(arch).with_strategy(strategy))
}

fn compile(compiler: &Compiler, func: &Function) -> Result<Output> {
    let config = compiler.config();
    let output = compiler
        .compile_function(func)
        .with_context(|| format!("{} on {} with {}", func.name(), config.arch, config.strategy))?;
    ensure!(output.frame_size % 16 == 0, "frame of {} bytes", output.frame_size);
    Ok(output)
}

/// Compiles `func` for every target and strategy and runs each case.
fn check(func: &Function, externals: &[(&str, usize)], cases: &[(Vec<i64>, i64)]) -> Result<()> {
    configs().into_par_iter().try_for_each(|(arch, strategy)| {
        let output = compile(&compiler(arch, strategy), func)?;
        let text = output.assembly.to_string();

        let (ok, report) = validate::report(arch, &text);
        ensure!(ok, "{}\n{}", report, text);

        for (args, expected) in cases {
            let mut machine = externals
                .iter()
                .fold(Machine::new(arch, &text), |m, (name, arity)| m.external(name, *arity));
            let result = machine
                .call(func.name(), args)
                .with_context(|| format!("{} with {} on {:?}\n{}", arch, strategy, args, text))?;
            ensure!(
                result == *expected,
                "{} with {}: {}{:?} = {}, expected {}\n{}",
                arch,
                strategy,
                func.name(),
                args,
                result,
                expected,
                text
            );
        }
        Ok(())
    })
}

fn identity() -> Function {
    let mut builder = FunctionBuilder::new("identity", Some(Type::Int));
    let x = builder.param(Type::Int);
    let entry = builder.block("entry");
    builder.ret(entry, Some(x));
    builder.build().unwrap()
}

fn add() -> Function {
    let mut builder = FunctionBuilder::new("add", Some(Type::Int));
    let a = builder.param(Type::Int);
    let b = builder.param(Type::Int);
    let entry = builder.block("entry");
    let sum = builder.binop(entry, BinOp::Add, a, b);
    builder.ret(entry, Some(sum));
    builder.build().unwrap()
}

/// `if a < b { b - a } else { a }`, with the phi fed straight from the
/// conditional branch.
fn gap() -> Function {
    let mut builder = FunctionBuilder::new("gap", Some(Type::Int));
    let a = builder.param(Type::Int);
    let b = builder.param(Type::Int);
    let entry = builder.block("entry");
    let small = builder.block("small");
    let join = builder.block("join");

    let less = builder.binop(entry, BinOp::Lt, a, b);
    builder.cond_branch(entry, less, small, join);

    let d = builder.binop(small, BinOp::Sub, b, a);
    builder.branch(small, join);

    let r = builder.phi(join, Type::Int, vec![(entry, a), (small, d)]);
    builder.ret(join, Some(r));
    builder.build().unwrap()
}

/// `1 + 2 + ... + n`
fn sum_to() -> Function {
    let mut builder = FunctionBuilder::new("sum_to", Some(Type::Int));
    let n = builder.param(Type::Int);
    let entry = builder.block("entry");
    let head = builder.block("head");
    let body = builder.block("body");
    let exit = builder.block("exit");

    builder.branch(entry, head);

    let i = builder.phi(head, Type::Int, vec![(entry, Value::int(0))]);
    let acc = builder.phi(head, Type::Int, vec![(entry, Value::int(0))]);
    let more = builder.binop(head, BinOp::Lt, i, n);
    builder.cond_branch(head, more, body, exit);

    let next = builder.binop(body, BinOp::Add, i, Value::int(1));
    let total = builder.binop(body, BinOp::Add, acc, next);
    builder.add_phi_source(head, i, body, next);
    builder.add_phi_source(head, acc, body, total);
    builder.branch(body, head);

    builder.ret(exit, Some(acc));
    builder.build().unwrap()
}

const PRESSURE: i64 = 16;

/// Keeps `PRESSURE` values alive at once.
fn pressure() -> Function {
    let mut builder = FunctionBuilder::new("pressure", Some(Type::Int));
    let x = builder.param(Type::Int);
    let entry = builder.block("entry");
    let values: Vec<_> = (1..=PRESSURE)
        .map(|i| builder.binop(entry, BinOp::Add, x, Value::int(i)))
        .collect();
    let sum = values[1..]
        .iter()
        .fold(values[0], |acc, v| builder.binop(entry, BinOp::Add, acc, *v));
    builder.ret(entry, Some(sum));
    builder.build().unwrap()
}

/// `(sum10(a, b, 1, ..., 8) + a) * b`
fn caller() -> Function {
    let mut builder = FunctionBuilder::new("caller", Some(Type::Int));
    let a = builder.param(Type::Int);
    let b = builder.param(Type::Int);
    let entry = builder.block("entry");
    let args = [a, b].into_iter().chain((1..=8).map(Value::int)).collect();
    let t = builder.call(entry, "sum10", args, Some(Type::Int)).unwrap();
    let u = builder.binop(entry, BinOp::Add, t, a);
    let r = builder.binop(entry, BinOp::Mul, u, b);
    builder.ret(entry, Some(r));
    builder.build().unwrap()
}

/// Sum of ten parameters, some of which arrive on the stack.
fn many_params() -> Function {
    let mut builder = FunctionBuilder::new("many", Some(Type::Int));
    let params: Vec<_> = (0..10).map(|_| builder.param(Type::Int)).collect();
    let entry = builder.block("entry");
    let sum = params[1..]
        .iter()
        .fold(params[0], |acc, p| builder.binop(entry, BinOp::Sub, acc, *p));
    builder.ret(entry, Some(sum));
    builder.build().unwrap()
}

/// `(a / b) + (a >= b) + 0x1234_5678_9abc`
fn arith() -> Function {
    let mut builder = FunctionBuilder::new("arith", Some(Type::Int));
    let a = builder.param(Type::Int);
    let b = builder.param(Type::Int);
    let entry = builder.block("entry");
    let q = builder.binop(entry, BinOp::Div, a, b);
    let ge = builder.binop(entry, BinOp::Ge, a, b);
    let s = builder.binop(entry, BinOp::Add, q, ge);
    let r = builder.binop(entry, BinOp::Add, s, Value::int(0x1234_5678_9abc));
    builder.ret(entry, Some(r));
    builder.build().unwrap()
}

/// `a * 8 + a * b + (a < 0)`
fn mix() -> Function {
    let mut builder = FunctionBuilder::new("mix", Some(Type::Int));
    let a = builder.param(Type::Int);
    let b = builder.param(Type::Int);
    let entry = builder.block("entry");
    let scaled = builder.binop(entry, BinOp::Mul, a, Value::int(8));
    let product = builder.binop(entry, BinOp::Mul, a, b);
    let sum = builder.binop(entry, BinOp::Add, product, scaled);
    let negative = builder.binop(entry, BinOp::Lt, a, Value::int(0));
    let r = builder.binop(entry, BinOp::Add, sum, negative);
    builder.ret(entry, Some(r));
    builder.build().unwrap()
}

/// `*p = x + 1; return x`
fn poke() -> Function {
    let mut builder = FunctionBuilder::new("poke", Some(Type::Int));
    let p = builder.param(Type::Ptr);
    let x = builder.param(Type::Int);
    let entry = builder.block("entry");
    let y = builder.binop(entry, BinOp::Add, x, Value::int(1));
    builder.store(entry, p, y);
    let copy = builder.load(entry, x);
    builder.ret(entry, Some(copy));
    builder.build().unwrap()
}

#[test]
fn test_identity_and_add() -> Result<()> {
    init_logger();
    check(&identity(), &[], &[(vec![42], 42), (vec![-7], -7)])?;
    check(&add(), &[], &[(vec![3, 5], 8), (vec![-50, -50], -100)])
}

#[test]
fn test_phi_resolution() -> Result<()> {
    init_logger();
    check(&gap(), &[], &[(vec![3, 10], 7), (vec![10, 3], 10), (vec![4, 4], 4)])?;
    check(&sum_to(), &[], &[(vec![10], 55), (vec![0], 0), (vec![1], 1)])
}

#[test]
fn test_spills_under_pressure() -> Result<()> {
    init_logger();
    let func = pressure();
    let expected = PRESSURE * 2 + PRESSURE * (PRESSURE + 1) / 2;
    check(&func, &[], &[(vec![2], expected)])?;

    for strategy in Strategy::iter() {
        let output = compile(&compiler(Arch::Amd64, strategy), &func)?;
        let spilled = output
            .allocation
            .iter()
            .filter(|(_, location)| matches!(location, Location::Stack(_)))
            .count();
        ensure!(spilled > 0, "{} kept {} values in 5 registers", strategy, PRESSURE);
    }
    Ok(())
}

#[test]
fn test_calls_with_stack_arguments() -> Result<()> {
    init_logger();
    let func = caller();
    check(&func, &[("sum10", 10)], &[(vec![2, 3], (2 + 3 + 36 + 2) * 3)])?;

    for (arch, strategy) in configs() {
        let output = compile(&compiler(arch, strategy), &func)?;
        let mut machine = Machine::new(arch, &output.assembly.to_string()).external("sum10", 10);
        machine.call("caller", &[-4, 9])?;
        assert_eq!(
            machine.calls(),
            [("sum10".to_string(), vec![-4, 9, 1, 2, 3, 4, 5, 6, 7, 8])],
            "{} with {}",
            arch,
            strategy
        );
    }
    Ok(())
}

#[test]
fn test_stack_parameters() -> Result<()> {
    init_logger();
    let args: Vec<i64> = (1..=10).collect();
    check(&many_params(), &[], &[(args, 1 - (2..=10).sum::<i64>())])
}

#[test]
fn test_arithmetic() -> Result<()> {
    init_logger();
    let k = 0x1234_5678_9abc;
    check(&arith(), &[], &[(vec![17, 5], 4 + k), (vec![-17, 5], -3 + k)])?;

    let mut rng = StdRng::seed_from_u64(7);
    let cases: Vec<(Vec<i64>, i64)> = (0..16)
        .map(|_| {
            let a = rng.gen_range(-10_000..10_000);
            let b = match rng.gen_range(-50..50) {
                0 => 1,
                b => b,
            };
            (vec![a, b], a / b + (a >= b) as i64 + k)
        })
        .collect();
    check(&arith(), &[], &cases)
}

#[test]
fn test_store_through_pointer() -> Result<()> {
    init_logger();
    let func = poke();
    for (arch, strategy) in configs() {
        let output = compile(&compiler(arch, strategy), &func)?;
        let mut machine = Machine::new(arch, &output.assembly.to_string());
        let result = machine.call("poke", &[0x20_0000, 41])?;
        assert_eq!(result, 41);
        assert_eq!(machine.memory(0x20_0000), Some(42), "{} with {}", arch, strategy);
    }
    Ok(())
}

#[test]
fn test_peephole_keeps_semantics() -> Result<()> {
    init_logger();
    for (arch, strategy) in configs() {
        for func in [identity(), gap(), sum_to(), pressure(), mix()] {
            let plain = compile(&compiler(arch, strategy), &func)?;
            let optimized = compile(
                &Compiler::new(
                    Config::default()
                        .with_arch(arch)
                        .with_strategy(strategy)
                        .with_peephole(true),
                ),
                &func,
            )?;
            assert!(optimized.assembly.len() <= plain.assembly.len());
            assert!(!optimized.warnings.iter().any(|w| w.message.starts_with("swap")));

            let args = [7; 2];
            let args = &args[..func.params().len()];
            let expected = Machine::new(arch, &plain.assembly.to_string()).call(func.name(), args)?;
            let result = Machine::new(arch, &optimized.assembly.to_string()).call(func.name(), args)?;
            assert_eq!(result, expected, "{} on {} with {}", func.name(), arch, strategy);
        }
    }

    // the arm64 identity copies its argument into x19 and back
    let plain = compile(&compiler(Arch::Arm64, Strategy::GraphColoring), &identity())?;
    assert!(plain.warnings.iter().any(|w| w.message.starts_with("swap")));

    let config = Config::default().with_arch(Arch::Arm64).with_peephole(true);
    let optimized = compile(&Compiler::new(config), &mix())?;
    let text = optimized.assembly.to_string();
    assert!(text.contains("lsl ") && text.contains("tst "), "{}", text);
    let result = Machine::new(Arch::Arm64, &text).call("mix", &[-3, 5])?;
    assert_eq!(result, -3 * 8 + -3 * 5 + 1);
    Ok(())
}

#[test]
fn test_pointer_auth() -> Result<()> {
    init_logger();
    for strategy in Strategy::iter() {
        let config = Config::default()
            .with_arch(Arch::Arm64)
            .with_strategy(strategy)
            .with_pointer_auth(true);
        let output = compile(&Compiler::new(config), &gap())?;
        let lines: Vec<_> = output.assembly.instructions().collect();
        assert_eq!(lines[0], "paciasp");
        let returns = lines.iter().filter(|l| **l == "ret").count();
        assert_eq!(lines.iter().filter(|l| **l == "autiasp").count(), returns);

        let result = Machine::new(Arch::Arm64, &output.assembly.to_string()).call("gap", &[2, 9])?;
        assert_eq!(result, 7, "{}", strategy);

        let plain = compile(&compiler(Arch::Arm64, strategy), &gap())?;
        assert!(!plain.assembly.to_string().contains("paciasp"));
    }

    // other targets have nothing to sign with
    let config = Config::default().with_arch(Arch::Riscv64).with_pointer_auth(true);
    let output = compile(&Compiler::new(config), &gap())?;
    assert_eq!(output.assembly, compile(&compiler(Arch::Riscv64, Strategy::GraphColoring), &gap())?.assembly);
    Ok(())
}

#[test]
fn test_profile_layout() -> Result<()> {
    init_logger();
    let func = sum_to();
    let profile = Profile::new()
        .with_hot_block("exit", 1000)
        .with_hot_block("head", 100)
        .with_hot_block("body", 10)
        .with_branch_weight("head", 0.9);

    let labels: Vec<_> = profile
        .layout(&func)
        .into_iter()
        .map(|id| func.block(id).label().to_string())
        .collect();
    assert_eq!(labels, ["entry", "exit", "head", "body"]);

    for (arch, strategy) in configs() {
        let config = Config::default()
            .with_arch(arch)
            .with_strategy(strategy)
            .with_profile(profile.clone());
        let output = compile(&Compiler::new(config), &func)?;
        let result = Machine::new(arch, &output.assembly.to_string()).call("sum_to", &[10])?;
        assert_eq!(result, 55, "{} with {}", arch, strategy);
    }
    Ok(())
}

#[test]
fn test_compile_program_in_parallel() -> Result<()> {
    init_logger();
    let program = Program::new(vec![identity(), add(), gap(), sum_to(), pressure(), caller()]);

    configs().par_iter().try_for_each(|(arch, strategy)| {
        let results = compiler(*arch, *strategy).compile_program(&program);
        ensure!(results.len() == program.functions().len());
        for (name, result) in results {
            let output = result.with_context(|| format!("{} on {}", name, arch))?;
            ensure!(output.name == name);
            ensure!(output.assembly.to_string().contains(&format!("{}:", name)));
        }
        Ok(())
    })
}

#[test]
fn test_errors() {
    init_logger();

    // float arithmetic is rejected, integer code next to it still compiles
    let mut builder = FunctionBuilder::new("scale", Some(Type::Float));
    let f = builder.param(Type::Float);
    let entry = builder.block("entry");
    builder.ret(entry, Some(f));
    let float = builder.build().unwrap();

    let program = Program::new(vec![float, add()]);
    let results = Compiler::default().compile_program(&program);
    assert!(matches!(results[0].1, Err(Error::CodegenError(_))));
    assert!(results[1].1.is_ok());

    // more arguments than registers plus the outgoing area
    let mut builder = FunctionBuilder::new("wide", None);
    let entry = builder.block("entry");
    builder.call(entry, "callee", (0..30).map(Value::int).collect(), None);
    builder.ret(entry, None);
    let wide = builder.build().unwrap();
    for arch in Arch::iter() {
        let result = Compiler::new(Config::default().with_arch(arch)).compile_function(&wide);
        assert!(matches!(result, Err(Error::CodegenError(_))), "{}", arch);
    }

    // malformed IR never reaches the back end
    let mut builder = FunctionBuilder::new("open", None);
    builder.block("entry");
    let error: Error = builder.build().unwrap_err().into();
    assert!(matches!(error, Error::IrError(_)));
    assert!(error.to_string().contains("no terminator"));
}
