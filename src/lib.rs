pub mod asm;
pub mod codegen;
mod config;
pub mod frame;
pub mod ir;
pub mod profile;
pub mod validate;

use thiserror::Error;

pub use crate::{
    asm::Assembly,
    codegen::reg_alloc::{Allocation, Location, Strategy},
    config::Config,
    frame::{Arch, TargetDescriptor},
    ir::{Function, FunctionBuilder, Program},
    profile::Profile,
    validate::{Diagnostic, Report},
};
use crate::{
    codegen::{
        amd64::AMD64, arm64::ARM64, generate, peephole, reg_alloc, riscv64::RISCV64, Options,
    },
    ir::BlockId,
};

/// Everything produced for one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub name: String,
    pub assembly: Assembly,
    pub frame_size: u32,
    pub allocation: Allocation,
    /// Validator warnings. Empty when validation is off.
    pub warnings: Vec<Diagnostic>,
}

#[derive(Debug, Default, Clone)]
pub struct Compiler {
    config: Config,
}

impl Compiler {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn compile_function(&self, func: &Function) -> Result<Output, Error> {
        let config = &self.config;
        let target = config.arch.target();

        let allocation = reg_alloc::alloc(func, target, config.strategy, config.profile.as_ref())?;

        let layout: Vec<BlockId> = match &config.profile {
            Some(profile) => profile.layout(func),
            None => func.blocks().iter().map(|block| block.id()).collect(),
        };

        let options = Options {
            pointer_auth: config.pointer_auth,
        };
        let (assembly, frame) = match config.arch {
            Arch::Amd64 => generate::<AMD64>(func, &allocation, &layout, options)?,
            Arch::Arm64 => generate::<ARM64>(func, &allocation, &layout, options)?,
            Arch::Riscv64 => generate::<RISCV64>(func, &allocation, &layout, options)?,
        };

        let assembly = if config.peephole {
            peephole::optimize(config.arch, assembly)
        } else {
            assembly
        };

        let warnings = if config.validate {
            validate::validate(config.arch, &assembly.to_string())?.warnings
        } else {
            Vec::new()
        };

        log::info!(
            "compiled {} for {}: {} line(s), {} byte frame",
            func.name(),
            config.arch,
            assembly.len(),
            frame.size()
        );

        Ok(Output {
            name: func.name().to_string(),
            assembly,
            frame_size: frame.size(),
            allocation,
            warnings,
        })
    }

    /// Compiles every function on its own; one failure does not stop the rest.
    pub fn compile_program(&self, program: &Program) -> Vec<(String, Result<Output, Error>)> {
        program
            .functions()
            .iter()
            .map(|func| (func.name().to_string(), self.compile_function(func)))
            .collect()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("{0}")]
    IrError(#[from] ir::Error),

    #[error("{0}")]
    AllocError(#[from] reg_alloc::Error),

    #[error("{0}")]
    CodegenError(#[from] codegen::Error),

    #[error("{0}")]
    ValidationError(#[from] validate::Error),
}
