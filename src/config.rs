use crate::{codegen::reg_alloc::Strategy, frame::Arch, profile::Profile};

/// Options for one [`Compiler`](crate::Compiler).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub arch: Arch,
    pub strategy: Strategy,
    pub profile: Option<Profile>,
    /// Run the validator on every emitted function.
    pub validate: bool,
    /// Run the peephole pass before validation.
    pub peephole: bool,
    /// Sign and authenticate the return address (`paciasp`/`autiasp`).
    /// Ignored by targets without pointer authentication.
    pub pointer_auth: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arch: Arch::Arm64,
            strategy: Strategy::GraphColoring,
            profile: None,
            validate: true,
            peephole: false,
            pointer_auth: false,
        }
    }
}

impl Config {
    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn with_peephole(mut self, peephole: bool) -> Self {
        self.peephole = peephole;
        self
    }

    pub fn with_pointer_auth(mut self, pointer_auth: bool) -> Self {
        self.pointer_auth = pointer_auth;
        self
    }
}
