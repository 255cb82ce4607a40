use thiserror::Error;

/// Fatal guest traps. Any of these halts the VM after a diagnostic is logged
/// (see `Vm::run`); there is no guest-visible recovery path.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("integer divide by zero at pc {pc:#010x}")]
    DivideByZero { pc: u32 },
    #[error("integer modulo by zero at pc {pc:#010x}")]
    ModuloByZero { pc: u32 },
    #[error("float divide by zero at pc {pc:#010x}")]
    FloatDivideByZero { pc: u32 },
    #[error("float modulo by zero at pc {pc:#010x}")]
    FloatModuloByZero { pc: u32 },
    #[error("misaligned pc {pc:#010x} in 32-bit mode")]
    MisalignedPc { pc: u32 },
}
