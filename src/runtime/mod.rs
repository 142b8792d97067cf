pub mod bignum;
pub mod files;
pub mod heap;
pub mod natives;
pub mod runtime_error;
pub mod vm_bc;

pub use runtime_error::{RuntimeError, RuntimeErrorKind};
pub use vm_bc::{Machine, MachineConfig, RunSummary};
