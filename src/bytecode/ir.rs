use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::op::{Instruction, Opcode, Operand};

/// File signature of a versioned module.
pub const MODULE_MAGIC: &[u8; 4] = b"PPPB";
pub const MODULE_VERSION: u32 = 1;

/// Bytes per instruction in a legacy headerless file.
const LEGACY_WIDTH: usize = 12;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("cannot read module: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed module: {0}")]
    Decode(#[from] postcard::Error),
    #[error("module version {found} is not supported")]
    Version { found: u32 },
    #[error("legacy module length {0} is not a multiple of 12")]
    LegacyLength(usize),
    #[error("unknown opcode {code:#06x} at instruction {index}")]
    UnknownOpcode { code: u32, index: usize },
    #[error("instruction {0} still has an unresolved operand")]
    Unresolved(usize),
}

/// A compiled program: one flat instruction stream entered at address 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub version: u32,
    pub code: Vec<Instruction>,
}

impl Module {
    pub fn new(code: Vec<Instruction>) -> Self {
        Module {
            version: MODULE_VERSION,
            code,
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Fails on the first operand that is not a plain value.
    pub fn check_resolved(&self) -> Result<(), ModuleError> {
        match self
            .code
            .iter()
            .position(|ins| !matches!(ins.operand, Operand::Value(_)))
        {
            Some(index) => Err(ModuleError::Unresolved(index)),
            None => Ok(()),
        }
    }

    /// Magic followed by the postcard encoding of the module.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ModuleError> {
        self.check_resolved()?;
        let mut bytes = MODULE_MAGIC.to_vec();
        bytes.extend(postcard::to_allocvec(self)?);
        Ok(bytes)
    }

    /// Reads a versioned module, or a legacy headerless one when the magic
    /// is missing.
    pub fn from_bytes(bytes: &[u8]) -> Result<Module, ModuleError> {
        match bytes.strip_prefix(MODULE_MAGIC.as_slice()) {
            Some(body) => {
                let module: Module = postcard::from_bytes(body)?;
                if module.version != MODULE_VERSION {
                    return Err(ModuleError::Version {
                        found: module.version,
                    });
                }
                module.check_resolved()?;
                Ok(module)
            }
            None => Module::from_legacy(bytes),
        }
    }

    /// Three little-endian 32-bit words per instruction: opcode number,
    /// level, operand.
    fn from_legacy(bytes: &[u8]) -> Result<Module, ModuleError> {
        if bytes.len() % LEGACY_WIDTH != 0 {
            return Err(ModuleError::LegacyLength(bytes.len()));
        }
        let word = |chunk: &[u8], i: usize| {
            i32::from_le_bytes([chunk[i], chunk[i + 1], chunk[i + 2], chunk[i + 3]])
        };
        let code = bytes
            .chunks_exact(LEGACY_WIDTH)
            .enumerate()
            .map(|(index, chunk)| {
                let code = word(chunk, 0) as u32;
                let op = Opcode::from_code(code).ok_or(ModuleError::UnknownOpcode { code, index })?;
                Ok(Instruction::new(op, word(chunk, 4) as i64, word(chunk, 8) as i64))
            })
            .collect::<Result<Vec<_>, ModuleError>>()?;
        Ok(Module::new(code))
    }

    pub fn save(&self, path: &Path) -> Result<(), ModuleError> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Module, ModuleError> {
        Module::from_bytes(&fs::read(path)?)
    }
}
