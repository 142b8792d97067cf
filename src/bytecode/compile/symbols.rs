//! Scoped symbol table.
//!
//! A flat stack of entries addressed by [`SymbolId`]. Lookup scans from the
//! top down so the innermost declaration of a name wins. Blocks are
//! bracketed with [`SymbolTable::enter_block`] / [`SymbolTable::leave_block`];
//! leaving a block drops everything declared inside it and hands the dropped
//! entries back so the caller can still emit cleanup for their storage.

use crate::bytecode::compile_error::CompileErrorKind;
use crate::bytecode::op::SymbolId;
use crate::lang::{ConstValue, Type};
use crate::lexer::Span;
use crate::runtime::natives::Native;

#[derive(Debug, Clone, PartialEq)]
pub enum SymbolKind {
    Variable,
    Constant(ConstValue),
    /// A function or procedure body; `ty` holds its signature.
    Function,
    /// A `type` alias; `ty` is the aliased type.
    TypeAlias,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Address {
    /// Offset from the frame base of the declaring level.
    Slot(i64),
    /// Instruction index.
    Code(usize),
    /// Function declared ahead of its body.
    Predeclared,
    Native(Native),
    None,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub ty: Type,
    pub level: i64,
    pub address: Address,
    pub byref: bool,
    /// Declarations plus assignments seen so far. Drives the release guard
    /// at block exit.
    pub refed: u32,
    pub span: Span,
}

impl Symbol {
    pub fn new(name: &str, kind: SymbolKind, ty: Type, level: i64, address: Address) -> Self {
        Symbol {
            name: name.to_string(),
            kind,
            ty,
            level,
            address,
            byref: false,
            refed: 0,
            span: Span::default(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn is_variable(&self) -> bool {
        self.kind == SymbolKind::Variable
    }

    /// Variable whose slot owns an array handle.
    pub fn owns_handle(&self) -> bool {
        self.is_variable() && !self.byref && self.ty.is_array()
    }

    pub fn slot(&self) -> Option<i64> {
        match self.address {
            Address::Slot(a) => Some(a),
            _ => None,
        }
    }
}

/// Position of a block's first entry and its nesting depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMark {
    first: usize,
    depth: usize,
}

#[derive(Debug)]
pub struct SymbolTable {
    entries: Vec<Symbol>,
    blocks: Vec<usize>,
    max: usize,
}

impl SymbolTable {
    pub fn new(max: usize) -> Self {
        SymbolTable {
            entries: Vec::new(),
            blocks: vec![0],
            max,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn enter_block(&mut self) -> BlockMark {
        let mark = BlockMark {
            first: self.entries.len(),
            depth: self.blocks.len(),
        };
        self.blocks.push(mark.first);
        mark
    }

    /// Drops every entry declared since `mark` and returns them.
    pub fn leave_block(&mut self, mark: BlockMark) -> Vec<Symbol> {
        self.blocks.truncate(mark.depth.max(1));
        if mark.first >= self.entries.len() {
            return Vec::new();
        }
        self.entries.split_off(mark.first)
    }

    /// Adds an entry. Redeclaring a name inside the same block is an error,
    /// except over a native routine, which user code may shadow.
    pub fn declare(&mut self, symbol: Symbol) -> Result<SymbolId, CompileErrorKind> {
        if self.entries.len() >= self.max {
            return Err(CompileErrorKind::TooManyIdentifiers(self.max));
        }
        if let Some(existing) = self.lookup_in_block(&symbol.name) {
            if !matches!(self.get(existing).address, Address::Native(_)) {
                return Err(CompileErrorKind::Redeclared(symbol.name));
            }
        }
        self.entries.push(symbol);
        Ok(SymbolId((self.entries.len() - 1) as u32))
    }

    /// Innermost visible declaration of `name`.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.entries
            .iter()
            .rposition(|s| s.name == name)
            .map(|i| SymbolId(i as u32))
    }

    /// Declaration of `name` in the innermost block only.
    pub fn lookup_in_block(&self, name: &str) -> Option<SymbolId> {
        let floor = self.blocks.last().copied().unwrap_or(0);
        self.entries[floor..]
            .iter()
            .rposition(|s| s.name == name)
            .map(|i| SymbolId((floor + i) as u32))
    }

    /// Innermost declaration of `name` at exactly `level`.
    pub fn lookup_at_level(&self, name: &str, level: i64) -> Option<SymbolId> {
        self.entries
            .iter()
            .rposition(|s| s.name == name && s.level == level)
            .map(|i| SymbolId(i as u32))
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.entries[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.entries[id.0 as usize]
    }

    /// Ids of entries at `level` satisfying `pred`.
    pub fn ids_at_level(&self, level: i64, pred: impl Fn(&Symbol) -> bool) -> Vec<SymbolId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, s)| s.level == level && pred(s))
            .map(|(i, _)| SymbolId(i as u32))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str, level: i64, slot: i64) -> Symbol {
        Symbol::new(name, SymbolKind::Variable, Type::INTEGER, level, Address::Slot(slot))
    }

    #[test]
    fn test_inner_declaration_shadows_outer() {
        let mut table = SymbolTable::new(100);
        let outer = table.declare(var("x", 0, 3)).unwrap();
        assert_eq!(table.lookup("x"), Some(outer));

        let mark = table.enter_block();
        let inner = table.declare(var("x", 1, 3)).unwrap();
        assert_eq!(table.lookup("x"), Some(inner));
        assert_eq!(table.get(table.lookup("x").unwrap()).level, 1);

        let dropped = table.leave_block(mark);
        assert_eq!(dropped.len(), 1);
        assert_eq!(table.lookup("x"), Some(outer));
    }

    #[test]
    fn test_redeclaration_in_same_block() {
        let mut table = SymbolTable::new(100);
        table.declare(var("x", 0, 3)).unwrap();
        let err = table.declare(var("x", 0, 4)).unwrap_err();
        assert_eq!(err.code(), 4010);
    }

    #[test]
    fn test_natives_can_be_shadowed() {
        let mut table = SymbolTable::new(100);
        let native = Symbol::new(
            "print",
            SymbolKind::Function,
            Type::Void,
            0,
            Address::Native(Native::Print),
        );
        table.declare(native).unwrap();
        let user = table
            .declare(Symbol::new("print", SymbolKind::Function, Type::Void, 0, Address::Code(10)))
            .unwrap();
        assert_eq!(table.lookup("print"), Some(user));
    }

    #[test]
    fn test_identifier_limit() {
        let mut table = SymbolTable::new(2);
        table.declare(var("a", 0, 3)).unwrap();
        table.declare(var("b", 0, 4)).unwrap();
        let err = table.declare(var("c", 0, 5)).unwrap_err();
        assert_eq!(err.code(), 20001);
    }

    #[test]
    fn test_lookup_at_level() {
        let mut table = SymbolTable::new(100);
        let f = table
            .declare(Symbol::new("f", SymbolKind::Function, Type::Void, 0, Address::Predeclared))
            .unwrap();
        table.enter_block();
        table.declare(var("f", 1, 3)).unwrap();
        assert_eq!(table.lookup_at_level("f", 0), Some(f));
        assert_ne!(table.lookup("f"), Some(f));
    }

    #[test]
    fn test_same_name_in_sibling_blocks() {
        let mut table = SymbolTable::new(100);
        let mark = table.enter_block();
        table.declare(var("i", 1, 3)).unwrap();
        table.leave_block(mark);
        let mark = table.enter_block();
        assert!(table.declare(var("i", 1, 4)).is_ok());
        table.leave_block(mark);
        assert!(table.is_empty());
    }
}
