//! Routines built into the machine and reached through `SYS`.
//!
//! The compiler pre-declares every entry at level 0 under its name, so user
//! code calls them like ordinary functions and may shadow them. Arguments
//! are pushed in order, `SYS 0 n` pops them and pushes the result, if any.
//! Array arguments are owned by the routine and released after the call;
//! `handle` arguments are borrowed.

use std::io::{BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::bytecode::op::{float_word, word_float};
use crate::lang::{FunctionDesc, ParamDesc, Type};
use crate::runtime::bignum::BigNum;
use crate::runtime::runtime_error::RuntimeErrorKind;
use crate::runtime::vm_bc::Machine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Native {
    MemoryAddref,
    MemoryRelease,
    ArrayCheck,
    CommandLine,
    I2s,
    C2s,
    B2s,
    F2s,
    S2i,
    S2f,
    NewIntegerArrayCopy,
    IntegerArrayAppend,
    IntegerArrayCompare,
    BigNumberAdd,
    BigNumberSub,
    BigNumberMul,
    BigNumberDiv,
    BigNumberMod,
    BigNumberCompare,
    Print,
    Println,
    ReadLine,
    Length,
    Resize,
    Clock,
    Time,
    FileOpen,
    FileClose,
    FileWrite,
    FileReadLine,
    FileEof,
}

impl Native {
    pub const ALL: [(Native, &'static str); 31] = [
        (Native::MemoryAddref, "__memory_addref"),
        (Native::MemoryRelease, "__memory_release"),
        (Native::ArrayCheck, "__array_check"),
        (Native::CommandLine, "__command_line"),
        (Native::I2s, "i2s"),
        (Native::C2s, "c2s"),
        (Native::B2s, "b2s"),
        (Native::F2s, "f2s"),
        (Native::S2i, "s2i"),
        (Native::S2f, "s2f"),
        (Native::NewIntegerArrayCopy, "new_integer_array_copy"),
        (Native::IntegerArrayAppend, "integer_array_append"),
        (Native::IntegerArrayCompare, "integer_array_compare"),
        (Native::BigNumberAdd, "big_number_add"),
        (Native::BigNumberSub, "big_number_sub"),
        (Native::BigNumberMul, "big_number_mul"),
        (Native::BigNumberDiv, "big_number_div"),
        (Native::BigNumberMod, "big_number_mod"),
        (Native::BigNumberCompare, "big_number_compare"),
        (Native::Print, "print"),
        (Native::Println, "println"),
        (Native::ReadLine, "read_line"),
        (Native::Length, "length"),
        (Native::Resize, "resize"),
        (Native::Clock, "clock"),
        (Native::Time, "time"),
        (Native::FileOpen, "file_open"),
        (Native::FileClose, "file_close"),
        (Native::FileWrite, "file_write"),
        (Native::FileReadLine, "file_read_line"),
        (Native::FileEof, "file_eof"),
    ];

    pub fn name(self) -> &'static str {
        Native::ALL
            .iter()
            .find(|(n, _)| *n == self)
            .map(|(_, name)| *name)
            .unwrap_or("?")
    }

    /// Operand of the `SYS` instruction.
    pub fn code(self) -> i64 {
        Native::ALL
            .iter()
            .position(|(n, _)| *n == self)
            .map(|i| i as i64)
            .unwrap_or(-1)
    }

    pub fn from_code(code: i64) -> Option<Native> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Native::ALL.get(i))
            .map(|(n, _)| *n)
    }

    pub fn signature(self) -> FunctionDesc {
        use Native::*;
        let int = || Type::INTEGER;
        let string = Type::string;
        let big = Type::big_number;
        let int_array = || Type::array_of(Type::INTEGER, -1);
        let (params, ret): (Vec<(&str, Type)>, Type) = match self {
            MemoryAddref | MemoryRelease => (vec![("h", Type::HANDLE)], Type::Void),
            ArrayCheck => (vec![("h", Type::HANDLE), ("index", int())], Type::Void),
            CommandLine | ReadLine => (vec![], string()),
            I2s => (vec![("value", int())], string()),
            C2s => (vec![("value", Type::CHARACTER)], string()),
            B2s => (vec![("value", Type::BOOLEAN)], string()),
            F2s => (vec![("value", Type::Float)], string()),
            S2i => (vec![("text", string())], int()),
            S2f => (vec![("text", string())], Type::Float),
            NewIntegerArrayCopy => (vec![("a", int_array())], int_array()),
            IntegerArrayAppend => (vec![("a", int_array()), ("b", int_array())], int_array()),
            IntegerArrayCompare => (vec![("a", int_array()), ("b", int_array())], int()),
            BigNumberAdd | BigNumberSub | BigNumberMul | BigNumberDiv | BigNumberMod => {
                (vec![("a", big()), ("b", big())], big())
            }
            BigNumberCompare => (vec![("a", big()), ("b", big())], int()),
            Print | Println => (vec![("text", string())], Type::Void),
            Length => (vec![("a", Type::array_of(Type::Unknown, -1))], int()),
            Resize => (vec![("h", Type::HANDLE), ("length", int())], Type::Void),
            Clock | Time => (vec![], int()),
            FileOpen => (vec![("path", string()), ("mode", string())], int()),
            FileClose => (vec![("file", int())], Type::Void),
            FileWrite => (vec![("file", int()), ("text", string())], Type::Void),
            FileReadLine => (vec![("file", int())], string()),
            FileEof => (vec![("file", int())], Type::BOOLEAN),
        };
        FunctionDesc {
            params: params
                .into_iter()
                .map(|(name, ty)| ParamDesc {
                    name: name.to_string(),
                    ty,
                    byref: false,
                    default: None,
                })
                .collect(),
            ret,
        }
    }
}

/// Text form of a float: integral finite values keep a `.0`.
pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

fn parse_big(text: &str) -> BigNum {
    BigNum::parse(text).unwrap_or_else(BigNum::zero)
}

impl Machine {
    /// Runs `native` against the top of the stack.
    pub(super) fn call_native(
        &mut self,
        native: Native,
        out: &mut dyn Write,
        input: &mut dyn BufRead,
    ) -> Result<(), RuntimeErrorKind> {
        let desc = native.signature();
        let args = self.pop_n(desc.params.len())?;
        let arg = |i: usize| args.get(i).copied().unwrap_or(0);

        let result = match native {
            Native::MemoryAddref => {
                self.heap.addref(arg(0))?;
                None
            }
            Native::MemoryRelease => {
                self.heap.release(arg(0))?;
                None
            }
            Native::ArrayCheck => {
                let length = self.heap.length(arg(0))?;
                let index = arg(1);
                if index < 0 || index >= length {
                    return Err(RuntimeErrorKind::IndexOutOfBounds { index, length });
                }
                None
            }
            Native::CommandLine => Some(self.heap.alloc_string(&self.command_line)?),
            Native::I2s => Some(self.heap.alloc_string(&arg(0).to_string())?),
            Native::C2s => {
                let c = char::from_u32(arg(0) as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
                Some(self.heap.alloc_string(&c.to_string())?)
            }
            Native::B2s => {
                let text = if arg(0) != 0 { "true" } else { "false" };
                Some(self.heap.alloc_string(text)?)
            }
            Native::F2s => Some(self.heap.alloc_string(&format_float(word_float(arg(0))))?),
            Native::S2i => {
                let text = self.heap.read_string(arg(0))?;
                Some(text.trim().parse::<i64>().unwrap_or(0))
            }
            Native::S2f => {
                let text = self.heap.read_string(arg(0))?;
                Some(float_word(text.trim().parse::<f64>().unwrap_or(0.0)))
            }
            Native::NewIntegerArrayCopy => Some(self.copy_elements(&[arg(0)])?),
            Native::IntegerArrayAppend => Some(self.copy_elements(&[arg(0), arg(1)])?),
            Native::IntegerArrayCompare => {
                let a = self.elements_or_empty(arg(0))?;
                let b = self.elements_or_empty(arg(1))?;
                Some(a.cmp(&b) as i64)
            }
            Native::BigNumberAdd
            | Native::BigNumberSub
            | Native::BigNumberMul
            | Native::BigNumberDiv
            | Native::BigNumberMod => {
                let a = parse_big(&self.heap.read_string(arg(0))?);
                let b = parse_big(&self.heap.read_string(arg(1))?);
                let value = match native {
                    Native::BigNumberAdd => a.add(&b),
                    Native::BigNumberSub => a.sub(&b),
                    Native::BigNumberMul => a.mul(&b),
                    Native::BigNumberDiv => a.div_rem(&b).ok_or(RuntimeErrorKind::DivideByZero)?.0,
                    _ => a.div_rem(&b).ok_or(RuntimeErrorKind::DivideByZero)?.1,
                };
                Some(self.heap.alloc_string(&value.to_string())?)
            }
            Native::BigNumberCompare => {
                let a = parse_big(&self.heap.read_string(arg(0))?);
                let b = parse_big(&self.heap.read_string(arg(1))?);
                Some(a.cmp(&b) as i64)
            }
            Native::Print | Native::Println => {
                let text = self.heap.read_string(arg(0))?;
                out.write_all(text.as_bytes())?;
                if native == Native::Println {
                    out.write_all(b"\n")?;
                }
                None
            }
            Native::ReadLine => {
                let mut line = String::new();
                input.read_line(&mut line)?;
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Some(self.heap.alloc_string(&line)?)
            }
            Native::Length => Some(if arg(0) == 0 { 0 } else { self.heap.length(arg(0))? }),
            Native::Resize => {
                self.heap.resize(arg(0), arg(1).max(0) as usize)?;
                None
            }
            Native::Clock => Some(self.started.elapsed().as_millis() as i64),
            Native::Time => Some(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0),
            ),
            Native::FileOpen => {
                let path = self.heap.read_string(arg(0))?;
                let mode = self.heap.read_string(arg(1))?;
                Some(self.files.open(&path, &mode)?)
            }
            Native::FileClose => {
                self.files.close(arg(0))?;
                None
            }
            Native::FileWrite => {
                let text = self.heap.read_string(arg(1))?;
                self.files.write(arg(0), &text)?;
                None
            }
            Native::FileReadLine => {
                let line = self.files.read_line(arg(0))?;
                Some(self.heap.alloc_string(&line)?)
            }
            Native::FileEof => Some(self.files.eof(arg(0))? as i64),
        };

        for (param, &value) in desc.params.iter().zip(&args) {
            if param.ty.is_array() {
                self.heap.release(value)?;
            }
        }
        if let Some(value) = result {
            self.push_word(value)?;
        }
        Ok(())
    }

    fn elements_or_empty(&self, handle: i64) -> Result<Vec<i64>, RuntimeErrorKind> {
        if handle == 0 {
            return Ok(Vec::new());
        }
        Ok(self.heap.elements(handle)?.to_vec())
    }

    /// New block holding the elements of `sources` in order. Elements that
    /// are handles gain a reference for the copy.
    fn copy_elements(&mut self, sources: &[i64]) -> Result<i64, RuntimeErrorKind> {
        let mut elements = Vec::new();
        let mut holds_handles = false;
        for &source in sources {
            if source == 0 {
                continue;
            }
            holds_handles |= self.heap.holds_handles(source)?;
            elements.extend_from_slice(self.heap.elements(source)?);
        }
        if holds_handles {
            for &element in &elements {
                self.heap.addref(element)?;
            }
        }
        self.heap.alloc_from(&elements, holds_handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for (native, name) in Native::ALL {
            assert_eq!(Native::from_code(native.code()), Some(native));
            assert_eq!(native.name(), name);
        }
        assert_eq!(Native::from_code(99), None);
        assert_eq!(Native::from_code(-1), None);
    }

    #[test]
    fn test_signatures() {
        let append = Native::IntegerArrayAppend.signature();
        assert_eq!(append.params.len(), 2);
        assert!(append.ret.is_array());
        assert!(!Native::Print.signature().returns_value());
        assert!(Native::Resize.signature().params[0].ty.is_handle());
        assert!(Native::FileEof.signature().ret.is_integer());
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(3.0), "3.0");
        assert_eq!(format_float(-0.5), "-0.5");
        assert_eq!(format_float(2.25), "2.25");
        assert_eq!(format_float(f64::INFINITY), "inf");
    }
}
