//! Reference-counted heap blocks addressed by handle.
//!
//! Block layout, in words:
//!
//! | offset | meaning                                     |
//! |--------|---------------------------------------------|
//! | 0      | reference count                             |
//! | 1      | reserved                                    |
//! | 2      | element count                               |
//! | 3      | 1 when the elements are themselves handles  |
//! | 4..    | elements                                    |
//!
//! Handle 0 is null. Handles are table indices plus one, so a resize never
//! changes a handle. Nothing is collected implicitly: a block goes away
//! when its count drops to zero through [`Heap::release`].

use crate::bytecode::op::{ARRAY_HEADER_SIZE, ARRAY_LENGTH_OFFSET};
use crate::runtime::runtime_error::RuntimeErrorKind;

const REFCOUNT: usize = 0;
const LENGTH: usize = ARRAY_LENGTH_OFFSET as usize;
const HOLDS_HANDLES: usize = 3;
const HEADER: usize = ARRAY_HEADER_SIZE as usize;

/// A block still allocated when the program ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leak {
    pub handle: i64,
    pub length: i64,
    pub refcount: i64,
}

#[derive(Debug, Default)]
pub struct Heap {
    blocks: Vec<Option<Vec<i64>>>,
    free: Vec<usize>,
    max: usize,
}

type HeapResult<T> = Result<T, RuntimeErrorKind>;

impl Heap {
    pub fn new(max: usize) -> Self {
        Heap {
            blocks: Vec::new(),
            free: Vec::new(),
            max,
        }
    }

    /// New block of `len` zeroed elements, owned once by the caller.
    pub fn alloc(&mut self, len: usize, holds_handles: bool) -> HeapResult<i64> {
        let mut block = vec![0; HEADER + len];
        block[REFCOUNT] = 1;
        block[LENGTH] = len as i64;
        block[HOLDS_HANDLES] = holds_handles as i64;

        let index = match self.free.pop() {
            Some(index) => index,
            None if self.blocks.len() < self.max => {
                self.blocks.push(None);
                self.blocks.len() - 1
            }
            None => return Err(RuntimeErrorKind::HeapExhausted(self.max)),
        };
        self.blocks[index] = Some(block);
        Ok(index as i64 + 1)
    }

    pub fn alloc_from(&mut self, elements: &[i64], holds_handles: bool) -> HeapResult<i64> {
        let handle = self.alloc(elements.len(), holds_handles)?;
        self.block_mut(handle)?[HEADER..].copy_from_slice(elements);
        Ok(handle)
    }

    pub fn alloc_string(&mut self, text: &str) -> HeapResult<i64> {
        let chars: Vec<i64> = text.chars().map(|c| c as i64).collect();
        self.alloc_from(&chars, false)
    }

    fn block(&self, handle: i64) -> HeapResult<&Vec<i64>> {
        if handle == 0 {
            return Err(RuntimeErrorKind::NullHandle);
        }
        self.blocks
            .get((handle - 1) as usize)
            .and_then(Option::as_ref)
            .filter(|_| handle > 0)
            .ok_or(RuntimeErrorKind::InvalidHandle(handle))
    }

    fn block_mut(&mut self, handle: i64) -> HeapResult<&mut Vec<i64>> {
        if handle == 0 {
            return Err(RuntimeErrorKind::NullHandle);
        }
        if handle < 0 {
            return Err(RuntimeErrorKind::InvalidHandle(handle));
        }
        self.blocks
            .get_mut((handle - 1) as usize)
            .and_then(Option::as_mut)
            .ok_or(RuntimeErrorKind::InvalidHandle(handle))
    }

    /// Word at `offset` from the start of the block (header included).
    pub fn load(&self, handle: i64, offset: i64) -> HeapResult<i64> {
        let block = self.block(handle)?;
        usize::try_from(offset)
            .ok()
            .and_then(|o| block.get(o))
            .copied()
            .ok_or(RuntimeErrorKind::HeapAccess { handle, offset })
    }

    pub fn store(&mut self, handle: i64, offset: i64, value: i64) -> HeapResult<()> {
        let block = self.block_mut(handle)?;
        let slot = usize::try_from(offset)
            .ok()
            .and_then(|o| block.get_mut(o))
            .ok_or(RuntimeErrorKind::HeapAccess { handle, offset })?;
        *slot = value;
        Ok(())
    }

    pub fn length(&self, handle: i64) -> HeapResult<i64> {
        Ok(self.block(handle)?[LENGTH])
    }

    pub fn refcount(&self, handle: i64) -> HeapResult<i64> {
        Ok(self.block(handle)?[REFCOUNT])
    }

    pub fn holds_handles(&self, handle: i64) -> HeapResult<bool> {
        Ok(self.block(handle)?[HOLDS_HANDLES] != 0)
    }

    pub fn elements(&self, handle: i64) -> HeapResult<&[i64]> {
        Ok(&self.block(handle)?[HEADER..])
    }

    pub fn read_string(&self, handle: i64) -> HeapResult<String> {
        if handle == 0 {
            return Ok(String::new());
        }
        Ok(self
            .elements(handle)?
            .iter()
            .map(|&c| char::from_u32(c as u32).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect())
    }

    /// Null is ignored.
    pub fn addref(&mut self, handle: i64) -> HeapResult<()> {
        if handle == 0 {
            return Ok(());
        }
        self.block_mut(handle)?[REFCOUNT] += 1;
        Ok(())
    }

    /// Drops one reference. A block reaching zero is freed, and when it holds
    /// handles each element is released in turn. Null is ignored.
    pub fn release(&mut self, handle: i64) -> HeapResult<()> {
        let mut pending = vec![handle];
        while let Some(handle) = pending.pop() {
            if handle == 0 {
                continue;
            }
            let block = self.block_mut(handle)?;
            block[REFCOUNT] -= 1;
            if block[REFCOUNT] > 0 {
                continue;
            }
            if block[HOLDS_HANDLES] != 0 {
                pending.extend_from_slice(&block[HEADER..]);
            }
            let index = (handle - 1) as usize;
            self.blocks[index] = None;
            self.free.push(index);
        }
        Ok(())
    }

    /// Changes the element count in place. New elements are zero; dropped
    /// elements that are handles are released.
    pub fn resize(&mut self, handle: i64, len: usize) -> HeapResult<()> {
        let block = self.block_mut(handle)?;
        let dropped: Vec<i64> = if block[HOLDS_HANDLES] != 0 && HEADER + len < block.len() {
            block[HEADER + len..].to_vec()
        } else {
            Vec::new()
        };
        block.resize(HEADER + len, 0);
        block[LENGTH] = len as i64;
        for element in dropped {
            self.release(element)?;
        }
        Ok(())
    }

    pub fn live_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    pub fn leaks(&self) -> Vec<Leak> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, block)| {
                block.as_ref().map(|b| Leak {
                    handle: i as i64 + 1,
                    length: b[LENGTH],
                    refcount: b[REFCOUNT],
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_sets_header() {
        let mut heap = Heap::new(16);
        let h = heap.alloc(3, false).unwrap();
        assert_eq!(h, 1);
        assert_eq!(heap.length(h).unwrap(), 3);
        assert_eq!(heap.refcount(h).unwrap(), 1);
        assert_eq!(heap.load(h, 4).unwrap(), 0);
        assert!(heap.load(h, 7).is_err());
    }

    #[test]
    fn test_release_frees_at_zero() {
        let mut heap = Heap::new(16);
        let h = heap.alloc(1, false).unwrap();
        heap.addref(h).unwrap();
        heap.release(h).unwrap();
        assert_eq!(heap.live_count(), 1);
        heap.release(h).unwrap();
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.load(h, 0), Err(RuntimeErrorKind::InvalidHandle(h)));
    }

    #[test]
    fn test_release_is_recursive_for_nested_arrays() {
        let mut heap = Heap::new(16);
        let a = heap.alloc_string("ab").unwrap();
        let b = heap.alloc_string("cd").unwrap();
        let outer = heap.alloc_from(&[a, b, 0], true).unwrap();
        heap.release(outer).unwrap();
        assert!(heap.leaks().is_empty());
    }

    #[test]
    fn test_null_is_ignored_but_not_readable() {
        let mut heap = Heap::new(16);
        assert!(heap.addref(0).is_ok());
        assert!(heap.release(0).is_ok());
        assert_eq!(heap.load(0, 4), Err(RuntimeErrorKind::NullHandle));
        assert_eq!(heap.read_string(0).unwrap(), "");
    }

    #[test]
    fn test_handles_are_reused_and_bounded() {
        let mut heap = Heap::new(2);
        let a = heap.alloc(0, false).unwrap();
        let _b = heap.alloc(0, false).unwrap();
        assert_eq!(heap.alloc(0, false), Err(RuntimeErrorKind::HeapExhausted(2)));
        heap.release(a).unwrap();
        assert_eq!(heap.alloc(0, false).unwrap(), a);
    }

    #[test]
    fn test_resize_keeps_handle() {
        let mut heap = Heap::new(4);
        let h = heap.alloc_from(&[1, 2, 3], false).unwrap();
        heap.resize(h, 5).unwrap();
        assert_eq!(heap.elements(h).unwrap(), &[1, 2, 3, 0, 0]);
        heap.resize(h, 1).unwrap();
        assert_eq!(heap.elements(h).unwrap(), &[1]);
        assert_eq!(heap.length(h).unwrap(), 1);
    }

    #[test]
    fn test_leak_report() {
        let mut heap = Heap::new(4);
        let h = heap.alloc_string("leak").unwrap();
        assert_eq!(
            heap.leaks(),
            vec![Leak {
                handle: h,
                length: 4,
                refcount: 1
            }]
        );
    }
}
