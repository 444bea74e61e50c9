//! # Window
//!
//! Bounds-checked views over a copy of module memory. All scanning happens on a [`Window`],
//! so every offset produced by a search is known to lie inside the bytes that were read.

use std::ops::Range;

/// A read-only snapshot of `data.len()` bytes of memory that started at `base`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window<'a> {
    /// Address the first byte was read from
    base: usize,
    /// Bytes of the window
    data: &'a [u8],
}

impl<'a> Window<'a> {
    /// Creates a window over `data`, which was read from `base`
    pub fn new(base: usize, data: &'a [u8]) -> Self {
        Self { base, data }
    }

    /// Address of the first byte
    pub fn base(&self) -> usize {
        self.base
    }

    /// Number of bytes in the window
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the window holds no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw bytes of the window
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Address range covered by the window
    pub fn range(&self) -> Range<usize> {
        self.base..self.base + self.data.len()
    }

    /// Converts an offset into the window into an absolute address.
    /// Returns `None` if the offset is outside of the window.
    pub fn address_of(&self, offset: usize) -> Option<usize> {
        (offset < self.data.len()).then(|| self.base + offset)
    }

    /// Returns `len` bytes starting at `offset`, if they are entirely inside the window
    pub fn get(&self, offset: usize, len: usize) -> Option<&'a [u8]> {
        let end = offset.checked_add(len)?;
        self.data.get(offset..end)
    }

    /// Narrows the window to at most `len` bytes starting at `offset`
    pub fn sub(&self, offset: usize, len: usize) -> Option<Window<'a>> {
        let data = self.data.get(offset..)?;
        let len = len.min(data.len());
        Some(Window::new(self.base + offset, &data[..len]))
    }
}

/// Clamps a search that starts at `start` and wants `want` bytes to the end of the module at
/// `module_base..module_base + module_size`. Returns `None` when `start` is outside the module.
pub fn clamp_to_module(
    start: usize,
    want: usize,
    module_base: usize,
    module_size: usize,
) -> Option<usize> {
    let end = module_base.checked_add(module_size)?;
    if start < module_base || start >= end {
        return None;
    }
    Some(want.min(end - start))
}
