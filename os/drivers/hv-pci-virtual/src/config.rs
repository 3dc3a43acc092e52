//! Byte-range overlay of configuration-space fields.
//!
//! A configuration access covers `len` bytes at some `offset`; a register
//! ("field") covers `size` bytes at its own offset. Neither needs to be
//! aligned to the other. [`patch`] computes which bytes of the field land
//! where in the access buffer, [`FieldPatch::apply`] writes them.

use crate::IoSize;

/// The bytes a configuration access touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigWindow {
    offset: u16,
    size: IoSize,
}

impl ConfigWindow {
    #[must_use]
    pub const fn new(size: IoSize, offset: u16) -> Self {
        Self { offset, size }
    }

    #[must_use]
    pub const fn offset(self) -> u16 {
        self.offset
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.size.len()
    }
}

/// A fixed register value of up to four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigField {
    pub offset: u16,
    /// Size in bytes, 1 to 4.
    pub size: u8,
    pub value: u32,
}

impl ConfigField {
    #[must_use]
    pub const fn new(offset: u16, size: u8, value: u32) -> Self {
        Self { offset, size, value }
    }
}

/// Bytes to store into an access buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPatch {
    /// Index into the access buffer.
    pub at: usize,
    bytes: [u8; 4],
    len: usize,
}

impl FieldPatch {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Store the patch into `buf`, the buffer of the window it was computed
    /// for. Bytes beyond `buf` are skipped.
    pub fn apply(&self, buf: &mut [u8]) {
        let end = (self.at + self.len).min(buf.len());
        if self.at < end {
            buf[self.at..end].copy_from_slice(&self.bytes[..end - self.at]);
        }
    }
}

/// Where `field` intersects `window`, if it does.
#[must_use]
pub fn patch(window: ConfigWindow, field: ConfigField) -> Option<FieldPatch> {
    let w_start = usize::from(window.offset);
    let w_end = w_start + window.len();
    let f_start = usize::from(field.offset);
    let f_end = f_start + usize::from(field.size.min(4));

    let start = w_start.max(f_start);
    let end = w_end.min(f_end);
    if start >= end {
        return None;
    }

    let value = field.value.to_le_bytes();
    let len = end - start;
    let mut bytes = [0; 4];
    bytes[..len].copy_from_slice(&value[start - f_start..start - f_start + len]);
    Some(FieldPatch {
        at: start - w_start,
        bytes,
        len,
    })
}

/// Overlay `field` onto `buf`, the result buffer of `window`.
pub fn overlay(window: ConfigWindow, field: ConfigField, buf: &mut [u8]) {
    if let Some(p) = patch(window, field) {
        p.apply(buf);
    }
}
