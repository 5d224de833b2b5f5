//! Kernel argument marshaling.
//!
//! The driver takes kernel parameters as an array of pointers, one per
//! parameter, each pointing at that parameter's value. Every argument here is
//! stored in its own 64-bit slot; [`ArgBuffer`] owns the slots and the
//! pointer array together so the pointers can never outlive their targets.

use std::ffi::c_void;

use crate::error::{LaunchError, Result};
use crate::signature::Scalar;

/// Lossless conversion of a host value into a 64-bit argument word.
pub trait IntoWord {
    fn into_word(self) -> std::result::Result<u64, String>;
}

macro_rules! unsigned_into_word {
    ($($t:ty),*) => {$(
        impl IntoWord for $t {
            fn into_word(self) -> std::result::Result<u64, String> {
                Ok(self as u64)
            }
        }
    )*};
}

// Untyped arguments are unsigned 64-bit words, so negative values cannot be
// represented and are rejected rather than reinterpreted.
macro_rules! signed_into_word {
    ($($t:ty),*) => {$(
        impl IntoWord for $t {
            fn into_word(self) -> std::result::Result<u64, String> {
                u64::try_from(self)
                    .map_err(|_| format!("{} is not representable as an unsigned 64-bit integer", self))
            }
        }
    )*};
}

unsigned_into_word!(u8, u16, u32, u64, usize, bool);
signed_into_word!(i8, i16, i32, i64, isize, i128);

impl IntoWord for u128 {
    fn into_word(self) -> std::result::Result<u64, String> {
        u64::try_from(self)
            .map_err(|_| format!("{} is not representable as an unsigned 64-bit integer", self))
    }
}

impl IntoWord for Scalar {
    fn into_word(self) -> std::result::Result<u64, String> {
        Ok(self.to_word())
    }
}

/// Marshaled kernel arguments: one 64-bit word per argument plus the
/// parallel pointer array handed to the driver.
pub struct ArgBuffer {
    // Declared first so it is dropped before the words it points into.
    ptrs: Box<[*mut c_void]>,
    // A `Vec`, not a `Box`: moving a `Box` asserts unique access to its
    // allocation, which would invalidate the pointers in `ptrs`.
    words: Vec<u64>,
}

// SAFETY: the pointers only ever point into `words`, which the buffer owns.
// Moving the buffer to another thread moves both allocations with it. The
// buffer is deliberately not `Sync`: one in-flight launch owns it.
unsafe impl Send for ArgBuffer {}

impl ArgBuffer {
    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Pointer view; entry `i` points at `words()[i]`.
    pub fn ptrs(&self) -> &[*mut c_void] {
        &self.ptrs
    }

    /// Pointer to the parameter array as the driver expects it, or null for an
    /// empty argument list. Valid while `self` is alive.
    pub fn param_ptr(&self) -> *mut *mut c_void {
        if self.ptrs.is_empty() {
            std::ptr::null_mut()
        } else {
            self.ptrs.as_ptr() as *mut *mut c_void
        }
    }
}

impl std::fmt::Debug for ArgBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgBuffer").field("words", &self.words).finish()
    }
}

/// Marshal `values`, in order, into an [`ArgBuffer`].
pub fn marshal<I>(values: I) -> Result<ArgBuffer>
where
    I: IntoIterator,
    I::Item: IntoWord,
{
    let mut words: Vec<u64> = values
        .into_iter()
        .enumerate()
        .map(|(index, v)| {
            v.into_word()
                .map_err(|reason| LaunchError::ArgumentConversion { index, reason })
        })
        .collect::<Result<_>>()?;

    // `words` is never resized after this point, so the heap addresses stay
    // valid for the life of the buffer even when the buffer itself moves.
    let base = words.as_mut_ptr();
    let ptrs: Box<[*mut c_void]> = (0..words.len())
        // SAFETY: `i < words.len()`, so the offset stays inside the allocation.
        .map(|i| unsafe { base.add(i).cast::<c_void>() })
        .collect();

    tracing::trace!("marshaled {} kernel arguments", words.len());
    Ok(ArgBuffer { ptrs, words })
}
