//! Index arithmetic for the single-producer/single-consumer byte rings.
//!
//! Both rings keep one slot permanently unused so that `head == tail` means
//! empty and `(head + 1) % size == tail` means full. These helpers are pure
//! functions over `(head, tail, size)`; the actual byte storage lives in
//! target RAM on the firmware side and behind the debug backend on the
//! monitor side, so each caller supplies its own copy loop.

/// Bytes that can still be written without touching the reserved slot.
pub fn free_space(head: u32, tail: u32, size: u32) -> u32 {
    if head >= tail {
        size - (head - tail) - 1
    } else {
        tail - head - 1
    }
}

/// Bytes currently buffered between `tail` and `head`.
pub fn used(head: u32, tail: u32, size: u32) -> u32 {
    if head >= tail {
        head - tail
    } else {
        size - (tail - head)
    }
}

/// Advances an index by `n` positions modulo `size`.
pub fn advance(idx: u32, n: u32, size: u32) -> u32 {
    (idx + n) % size
}

/// A contiguous run of ring bytes, as `(offset, len)`.
pub type Span = (u32, u32);

/// Splits a transfer of `len` bytes starting at `start` into the one or two
/// contiguous spans it occupies, wrapping at `size`.
pub fn spans(start: u32, len: u32, size: u32) -> (Span, Option<Span>) {
    let to_end = size - start;
    if len <= to_end {
        ((start, len), None)
    } else {
        ((start, to_end), Some((0, len - to_end)))
    }
}
