//! Fast allocation of zeroed buffers.
use std::{alloc::Layout, mem};

use bytemuck::Zeroable;

/// Allocate a `Vec<T>` of length `len` with all bytes zero.
///
/// This uses [`std::alloc::alloc_zeroed`] which can hand out pages that are
/// already zero instead of writing `len` default values, which matters for the
/// large PPRF and encoder buffers.
pub fn allocate_zeroed_vec<T: Zeroable>(len: usize) -> Vec<T> {
    if len == 0 || mem::size_of::<T>() == 0 {
        return Vec::new();
    }
    let size = len * mem::size_of::<T>();
    let align = mem::align_of::<T>();
    let layout = Layout::from_size_align(size, align).expect("len too large");
    unsafe {
        let zeroed = std::alloc::alloc_zeroed(layout);
        if zeroed.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        // Safety:
        // - zeroed ptr was allocated via the global allocator with the alignment of T
        // - size of T times capacity (len) is equal to the size of the allocation
        // - all values are initialized because of alloc_zeroed and T: Zeroable
        Vec::from_raw_parts(zeroed as *mut T, len, len)
    }
}

#[cfg(test)]
mod tests {
    use super::allocate_zeroed_vec;
    use crate::Block;

    #[test]
    fn zeroed_blocks() {
        let v: Vec<Block> = allocate_zeroed_vec(1000);
        assert_eq!(1000, v.len());
        assert!(v.iter().all(|b| *b == Block::ZERO));
        let empty: Vec<[Block; 8]> = allocate_zeroed_vec(0);
        assert!(empty.is_empty());
    }
}
