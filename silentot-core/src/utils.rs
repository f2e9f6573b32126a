use std::ops::BitXorAssign;

pub fn xor_inplace<T: Copy + BitXorAssign>(a: &mut [T], b: &[T]) {
    a.iter_mut().zip(b).for_each(|(a, b)| {
        *a ^= *b;
    });
}

/// Smallest `d` such that `2^d >= val`.
///
/// # Panics
/// If `val == 0`.
pub fn log2_ceil(val: usize) -> usize {
    let log2 = val.ilog2();
    if val > (1 << log2) {
        (log2 + 1) as usize
    } else {
        log2 as usize
    }
}
