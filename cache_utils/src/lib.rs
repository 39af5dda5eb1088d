#![deny(unsafe_op_in_unsafe_fn)]

pub mod clock;
pub mod mmap;

#[cfg(target_arch = "x86_64")]
use core::arch::x86_64 as arch_x86;
use core::ptr;

// rdtsc (has mfence before and after)
#[cfg(target_arch = "x86_64")]
pub unsafe fn rdtsc_fence() -> u64 {
    unsafe {
        arch_x86::_mm_mfence();
        let tsc: u64 = arch_x86::_rdtsc();
        arch_x86::_mm_mfence();
        tsc
    }
}

/// # Safety
///
/// p must be valid for a read of one `T`.
pub unsafe fn maccess<T>(p: *const T) {
    unsafe { ptr::read_volatile(p) };
}

// flush (cflush)
#[cfg(target_arch = "x86_64")]
pub unsafe fn flush(p: *const u8) {
    unsafe { arch_x86::_mm_clflush(p) };
}

pub const CACHE_LINE_LEN: usize = 64;
pub const PAGE_LEN: usize = 1 << 12;

pub fn cache_line_of<T>(p: *const T) -> usize {
    (p as usize) & !(CACHE_LINE_LEN - 1)
}

pub fn page_of<T>(p: *const T) -> usize {
    (p as usize) & !(PAGE_LEN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_and_page_masks() {
        let p = 0x7f00_1234_5678usize as *const u8;
        assert_eq!(cache_line_of(p), 0x7f00_1234_5640);
        assert_eq!(page_of(p), 0x7f00_1234_5000);
    }

    #[test]
    fn maccess_reads_without_side_effect() {
        let v = [0xabu8; 8];
        unsafe { maccess(v.as_ptr()) };
        assert_eq!(v[0], 0xab);
    }
}
