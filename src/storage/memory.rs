//! System-memory facade: anonymous page mappings for bucket storage and
//! small heap blocks for bookkeeping arrays. Every path hands back
//! zero-initialised bytes; the occupancy bitmaps rely on that (all-zero
//! means all-free).

use std::alloc;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{self, MapFlags, ProtFlags};
use tracing::debug;

use crate::common::{BkvError, BkvResult};
use crate::context::SystemContext;

/// Map `page_count` fresh anonymous pages, readable and writable.
/// The kernel zero-fills anonymous private mappings.
pub fn page_alloc(ctx: &SystemContext, page_count: u32) -> BkvResult<NonNull<u8>> {
    let length = NonZeroUsize::new(page_count as usize * ctx.page_size())
        .ok_or_else(|| BkvError::OutOfMemory("page_alloc of zero pages".to_string()))?;

    debug!("page_alloc: {} pages ({} bytes)", page_count, length);

    let region = unsafe {
        mman::mmap_anonymous(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )
    }
    .map_err(|e| BkvError::OutOfMemory(format!("mmap of {} pages failed: {}", page_count, e)))?;

    Ok(region.cast())
}

/// Resize a mapped region to `new_page_count` pages. The region may move;
/// bytes past the old length come back zeroed. Both page counts must be
/// non-zero.
pub fn page_realloc(
    ctx: &SystemContext,
    region: NonNull<u8>,
    old_page_count: u32,
    new_page_count: u32,
) -> BkvResult<NonNull<u8>> {
    if old_page_count == 0 || new_page_count == 0 {
        return Err(BkvError::OutOfMemory(format!(
            "page_realloc with zero page count ({} -> {})",
            old_page_count, new_page_count
        )));
    }

    debug!("page_realloc: {} -> {} pages", old_page_count, new_page_count);

    remap_region(ctx, region, old_page_count, new_page_count)
}

/// Growth of an anonymous private mapping is zero-filled by the kernel.
#[cfg(target_os = "linux")]
fn remap_region(
    ctx: &SystemContext,
    region: NonNull<u8>,
    old_page_count: u32,
    new_page_count: u32,
) -> BkvResult<NonNull<u8>> {
    let moved = unsafe {
        mman::mremap(
            region.cast(),
            old_page_count as usize * ctx.page_size(),
            new_page_count as usize * ctx.page_size(),
            mman::MRemapFlags::MREMAP_MAYMOVE,
            None,
        )
    }
    .map_err(|e| {
        BkvError::OutOfMemory(format!(
            "mremap {} -> {} pages failed: {}",
            old_page_count, new_page_count, e
        ))
    })?;
    Ok(moved.cast())
}

/// No in-place page remap here: map a new region, copy, unmap the old.
#[cfg(not(target_os = "linux"))]
fn remap_region(
    ctx: &SystemContext,
    region: NonNull<u8>,
    old_page_count: u32,
    new_page_count: u32,
) -> BkvResult<NonNull<u8>> {
    let old_len = old_page_count as usize * ctx.page_size();
    let new_len = new_page_count as usize * ctx.page_size();
    let fresh = page_alloc(ctx, new_page_count)?;
    unsafe {
        std::ptr::copy_nonoverlapping(region.as_ptr(), fresh.as_ptr(), old_len.min(new_len));
    }
    page_free(ctx, region, old_page_count)?;
    Ok(fresh)
}

/// Unmap a region previously obtained from `page_alloc`/`page_realloc`.
pub fn page_free(ctx: &SystemContext, region: NonNull<u8>, page_count: u32) -> BkvResult<()> {
    if page_count == 0 {
        return Ok(());
    }
    let length = page_count as usize * ctx.page_size();
    unsafe { mman::munmap(region.cast(), length) }
        .map_err(|e| BkvError::Corrupt(format!("munmap of {} pages failed: {}", page_count, e)))
}

fn heap_layout(len: usize) -> BkvResult<alloc::Layout> {
    alloc::Layout::array::<u8>(len)
        .map_err(|e| BkvError::OutOfMemory(format!("heap layout of {} bytes: {}", len, e)))
}

/// Allocate a zero-initialised heap block of `len` bytes.
pub fn heap_alloc(len: usize) -> BkvResult<NonNull<u8>> {
    if len == 0 {
        return Err(BkvError::OutOfMemory("heap_alloc of zero bytes".to_string()));
    }
    let layout = heap_layout(len)?;
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    NonNull::new(ptr)
        .ok_or_else(|| BkvError::OutOfMemory(format!("heap alloc of {} bytes failed", len)))
}

/// Resize a heap block. Bytes in `[old_len, new_len)` come back zeroed when
/// growing.
pub fn heap_realloc(block: NonNull<u8>, old_len: usize, new_len: usize) -> BkvResult<NonNull<u8>> {
    if old_len == 0 || new_len == 0 {
        return Err(BkvError::OutOfMemory(format!(
            "heap_realloc with zero length ({} -> {})",
            old_len, new_len
        )));
    }
    let layout = heap_layout(old_len)?;
    let ptr = unsafe { alloc::realloc(block.as_ptr(), layout, new_len) };
    let block = NonNull::new(ptr).ok_or_else(|| {
        BkvError::OutOfMemory(format!("heap realloc {} -> {} bytes failed", old_len, new_len))
    })?;
    if new_len > old_len {
        unsafe { block.as_ptr().add(old_len).write_bytes(0, new_len - old_len) };
    }
    Ok(block)
}

/// Release a heap block. `len` must match the block's current length.
pub fn heap_free(block: NonNull<u8>, len: usize) {
    if len == 0 {
        return;
    }
    // Layout::array::<u8> only fails past isize::MAX, which an existing
    // allocation cannot be.
    let layout = alloc::Layout::array::<u8>(len).expect("layout of live heap block");
    unsafe { alloc::dealloc(block.as_ptr(), layout) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SystemContext {
        SystemContext::detect()
    }

    fn region_slice<'a>(ptr: NonNull<u8>, len: usize) -> &'a mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) }
    }

    #[test]
    fn page_alloc_returns_zeroed_pages() {
        let ctx = ctx();
        let region = page_alloc(&ctx, 4).unwrap();
        let bytes = region_slice(region, 4 * ctx.page_size());
        assert!(bytes.iter().all(|&b| b == 0));
        page_free(&ctx, region, 4).unwrap();
    }

    #[test]
    fn page_alloc_rejects_zero_pages() {
        assert!(page_alloc(&ctx(), 0).is_err());
    }

    #[test]
    fn page_realloc_preserves_data_and_zeroes_growth() {
        let ctx = ctx();
        let region = page_alloc(&ctx, 2).unwrap();
        region_slice(region, 2 * ctx.page_size()).fill(0xAB);

        let region = page_realloc(&ctx, region, 2, 5).unwrap();
        let bytes = region_slice(region, 5 * ctx.page_size());
        assert!(bytes[..2 * ctx.page_size()].iter().all(|&b| b == 0xAB));
        assert!(bytes[2 * ctx.page_size()..].iter().all(|&b| b == 0));
        page_free(&ctx, region, 5).unwrap();
    }

    #[test]
    fn heap_realloc_preserves_data_and_zeroes_growth() {
        let block = heap_alloc(16).unwrap();
        let bytes = region_slice(block, 16);
        assert!(bytes.iter().all(|&b| b == 0));
        bytes.fill(0xCD);

        let block = heap_realloc(block, 16, 64).unwrap();
        let bytes = region_slice(block, 64);
        assert!(bytes[..16].iter().all(|&b| b == 0xCD));
        assert!(bytes[16..].iter().all(|&b| b == 0));
        heap_free(block, 64);
    }
}
