//! Per-bucket page-table management: bucket creation, contiguous-free-run
//! search over the occupancy bitmap, in-place page extension, single-slot
//! allocation, and teardown. Buckets are kept in an append-only arena; a
//! bucket appears at most once and its position carries no meaning.

use std::ptr::NonNull;

use tracing::{debug, error};

use crate::common::{BkvError, BkvResult};
use crate::context::SystemContext;
use crate::storage::bucket::{self, UsageGeometry};
use crate::storage::memory;
use crate::storage::records::PtblRecord;

/// Outcome of a free-run scan: either the starting logical page of a
/// sufficient run, or the length of the trailing free run (0 when the last
/// page is occupied) so the caller knows how many pages to add.
enum RunSearch {
    Found(u32),
    Exhausted { trailing_free: u32 },
}

pub struct PageTable {
    pub(crate) records: Vec<PtblRecord>,
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Position of the record managing `bucket`, if the bucket is live.
    /// Insertion order; a linear scan over at most 64 entries.
    pub fn lookup(&self, bucket: u8) -> Option<usize> {
        self.records.iter().position(|rec| rec.bucket() == bucket)
    }

    /// Ensure `bucket` exists with `page_count` contiguous free logical
    /// pages; returns the record position and the base of the free run.
    /// Extends the bucket's mapping when no sufficient run exists.
    pub fn alloc_pages(
        &mut self,
        ctx: &SystemContext,
        page_count: u32,
        bucket: u8,
    ) -> BkvResult<(usize, NonNull<u8>)> {
        debug!("alloc_pages: {} pages, bucket {}", page_count, bucket);

        let idx = match self.lookup(bucket) {
            None => {
                let (rec, base) = init_record(ctx, page_count, bucket)?;
                self.records.push(rec);
                return Ok((self.records.len() - 1, base));
            }
            Some(idx) => idx,
        };

        let rec = &self.records[idx];
        let base = rec.base.ok_or_else(|| {
            BkvError::Corrupt(format!("bucket {} has no mapped region", bucket))
        })?;

        match find_free_run(rec, bucket, page_count) {
            RunSearch::Found(start) => {
                let offset = start as usize * bucket::logical_page_bytes(ctx, bucket);
                Ok((idx, unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) }))
            }
            RunSearch::Exhausted { trailing_free } => {
                let run = self.extend(ctx, idx, bucket, page_count, trailing_free)?;
                Ok((idx, run))
            }
        }
    }

    /// Grow the bucket so that `want` pages are free at the tail, reusing
    /// whatever trailing free run already exists. Returns the run base.
    fn extend(
        &mut self,
        ctx: &SystemContext,
        idx: usize,
        bucket: u8,
        want: u32,
        trailing_free: u32,
    ) -> BkvResult<NonNull<u8>> {
        let rec = &mut self.records[idx];
        let old_page_count = rec.page_count();
        let new_page_count = old_page_count + want - trailing_free;
        let base = rec.base.ok_or_else(|| {
            BkvError::Corrupt(format!("bucket {} has no mapped region", bucket))
        })?;

        let new_base = memory::page_realloc(
            ctx,
            base,
            checked_os_span(bucket, old_page_count)?,
            checked_os_span(bucket, new_page_count)?,
        )?;
        // The OS may hand back a different virtual address.
        rec.base = Some(new_base);

        // Bitmap growth can be zero when several pages share a byte.
        let new_usage_length = bucket::usage_length(bucket, new_page_count);
        if new_usage_length > rec.page_usage_length {
            let usage = rec.page_usage.ok_or_else(|| {
                BkvError::Corrupt(format!("bucket {} has no occupancy bitmap", bucket))
            })?;
            let grown = memory::heap_realloc(
                usage,
                rec.page_usage_length as usize,
                new_usage_length as usize,
            )?;
            rec.page_usage = Some(grown);
            rec.page_usage_length = new_usage_length;
        }

        rec.set_page_count(new_page_count);
        debug!(
            "extended bucket {}: {} -> {} pages",
            bucket, old_page_count, new_page_count
        );

        let offset =
            (new_page_count - want) as usize * bucket::logical_page_bytes(ctx, bucket);
        Ok(unsafe { NonNull::new_unchecked(new_base.as_ptr().add(offset)) })
    }

    /// Claim one value slot in `bucket`, creating or extending the bucket
    /// as needed. Returns the record position and the slot index.
    pub fn slot_alloc(&mut self, ctx: &SystemContext, bucket: u8) -> BkvResult<(usize, u64)> {
        let idx = match self.lookup(bucket) {
            Some(idx) => idx,
            None => self.alloc_pages(ctx, 1, bucket)?.0,
        };

        if let Some(slot) = self.claim_free_slot(idx, bucket) {
            return Ok((idx, slot));
        }

        // Bitmap exhausted: add one page and take its first slot.
        let (idx, _) = self.alloc_pages(ctx, 1, bucket)?;
        let rec = &mut self.records[idx];
        let slot = (rec.page_count() - 1) as u64 * bucket::bits_per_page(bucket) as u64;
        let usage = rec.usage_mut();
        usage[(slot / 8) as usize] |= 1 << (slot % 8);
        Ok((idx, slot))
    }

    /// First zero bit wins: bit `j` of byte `i` is slot `i * 8 + j` in
    /// every bucket, since a page's slot count equals its bitmap width.
    fn claim_free_slot(&mut self, idx: usize, bucket: u8) -> Option<u64> {
        let bits = bucket::bits_per_page(bucket);
        let rec = &mut self.records[idx];
        let page_count = rec.page_count();
        let usage = rec.usage_mut();
        let last = usage.len().checked_sub(1)?;

        for (i, byte) in usage.iter_mut().enumerate() {
            // In the final byte of a sub-byte bitmap only the low bits that
            // map to real pages are valid; the rest is padding.
            let valid = if bits < 8 && i == last {
                match (page_count as u64 * bits as u64) % 8 {
                    0 => 8,
                    rem => rem as u32,
                }
            } else {
                8
            };
            for j in 0..valid {
                if *byte & (1 << j) == 0 {
                    *byte |= 1 << j;
                    return Some(i as u64 * 8 + j as u64);
                }
            }
        }
        None
    }

    /// Clear a slot's occupancy bit. Clearing an already-clear bit is a
    /// no-op.
    pub fn slot_free(&mut self, bucket: u8, slot: u64) -> BkvResult<()> {
        let idx = self.lookup(bucket).ok_or_else(|| {
            BkvError::Corrupt(format!("no bucket {} for freed slot {}", bucket, slot))
        })?;
        let usage = self.records[idx].usage_mut();
        let byte = (slot / 8) as usize;
        if byte >= usage.len() {
            return Err(BkvError::Corrupt(format!(
                "slot {} outside the bitmap of bucket {}",
                slot, bucket
            )));
        }
        usage[byte] &= !(1 << (slot % 8));
        Ok(())
    }

    /// Release every bucket's bitmap and page region. Bucket regions are
    /// held until this point even when they fall empty.
    pub fn free_all(&mut self, ctx: &SystemContext) {
        for rec in &mut self.records {
            if let Some(usage) = rec.page_usage.take() {
                memory::heap_free(usage, rec.page_usage_length as usize);
                rec.page_usage_length = 0;

                if let Some(base) = rec.base.take() {
                    // The span fit in a u32 when the region was mapped.
                    let os_pages = bucket::os_page_span(rec.bucket(), rec.page_count()) as u32;
                    if let Err(e) = memory::page_free(ctx, base, os_pages) {
                        error!("failed to unmap bucket {}: {}", rec.bucket(), e);
                    }
                }
            }
        }
        self.records = Vec::new();
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

fn checked_os_span(bucket: u8, logical_pages: u32) -> BkvResult<u32> {
    u32::try_from(bucket::os_page_span(bucket, logical_pages)).map_err(|_| {
        BkvError::OutOfMemory(format!(
            "{} logical pages of bucket {} exceed the mappable span",
            logical_pages, bucket
        ))
    })
}

/// Map the OS region and allocate the zeroed bitmap for a fresh bucket
/// record. All-zero bitmap means all pages free.
fn init_record(
    ctx: &SystemContext,
    page_count: u32,
    bucket: u8,
) -> BkvResult<(PtblRecord, NonNull<u8>)> {
    debug!("init bucket {}: {} pages", bucket, page_count);

    let os_pages = checked_os_span(bucket, page_count)?;
    let base = memory::page_alloc(ctx, os_pages)?;

    let usage_length = bucket::usage_length(bucket, page_count);
    let usage = match memory::heap_alloc(usage_length as usize) {
        Ok(ptr) => ptr,
        Err(e) => {
            let _ = memory::page_free(ctx, base, os_pages);
            return Err(e);
        }
    };

    let mut rec = PtblRecord::new();
    rec.base = Some(base);
    rec.page_usage = Some(usage);
    rec.page_usage_length = usage_length;
    rec.set_page_count(page_count);
    rec.set_bucket(bucket);
    Ok((rec, base))
}

/// Walk the bitmap for a contiguous run of `want` free logical pages.
/// What "free" means depends on the bucket's geometry family: whole
/// 8-byte words for buckets 0..=2, whole byte groups for 3..=5, and
/// bit groups within a byte for 6 and above (where contiguity crosses
/// byte boundaries and the final byte may end in padding bits).
fn find_free_run(rec: &PtblRecord, bucket: u8, want: u32) -> RunSearch {
    let page_count = rec.page_count();
    let usage = rec.usage();
    let mut free_pages: u32 = 0;

    match UsageGeometry::of(bucket) {
        UsageGeometry::WideByte => {
            let bpp = bucket::bytes_per_page(bucket) as usize;
            for page in 0..page_count as usize {
                let range = &usage[page * bpp..(page + 1) * bpp];
                let free = range
                    .chunks_exact(8)
                    .all(|word| u64::from_ne_bytes(word.try_into().unwrap()) == 0);
                if free {
                    free_pages += 1;
                    if free_pages >= want {
                        return RunSearch::Found(page as u32 + 1 - want);
                    }
                } else {
                    free_pages = 0;
                }
            }
        }
        UsageGeometry::ExactByte => {
            let bpp = bucket::bytes_per_page(bucket) as usize;
            for page in 0..page_count as usize {
                let free = usage[page * bpp..(page + 1) * bpp].iter().all(|&b| b == 0);
                if free {
                    free_pages += 1;
                    if free_pages >= want {
                        return RunSearch::Found(page as u32 + 1 - want);
                    }
                } else {
                    free_pages = 0;
                }
            }
        }
        UsageGeometry::SubByte => {
            let bits = bucket::bits_per_page(bucket);
            let pages_per_byte = 8 / bits;
            let mask = (1u8 << bits) - 1;
            for (i, &byte) in usage.iter().enumerate() {
                // The final byte may cover fewer pages than it has groups.
                let groups = if i == usage.len() - 1 {
                    match page_count % pages_per_byte {
                        0 => pages_per_byte,
                        rem => rem,
                    }
                } else {
                    pages_per_byte
                };
                for k in 0..groups {
                    if byte & (mask << (bits * k)) == 0 {
                        free_pages += 1;
                        if free_pages >= want {
                            return RunSearch::Found(i as u32 * pages_per_byte + k + 1 - want);
                        }
                    } else {
                        free_pages = 0;
                    }
                }
            }
        }
    }

    RunSearch::Exhausted {
        trailing_free: free_pages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::bucket::{bits_per_page, bytes_per_page, usage_length};

    fn ctx() -> SystemContext {
        SystemContext::detect()
    }

    #[test]
    fn lookup_finds_bucket_by_id() {
        let ctx = ctx();
        let mut table = PageTable::new();
        table.alloc_pages(&ctx, 1, 3).unwrap();
        assert_eq!(table.lookup(3), Some(0));
        assert_eq!(table.lookup(63), None);
        table.free_all(&ctx);
    }

    #[test]
    fn first_allocation_creates_the_bucket() {
        let ctx = ctx();
        for bucket in [0u8, 4, 9] {
            let mut table = PageTable::new();
            let (idx, base) = table.alloc_pages(&ctx, 10, bucket).unwrap();
            assert_eq!(table.len(), 1);
            assert_eq!(table.records[idx].bucket(), bucket);
            assert_eq!(table.records[idx].page_count(), 10);
            assert_eq!(
                table.records[idx].page_usage_length,
                usage_length(bucket, 10)
            );

            // The bucket is still empty: a 1-page request reuses the head.
            let (_, again) = table.alloc_pages(&ctx, 1, bucket).unwrap();
            assert_eq!(again, base);
            assert_eq!(table.records[idx].page_count(), 10);
            table.free_all(&ctx);
        }
    }

    /// With 10 pages and only page `j - 1` occupied: requests of up to 5
    /// pages fit into the free tail without growing the mapping, larger
    /// requests grow the bucket by exactly two pages.
    #[test]
    fn run_search_and_extension_across_all_page_buckets() {
        let ctx = ctx();
        let mut table = PageTable::new();

        for bucket in 0u8..=8 {
            let (idx, base) = table.alloc_pages(&ctx, 10, bucket).unwrap();
            assert_eq!(table.len(), bucket as usize + 1);
            assert_eq!(idx, bucket as usize);
            let mut prev_run = base.as_ptr();

            for j in 1u32..=10 {
                let old_page_count = table.records[idx].page_count();
                let old_usage_length = table.records[idx].page_usage_length;

                // Mark page j-1 as the only occupied page.
                {
                    let usage = table.records[idx].usage_mut();
                    usage.fill(0);
                    if bucket <= 5 {
                        usage[(bytes_per_page(bucket) * (j - 1)) as usize] = 1;
                    } else {
                        let bits = bits_per_page(bucket);
                        let per_byte = 8 / bits;
                        usage[((j - 1) / per_byte) as usize] |=
                            1 << (((j - 1) % per_byte) * bits);
                    }
                }

                let (_, run) = table.alloc_pages(&ctx, j, bucket).unwrap();
                let page_count = table.records[idx].page_count();
                let usage_len = table.records[idx].page_usage_length;

                if j <= 5 {
                    // Fits right after the occupied page.
                    assert_eq!(run.as_ptr(), prev_run.wrapping_add(ctx.page_size()));
                    assert_eq!(page_count, old_page_count);
                    assert_eq!(usage_len, old_usage_length);
                } else {
                    assert_eq!(page_count, old_page_count + 2);
                    assert_eq!(usage_len, usage_length(bucket, page_count));
                }
                prev_run = run.as_ptr();
            }
        }
        table.free_all(&ctx);
    }

    #[test]
    fn extension_with_full_bitmap_appends_at_the_tail() {
        let ctx = ctx();
        let mut table = PageTable::new();
        let (idx, _) = table.alloc_pages(&ctx, 10, 9).unwrap();

        for _ in 0..10 {
            table.slot_alloc(&ctx, 9).unwrap();
        }
        let (_, run) = table.alloc_pages(&ctx, 1, 9).unwrap();
        let rec = &table.records[idx];
        assert_eq!(rec.page_count(), 11);
        let expected = unsafe {
            rec.base
                .unwrap()
                .as_ptr()
                .add(10 * bucket::logical_page_bytes(&ctx, 9))
        };
        assert_eq!(run.as_ptr(), expected);
        table.free_all(&ctx);
    }

    #[test]
    fn slot_alloc_hands_out_ascending_slots_and_reuses_freed_ones() {
        let ctx = ctx();
        let mut table = PageTable::new();

        for expected in 0u64..8 {
            let (_, slot) = table.slot_alloc(&ctx, 0).unwrap();
            assert_eq!(slot, expected);
        }
        table.slot_free(0, 3).unwrap();
        let (_, slot) = table.slot_alloc(&ctx, 0).unwrap();
        assert_eq!(slot, 3);
        table.free_all(&ctx);
    }

    /// Bucket 9: one slot per logical page, ten pages in a two-byte
    /// bitmap. The six high bits of the second byte are padding; once the
    /// ten real slots are taken the next allocation must extend.
    #[test]
    fn slot_alloc_stops_at_final_byte_padding() {
        let ctx = ctx();
        let mut table = PageTable::new();
        let (idx, _) = table.alloc_pages(&ctx, 10, 9).unwrap();
        assert_eq!(table.records[idx].page_usage_length, 2);

        for expected in 0u64..10 {
            let (_, slot) = table.slot_alloc(&ctx, 9).unwrap();
            assert_eq!(slot, expected);
            assert_eq!(table.records[idx].page_count(), 10);
        }

        let (_, slot) = table.slot_alloc(&ctx, 9).unwrap();
        assert_eq!(slot, 10);
        assert_eq!(table.records[idx].page_count(), 11);
        assert_eq!(table.records[idx].page_usage_length, 2);
        table.free_all(&ctx);
    }

    #[test]
    fn slot_alloc_extends_a_full_first_page() {
        let ctx = ctx();
        let mut table = PageTable::new();

        // Bucket 8: 4096-byte slots, one bit and one slot per page.
        let (idx, _) = table.slot_alloc(&ctx, 8).unwrap();
        assert_eq!(table.records[idx].page_count(), 1);
        for expected in 1u64..4 {
            let (_, slot) = table.slot_alloc(&ctx, 8).unwrap();
            assert_eq!(slot, expected);
        }
        assert_eq!(table.records[idx].page_count(), 4);
        table.free_all(&ctx);
    }

    #[test]
    fn slot_free_is_idempotent() {
        let ctx = ctx();
        let mut table = PageTable::new();
        let (idx, slot) = table.slot_alloc(&ctx, 2).unwrap();
        table.slot_free(2, slot).unwrap();
        table.slot_free(2, slot).unwrap();
        assert!(table.records[idx].usage().iter().all(|&b| b == 0));
        table.free_all(&ctx);
    }

    #[test]
    fn slot_free_on_a_missing_bucket_is_corruption() {
        let mut table = PageTable::new();
        assert!(matches!(
            table.slot_free(5, 0),
            Err(BkvError::Corrupt(_))
        ));
    }

    #[test]
    fn free_all_clears_every_record() {
        let ctx = ctx();
        let mut table = PageTable::new();
        table.alloc_pages(&ctx, 4, 0).unwrap();
        table.alloc_pages(&ctx, 2, 9).unwrap();
        table.free_all(&ctx);
        assert!(table.is_empty());
        // Safe to call again on an empty table.
        table.free_all(&ctx);
    }
}
