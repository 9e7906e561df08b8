//! The store proper: an opaque-integer-keyed table of byte-string values,
//! each value living in a fixed-size slot of its size-class bucket. A key
//! is the position of its record in the key-record table; freed positions
//! are handed out again before the table grows.

use std::ptr;
use std::slice;

use tracing::{debug, info};

use crate::common::{BkvError, BkvResult};
use crate::config::MAX_VALUE_SIZE;
use crate::context::SystemContext;
use crate::storage::bucket;
use crate::storage::ptbl::PageTable;
use crate::storage::records::KvRecord;

/// A borrowed view of one stored value. The borrow pins the database, so
/// no call that could remap a bucket can run while the view is alive.
#[derive(Debug)]
pub struct ValueRef<'a> {
    pub data: &'a [u8],
    pub flags: u8,
    pub bucket: u8,
}

impl ValueRef<'_> {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

pub struct Database {
    ctx: SystemContext,
    page_table: PageTable,
    kv_records: Vec<KvRecord>,
}

impl Database {
    pub fn open(ctx: SystemContext) -> Self {
        info!(
            "opening store: page size {} bytes, {} physical pages",
            ctx.page_size(),
            ctx.phys_page_count()
        );
        Self {
            ctx,
            page_table: PageTable::new(),
            kv_records: Vec::new(),
        }
    }

    /// Release every bucket region and both record tables.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.page_table.free_all(&self.ctx);
        self.kv_records = Vec::new();
    }

    /// Store `value` under a fresh (or reused) key. The value is copied
    /// into a slot of the bucket sized for it.
    pub fn alloc(&mut self, flags: u8, value: &[u8]) -> BkvResult<u64> {
        let size = value.len() as u64;
        if value.is_empty() || size > MAX_VALUE_SIZE {
            return Err(BkvError::InvalidSize(size));
        }

        let bucket = bucket::bucket_of(size);
        debug!(
            "alloc: flags {:#04x}, {} bytes -> bucket {}",
            flags, size, bucket
        );

        let (ptbl_index, slot) = self.page_table.slot_alloc(&self.ctx, bucket)?;

        let key = self.claim_key();
        {
            let rec = &mut self.kv_records[key];
            rec.set_flags(flags as u64);
            rec.set_size(size);
            rec.set_bucket(bucket);
            rec.set_index(slot);
        }

        self.write_slot(ptbl_index, bucket, slot, value)?;
        Ok(key as u64)
    }

    /// Make the key inactive, scrub its slot, and release the slot's bit.
    /// Freeing an already-inactive key succeeds and does nothing.
    pub fn free(&mut self, key: u64) -> BkvResult<()> {
        debug!("free: key {}", key);

        let idx = key as usize;
        let rec = match self.kv_records.get(idx) {
            Some(rec) => rec,
            None => return Err(BkvError::InvalidKey(key)),
        };
        if rec.size() == 0 {
            return Ok(());
        }

        let bucket = rec.bucket();
        let slot = rec.index();
        let ptbl_index = self.page_table.lookup(bucket).ok_or_else(|| {
            BkvError::Corrupt(format!("key {} references missing bucket {}", key, bucket))
        })?;

        // Size zero disables lookup before the slot is touched.
        self.kv_records[idx].set_size(0);

        let base = self.page_table.records[ptbl_index].base.ok_or_else(|| {
            BkvError::Corrupt(format!("bucket {} has no mapped region", bucket))
        })?;
        let slot_bytes = bucket::slot_size(bucket) as usize;
        unsafe {
            base.as_ptr()
                .add(slot as usize * slot_bytes)
                .write_bytes(0, slot_bytes)
        };

        self.page_table.slot_free(bucket, slot)?;

        // Only the tail position is surrendered; interior frees keep their
        // position reachable for reuse.
        if idx == self.kv_records.len() - 1 {
            self.kv_records.pop();
        }
        if self.kv_records.is_empty() {
            self.kv_records = Vec::new();
        }
        Ok(())
    }

    /// Resolve a key to its value bytes, flags, and bucket.
    pub fn get(&self, key: u64) -> BkvResult<ValueRef<'_>> {
        let rec = match self.kv_records.get(key as usize) {
            Some(rec) => rec,
            None => return Err(BkvError::InvalidKey(key)),
        };
        let size = rec.size();
        if size == 0 {
            return Err(BkvError::InvalidKey(key));
        }

        let bucket = rec.bucket();
        let ptbl_index = self.page_table.lookup(bucket).ok_or_else(|| {
            BkvError::Corrupt(format!("key {} references missing bucket {}", key, bucket))
        })?;
        let base = self.page_table.records[ptbl_index].base.ok_or_else(|| {
            BkvError::Corrupt(format!("bucket {} has no mapped region", bucket))
        })?;

        let offset = rec.index() as usize * bucket::slot_size(bucket) as usize;
        let data = unsafe { slice::from_raw_parts(base.as_ptr().add(offset), size as usize) };
        Ok(ValueRef {
            data,
            flags: rec.flags(),
            bucket,
        })
    }

    /// Replace the value under `key`. A new slot is filled before the old
    /// one is released, so the caller observes either the old value intact
    /// or the new one fully installed.
    pub fn set(&mut self, key: u64, value: &[u8]) -> BkvResult<()> {
        let length = value.len() as u64;
        if value.is_empty() || length > MAX_VALUE_SIZE {
            return Err(BkvError::InvalidSize(length));
        }

        let idx = key as usize;
        let rec = match self.kv_records.get(idx) {
            Some(rec) => rec,
            None => return Err(BkvError::InvalidKey(key)),
        };
        if rec.size() == 0 {
            return Err(BkvError::InvalidKey(key));
        }
        let old_bucket = rec.bucket();
        let old_slot = rec.index();
        self.page_table.lookup(old_bucket).ok_or_else(|| {
            BkvError::Corrupt(format!(
                "key {} references missing bucket {}",
                key, old_bucket
            ))
        })?;

        let new_bucket = bucket::bucket_of(length);
        debug!(
            "set: key {}, {} bytes, bucket {} -> {}",
            key, length, old_bucket, new_bucket
        );

        // The only fallible step: nothing about the record has changed if
        // this errors out.
        let (new_ptbl, new_slot) = self.page_table.slot_alloc(&self.ctx, new_bucket)?;

        self.kv_records[idx].set_size(0);
        self.page_table.slot_free(old_bucket, old_slot)?;
        {
            let rec = &mut self.kv_records[idx];
            rec.set_bucket(new_bucket);
            rec.set_index(new_slot);
        }
        self.write_slot(new_ptbl, new_bucket, new_slot, value)?;
        self.kv_records[idx].set_size(length);
        Ok(())
    }

    /// Hand out a key: the highest-indexed inactive record if any exists,
    /// otherwise the table grows by exactly one entry.
    fn claim_key(&mut self) -> usize {
        if self.kv_records.is_empty() {
            self.kv_records.push(KvRecord::new());
            return 0;
        }

        let mut freed = None;
        for (i, rec) in self.kv_records.iter().enumerate() {
            if rec.size() == 0 {
                freed = Some(i);
            }
        }
        match freed {
            Some(i) => i,
            None => {
                self.kv_records.push(KvRecord::new());
                self.kv_records.len() - 1
            }
        }
    }

    fn write_slot(
        &mut self,
        ptbl_index: usize,
        bucket: u8,
        slot: u64,
        value: &[u8],
    ) -> BkvResult<()> {
        let base = self.page_table.records[ptbl_index].base.ok_or_else(|| {
            BkvError::Corrupt(format!("bucket {} has no mapped region", bucket))
        })?;
        let offset = slot as usize * bucket::slot_size(bucket) as usize;
        unsafe {
            ptr::copy_nonoverlapping(value.as_ptr(), base.as_ptr().add(offset), value.len())
        };
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn bucket_usage(&self, bucket: u8) -> &[u8] {
        let idx = self.page_table.lookup(bucket).expect("bucket exists");
        self.page_table.records[idx].usage()
    }

    #[cfg(test)]
    pub(crate) fn key_count(&self) -> usize {
        self.kv_records.len()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.release();
    }
}
