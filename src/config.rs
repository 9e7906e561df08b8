//! This file provides some configuration for bkv.
//! Caution: the field widths below are baked into the packed record
//! layout; changing them invalidates every record already in memory.

pub const _NAME: &str = "bkv";
pub const _VERSION: &str = "0.1.0";

pub const LOG_LEVEL: &str = "debug";
pub const LOG_PATH: &str = "./logs/bkv.log";

/// The smallest bucket holds values of up to `1 << SLOT_BASE_SHIFT` bytes.
pub const SLOT_BASE_SHIFT: u32 = 4;

/// Value sizes occupy 56 bits in the packed key/value record.
pub const MAX_VALUE_SIZE: u64 = (1 << 56) - 1;

/// Used when `sysconf` cannot report a page size.
pub const DEFAULT_PAGE_SIZE_BYTES: usize = 4 * 1024; // 4 KB
