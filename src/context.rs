use tracing::warn;

use crate::config::DEFAULT_PAGE_SIZE_BYTES;

/// System parameters captured once at startup. Immutable afterwards; every
/// page-level size computation in the store goes through `page_size`.
#[derive(Debug, Clone, Copy)]
pub struct SystemContext {
    system_page_size: usize,
    system_phys_page_count: u64,
}

impl SystemContext {
    /// Query the running system for its page size and physical page count.
    pub fn detect() -> Self {
        let page_size = match unsafe { nix::libc::sysconf(nix::libc::_SC_PAGE_SIZE) } {
            n if n > 0 => n as usize,
            _ => {
                warn!(
                    "sysconf(_SC_PAGE_SIZE) failed, assuming {} bytes",
                    DEFAULT_PAGE_SIZE_BYTES
                );
                DEFAULT_PAGE_SIZE_BYTES
            }
        };
        // Informational only; nothing in the store depends on it.
        let phys_pages = match unsafe { nix::libc::sysconf(nix::libc::_SC_PHYS_PAGES) } {
            n if n > 0 => n as u64,
            _ => 0,
        };
        Self {
            system_page_size: page_size,
            system_phys_page_count: phys_pages,
        }
    }

    pub fn new(system_page_size: usize, system_phys_page_count: u64) -> Self {
        Self {
            system_page_size,
            system_phys_page_count,
        }
    }

    pub fn page_size(&self) -> usize {
        self.system_page_size
    }

    pub fn phys_page_count(&self) -> u64 {
        self.system_phys_page_count
    }
}
