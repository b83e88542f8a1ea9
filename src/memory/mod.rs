//! Paged guest address space
//!
//! Guest memory is a sparse map of 4 KiB pages. Reads and writes go through
//! a single-slot hot-page cache, then the page map, then the page-fault
//! callback. Writes to shared read-only pages are resolved by copy-on-write;
//! trap pages route every access to an MMIO callback instead of backing
//! bytes. The execute segment is a fixed, contiguous view used by the fetch
//! path together with the decoder cache.

pub mod cache;
pub mod page;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::MachineError;
use cache::DecoderCache;
pub use cache::DIVISOR;
pub use page::{Page, PageAttributes, PageData, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

/// Largest range `memview` will gather into a temporary buffer when the
/// requested bytes straddle a page boundary.
pub const MEMVIEW_MAX: usize = PAGE_SIZE;

/// Default length cap for guest C-string reads.
pub const MEMSTRING_MAX: usize = 1024;

/// Called when an access touches an unmapped page. The returned page is
/// installed at that page number. The default behavior (no handler) treats
/// unmapped memory as forbidden and fails with a protection fault.
pub type PageFaultHandler = Box<dyn FnMut(u64) -> Result<Page, MachineError> + Send>;

/// Called when a write hits a shared read-only page. The handler must leave
/// the page with mutable backing; the default promotes it to an owned copy.
pub type PageWriteHandler = Box<dyn FnMut(&mut Page) + Send>;

/// An intercepted access to a trap (MMIO) page.
#[derive(Clone, Copy, Debug)]
pub enum MmioOp {
    Read { size: u8 },
    Write { size: u8, value: u64 },
}

/// Services reads and writes of a trap page. The return value is the read
/// result (ignored for writes).
pub type MmioHandler = Box<dyn FnMut(&mut Page, u32, MmioOp) -> u64 + Send>;

/// The contiguous execute segment. Its base and length are fixed after
/// load; fetches outside it are an execution fault. `pagedata` is a
/// page-aligned copy of the segment used by the fetch path, kept in sync
/// with the page map through the invalidation queue.
struct ExecSegment {
    base: u64,
    len: u64,
    pbase: u64,
    pagedata: Vec<u8>,
    cache: Option<DecoderCache>,
    dirty: Vec<u64>,
}

/// Optional shared backing for the read-only data segment. The regular page
/// map has priority; the first write copies the page into the map.
struct RoSegment {
    begin_page: u64,
    end_page: u64,
    pages: Arc<Vec<Page>>,
}

pub struct Memory {
    pages: HashMap<u64, Box<Page>>,
    mmio_handlers: HashMap<u64, MmioHandler>,
    page_fault_handler: Option<PageFaultHandler>,
    page_write_handler: Option<PageWriteHandler>,
    ro_segment: Option<RoSegment>,
    exec: Option<ExecSegment>,

    // Single-slot caches for the most recently used readable and writable
    // page. The raw pointers reference the boxed pages in the map and stay
    // valid until the map entry is removed or replaced; every insertion,
    // removal, attribute change and COW promotion resets the slots.
    cur_rd_page: u64,
    cur_rd_ptr: *const Page,
    cur_wr_page: u64,
    cur_wr_ptr: *mut Page,

    start_address: u64,
    stack_address: u64,
    exit_address: u64,

    memory_max: u64,
    enforce_alignment: bool,
}

// Safety: the raw pointers only reference pages owned by this Memory, and
// the non-owned page contract already requires external synchronization.
unsafe impl Send for Memory {}

impl Memory {
    pub fn new(memory_max: u64, enforce_alignment: bool) -> Self {
        Memory {
            pages: HashMap::new(),
            mmio_handlers: HashMap::new(),
            page_fault_handler: None,
            page_write_handler: None,
            ro_segment: None,
            exec: None,
            cur_rd_page: u64::MAX,
            cur_rd_ptr: std::ptr::null(),
            cur_wr_page: u64::MAX,
            cur_wr_ptr: std::ptr::null_mut(),
            start_address: 0,
            stack_address: 0,
            exit_address: 0,
            memory_max,
            enforce_alignment,
        }
    }

    pub fn start_address(&self) -> u64 {
        self.start_address
    }
    pub fn stack_address(&self) -> u64 {
        self.stack_address
    }
    pub fn exit_address(&self) -> u64 {
        self.exit_address
    }
    pub fn set_start_address(&mut self, addr: u64) {
        self.start_address = addr;
    }
    pub fn set_stack_address(&mut self, addr: u64) {
        self.stack_address = addr;
    }
    pub fn set_exit_address(&mut self, addr: u64) {
        self.exit_address = addr;
    }
    pub fn memory_max(&self) -> u64 {
        self.memory_max
    }

    pub fn pages_active(&self) -> usize {
        self.pages.len()
    }

    /// Bytes still available before `memory_max` is reached.
    pub fn free_memory(&self) -> u64 {
        self.memory_max
            .saturating_sub(self.pages.len() as u64 * PAGE_SIZE as u64)
    }

    pub fn set_page_fault_handler(&mut self, handler: PageFaultHandler) {
        self.page_fault_handler = Some(handler);
    }

    pub fn set_page_write_handler(&mut self, handler: PageWriteHandler) {
        self.page_write_handler = Some(handler);
    }

    /// A page-fault handler that lazily allocates zeroed RW pages, the
    /// common replacement for the refusing default.
    pub fn lazy_page_fault() -> PageFaultHandler {
        Box::new(|_pageno| Ok(Page::zeroed(PageAttributes::rw())))
    }

    #[inline]
    fn flush_slots(&mut self) {
        self.cur_rd_page = u64::MAX;
        self.cur_wr_page = u64::MAX;
    }

    // ------------------------------------------------------------------
    // Page lookup
    // ------------------------------------------------------------------

    fn page_fault(&mut self, pageno: u64) -> Result<(), MachineError> {
        let mut handler = match self.page_fault_handler.take() {
            Some(h) => h,
            None => {
                return Err(MachineError::ProtectionFault { addr: pageno << PAGE_SHIFT });
            }
        };
        let result = handler(pageno);
        self.page_fault_handler = Some(handler);
        self.insert_page(pageno, result?)?;
        Ok(())
    }

    fn insert_page(&mut self, pageno: u64, page: Page) -> Result<(), MachineError> {
        let in_use = self.pages.len() as u64 * PAGE_SIZE as u64;
        if !self.pages.contains_key(&pageno) && in_use + PAGE_SIZE as u64 > self.memory_max {
            return Err(MachineError::OutOfMemory {
                requested: PAGE_SIZE as u64,
                limit: self.memory_max,
            });
        }
        self.pages.insert(pageno, Box::new(page));
        self.flush_slots();
        Ok(())
    }

    fn ro_page(&self, pageno: u64) -> Option<&Page> {
        let ro = self.ro_segment.as_ref()?;
        if pageno >= ro.begin_page && pageno < ro.end_page {
            Some(&ro.pages[(pageno - ro.begin_page) as usize])
        } else {
            None
        }
    }

    fn get_readable_page(&mut self, pageno: u64, addr: u64) -> Result<&Page, MachineError> {
        if pageno == self.cur_rd_page {
            // Safety: slot invariant, see the field comment.
            return Ok(unsafe { &*self.cur_rd_ptr });
        }
        if !self.pages.contains_key(&pageno) {
            if self.ro_page(pageno).is_some() {
                let page = self.ro_page(pageno).expect("ro page");
                if !page.attr.read {
                    return Err(MachineError::ProtectionFault { addr });
                }
                // Not hot-cached: the page lives in the shared segment,
                // not in the map.
                return Ok(page);
            }
            self.page_fault(pageno)?;
        }
        let ptr: *const Page = match self.pages.get(&pageno) {
            Some(boxed) => &**boxed,
            None => return Err(MachineError::ProtectionFault { addr }),
        };
        // Safety: the pointer was just derived from a live map entry and no
        // map mutation happens before the borrow ends.
        let page = unsafe { &*ptr };
        if !page.attr.read {
            return Err(MachineError::ProtectionFault { addr });
        }
        if !page.is_trap() {
            self.cur_rd_page = pageno;
            self.cur_rd_ptr = ptr;
        }
        Ok(page)
    }

    fn get_writable_page(&mut self, pageno: u64, addr: u64) -> Result<&mut Page, MachineError> {
        if pageno == self.cur_wr_page {
            // Safety: slot invariant, see the field comment.
            return Ok(unsafe { &mut *self.cur_wr_ptr });
        }
        if !self.pages.contains_key(&pageno) {
            // Copy-on-write entry point for the shared rodata segment:
            // materialize a shared reference in the map and let the
            // promotion below turn it into an owned page.
            let from_ro = self.ro_page(pageno).map(|p| {
                if !p.attr.write {
                    return Err(MachineError::ProtectionFault { addr });
                }
                p.clone_shared_ref().ok_or(MachineError::ProtectionFault { addr })
            });
            match from_ro {
                Some(Ok(clone)) => self.insert_page(pageno, clone)?,
                Some(Err(e)) => return Err(e),
                None => self.page_fault(pageno)?,
            }
        }

        let (writable, shared) = match self.pages.get(&pageno) {
            Some(p) => (p.attr.write, p.is_shared()),
            None => return Err(MachineError::ProtectionFault { addr }),
        };
        if !writable {
            return Err(MachineError::ProtectionFault { addr });
        }
        if shared {
            // COW promotion through the page-write handler.
            let mut handler = self.page_write_handler.take();
            let page = self.pages.get_mut(&pageno).expect("page vanished during COW");
            match handler.as_mut() {
                Some(h) => h(page),
                None => page.promote_owned(),
            }
            self.page_write_handler = handler;
            self.flush_slots();
        }

        let in_exec = self.exec_contains_page(pageno);
        if in_exec {
            self.queue_exec_invalidation(pageno);
        }

        let ptr: *mut Page = &mut **self.pages.get_mut(&pageno).expect("page vanished");
        // Safety: as in get_readable_page.
        let page = unsafe { &mut *ptr };
        // Trap pages and execute-segment pages are kept out of the hot
        // slot: the former must route through the MMIO callback, the
        // latter must queue an invalidation on every write.
        if !page.is_trap() && !in_exec {
            self.cur_wr_page = pageno;
            self.cur_wr_ptr = ptr;
        }
        Ok(page)
    }

    // ------------------------------------------------------------------
    // MMIO traps
    // ------------------------------------------------------------------

    /// Register an MMIO callback for the page containing `addr`. The page
    /// loses its backing bytes; all reads and writes go to the callback.
    pub fn trap(&mut self, addr: u64, handler: MmioHandler) {
        let pageno = addr >> PAGE_SHIFT;
        let attr = self.pages.get(&pageno).map(|p| p.attr).unwrap_or_default();
        self.pages.insert(pageno, Box::new(Page::trapped(attr)));
        self.mmio_handlers.insert(pageno, handler);
        self.flush_slots();
        if self.exec_contains_page(pageno) {
            self.queue_exec_invalidation(pageno);
        }
    }

    fn mmio_access(&mut self, pageno: u64, offset: u32, op: MmioOp) -> Result<u64, MachineError> {
        let mut handler = match self.mmio_handlers.remove(&pageno) {
            Some(h) => h,
            None => {
                return Err(MachineError::ProtectionFault {
                    addr: (pageno << PAGE_SHIFT) + offset as u64,
                })
            }
        };
        let result = match self.pages.get_mut(&pageno) {
            Some(page) => handler(page, offset, op),
            None => 0,
        };
        self.mmio_handlers.insert(pageno, handler);
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Typed access
    // ------------------------------------------------------------------

    fn read_int(&mut self, addr: u64, size: u32) -> Result<u64, MachineError> {
        if self.enforce_alignment && addr & (size as u64 - 1) != 0 {
            return Err(MachineError::MisalignedAccess { addr, size });
        }
        let offset = (addr & PAGE_MASK) as usize;
        if offset + size as usize > PAGE_SIZE {
            return self.read_straddle(addr, size);
        }
        let pageno = addr >> PAGE_SHIFT;
        {
            let page = self.get_readable_page(pageno, addr)?;
            if let Some(bytes) = page.bytes() {
                let mut v = 0u64;
                for (i, b) in bytes[offset..offset + size as usize].iter().enumerate() {
                    v |= (*b as u64) << (i * 8);
                }
                return Ok(v);
            }
        }
        self.mmio_access(pageno, offset as u32, MmioOp::Read { size: size as u8 })
    }

    fn write_int(&mut self, addr: u64, size: u32, value: u64) -> Result<(), MachineError> {
        if self.enforce_alignment && addr & (size as u64 - 1) != 0 {
            return Err(MachineError::MisalignedAccess { addr, size });
        }
        let offset = (addr & PAGE_MASK) as usize;
        if offset + size as usize > PAGE_SIZE {
            return self.write_straddle(addr, size, value);
        }
        let pageno = addr >> PAGE_SHIFT;
        {
            let page = self.get_writable_page(pageno, addr)?;
            if let Some(bytes) = page.bytes_mut() {
                for i in 0..size as usize {
                    bytes[offset + i] = (value >> (i * 8)) as u8;
                }
                return Ok(());
            }
        }
        self.mmio_access(pageno, offset as u32, MmioOp::Write { size: size as u8, value })?;
        Ok(())
    }

    /// Byte-wise fallback for accesses that straddle a page boundary.
    fn read_straddle(&mut self, addr: u64, size: u32) -> Result<u64, MachineError> {
        let mut v = 0u64;
        for i in 0..size as u64 {
            v |= self.read_int(addr + i, 1)? << (i * 8);
        }
        Ok(v)
    }

    fn write_straddle(&mut self, addr: u64, size: u32, value: u64) -> Result<(), MachineError> {
        for i in 0..size as u64 {
            self.write_int(addr + i, 1, (value >> (i * 8)) & 0xff)?;
        }
        Ok(())
    }

    pub fn read_u8(&mut self, addr: u64) -> Result<u8, MachineError> {
        self.read_int(addr, 1).map(|v| v as u8)
    }
    pub fn read_u16(&mut self, addr: u64) -> Result<u16, MachineError> {
        self.read_int(addr, 2).map(|v| v as u16)
    }
    pub fn read_u32(&mut self, addr: u64) -> Result<u32, MachineError> {
        self.read_int(addr, 4).map(|v| v as u32)
    }
    pub fn read_u64(&mut self, addr: u64) -> Result<u64, MachineError> {
        self.read_int(addr, 8)
    }
    pub fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), MachineError> {
        self.write_int(addr, 1, value as u64)
    }
    pub fn write_u16(&mut self, addr: u64, value: u16) -> Result<(), MachineError> {
        self.write_int(addr, 2, value as u64)
    }
    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), MachineError> {
        self.write_int(addr, 4, value as u64)
    }
    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), MachineError> {
        self.write_int(addr, 8, value)
    }

    // ------------------------------------------------------------------
    // Bulk transfer
    // ------------------------------------------------------------------

    /// Copy host bytes into guest memory, page by page. Destination pages
    /// are materialized on demand through the page-fault path.
    pub fn memcpy(&mut self, mut dst: u64, mut src: &[u8]) -> Result<(), MachineError> {
        while !src.is_empty() {
            let pageno = dst >> PAGE_SHIFT;
            let offset = (dst & PAGE_MASK) as usize;
            let n = src.len().min(PAGE_SIZE - offset);
            {
                let page = self.get_writable_page(pageno, dst)?;
                if let Some(bytes) = page.bytes_mut() {
                    bytes[offset..offset + n].copy_from_slice(&src[..n]);
                    dst += n as u64;
                    src = &src[n..];
                    continue;
                }
            }
            // Trap page in the middle of the range: fall back to bytes.
            for &b in &src[..n] {
                self.write_int(dst, 1, b as u64)?;
                dst += 1;
            }
            src = &src[n..];
        }
        Ok(())
    }

    /// Copy guest memory out into a host buffer.
    pub fn memcpy_out(&mut self, dst: &mut [u8], mut src: u64) -> Result<(), MachineError> {
        let mut done = 0usize;
        while done < dst.len() {
            let pageno = src >> PAGE_SHIFT;
            let offset = (src & PAGE_MASK) as usize;
            let n = (dst.len() - done).min(PAGE_SIZE - offset);
            {
                let page = self.get_readable_page(pageno, src)?;
                if let Some(bytes) = page.bytes() {
                    dst[done..done + n].copy_from_slice(&bytes[offset..offset + n]);
                    done += n;
                    src += n as u64;
                    continue;
                }
            }
            for i in 0..n {
                dst[done + i] = self.read_int(src, 1)? as u8;
                src += 1;
            }
            done += n;
        }
        Ok(())
    }

    pub fn memset(&mut self, mut dst: u64, value: u8, mut len: usize) -> Result<(), MachineError> {
        while len > 0 {
            let pageno = dst >> PAGE_SHIFT;
            let offset = (dst & PAGE_MASK) as usize;
            let n = len.min(PAGE_SIZE - offset);
            {
                let page = self.get_writable_page(pageno, dst)?;
                if let Some(bytes) = page.bytes_mut() {
                    bytes[offset..offset + n].fill(value);
                    dst += n as u64;
                    len -= n;
                    continue;
                }
            }
            for _ in 0..n {
                self.write_int(dst, 1, value as u64)?;
                dst += 1;
            }
            len -= n;
        }
        Ok(())
    }

    /// Compare two guest ranges, memcmp-style.
    pub fn memcmp(&mut self, mut p1: u64, mut p2: u64, mut len: usize) -> Result<i32, MachineError> {
        while len > 0 {
            let a = self.read_int(p1, 1)? as u8;
            let b = self.read_int(p2, 1)? as u8;
            if a != b {
                return Ok(a as i32 - b as i32);
            }
            p1 += 1;
            p2 += 1;
            len -= 1;
        }
        Ok(0)
    }

    /// Compare a host buffer against guest memory.
    pub fn memcmp_host(&mut self, p1: &[u8], mut p2: u64) -> Result<i32, MachineError> {
        for &a in p1 {
            let b = self.read_int(p2, 1)? as u8;
            if a != b {
                return Ok(a as i32 - b as i32);
            }
            p2 += 1;
        }
        Ok(0)
    }

    /// Present a contiguous view of guest memory to `callback`. The view is
    /// zero-copy when the range lies within a single page; otherwise the
    /// bytes are gathered into a bounded temporary buffer.
    pub fn memview<R>(
        &mut self,
        addr: u64,
        len: usize,
        callback: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, MachineError> {
        let offset = (addr & PAGE_MASK) as usize;
        if offset + len <= PAGE_SIZE {
            let pageno = addr >> PAGE_SHIFT;
            let page = self.get_readable_page(pageno, addr)?;
            if let Some(bytes) = page.bytes() {
                return Ok(callback(&bytes[offset..offset + len]));
            }
        }
        if len > MEMVIEW_MAX {
            return Err(MachineError::InvalidArgument { what: "memview range too large" });
        }
        let mut buffer = vec![0u8; len];
        self.memcpy_out(&mut buffer, addr)?;
        Ok(callback(&buffer))
    }

    /// Read a NUL-terminated guest string of at most `maxlen` bytes.
    pub fn memstring(&mut self, addr: u64, maxlen: usize) -> Result<String, MachineError> {
        let len = self.strlen(addr, maxlen)? as usize;
        let mut buffer = vec![0u8; len];
        self.memcpy_out(&mut buffer, addr)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Length of the NUL-terminated string at `addr`, bounded by `maxlen`.
    pub fn strlen(&mut self, addr: u64, maxlen: usize) -> Result<u64, MachineError> {
        let mut len = 0u64;
        let mut cursor = addr;
        while (len as usize) < maxlen {
            let pageno = cursor >> PAGE_SHIFT;
            let offset = (cursor & PAGE_MASK) as usize;
            let n = (maxlen - len as usize).min(PAGE_SIZE - offset);
            {
                let page = self.get_readable_page(pageno, cursor)?;
                if let Some(bytes) = page.bytes() {
                    if let Some(pos) = bytes[offset..offset + n].iter().position(|&b| b == 0) {
                        return Ok(len + pos as u64);
                    }
                    len += n as u64;
                    cursor += n as u64;
                    continue;
                }
            }
            for _ in 0..n {
                if self.read_int(cursor, 1)? == 0 {
                    return Ok(len);
                }
                len += 1;
                cursor += 1;
            }
        }
        Err(MachineError::StringOverLimit { addr, maxlen })
    }

    // ------------------------------------------------------------------
    // Page management
    // ------------------------------------------------------------------

    pub fn get_page(&self, pageno: u64) -> Option<&Page> {
        match self.pages.get(&pageno) {
            Some(p) => Some(p),
            None => self.ro_page(pageno),
        }
    }

    /// Allocate an owned zero page at `pageno` (no-op if one exists).
    pub fn create_page(&mut self, pageno: u64) -> Result<&mut Page, MachineError> {
        if !self.pages.contains_key(&pageno) {
            self.insert_page(pageno, Page::zeroed(PageAttributes::rw()))?;
        }
        Ok(self.pages.get_mut(&pageno).expect("page just inserted"))
    }

    /// Release all pages covering `[addr, addr + len)`, page-rounded.
    pub fn free_pages(&mut self, addr: u64, len: usize) {
        let first = addr >> PAGE_SHIFT;
        let last = (addr + len as u64 + PAGE_MASK) >> PAGE_SHIFT;
        for pageno in first..last {
            if self.pages.remove(&pageno).is_some() {
                self.mmio_handlers.remove(&pageno);
                if self.exec_contains_page(pageno) {
                    self.queue_exec_invalidation(pageno);
                }
            }
        }
        self.flush_slots();
    }

    /// Set page attributes over `[addr, addr + len)`, rounded to whole
    /// pages. Missing pages are created.
    pub fn set_page_attr(
        &mut self,
        addr: u64,
        len: usize,
        attr: PageAttributes,
    ) -> Result<(), MachineError> {
        let first = addr >> PAGE_SHIFT;
        let last = (addr + len as u64 + PAGE_MASK) >> PAGE_SHIFT;
        for pageno in first..last {
            self.create_page(pageno)?.attr = attr;
            if self.exec_contains_page(pageno) {
                self.queue_exec_invalidation(pageno);
            }
        }
        self.flush_slots();
        Ok(())
    }

    /// Install a page backed by shared read-only bytes. Regular writes COW.
    pub fn install_shared_page(&mut self, pageno: u64, page: Page) -> Result<(), MachineError> {
        self.insert_page(pageno, page)
    }

    /// Install the shared rodata segment starting at `begin_page`.
    pub(crate) fn install_ro_segment(&mut self, begin_page: u64, pages: Arc<Vec<Page>>) {
        let end_page = begin_page + pages.len() as u64;
        self.ro_segment = Some(RoSegment { begin_page, end_page, pages });
        self.flush_slots();
    }

    /// Map externally owned memory into the guest at `dst`.
    ///
    /// # Safety
    /// `ptr` must reference `size` valid bytes that outlive this machine,
    /// and any concurrent writer must be synchronized by the embedder.
    /// `dst` and `size` must be page-aligned.
    pub unsafe fn insert_non_owned_memory(
        &mut self,
        dst: u64,
        ptr: *mut u8,
        size: usize,
        attr: PageAttributes,
    ) -> Result<(), MachineError> {
        if dst & PAGE_MASK != 0 || size % PAGE_SIZE != 0 || ptr.is_null() {
            return Err(MachineError::InvalidArgument { what: "unaligned non-owned mapping" });
        }
        let first = dst >> PAGE_SHIFT;
        for i in 0..(size / PAGE_SIZE) as u64 {
            let page_ptr = std::ptr::NonNull::new_unchecked(ptr.add(i as usize * PAGE_SIZE));
            self.insert_page(first + i, Page { attr, data: PageData::NonOwned(page_ptr) })?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Execute segment and decoder cache
    // ------------------------------------------------------------------

    /// Fix the execute segment to `[base, base + len)`. The segment bytes
    /// are copied from the current page contents; `enable_cache` allocates
    /// the decoder cache over the covered pages.
    pub fn define_exec_segment(
        &mut self,
        base: u64,
        len: u64,
        enable_cache: bool,
    ) -> Result<(), MachineError> {
        let pbase = base & !PAGE_MASK;
        let pend = (base + len + PAGE_MASK) & !PAGE_MASK;
        let plen = (pend - pbase) as usize;
        let mut pagedata = vec![0u8; plen];
        for (i, pageno) in (pbase >> PAGE_SHIFT..pend >> PAGE_SHIFT).enumerate() {
            if let Some(bytes) = self.get_page(pageno).and_then(|p| p.bytes()) {
                pagedata[i * PAGE_SIZE..(i + 1) * PAGE_SIZE].copy_from_slice(bytes);
            }
        }
        let cache = enable_cache.then(|| DecoderCache::new(pbase, plen / PAGE_SIZE));
        self.exec = Some(ExecSegment { base, len, pbase, pagedata, cache, dirty: Vec::new() });
        // Pages inside the segment must never sit in the hot slots, so
        // every write to them queues an invalidation.
        self.flush_slots();
        Ok(())
    }

    pub fn exec_segment(&self) -> Option<(u64, u64)> {
        self.exec.as_ref().map(|e| (e.base, e.len))
    }

    fn exec_contains_page(&self, pageno: u64) -> bool {
        match &self.exec {
            Some(e) => {
                let first = e.pbase >> PAGE_SHIFT;
                let last = (e.pbase + e.pagedata.len() as u64) >> PAGE_SHIFT;
                pageno >= first && pageno < last
            }
            None => false,
        }
    }

    /// Queue a decoder-cache and fetch-view refresh for one page. Drained
    /// at the next fetch, so a self-modifying guest observes its own writes
    /// at the following instruction boundary.
    pub fn invalidate_page(&mut self, pageno: u64) {
        self.queue_exec_invalidation(pageno);
    }

    fn queue_exec_invalidation(&mut self, pageno: u64) {
        if let Some(exec) = &mut self.exec {
            if exec.dirty.last() != Some(&pageno) {
                exec.dirty.push(pageno);
            }
        }
    }

    fn drain_exec_dirty(&mut self) {
        let mut exec = match self.exec.take() {
            Some(e) => e,
            None => return,
        };
        for pageno in std::mem::take(&mut exec.dirty) {
            let offset = match (pageno << PAGE_SHIFT).checked_sub(exec.pbase) {
                Some(o) => o as usize,
                None => continue,
            };
            if offset + PAGE_SIZE > exec.pagedata.len() {
                continue;
            }
            let dst = &mut exec.pagedata[offset..offset + PAGE_SIZE];
            match self.pages.get(&pageno).and_then(|p| p.bytes()) {
                Some(bytes) => dst.copy_from_slice(bytes),
                None => dst.fill(0),
            }
            if let Some(cache) = &mut exec.cache {
                cache.clear_page(pageno);
            }
        }
        self.exec = Some(exec);
    }

    /// Fetch the instruction word at `pc` from the execute segment.
    /// Returns the raw bits and the encoded length (2 or 4).
    pub(crate) fn fetch_instruction(&mut self, pc: u64) -> Result<(u32, u8), MachineError> {
        if self.exec.as_ref().map_or(false, |e| !e.dirty.is_empty()) {
            self.drain_exec_dirty();
        }
        let exec = self
            .exec
            .as_ref()
            .ok_or(MachineError::ExecutionSpaceProtectionFault { pc })?;
        if pc < exec.base || pc >= exec.base + exec.len {
            return Err(MachineError::ExecutionSpaceProtectionFault { pc });
        }
        let idx = (pc - exec.pbase) as usize;
        if idx + 2 > exec.pagedata.len() {
            return Err(MachineError::ExecutionSpaceProtectionFault { pc });
        }
        let lo = u16::from_le_bytes([exec.pagedata[idx], exec.pagedata[idx + 1]]);
        if lo & 0b11 != 0b11 {
            return Ok((lo as u32, 2));
        }
        let hi = if idx + 4 <= exec.pagedata.len() {
            u16::from_le_bytes([exec.pagedata[idx + 2], exec.pagedata[idx + 3]])
        } else {
            0
        };
        Ok((lo as u32 | (hi as u32) << 16, 4))
    }

    /// Decoder-cache slot for `pc`; `None` when the cache is disabled.
    #[inline]
    pub(crate) fn decoder_get(&self, pc: u64) -> Option<u8> {
        self.exec.as_ref()?.cache.as_ref().map(|c| c.get(pc))
    }

    #[inline]
    pub(crate) fn decoder_set(&mut self, pc: u64, index: u8) {
        if let Some(cache) = self.exec.as_mut().and_then(|e| e.cache.as_mut()) {
            cache.set(pc, index);
        }
    }

    /// Drop every page and mapping; the caller re-runs the loader.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.mmio_handlers.clear();
        self.ro_segment = None;
        self.exec = None;
        self.flush_slots();
    }

    /// Drop the active pages but keep the execute segment definition and
    /// the shared rodata segment. Used by snapshot restore, which rebuilds
    /// the page set on a machine constructed from the same binary.
    pub(crate) fn reset_pages(&mut self) {
        self.pages.clear();
        self.mmio_handlers.clear();
        self.flush_slots();
    }

    pub(crate) fn iter_pages(&self) -> impl Iterator<Item = (u64, &Page)> {
        self.pages.iter().map(|(n, p)| (*n, &**p))
    }

    pub(crate) fn insert_restored_page(
        &mut self,
        pageno: u64,
        page: Page,
    ) -> Result<(), MachineError> {
        self.insert_page(pageno, page)
    }

    /// Queue a refresh of every execute-segment page, so the fetch view and
    /// decoder cache match the restored page contents.
    pub(crate) fn invalidate_exec_all(&mut self) {
        let range = self.exec.as_ref().map(|e| {
            (e.pbase >> PAGE_SHIFT, (e.pbase + e.pagedata.len() as u64) >> PAGE_SHIFT)
        });
        if let Some((first, last)) = range {
            for pageno in first..last {
                self.queue_exec_invalidation(pageno);
            }
        }
    }
}
