//! Guest memory pages
//!
//! A page covers `PAGE_SIZE` bytes of page-aligned guest memory. The backing
//! bytes are either owned by the emulator, shared read-only with other
//! machines (copy-on-write), borrowed from the embedder, or absent entirely
//! for MMIO trap pages whose accesses are serviced by a callback.

use std::ptr::NonNull;
use std::sync::Arc;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_MASK: u64 = (PAGE_SIZE as u64) - 1;

/// Access permissions of a page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageAttributes {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Default for PageAttributes {
    fn default() -> Self {
        PageAttributes { read: true, write: true, exec: false }
    }
}

impl PageAttributes {
    pub const fn rw() -> Self {
        PageAttributes { read: true, write: true, exec: false }
    }

    pub const fn new(read: bool, write: bool, exec: bool) -> Self {
        PageAttributes { read, write, exec }
    }

    pub fn to_bits(self) -> u8 {
        (self.read as u8) | (self.write as u8) << 1 | (self.exec as u8) << 2
    }

    pub fn from_bits(bits: u8) -> Self {
        PageAttributes {
            read: bits & 1 != 0,
            write: bits & 2 != 0,
            exec: bits & 4 != 0,
        }
    }
}

/// The backing storage of a page.
pub enum PageData {
    /// Bytes allocated and mutated by the emulator.
    Owned(Box<[u8; PAGE_SIZE]>),
    /// Read-only bytes owned elsewhere; the first write promotes the page
    /// to `Owned` through the copy-on-write handler.
    Shared(Arc<[u8; PAGE_SIZE]>),
    /// Externally provided backing (e.g. a memory-mapped device buffer).
    /// The embedder guarantees the allocation outlives the machine.
    NonOwned(NonNull<u8>),
    /// No backing at all; reads and writes invoke the MMIO callback
    /// registered for this page number.
    Trap,
}

pub struct Page {
    pub attr: PageAttributes,
    pub(crate) data: PageData,
}

// Safety: the only non-Send member is the NonOwned pointer, whose backing
// the embedder owns; sharing such a region between machines without
// external synchronization is already documented as unsupported.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// A zero-filled owned page.
    pub fn zeroed(attr: PageAttributes) -> Self {
        Page { attr, data: PageData::Owned(Box::new([0u8; PAGE_SIZE])) }
    }

    /// An owned page initialized from `bytes` (zero-padded).
    pub fn from_bytes(bytes: &[u8], attr: PageAttributes) -> Self {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let n = bytes.len().min(PAGE_SIZE);
        data[..n].copy_from_slice(&bytes[..n]);
        Page { attr, data: PageData::Owned(data) }
    }

    /// A page referencing shared read-only backing.
    pub fn shared(bytes: Arc<[u8; PAGE_SIZE]>, attr: PageAttributes) -> Self {
        Page { attr, data: PageData::Shared(bytes) }
    }

    /// An MMIO page without backing bytes.
    pub fn trapped(attr: PageAttributes) -> Self {
        Page { attr, data: PageData::Trap }
    }

    #[inline]
    pub fn is_trap(&self) -> bool {
        matches!(self.data, PageData::Trap)
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        matches!(self.data, PageData::Shared(_))
    }

    /// Readable view of the backing bytes; `None` for trap pages.
    #[inline]
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.data {
            PageData::Owned(b) => Some(&b[..]),
            PageData::Shared(b) => Some(&b[..]),
            // Safety: NonOwned always points at PAGE_SIZE live bytes,
            // guaranteed by the insert_non_owned_memory contract.
            PageData::NonOwned(p) => {
                Some(unsafe { std::slice::from_raw_parts(p.as_ptr(), PAGE_SIZE) })
            }
            PageData::Trap => None,
        }
    }

    /// Mutable view of the backing bytes. Shared pages return `None`; the
    /// caller must promote them first (copy-on-write).
    #[inline]
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.data {
            PageData::Owned(b) => Some(&mut b[..]),
            PageData::Shared(_) => None,
            // Safety: see bytes().
            PageData::NonOwned(p) => {
                Some(unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), PAGE_SIZE) })
            }
            PageData::Trap => None,
        }
    }

    /// A second reference to the same shared backing, or `None` when the
    /// page is not shared.
    pub fn clone_shared_ref(&self) -> Option<Page> {
        match &self.data {
            PageData::Shared(bytes) => Some(Page::shared(bytes.clone(), self.attr)),
            _ => None,
        }
    }

    /// Replace shared backing with an owned copy of the current contents.
    /// This is the default copy-on-write promotion.
    pub fn promote_owned(&mut self) {
        if let PageData::Shared(shared) = &self.data {
            let copy = Box::new(**shared);
            self.data = PageData::Owned(copy);
        }
    }

    /// Variant tag used by the snapshot format.
    pub fn variant_tag(&self) -> u8 {
        match self.data {
            PageData::Owned(_) => 0,
            PageData::Shared(_) => 1,
            PageData::NonOwned(_) => 2,
            PageData::Trap => 3,
        }
    }
}
