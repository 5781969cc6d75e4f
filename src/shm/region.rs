//! Named shared-memory region: creation, layout and lifetime.
//!
//! The region layout is deterministic from the configuration:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ ControlBlock (64 bytes): magic, version, sizing, ref_count │
//! ├────────────────────────────────────────────────────────────┤
//! │ RegionLock[0..max_endpoints] (64 bytes each)               │
//! ├────────────────────────────────────────────────────────────┤
//! │ per endpoint: RingHeader │ ReaderState[0..max_readers]     │
//! │              │ data[0..buffer_size]                        │
//! │ (repeated max_endpoints times)                             │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The first opener finds a zero-length object, sizes it with `ftruncate`
//! (which zero-fills) and initializes the layout, publishing the magic word
//! last. Later openers wait briefly for the magic, then validate that the
//! stored sizing matches their own. The atomic reference count ties region
//! lifetime to the longest-lived holder.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use rustix::fs::Mode;
use rustix::mm::{MapFlags, ProtFlags};
use rustix::shm::OFlags;

use crate::error::{Error, Result};
use crate::shm::lock::RegionLock;
use crate::shm::ring::{ReaderState, RingHeader, RingView};

/// Region layout magic, "SHM2".
pub const REGION_MAGIC: u32 = 0x5348_4D32;
/// Region layout version.
pub const REGION_VERSION: u32 = 2;

const CACHE_LINE: usize = 64;

/// Sizing parameters for a region. All openers of one name must agree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionConfig {
    /// Data bytes per endpoint ring; must be a power of two.
    pub buffer_size: u32,
    /// Number of endpoint rings.
    pub max_endpoints: u32,
    /// Reader slots per ring.
    pub max_readers: u32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 65536,
            max_endpoints: 16,
            max_readers: 8,
        }
    }
}

impl RegionConfig {
    fn validate(&self) -> Result<()> {
        if !self.buffer_size.is_power_of_two() || self.buffer_size < 256 {
            return Err(Error::Invalid("buffer_size must be a power of two >= 256"));
        }
        if self.max_endpoints == 0 || self.max_endpoints > 256 {
            return Err(Error::Invalid("max_endpoints out of range"));
        }
        if self.max_readers == 0 || self.max_readers > 64 {
            return Err(Error::Invalid("max_readers out of range"));
        }
        Ok(())
    }

    /// Bytes one endpoint block occupies.
    fn endpoint_block_size(&self) -> usize {
        std::mem::size_of::<RingHeader>()
            + self.max_readers as usize * std::mem::size_of::<ReaderState>()
            + self.buffer_size as usize
    }

    /// Total region size for this configuration.
    pub fn region_size(&self) -> usize {
        std::mem::size_of::<ControlBlock>()
            + self.max_endpoints as usize * std::mem::size_of::<RegionLock>()
            + self.max_endpoints as usize * self.endpoint_block_size()
    }
}

/// Region header, one cache line.
#[repr(C, align(64))]
pub(crate) struct ControlBlock {
    magic: AtomicU32,
    version: AtomicU32,
    buffer_size: AtomicU32,
    max_endpoints: AtomicU32,
    max_readers: AtomicU32,
    ref_count: AtomicU32,
}

/// A mapped, reference-counted shared-memory region.
pub struct SharedRegion {
    name: String,
    base: NonNull<u8>,
    size: usize,
    cfg: RegionConfig,
}

// SAFETY: all shared state inside the mapping is atomics; writers of ring
// data are serialized by the per-endpoint locks.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create or open the named region.
    ///
    /// Names follow `shm_open` rules; a leading `/` is conventional.
    pub fn open(name: &str, cfg: RegionConfig) -> Result<Self> {
        cfg.validate()?;
        let size = cfg.region_size();

        let fd = rustix::shm::open(
            name,
            OFlags::CREATE | OFlags::RDWR,
            Mode::from_raw_mode(0o600),
        )?;

        let stat = rustix::fs::fstat(&fd)?;
        let is_new = stat.st_size == 0;
        if is_new {
            rustix::fs::ftruncate(&fd, size as u64)?;
        } else if (stat.st_size as u64) < size as u64 {
            return Err(Error::Invalid("region exists with a smaller layout"));
        }

        // SAFETY: freshly sized fd, mapping the whole region shared.
        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let base = NonNull::new(base.cast::<u8>())
            .ok_or(Error::Invalid("mmap returned null"))?;
        // The mapping keeps the region alive; the descriptor may close.
        drop(fd);

        let region = Self {
            name: name.to_string(),
            base,
            size,
            cfg,
        };

        if is_new {
            region.init_layout();
        } else {
            region.await_and_validate()?;
        }

        region.control().ref_count.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(name, size, is_new, "shared region mapped");
        Ok(region)
    }

    /// Remove the region name from the namespace.
    ///
    /// Existing mappings stay valid until unmapped; new opens start fresh.
    pub fn unlink(name: &str) -> Result<()> {
        rustix::shm::unlink(name)?;
        Ok(())
    }

    /// Region name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sizing this region was opened with.
    pub fn config(&self) -> RegionConfig {
        self.cfg
    }

    /// Current number of attached holders.
    pub fn ref_count(&self) -> u32 {
        self.control().ref_count.load(Ordering::Acquire)
    }

    fn init_layout(&self) {
        let ctrl = self.control();
        ctrl.version.store(REGION_VERSION, Ordering::Relaxed);
        ctrl.buffer_size.store(self.cfg.buffer_size, Ordering::Relaxed);
        ctrl.max_endpoints
            .store(self.cfg.max_endpoints, Ordering::Relaxed);
        ctrl.max_readers.store(self.cfg.max_readers, Ordering::Relaxed);
        ctrl.ref_count.store(0, Ordering::Relaxed);

        for endpoint in 0..self.cfg.max_endpoints {
            if let (Some(lock), Some(ring)) = (self.lock(endpoint), self.ring(endpoint)) {
                lock.init();
                ring.init(self.cfg.buffer_size as u64);
            }
        }

        // Publish the initialized layout.
        ctrl.magic.store(REGION_MAGIC, Ordering::Release);
    }

    fn await_and_validate(&self) -> Result<()> {
        let ctrl = self.control();
        let deadline = Instant::now() + Duration::from_secs(1);
        while ctrl.magic.load(Ordering::Acquire) != REGION_MAGIC {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(1000));
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        if ctrl.version.load(Ordering::Acquire) != REGION_VERSION {
            return Err(Error::Invalid("region version mismatch"));
        }
        let stored = RegionConfig {
            buffer_size: ctrl.buffer_size.load(Ordering::Acquire),
            max_endpoints: ctrl.max_endpoints.load(Ordering::Acquire),
            max_readers: ctrl.max_readers.load(Ordering::Acquire),
        };
        if stored != self.cfg {
            return Err(Error::Invalid("region sizing mismatch"));
        }
        Ok(())
    }

    pub(crate) fn control(&self) -> &ControlBlock {
        // SAFETY: the control block heads the mapping and the mapping
        // outlives `self`.
        unsafe { &*self.base.as_ptr().cast::<ControlBlock>() }
    }

    /// The write lock for one endpoint ring.
    pub(crate) fn lock(&self, endpoint: u32) -> Option<&RegionLock> {
        if endpoint >= self.cfg.max_endpoints {
            return None;
        }
        let offset =
            std::mem::size_of::<ControlBlock>() + endpoint as usize * std::mem::size_of::<RegionLock>();
        // SAFETY: offset stays inside the mapping by layout construction.
        Some(unsafe { &*self.base.as_ptr().add(offset).cast::<RegionLock>() })
    }

    /// A view over one endpoint's ring.
    pub(crate) fn ring(&self, endpoint: u32) -> Option<RingView<'_>> {
        if endpoint >= self.cfg.max_endpoints {
            return None;
        }
        let rings_base = std::mem::size_of::<ControlBlock>()
            + self.cfg.max_endpoints as usize * std::mem::size_of::<RegionLock>();
        let block = rings_base + endpoint as usize * self.cfg.endpoint_block_size();
        let readers = block + std::mem::size_of::<RingHeader>();
        let data =
            readers + self.cfg.max_readers as usize * std::mem::size_of::<ReaderState>();

        // SAFETY: every offset stays inside the mapping by layout
        // construction; the creator initialized the structures before
        // publishing the magic word.
        unsafe {
            let base = self.base.as_ptr();
            Some(RingView::from_raw(
                base.add(block).cast::<RingHeader>(),
                base.add(readers).cast::<ReaderState>(),
                base.add(data),
                self.cfg.max_readers,
            ))
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        let remaining = self.control().ref_count.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(name = %self.name, remaining = remaining.saturating_sub(1), "shared region detached");
        // Last detach: the locks are plain atomic words, nothing to
        // finalize beyond the unmap. The name persists until unlinked.
        // SAFETY: base/size describe the mapping created in `open`.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.size);
        }
    }
}

const _: () = {
    assert!(std::mem::size_of::<ControlBlock>() == CACHE_LINE);
    assert!(std::mem::size_of::<RegionLock>() == CACHE_LINE);
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    static NAME_SEQ: AtomicU64 = AtomicU64::new(0);

    fn unique_name(tag: &str) -> String {
        format!(
            "/conduit-test-{tag}-{}-{}",
            std::process::id(),
            NAME_SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn small_cfg() -> RegionConfig {
        RegionConfig {
            buffer_size: 4096,
            max_endpoints: 4,
            max_readers: 4,
        }
    }

    #[test]
    fn test_create_open_refcount() {
        let name = unique_name("refcount");
        let a = SharedRegion::open(&name, small_cfg()).unwrap();
        assert_eq!(a.ref_count(), 1);

        let b = SharedRegion::open(&name, small_cfg()).unwrap();
        assert_eq!(a.ref_count(), 2);
        assert_eq!(b.ref_count(), 2);

        drop(b);
        assert_eq!(a.ref_count(), 1);

        drop(a);
        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_sizing_mismatch_rejected() {
        let name = unique_name("mismatch");
        let _a = SharedRegion::open(&name, small_cfg()).unwrap();

        let other = RegionConfig {
            buffer_size: 8192,
            ..small_cfg()
        };
        assert!(SharedRegion::open(&name, other).is_err());
        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = RegionConfig {
            buffer_size: 1000, // not a power of two
            ..small_cfg()
        };
        assert!(SharedRegion::open("/conduit-test-unused", bad).is_err());

        let bad = RegionConfig {
            max_endpoints: 0,
            ..small_cfg()
        };
        assert!(SharedRegion::open("/conduit-test-unused", bad).is_err());
    }

    #[test]
    fn test_ring_shared_between_mappings() {
        let name = unique_name("shared");
        let writer = SharedRegion::open(&name, small_cfg()).unwrap();
        let reader = SharedRegion::open(&name, small_cfg()).unwrap();

        reader.ring(0).unwrap().register_reader(1);
        assert!(writer.ring(0).unwrap().write(b"across mappings", 0));

        let msg = reader.ring(0).unwrap().read(1).unwrap();
        assert_eq!(msg.payload, b"across mappings");

        drop(writer);
        drop(reader);
        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_endpoint_bounds() {
        let name = unique_name("bounds");
        let region = SharedRegion::open(&name, small_cfg()).unwrap();
        assert!(region.ring(3).is_some());
        assert!(region.ring(4).is_none());
        assert!(region.lock(4).is_none());
        drop(region);
        SharedRegion::unlink(&name).unwrap();
    }
}
