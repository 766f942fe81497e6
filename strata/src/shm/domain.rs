use crate::error::{Result, StrataError};
use crate::shm::{Segment, SegmentKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Exported handle to a registered buffer, exchanged between node peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionToken {
    pub addr: u64,
    pub len: u64,
}

impl RegionToken {
    pub const WIRE_SIZE: usize = 16;

    pub fn to_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::WIRE_SIZE {
            return Err(StrataError::DecodeFailed(format!(
                "region token needs {} bytes, got {}",
                Self::WIRE_SIZE,
                bytes.len()
            )));
        }
        let mut addr = [0u8; 8];
        let mut len = [0u8; 8];
        addr.copy_from_slice(&bytes[..8]);
        len.copy_from_slice(&bytes[8..]);
        Ok(Self {
            addr: u64::from_le_bytes(addr),
            len: u64::from_le_bytes(len),
        })
    }
}

/// A peer's buffer made addressable in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    addr: u64,
    len: usize,
    token: RegionToken,
}

impl MappedRegion {
    pub fn new(addr: u64, len: usize, token: RegionToken) -> Self {
        Self { addr, len, token }
    }

    /// Local address of the mapping.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn token(&self) -> RegionToken {
        self.token
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// # Safety
    /// No rank may write the range while the slice is alive.
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        if len == 0 {
            return Ok(&[]);
        }
        Ok(unsafe { std::slice::from_raw_parts((self.addr as usize + offset) as *const u8, len) })
    }

    /// Copy `data` into the mapping at `offset`.
    ///
    /// # Safety
    /// This rank must be the only one accessing the range until the next
    /// barrier.
    pub unsafe fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.addr as usize + offset) as *mut u8,
                data.len(),
            );
        }
        Ok(())
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(StrataError::Mapping(format!(
                "access {offset}+{len} outside mapping of {} bytes",
                self.len
            )));
        }
        Ok(())
    }
}

/// Shared-memory services of the node a rank runs on.
///
/// Segments are scoped to a node: every rank attaching the same key on the
/// same node sees the same memory. Single-copy mapping lets a rank read and
/// write a node peer's registered buffer directly.
pub trait MemoryDomain: Send + Sync {
    /// Attach the segment named by `key`, creating it zeroed with at least
    /// `len` bytes on first attach.
    fn attach_segment(&self, key: SegmentKey, len: usize) -> Result<Arc<Segment>>;

    /// Drop this rank's claim on a segment.
    fn detach_segment(&self, key: SegmentKey);

    /// Whether `register`/`map` are available.
    fn can_map(&self) -> bool;

    /// Export a local buffer so node peers can map it.
    fn register(&self, addr: u64, len: usize) -> Result<RegionToken>;

    /// Withdraw an exported buffer.
    fn deregister(&self, token: RegionToken) -> Result<()>;

    /// Map a peer's exported buffer into this process.
    fn map(&self, token: RegionToken) -> Result<MappedRegion>;

    /// Release a mapping.
    fn unmap(&self, region: MappedRegion) -> Result<()>;
}

struct SegmentEntry {
    segment: Arc<Segment>,
    attached: usize,
}

/// Memory domain for ranks sharing one address space.
///
/// Segments are heap allocations handed out by key; mapping a registered
/// buffer is the identity.
pub struct LocalMemoryDomain {
    segments: Mutex<HashMap<SegmentKey, SegmentEntry>>,
    registered: Mutex<HashMap<RegionToken, usize>>,
    can_map: bool,
    live_mappings: AtomicUsize,
}

impl LocalMemoryDomain {
    pub fn new() -> Self {
        Self::with_mapping(true)
    }

    /// A domain without single-copy support.
    pub fn without_mapping() -> Self {
        Self::with_mapping(false)
    }

    fn with_mapping(can_map: bool) -> Self {
        Self {
            segments: Mutex::new(HashMap::new()),
            registered: Mutex::new(HashMap::new()),
            can_map,
            live_mappings: AtomicUsize::new(0),
        }
    }

    /// Mappings handed out and not yet released.
    pub fn live_mappings(&self) -> usize {
        self.live_mappings.load(Ordering::Acquire)
    }

    /// Registrations not yet withdrawn.
    pub fn live_registrations(&self) -> usize {
        self.registered
            .lock()
            .map(|r| r.values().sum())
            .unwrap_or_default()
    }

    /// Segments with at least one attached rank.
    pub fn attached_segments(&self) -> usize {
        self.segments.lock().map(|s| s.len()).unwrap_or_default()
    }
}

impl Default for LocalMemoryDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDomain for LocalMemoryDomain {
    fn attach_segment(&self, key: SegmentKey, len: usize) -> Result<Arc<Segment>> {
        let mut segments = self
            .segments
            .lock()
            .map_err(|_| StrataError::LockPoisoned("segments"))?;
        if let Some(entry) = segments.get_mut(&key) {
            if entry.segment.len() < len {
                return Err(StrataError::SharedMemory(format!(
                    "segment {key:?} has {} bytes, {len} requested",
                    entry.segment.len()
                )));
            }
            entry.attached += 1;
            return Ok(Arc::clone(&entry.segment));
        }
        let segment = Arc::new(Segment::zeroed(len)?);
        segments.insert(
            key,
            SegmentEntry {
                segment: Arc::clone(&segment),
                attached: 1,
            },
        );
        Ok(segment)
    }

    fn detach_segment(&self, key: SegmentKey) {
        if let Ok(mut segments) = self.segments.lock()
            && let Some(entry) = segments.get_mut(&key)
        {
            entry.attached = entry.attached.saturating_sub(1);
            if entry.attached == 0 {
                segments.remove(&key);
            }
        }
    }

    fn can_map(&self) -> bool {
        self.can_map
    }

    fn register(&self, addr: u64, len: usize) -> Result<RegionToken> {
        if !self.can_map {
            return Err(StrataError::Mapping("domain does not support mapping".into()));
        }
        let token = RegionToken {
            addr,
            len: len as u64,
        };
        *self
            .registered
            .lock()
            .map_err(|_| StrataError::LockPoisoned("registrations"))?
            .entry(token)
            .or_default() += 1;
        Ok(token)
    }

    fn deregister(&self, token: RegionToken) -> Result<()> {
        let mut registered = self
            .registered
            .lock()
            .map_err(|_| StrataError::LockPoisoned("registrations"))?;
        match registered.get_mut(&token) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                registered.remove(&token);
            }
            None => {
                return Err(StrataError::Mapping(format!("{token:?} is not registered")));
            }
        }
        Ok(())
    }

    fn map(&self, token: RegionToken) -> Result<MappedRegion> {
        let registered = self
            .registered
            .lock()
            .map_err(|_| StrataError::LockPoisoned("registrations"))?;
        if !registered.contains_key(&token) {
            return Err(StrataError::Mapping(format!("{token:?} is not registered")));
        }
        self.live_mappings.fetch_add(1, Ordering::AcqRel);
        Ok(MappedRegion::new(token.addr, token.len as usize, token))
    }

    fn unmap(&self, _region: MappedRegion) -> Result<()> {
        self.live_mappings.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}
