//! Seglet memory pool.
//!
//! All log memory is carved into fixed-size seglets at startup. Segments
//! lease a full complement of seglets when created and return them when
//! freed. Two pools back the lease: the general pool serves the writer's
//! head segments, and a survivor reserve serves cleaner side segments so the
//! cleaner can always make progress without competing with the writer.
//!
//! Freed seglets refill the reserve first whenever it sits below its target,
//! which keeps the reserve at strength even though survivor segments hold
//! their seglets for arbitrarily long once they join the live set.

use parking_lot::{Condvar, Mutex};

/// A fixed-size block of log memory.
///
/// Bytes below a segment's append cursor are immutable; the per-seglet lock
/// only arbitrates the writer filling the tail of a seglet against readers
/// copying out of its head.
#[derive(Debug)]
pub struct Seglet {
    buf: Mutex<Box<[u8]>>,
}

impl Seglet {
    fn new(size: usize) -> Self {
        Self {
            buf: Mutex::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        let mut buf = self.buf.lock();
        buf[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn read_into(&self, offset: usize, out: &mut [u8]) {
        let buf = self.buf.lock();
        out.copy_from_slice(&buf[offset..offset + out.len()]);
    }
}

/// Capability to allocate from the survivor reserve. Issued exactly once by
/// [`SegletAllocator::reserve`]; only the holder (the segment manager, on
/// behalf of the cleaner) can consume reserved seglets.
#[derive(Debug)]
pub struct ReserveGrant {
    _priv: (),
}

#[derive(Debug, Default)]
struct Pools {
    free: Vec<Seglet>,
    reserve: Vec<Seglet>,
    reserve_target: usize,
    grant_issued: bool,
}

/// Thread-safe pool of all seglets backing a log.
#[derive(Debug)]
pub struct SegletAllocator {
    seglet_size: u32,
    total: u32,
    pools: Mutex<Pools>,
    /// Signalled when the general pool grows.
    free_grew: Condvar,
    /// Signalled when the reserve grows.
    reserve_grew: Condvar,
}

impl SegletAllocator {
    pub fn new(seglet_size: u32, total_seglets: u32) -> Self {
        let free = (0..total_seglets)
            .map(|_| Seglet::new(seglet_size as usize))
            .collect();
        Self {
            seglet_size,
            total: total_seglets,
            pools: Mutex::new(Pools {
                free,
                ..Default::default()
            }),
            free_grew: Condvar::new(),
            reserve_grew: Condvar::new(),
        }
    }

    pub fn seglet_size(&self) -> u32 {
        self.seglet_size
    }

    pub fn total_seglets(&self) -> u32 {
        self.total
    }

    /// Seglets currently in the general pool.
    pub fn available(&self) -> u32 {
        self.pools.lock().free.len() as u32
    }

    /// Seglets currently in the survivor reserve.
    pub fn reserve_available(&self) -> u32 {
        self.pools.lock().reserve.len() as u32
    }

    /// Percent of all seglets unavailable to the writer. Reserved seglets
    /// count as in use: they are spoken for even while idle.
    pub fn utilization(&self) -> u32 {
        let free = self.pools.lock().free.len() as u64;
        let total = u64::from(self.total);
        (100 * (total - free) / total) as u32
    }

    /// One-time survivor reservation. Moves `n` seglets out of the general
    /// pool and returns the grant required to allocate them; fails if fewer
    /// than `n` are currently free or if a grant was already issued.
    pub fn reserve(&self, n: u32) -> Option<ReserveGrant> {
        let mut pools = self.pools.lock();
        if pools.grant_issued || pools.free.len() < n as usize {
            return None;
        }
        pools.grant_issued = true;
        pools.reserve_target = n as usize;
        for _ in 0..n {
            let seglet = pools.free.pop().unwrap();
            pools.reserve.push(seglet);
        }
        Some(ReserveGrant { _priv: () })
    }

    /// Take one seglet from the general pool, if any.
    pub fn alloc(&self) -> Option<Seglet> {
        self.pools.lock().free.pop()
    }

    /// Take `n` seglets from the general pool, all or nothing.
    pub fn alloc_many(&self, n: u32) -> Option<Vec<Seglet>> {
        let mut pools = self.pools.lock();
        let n = n as usize;
        if pools.free.len() < n {
            return None;
        }
        let at = pools.free.len() - n;
        Some(pools.free.split_off(at))
    }

    /// Take `n` seglets from the general pool, blocking until available.
    /// The writer stalls here at head rollover when memory is depleted.
    pub fn alloc_many_blocking(&self, n: u32) -> Vec<Seglet> {
        let mut pools = self.pools.lock();
        let n = n as usize;
        while pools.free.len() < n {
            self.free_grew.wait(&mut pools);
        }
        let at = pools.free.len() - n;
        pools.free.split_off(at)
    }

    /// Take `n` seglets from the survivor reserve, all or nothing.
    pub(crate) fn alloc_reserved(&self, n: u32, _grant: &ReserveGrant) -> Option<Vec<Seglet>> {
        let mut pools = self.pools.lock();
        let n = n as usize;
        if pools.reserve.len() < n {
            return None;
        }
        let at = pools.reserve.len() - n;
        Some(pools.reserve.split_off(at))
    }

    /// Take `n` seglets from the survivor reserve, blocking until available.
    pub(crate) fn alloc_reserved_blocking(&self, n: u32, _grant: &ReserveGrant) -> Vec<Seglet> {
        let mut pools = self.pools.lock();
        let n = n as usize;
        while pools.reserve.len() < n {
            self.reserve_grew.wait(&mut pools);
        }
        let at = pools.reserve.len() - n;
        pools.reserve.split_off(at)
    }

    /// Return seglets to the pool. The reserve is refilled before anything
    /// reaches the general pool.
    pub fn free_all(&self, seglets: impl IntoIterator<Item = Seglet>) {
        let mut pools = self.pools.lock();
        let mut reserve_grew = false;
        let mut free_grew = false;
        for seglet in seglets {
            if pools.reserve.len() < pools.reserve_target {
                pools.reserve.push(seglet);
                reserve_grew = true;
            } else {
                pools.free.push(seglet);
                free_grew = true;
            }
        }
        if reserve_grew {
            self.reserve_grew.notify_all();
        }
        if free_grew {
            self.free_grew.notify_all();
        }
    }

    pub fn free(&self, seglet: Seglet) {
        self.free_all(std::iter::once(seglet));
    }
}
