//! Slab allocator for the three common packet payload sizes (§4.D),
//! grounded on libtorrent's `packet_pool`/`packet_slab`: a bounded free
//! list per size class, falling through to the general allocator on a
//! miss or when the free list is full.

/// `576 (INET_MIN_MTU) - 20 (IPv4) - 8 (UDP) - 20 (uTP header)`
pub const MTU_FLOOR_PAYLOAD: usize = 576 - 20 - 8 - 20;
/// `1500 (Ethernet) - 20 (IPv4) - 8 (UDP) - 20 (uTP header)`
pub const MTU_CEILING_PAYLOAD: usize = 1500 - 20 - 8 - 20;
/// SYN/FIN/STATE carry no payload.
pub const SYN_PAYLOAD: usize = 0;

const SLAB_LIMIT: usize = 10;

struct Slab {
    capacity: usize,
    free: Vec<Vec<u8>>,
}

impl Slab {
    fn new(capacity: usize) -> Self {
        Slab {
            capacity,
            free: Vec::with_capacity(SLAB_LIMIT),
        }
    }

    fn alloc(&mut self) -> Vec<u8> {
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(self.capacity),
        }
    }

    fn release(&mut self, buf: Vec<u8>) {
        if self.free.len() < SLAB_LIMIT && buf.capacity() >= self.capacity {
            self.free.push(buf);
        }
    }

    fn decay(&mut self) {
        self.free.pop();
    }
}

/// Per-manager, single-threaded packet buffer pool (§4.D, §5 "Shared
/// resources": no locking).
pub struct PacketPool {
    syn: Slab,
    mtu_floor: Slab,
    mtu_ceiling: Slab,
}

impl PacketPool {
    pub fn new() -> Self {
        PacketPool {
            syn: Slab::new(SYN_PAYLOAD),
            mtu_floor: Slab::new(MTU_FLOOR_PAYLOAD),
            mtu_ceiling: Slab::new(MTU_CEILING_PAYLOAD),
        }
    }

    /// Borrow a buffer with at least `len` bytes of capacity.
    pub fn acquire(&mut self, len: usize) -> Vec<u8> {
        if len <= SYN_PAYLOAD {
            self.syn.alloc()
        } else if len <= MTU_FLOOR_PAYLOAD {
            self.mtu_floor.alloc()
        } else if len <= MTU_CEILING_PAYLOAD {
            self.mtu_ceiling.alloc()
        } else {
            Vec::with_capacity(len)
        }
    }

    /// Return a buffer to its matching slab, if any.
    pub fn release(&mut self, buf: Vec<u8>) {
        let cap = buf.capacity();
        if cap == SYN_PAYLOAD {
            self.syn.release(buf);
        } else if cap <= MTU_FLOOR_PAYLOAD {
            self.mtu_floor.release(buf);
        } else if cap <= MTU_CEILING_PAYLOAD {
            self.mtu_ceiling.release(buf);
        }
        // larger than any slab: dropped, falls back to the allocator next time
    }

    /// Drop one cached buffer per slab (called periodically by the manager).
    pub fn decay(&mut self) {
        self.syn.decay();
        self.mtu_floor.decay();
        self.mtu_ceiling.decay();
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_released_buffer() {
        let mut pool = PacketPool::new();
        let buf = pool.acquire(100);
        let cap = buf.capacity();
        pool.release(buf);
        let buf2 = pool.acquire(100);
        assert_eq!(buf2.capacity(), cap);
    }

    #[test]
    fn decay_drops_one_per_slab() {
        let mut pool = PacketPool::new();
        for _ in 0..3 {
            let b = pool.acquire(100);
            pool.release(b);
        }
        // only one slot is ever used since alloc/release pairs reuse the same buf
        pool.decay();
        let b = pool.acquire(100);
        assert!(b.capacity() >= 100);
    }

    #[test]
    fn oversized_falls_through() {
        let mut pool = PacketPool::new();
        let buf = pool.acquire(10_000);
        assert!(buf.capacity() >= 10_000);
    }
}
