//! Compressible vectors sharing an element budget
//!
//! A [`CountLimitedPool`] owns the storage of every vector registered with it
//! and keeps the sum of their capacities under a fixed element count. When a
//! vector needs room, the least recently used vectors are compressed with the
//! pool's [`Compressor`] and give their budget back. A compressed vector is
//! inflated again transparently the next time its data is touched.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{PoolError, PoolResult};
use crate::extent::Position;

/// Accesses after which a vector moves itself to the head of the LRU list
pub const ACCESS_NOTIFY_THRESHOLD: usize = 100;

pub const DEFAULT_COMPRESSION_LEVEL: u32 = 5;

/// Fixed-size little-endian codec for pooled elements
pub trait PoolElement: Copy + Default + Send + 'static {
    const SIZE: usize;

    fn write_le(&self, out: &mut Vec<u8>);

    /// `bytes` holds exactly `SIZE` bytes
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_pool_element {
    ($($ty:ty),* $(,)?) => {
        $(
            impl PoolElement for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn write_le(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_pool_element!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl PoolElement for Position {
    const SIZE: usize = 16;

    fn write_le(&self, out: &mut Vec<u8>) {
        self.x.write_le(out);
        self.y.write_le(out);
    }

    fn read_le(bytes: &[u8]) -> Self {
        Position::new(f64::read_le(&bytes[..8]), f64::read_le(&bytes[8..16]))
    }
}

/// Byte compression used when a vector is discarded
pub trait Compressor: fmt::Debug + Send + Sync {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    fn decompress(&self, data: &[u8], expected_len: usize) -> io::Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZlibCompressor {
    level: u32,
}

impl ZlibCompressor {
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL)
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(expected_len);
        ZlibDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Opaque key of a vector's storage inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle(u64);

#[derive(Debug)]
struct Compressed {
    bytes: Vec<u8>,
    len: usize,
    capacity: usize,
}

#[derive(Debug)]
struct Slot<T> {
    data: Vec<T>,
    /// Element budget held by this slot while inflated
    capacity: usize,
    compressed: Option<Compressed>,
    access_count: usize,
}

impl<T: PoolElement> Slot<T> {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            capacity: 0,
            compressed: None,
            access_count: 0,
        }
    }

    fn len(&self) -> usize {
        match &self.compressed {
            Some(compressed) => compressed.len,
            None => self.data.len(),
        }
    }

    fn capacity(&self) -> usize {
        match &self.compressed {
            Some(compressed) => compressed.capacity,
            None => self.capacity,
        }
    }

    fn set_capacity(&mut self, capacity: usize) {
        if capacity < self.data.len() {
            self.data.truncate(capacity);
        }
        if capacity > self.data.capacity() {
            self.data.reserve_exact(capacity - self.data.len());
        }
        self.capacity = capacity;
    }

    /// Compress the contents and return the released budget. The inflated
    /// data is only dropped once the payload exists.
    fn compress(&mut self, compressor: &dyn Compressor) -> PoolResult<usize> {
        if self.compressed.is_some() {
            return Ok(0);
        }

        let mut raw = Vec::with_capacity(self.data.len() * T::SIZE);
        for value in &self.data {
            value.write_le(&mut raw);
        }
        let bytes = compressor.compress(&raw).map_err(PoolError::Compression)?;

        let released = self.capacity;
        self.compressed = Some(Compressed {
            bytes,
            len: self.data.len(),
            capacity: self.capacity,
        });
        self.data = Vec::new();
        self.capacity = 0;
        Ok(released)
    }

    /// Restore the contents. On failure the compressed payload is kept.
    fn decompress(&mut self, compressor: &dyn Compressor) -> PoolResult<()> {
        let Some(compressed) = &self.compressed else {
            return Ok(());
        };

        let expected = compressed.len * T::SIZE;
        let raw = compressor
            .decompress(&compressed.bytes, expected)
            .map_err(PoolError::Decompression)?;
        if raw.len() != expected {
            return Err(PoolError::CorruptPayload {
                expected,
                actual: raw.len(),
            });
        }

        let mut data = Vec::with_capacity(compressed.capacity);
        data.extend(raw.chunks_exact(T::SIZE).map(T::read_le));
        self.capacity = compressed.capacity;
        self.data = data;
        self.compressed = None;
        Ok(())
    }
}

/// How much capacity a data operation needs before it runs
#[derive(Debug, Clone, Copy)]
enum Growth {
    Keep,
    Reserve(usize),
    Additional(usize),
}

impl Growth {
    fn target(self, len: usize, capacity: usize, limit: Option<usize>) -> usize {
        match self {
            Growth::Keep => capacity,
            Growth::Reserve(requested) => capacity.max(requested),
            Growth::Additional(extra) => {
                let needed = len + extra;
                if needed <= capacity {
                    return capacity;
                }
                let doubled = (capacity * 2).max(needed);
                match limit {
                    Some(limit) => doubled.min(limit).max(needed),
                    None => doubled,
                }
            }
        }
    }
}

struct PoolInner<T> {
    count_limit: usize,
    total_used: usize,
    /// Inflated slots holding budget, most recently used first
    lru: LruCache<SlotHandle, ()>,
    slots: HashMap<SlotHandle, Slot<T>>,
    next_handle: u64,
    compressor: Box<dyn Compressor>,
}

impl<T: PoolElement> PoolInner<T> {
    fn slot_mut(&mut self, handle: SlotHandle) -> PoolResult<&mut Slot<T>> {
        self.slots
            .get_mut(&handle)
            .ok_or(PoolError::UnknownSlot(handle.0))
    }

    fn register(&mut self) -> SlotHandle {
        let handle = SlotHandle(self.next_handle);
        self.next_handle += 1;
        self.slots.insert(handle, Slot::new());
        handle
    }

    fn check_limit(&self, requested: usize) -> PoolResult<()> {
        if requested > self.count_limit {
            return Err(PoolError::BudgetExhausted {
                requested,
                limit: self.count_limit,
            });
        }
        Ok(())
    }

    /// Evict least recently used slots other than `requester` until
    /// `additional` more elements fit in the budget.
    fn make_room(&mut self, additional: usize, requester: SlotHandle) -> PoolResult<()> {
        while self.total_used + additional > self.count_limit {
            let victim = self
                .lru
                .iter()
                .rev()
                .map(|(&handle, _)| handle)
                .find(|&handle| handle != requester);
            let victim = match victim {
                Some(handle) => handle,
                None => {
                    return Err(PoolError::BudgetExhausted {
                        requested: additional,
                        limit: self.count_limit,
                    })
                }
            };
            self.discard(victim)?;
        }
        Ok(())
    }

    fn discard(&mut self, handle: SlotHandle) -> PoolResult<()> {
        let slot = self
            .slots
            .get_mut(&handle)
            .ok_or(PoolError::UnknownSlot(handle.0))?;
        let released = slot.compress(self.compressor.as_ref())?;
        self.total_used -= released;
        self.lru.pop(&handle);
        if released > 0 {
            debug!("Discarded pool slot {} releasing {} elements", handle.0, released);
        }
        Ok(())
    }

    fn inflate(&mut self, handle: SlotHandle) -> PoolResult<()> {
        let capacity = match &self.slot_mut(handle)?.compressed {
            Some(compressed) => compressed.capacity,
            None => return Ok(()),
        };
        self.check_limit(capacity)?;
        self.make_room(capacity, handle)?;

        let slot = self
            .slots
            .get_mut(&handle)
            .ok_or(PoolError::UnknownSlot(handle.0))?;
        slot.decompress(self.compressor.as_ref())?;
        self.total_used += capacity;
        if capacity > 0 {
            self.lru.put(handle, ());
        }
        debug!("Inflated pool slot {} holding {} elements", handle.0, capacity);
        Ok(())
    }

    /// Resize the budget of an inflated slot
    fn grant(&mut self, handle: SlotHandle, new_capacity: usize) -> PoolResult<()> {
        self.check_limit(new_capacity)?;
        let current = self.slot_mut(handle)?.capacity;
        if new_capacity > current {
            self.notify_access(handle);
            self.make_room(new_capacity - current, handle)?;
        }

        self.slot_mut(handle)?.set_capacity(new_capacity);
        self.total_used = self.total_used - current + new_capacity;
        if new_capacity > 0 {
            self.lru.put(handle, ());
        } else {
            self.lru.pop(&handle);
        }
        Ok(())
    }

    fn notify_access(&mut self, handle: SlotHandle) {
        self.lru.promote(&handle);
    }

    fn touch(&mut self, handle: SlotHandle) -> PoolResult<()> {
        let slot = self.slot_mut(handle)?;
        slot.access_count += 1;
        if slot.access_count > ACCESS_NOTIFY_THRESHOLD {
            slot.access_count = 0;
            self.notify_access(handle);
        }
        Ok(())
    }

    /// Inflate and size a slot before a data operation
    fn prepare(&mut self, handle: SlotHandle, growth: Growth) -> PoolResult<()> {
        self.touch(handle)?;
        self.inflate(handle)?;
        let slot = self.slot_mut(handle)?;
        let (len, capacity) = (slot.data.len(), slot.capacity);
        let target = growth.target(len, capacity, Some(self.count_limit));
        if target != capacity {
            self.grant(handle, target)?;
        }
        Ok(())
    }

    fn free(&mut self, handle: SlotHandle) -> bool {
        match self.slots.remove(&handle) {
            Some(slot) => {
                self.total_used -= slot.capacity;
                self.lru.pop(&handle);
                true
            }
            None => false,
        }
    }
}

/// Element budget shared by a set of compressible vectors
pub struct CountLimitedPool<T> {
    inner: Mutex<PoolInner<T>>,
}

impl<T: PoolElement> CountLimitedPool<T> {
    pub fn new(count_limit: usize) -> Self {
        Self::with_compressor(count_limit, Box::new(ZlibCompressor::default()))
    }

    pub fn with_compressor(count_limit: usize, compressor: Box<dyn Compressor>) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                count_limit,
                total_used: 0,
                lru: LruCache::unbounded(),
                slots: HashMap::new(),
                next_handle: 0,
                compressor,
            }),
        }
    }

    pub fn count_limit(&self) -> usize {
        self.inner.lock().count_limit
    }

    pub fn total_used(&self) -> usize {
        self.inner.lock().total_used
    }

    /// Number of inflated vectors currently holding budget
    pub fn managed_count(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Grant `count` elements to `handle`, compressing least recently used
    /// vectors until the grant fits, and make it the most recently used.
    pub fn allocate(&self, count: usize, handle: SlotHandle) -> PoolResult<()> {
        let mut inner = self.inner.lock();
        inner.inflate(handle)?;
        inner.grant(handle, count)
    }

    /// Change the grant of `handle`. The requester is marked as used first so
    /// it is never chosen for eviction on its own behalf.
    pub fn reallocate(&self, new_count: usize, handle: SlotHandle) -> PoolResult<()> {
        let mut inner = self.inner.lock();
        inner.notify_access(handle);
        inner.inflate(handle)?;
        inner.grant(handle, new_count)
    }

    /// Forget `handle` and release its budget
    pub fn free(&self, handle: SlotHandle) -> bool {
        self.inner.lock().free(handle)
    }

    pub fn notify_access(&self, handle: SlotHandle) {
        self.inner.lock().notify_access(handle);
    }

    fn register(&self) -> SlotHandle {
        self.inner.lock().register()
    }
}

impl<T> fmt::Debug for CountLimitedPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CountLimitedPool")
            .field("count_limit", &inner.count_limit)
            .field("total_used", &inner.total_used)
            .field("slots", &inner.slots.len())
            .finish()
    }
}

enum Storage<T> {
    Pooled {
        pool: Arc<CountLimitedPool<T>>,
        handle: SlotHandle,
    },
    Unpooled {
        slot: Mutex<Slot<T>>,
        compressor: ZlibCompressor,
    },
}

/// Growable buffer whose contents can be compressed when memory is tight
pub struct CompressiblePooledVector<T: PoolElement> {
    storage: Storage<T>,
}

impl<T: PoolElement> CompressiblePooledVector<T> {
    pub fn new(pool: &Arc<CountLimitedPool<T>>) -> Self {
        let handle = pool.register();
        Self {
            storage: Storage::Pooled {
                pool: Arc::clone(pool),
                handle,
            },
        }
    }

    pub fn with_capacity(pool: &Arc<CountLimitedPool<T>>, capacity: usize) -> PoolResult<Self> {
        let vector = Self::new(pool);
        vector.reserve(capacity)?;
        Ok(vector)
    }

    /// A vector that never counts against a budget. It is only compressed
    /// through explicit [`discard`](Self::discard) calls.
    pub fn unpooled() -> Self {
        Self {
            storage: Storage::Unpooled {
                slot: Mutex::new(Slot::new()),
                compressor: ZlibCompressor::default(),
            },
        }
    }

    pub fn handle(&self) -> Option<SlotHandle> {
        match &self.storage {
            Storage::Pooled { handle, .. } => Some(*handle),
            Storage::Unpooled { .. } => None,
        }
    }

    fn access<R>(
        &self,
        growth: Growth,
        f: impl FnOnce(&mut Slot<T>) -> PoolResult<R>,
    ) -> PoolResult<R> {
        match &self.storage {
            Storage::Pooled { pool, handle } => {
                let mut inner = pool.inner.lock();
                inner.prepare(*handle, growth)?;
                f(inner.slot_mut(*handle)?)
            }
            Storage::Unpooled { slot, compressor } => {
                let mut slot = slot.lock();
                slot.decompress(compressor)?;
                let target = growth.target(slot.data.len(), slot.capacity, None);
                if target != slot.capacity {
                    slot.set_capacity(target);
                }
                f(&mut slot)
            }
        }
    }

    fn inspect<R>(&self, f: impl FnOnce(&Slot<T>) -> R) -> Option<R> {
        match &self.storage {
            Storage::Pooled { pool, handle } => pool.inner.lock().slots.get(handle).map(f),
            Storage::Unpooled { slot, .. } => Some(f(&slot.lock())),
        }
    }

    pub fn reserve(&self, capacity: usize) -> PoolResult<()> {
        self.access(Growth::Reserve(capacity), |_| Ok(()))
    }

    pub fn push(&self, value: T) -> PoolResult<()> {
        self.access(Growth::Additional(1), |slot| {
            slot.data.push(value);
            Ok(())
        })
    }

    pub fn extend_from_slice(&self, values: &[T]) -> PoolResult<()> {
        self.access(Growth::Additional(values.len()), |slot| {
            slot.data.extend_from_slice(values);
            Ok(())
        })
    }

    pub fn get(&self, index: usize) -> PoolResult<T> {
        self.access(Growth::Keep, |slot| {
            slot.data.get(index).copied().ok_or(PoolError::OutOfBounds {
                index,
                len: slot.data.len(),
            })
        })
    }

    pub fn set(&self, index: usize, value: T) -> PoolResult<()> {
        self.access(Growth::Keep, |slot| {
            let len = slot.data.len();
            let element = slot
                .data
                .get_mut(index)
                .ok_or(PoolError::OutOfBounds { index, len })?;
            *element = value;
            Ok(())
        })
    }

    /// Remove the element at `index`, shifting the following ones down
    pub fn erase(&self, index: usize) -> PoolResult<T> {
        self.access(Growth::Keep, |slot| {
            if index >= slot.data.len() {
                return Err(PoolError::OutOfBounds {
                    index,
                    len: slot.data.len(),
                });
            }
            Ok(slot.data.remove(index))
        })
    }

    pub fn clear(&self) -> PoolResult<()> {
        self.access(Growth::Keep, |slot| {
            slot.data.clear();
            Ok(())
        })
    }

    pub fn to_vec(&self) -> PoolResult<Vec<T>> {
        self.access(Growth::Keep, |slot| Ok(slot.data.clone()))
    }

    pub fn len(&self) -> usize {
        self.inspect(Slot::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity restored when the vector is inflated
    pub fn capacity(&self) -> usize {
        self.inspect(Slot::capacity).unwrap_or(0)
    }

    pub fn is_compressed(&self) -> bool {
        self.inspect(|slot| slot.compressed.is_some())
            .unwrap_or(false)
    }

    /// Compress the contents and give the budget back to the pool
    pub fn discard(&self) -> PoolResult<()> {
        match &self.storage {
            Storage::Pooled { pool, handle } => pool.inner.lock().discard(*handle),
            Storage::Unpooled { slot, compressor } => {
                slot.lock().compress(compressor).map(|_| ())
            }
        }
    }

    /// Re-acquire budget and restore the contents
    pub fn inflate(&self) -> PoolResult<()> {
        match &self.storage {
            Storage::Pooled { pool, handle } => pool.inner.lock().inflate(*handle),
            Storage::Unpooled { slot, compressor } => slot.lock().decompress(compressor),
        }
    }
}

impl<T: PoolElement> Drop for CompressiblePooledVector<T> {
    fn drop(&mut self) {
        if let Storage::Pooled { pool, handle } = &self.storage {
            pool.free(*handle);
        }
    }
}

impl<T: PoolElement> fmt::Debug for CompressiblePooledVector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressiblePooledVector")
            .field("handle", &self.handle())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("compressed", &self.is_compressed())
            .finish()
    }
}
