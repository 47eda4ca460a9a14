use std::sync::Mutex;

/// Fixed-capacity allocator for numeric ids backed by a bitset.
///
/// Used for connection ids by the accept loop and for user ids by the
/// store. Ids are always in `0..capacity`.
///
/// # Examples
///
/// ```
/// use mrps::id_pool::IdPool;
///
/// let pool = IdPool::new(2);
/// assert_eq!(pool.take(), Some(0));
/// assert_eq!(pool.take(), Some(1));
/// assert_eq!(pool.take(), None);
/// pool.give_back(0);
/// assert_eq!(pool.take(), Some(0));
/// ```
#[derive(Debug)]
pub struct IdPool {
    capacity: u32,
    bits: Mutex<Vec<u64>>,
}

impl IdPool {
    /// Creates a pool with every id in `0..capacity` free.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        let words = (capacity as usize).div_ceil(64);
        Self {
            capacity,
            bits: Mutex::new(vec![0; words]),
        }
    }

    /// Number of ids the pool manages.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Takes the lowest free id, or `None` when the pool is exhausted.
    pub fn take(&self) -> Option<u32> {
        let mut bits = self.lock();
        for (w, word) in bits.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones();
            let id = w as u32 * 64 + bit;
            if id >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            return Some(id);
        }
        None
    }

    /// Returns a taken id to the pool.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range or not currently taken.
    pub fn give_back(&self, id: u32) {
        assert!(id < self.capacity, "id {id} out of range");
        let mut bits = self.lock();
        let (w, mask) = Self::locate(id);
        assert!(bits[w] & mask != 0, "id {id} returned while free");
        bits[w] &= !mask;
    }

    /// Marks `id` taken or free directly, for seeding from persisted state.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    pub fn set_taken(&self, id: u32, taken: bool) {
        assert!(id < self.capacity, "id {id} out of range");
        let mut bits = self.lock();
        let (w, mask) = Self::locate(id);
        if taken {
            bits[w] |= mask;
        } else {
            bits[w] &= !mask;
        }
    }

    /// Returns `true` if `id` is currently taken.
    #[must_use]
    pub fn is_taken(&self, id: u32) -> bool {
        if id >= self.capacity {
            return false;
        }
        let (w, mask) = Self::locate(id);
        self.lock()[w] & mask != 0
    }

    /// Number of ids currently taken.
    #[must_use]
    pub fn taken_count(&self) -> u32 {
        self.lock().iter().map(|w| w.count_ones()).sum()
    }

    fn locate(id: u32) -> (usize, u64) {
        ((id / 64) as usize, 1u64 << (id % 64))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u64>> {
        // A poisoned pool means an assertion already fired; the bitset itself
        // is never left half-written.
        self.bits.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
