#[cfg(test)]
mod pool_test;

pub(crate) type PoolIdx = u32;

/// Typed object pool: a slot arena with a free list and a live bitset.
///
/// Grows on demand up to its bound and never shrinks, so a connection that
/// has survived its worst-case burst keeps the capacity for the next one.
/// Exhaustion is an `Option::None`, not an error; callers treat it as
/// backpressure and retry after completions return slots.
#[derive(Debug)]
pub(crate) struct Pool<T> {
    name: &'static str,
    slots: Vec<Option<T>>,
    free: Vec<PoolIdx>,
    live: Vec<u64>,
    bound: usize,
}

impl<T> Pool<T> {
    pub(crate) fn new(name: &'static str, bound: usize) -> Self {
        Pool {
            name,
            slots: Vec::new(),
            free: Vec::new(),
            live: Vec::new(),
            bound,
        }
    }

    pub(crate) fn bound(&self) -> usize {
        self.bound
    }

    pub(crate) fn in_use_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Takes a slot for `item`; `None` when the pool is at its bound.
    pub(crate) fn get(&mut self, item: T) -> Option<PoolIdx> {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                if self.slots.len() >= self.bound {
                    log::debug!("[{}] pool exhausted at {} slots", self.name, self.bound);
                    return None;
                }
                self.slots.push(None);
                (self.slots.len() - 1) as PoolIdx
            }
        };
        self.slots[idx as usize] = Some(item);
        self.mark_live(idx, true);
        Some(idx)
    }

    /// Returns a slot's item to the caller and the slot to the free list.
    pub(crate) fn put(&mut self, idx: PoolIdx) -> Option<T> {
        let item = self.slots.get_mut(idx as usize)?.take()?;
        self.mark_live(idx, false);
        self.free.push(idx);
        Some(item)
    }

    pub(crate) fn get_ref(&self, idx: PoolIdx) -> Option<&T> {
        self.slots.get(idx as usize)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, idx: PoolIdx) -> Option<&mut T> {
        self.slots.get_mut(idx as usize)?.as_mut()
    }

    /// Iterates live slots in index order.
    pub(crate) fn iter_in_use(&self) -> impl Iterator<Item = (PoolIdx, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| {
            let idx = idx as PoolIdx;
            match slot {
                Some(item) if self.is_live(idx) => Some((idx, item)),
                _ => None,
            }
        })
    }

    /// Indexes of every live slot, for walks that need `&mut self` while
    /// visiting.
    pub(crate) fn in_use_indexes(&self) -> Vec<PoolIdx> {
        self.iter_in_use().map(|(idx, _)| idx).collect()
    }

    fn mark_live(&mut self, idx: PoolIdx, live: bool) {
        let word = idx as usize / 64;
        let bit = idx as usize % 64;
        if word >= self.live.len() {
            self.live.resize(word + 1, 0);
        }
        if live {
            self.live[word] |= 1 << bit;
        } else {
            self.live[word] &= !(1 << bit);
        }
    }

    fn is_live(&self, idx: PoolIdx) -> bool {
        let word = idx as usize / 64;
        let bit = idx as usize % 64;
        self.live.get(word).is_some_and(|w| w & (1 << bit) != 0)
    }
}
