//! Region handles handed across the C boundary.
//!
//! A handle packs a slot index (upper 32 bits) and the slot's generation
//! (lower 32 bits). Removing a value bumps the generation, so handles kept
//! by C callers after `EMA_finalize` are rejected instead of aliasing a
//! newer region.

fn encode(slot: u32, generation: u32) -> u64 {
    ((slot as u64) << 32) | generation as u64
}

fn decode(handle: u64) -> (usize, u32) {
    ((handle >> 32) as usize, handle as u32)
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub(crate) struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> HandleTable<T> {
    pub(crate) const fn new() -> Self {
        HandleTable {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> u64 {
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.value = Some(value);
            return encode(idx, slot.generation);
        }
        let idx = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        encode(idx, 0)
    }

    pub(crate) fn get(&self, handle: u64) -> Option<&T> {
        let (idx, generation) = decode(handle);
        let slot = self.slots.get(idx)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Handle of the first live value matching `pred`.
    pub(crate) fn find(&self, pred: impl Fn(&T) -> bool) -> Option<u64> {
        self.slots.iter().enumerate().find_map(|(idx, slot)| match &slot.value {
            Some(value) if pred(value) => Some(encode(idx as u32, slot.generation)),
            _ => None,
        })
    }

    #[cfg(test)]
    pub(crate) fn remove(&mut self, handle: u64) -> Option<T> {
        let (idx, generation) = decode(handle);
        let slot = self.slots.get_mut(idx)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        Self::retire(slot, idx as u32, &mut self.free);
        Some(value)
    }

    /// Invalidate every live handle.
    pub(crate) fn clear(&mut self) {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                Self::retire(slot, idx as u32, &mut self.free);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    fn retire(slot: &mut Slot<T>, idx: u32, free: &mut Vec<u32>) {
        slot.generation = slot.generation.wrapping_add(1);
        // A wrapped generation would revive handles of generation 0.
        if slot.generation != 0 {
            free.push(idx);
        }
    }
}
