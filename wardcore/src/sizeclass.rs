//! Routes variable-size allocations to one of ten power-of-two slabs
//! (2^5 .. 2^14), all protected by a single mutex.

use crate::error::{ErrorType, NetworkError, NetworkResult};
use crate::slab::Slab;
use std::sync::Mutex;

const FIRST_PO2: u32 = 5;
const LAST_PO2: u32 = 14;
const NUM_CLASSES: usize = (LAST_PO2 - FIRST_PO2 + 1) as usize;

/// Slot counts per class, heavier small-object weight, matching the
/// reference cache table.
const SLOT_COUNTS: [usize; NUM_CLASSES] = [256, 128, 64, 32, 16, 8, 16, 8, 16, 8];

fn ceil_log2(size: usize) -> u32 {
    debug_assert!(size > 0);
    let bits = usize::BITS - (size - 1).leading_zeros();
    bits.max(1)
}

fn size_to_class(size: usize) -> Option<usize> {
    let log2 = ceil_log2(size);
    if log2 < FIRST_PO2 || log2 > LAST_PO2 {
        return None;
    }
    Some((log2 - FIRST_PO2) as usize)
}

/// A handle into the allocator: the class and the slot offset within that
/// class's slab. Opaque to callers; round-tripped back into `free`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Handle {
    class: usize,
    offset: usize,
}

pub struct SizeClassAllocator {
    classes: Mutex<[Slab; NUM_CLASSES]>,
}

impl SizeClassAllocator {
    pub fn new() -> SizeClassAllocator {
        let mut classes: Vec<Slab> = Vec::with_capacity(NUM_CLASSES);
        for (i, &slots) in SLOT_COUNTS.iter().enumerate() {
            let stride = 1usize << (FIRST_PO2 as usize + i);
            classes.push(Slab::new(slots, stride));
        }
        SizeClassAllocator {
            classes: Mutex::new(
                classes
                    .try_into()
                    .unwrap_or_else(|_| panic!("class table length mismatch")),
            ),
        }
    }

    pub fn alloc(&self, size: usize) -> NetworkResult<Handle> {
        let class = size_to_class(size)
            .ok_or(NetworkError::Fatal(ErrorType::Exhausted))?;
        let mut classes = self.classes.lock().expect("size-class mutex poisoned");
        let offset = classes[class]
            .alloc()
            .ok_or(NetworkError::Fatal(ErrorType::Exhausted))?;
        Ok(Handle { class, offset })
    }

    pub fn free(&self, size: usize, handle: Handle) -> NetworkResult<()> {
        let class = size_to_class(size)
            .ok_or(NetworkError::Fatal(ErrorType::Exhausted))?;
        debug_assert_eq!(class, handle.class, "handle freed against the wrong size");
        let mut classes = self.classes.lock().expect("size-class mutex poisoned");
        if !classes[class].free(handle.offset) {
            return Err(NetworkError::Fatal(ErrorType::Exhausted));
        }
        Ok(())
    }
}

impl Default for SizeClassAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_log2_matches_expected_classes() {
        assert_eq!(size_to_class(1), Some(0)); // clamps up to 2^5
        assert_eq!(size_to_class(32), Some(0));
        assert_eq!(size_to_class(33), Some(1));
        assert_eq!(size_to_class(16384), Some(9));
        assert_eq!(size_to_class(16385), None);
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let alloc = SizeClassAllocator::new();
        let handle = alloc.alloc(100).expect("class 2 has room");
        alloc.free(100, handle).expect("handle matches class");
    }

    #[test]
    fn exhaustion_surfaces_as_error_not_panic() {
        let alloc = SizeClassAllocator::new();
        let mut handles = Vec::new();
        // class 0 (32-byte) has 256 slots.
        for _ in 0..256 {
            handles.push(alloc.alloc(10).unwrap());
        }
        assert!(alloc.alloc(10).is_err());
    }
}
