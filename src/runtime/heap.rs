//! Reference-counted heap for port data values whose canonical form is a
//! handle (text and friends). Retain/release balance across an event pass is
//! a correctness property; tests read the counts directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

struct HeapCell {
    bytes: Vec<u8>,
    refcount: u64,
}

pub struct Heap {
    cells: Mutex<HashMap<u64, HeapCell>>,
    next: AtomicU64,
}

impl Heap {
    pub fn new() -> Self {
        Heap { cells: Mutex::new(HashMap::new()), next: AtomicU64::new(1) }
    }

    /// Allocate a cell and return its handle. The cell starts unowned; the
    /// first retain takes ownership for whatever slot stores the handle.
    pub fn alloc(&self, bytes: Vec<u8>) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.cells.lock().insert(handle, HeapCell { bytes, refcount: 0 });
        handle
    }

    pub fn retain(&self, handle: u64) {
        if handle == 0 {
            return;
        }
        if let Some(cell) = self.cells.lock().get_mut(&handle) {
            cell.refcount += 1;
        } else {
            log::warn!("retain of dangling heap handle {handle}");
        }
    }

    pub fn release(&self, handle: u64) {
        if handle == 0 {
            return;
        }
        let mut cells = self.cells.lock();
        match cells.get_mut(&handle) {
            Some(cell) if cell.refcount > 1 => cell.refcount -= 1,
            Some(cell) if cell.refcount == 1 => {
                cells.remove(&handle);
            }
            Some(_) => log::warn!("release of unowned heap handle {handle}"),
            None => log::warn!("release of dangling heap handle {handle}"),
        }
    }

    pub fn bytes(&self, handle: u64) -> Option<Vec<u8>> {
        self.cells.lock().get(&handle).map(|c| c.bytes.clone())
    }

    pub fn set_bytes(&self, handle: u64, bytes: Vec<u8>) {
        if let Some(cell) = self.cells.lock().get_mut(&handle) {
            cell.bytes = bytes;
        } else {
            log::warn!("write to dangling heap handle {handle}");
        }
    }

    pub fn refcount(&self, handle: u64) -> Option<u64> {
        self.cells.lock().get(&handle).map(|c| c.refcount)
    }

    /// Number of live cells; zero after balanced retain/release traffic.
    pub fn live_cells(&self) -> usize {
        self.cells.lock().len()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_at_one_frees() {
        let heap = Heap::new();
        let h = heap.alloc(b"hello".to_vec());
        assert_eq!(heap.refcount(h), Some(0));
        heap.retain(h);
        heap.retain(h);
        assert_eq!(heap.refcount(h), Some(2));
        heap.release(h);
        heap.release(h);
        assert_eq!(heap.refcount(h), None);
        assert_eq!(heap.live_cells(), 0);
    }

    #[test]
    fn null_handle_is_ignored() {
        let heap = Heap::new();
        heap.retain(0);
        heap.release(0);
        assert_eq!(heap.live_cells(), 0);
    }
}
