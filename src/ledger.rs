//! Bounded, concurrently written fault ledger.
//!
//! Workers claim a slot with an atomic fetch-and-increment on the fault
//! counter and write their record into `slot % capacity`. Storage wraps,
//! the counter does not: once more faults arrive than there are slots,
//! older records are overwritten (and a record may even be torn if two
//! workers share a slot in the same phase) but the total stays exact.

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of fault records kept between readouts.
pub const MAX_ERR_RECORD_COUNT: usize = 10;

/// A single detected mismatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultRecord {
    /// Device address of the faulting word.
    pub address: u64,
    /// Value the kernel expected.
    pub expected: u64,
    /// Value the kernel read.
    pub observed: u64,
    /// Value read again from the start of the faulting block (or chunk).
    pub reread: u64,
}

impl FaultRecord {
    /// Bits that differ between expected and observed.
    pub fn diff(&self) -> u64 {
        self.expected ^ self.observed
    }

    /// Bits that differ between expected and the re-read value.
    pub fn reread_diff(&self) -> u64 {
        self.expected ^ self.reread
    }
}

#[derive(Default)]
struct Slot {
    address: AtomicU64,
    expected: AtomicU64,
    observed: AtomicU64,
    reread: AtomicU64,
}

impl Slot {
    fn write(&self, record: &FaultRecord) {
        self.address.store(record.address, Ordering::Relaxed);
        self.expected.store(record.expected, Ordering::Relaxed);
        self.observed.store(record.observed, Ordering::Relaxed);
        self.reread.store(record.reread, Ordering::Relaxed);
    }

    fn take(&self) -> FaultRecord {
        FaultRecord {
            address: self.address.swap(0, Ordering::Relaxed),
            expected: self.expected.swap(0, Ordering::Relaxed),
            observed: self.observed.swap(0, Ordering::Relaxed),
            reread: self.reread.swap(0, Ordering::Relaxed),
        }
    }
}

/// What one readout drained from the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerReadout {
    /// Exact number of faults recorded since the previous readout.
    pub total: u64,
    /// Up to `capacity` surviving records, in slot order.
    pub records: Vec<FaultRecord>,
}

impl LedgerReadout {
    pub fn is_clean(&self) -> bool {
        self.total == 0
    }

    /// Faults whose records were overwritten.
    pub fn dropped(&self) -> u64 {
        self.total - self.records.len() as u64
    }
}

/// Fixed-capacity ring of fault records plus an exact fault counter.
pub struct ErrorLedger {
    count: AtomicU64,
    slots: Box<[Slot]>,
}

impl ErrorLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            count: AtomicU64::new(0),
            slots: (0..capacity).map(|_| Slot::default()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Faults recorded since the last readout.
    #[cfg(test)]
    pub fn pending(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Records a fault. Safe under any number of concurrent callers.
    pub fn record_fault(&self, address: u64, expected: u64, observed: u64, reread: u64) {
        let slot = self.count.fetch_add(1, Ordering::AcqRel);
        let cell = &self.slots[(slot % self.slots.len() as u64) as usize];
        cell.write(&FaultRecord {
            address,
            expected,
            observed,
            reread,
        });
    }

    /// Merges a batch read back from a device-side ledger: `total` faults, of
    /// which `records` survived in ring order.
    pub fn absorb(&self, total: u64, records: &[FaultRecord]) {
        if total == 0 {
            return;
        }
        let first = self.count.fetch_add(total, Ordering::AcqRel);
        let capacity = self.capacity() as u64;
        for (i, record) in records.iter().take(self.capacity()).enumerate() {
            self.slots[((first + i as u64) % capacity) as usize].write(record);
        }
    }

    /// Drains the count and up to `capacity` records, zeroing all storage.
    ///
    /// Must only be called at a launch boundary, when no worker is writing.
    pub fn read_and_reset(&self) -> LedgerReadout {
        let total = self.count.swap(0, Ordering::AcqRel);
        let live = total.min(self.slots.len() as u64) as usize;
        let mut records = Vec::with_capacity(live);
        for (i, slot) in self.slots.iter().enumerate() {
            let record = slot.take();
            if i < live {
                records.push(record);
            }
        }
        LedgerReadout { total, records }
    }
}

impl Default for ErrorLedger {
    fn default() -> Self {
        Self::new(MAX_ERR_RECORD_COUNT)
    }
}
