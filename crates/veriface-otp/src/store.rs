use crate::phone::PhoneNumber;
use crate::record::OtpRecord;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Keyed OTP storage with atomic per-key read-modify-write.
pub trait OtpStore: Send + Sync {
    /// Run `f` on the slot for `phone` with exclusive access. Leaving the
    /// slot `None` removes the record.
    fn with_entry<R>(&self, phone: &PhoneNumber, f: impl FnOnce(&mut Option<OtpRecord>) -> R) -> R;

    /// Remove every record matching `pred`; returns how many were removed.
    fn remove_where(&self, pred: &mut dyn FnMut(&OtpRecord) -> bool) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local store; restart clears it.
#[derive(Debug, Default)]
pub struct MemoryOtpStore {
    records: Mutex<HashMap<PhoneNumber, OtpRecord>>,
}

impl MemoryOtpStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PhoneNumber, OtpRecord>> {
        // A panic mid-update leaves at worst one stale record.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl OtpStore for MemoryOtpStore {
    fn with_entry<R>(&self, phone: &PhoneNumber, f: impl FnOnce(&mut Option<OtpRecord>) -> R) -> R {
        let mut records = self.lock();
        let mut slot = records.remove(phone);
        let out = f(&mut slot);
        if let Some(record) = slot {
            records.insert(phone.clone(), record);
        }
        out
    }

    fn remove_where(&self, pred: &mut dyn FnMut(&OtpRecord) -> bool) -> usize {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, record| !pred(record));
        before - records.len()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}
