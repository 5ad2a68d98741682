//! Serializes tests that touch the process-wide stream slots

use parking_lot::{Mutex, MutexGuard};

lazy_static::lazy_static! {
    static ref STREAM_LOCK: Mutex<()> = Mutex::new(());
}

pub(crate) fn stream_lock() -> MutexGuard<'static, ()> {
    STREAM_LOCK.lock()
}
