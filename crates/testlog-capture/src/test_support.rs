//! Serializes tests that touch the process-wide console facade

use parking_lot::{Mutex, MutexGuard};

lazy_static::lazy_static! {
    static ref CONSOLE_LOCK: Mutex<()> = Mutex::new(());
}

pub(crate) fn console_lock() -> MutexGuard<'static, ()> {
    CONSOLE_LOCK.lock()
}
