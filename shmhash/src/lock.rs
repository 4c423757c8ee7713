use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Result, ShmError};

const WRITER: u32 = 1 << 31;
/// A writer is waiting; new readers back off so writers are not starved.
/// Advisory only: a waiter that died leaves it set, so readers stop honouring
/// it after waiting half their timeout.
const WRITER_WAITING: u32 = 1 << 30;
const READERS: u32 = WRITER_WAITING - 1;

/// Spins before falling back to yielding the thread.
const SPIN_LIMIT: u32 = 64;

/// Reader/writer lock over a single `u32` word that lives in shared memory.
///
/// Any process that maps the word takes part in the locking. Acquisition is
/// bounded by `timeout`; a holder that died with the lock taken shows up as
/// `ShmError::LockTimeout` for everyone else.
pub struct SharedRwLock<'a> {
    word: &'a AtomicU32,
    timeout: Duration,
}

pub struct ReadGuard<'a> {
    word: &'a AtomicU32,
}

pub struct WriteGuard<'a> {
    word: &'a AtomicU32,
}

struct Backoff {
    spins: u32,
    started: Instant,
    deadline: Instant,
    timeout: Duration,
}

impl Backoff {
    fn new(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            spins: 0,
            started,
            deadline: started + timeout,
            timeout,
        }
    }

    /// True once half of the timeout has been spent waiting.
    fn patience_spent(&self) -> bool {
        self.started.elapsed() >= self.timeout / 2
    }

    fn wait(&mut self) -> Result<()> {
        if self.spins < SPIN_LIMIT {
            for _ in 0..(1 << self.spins.min(6)) {
                std::hint::spin_loop();
            }
            self.spins += 1;
        } else {
            std::thread::yield_now();
        }
        if Instant::now() >= self.deadline {
            return Err(ShmError::LockTimeout(self.timeout));
        }
        Ok(())
    }
}

impl<'a> SharedRwLock<'a> {
    pub fn new(word: &'a AtomicU32, timeout: Duration) -> Self {
        Self { word, timeout }
    }

    pub fn read(&self) -> Result<ReadGuard<'a>> {
        let mut backoff = Backoff::new(self.timeout);
        loop {
            let current = self.word.load(Ordering::Relaxed);
            let yielding = current & WRITER_WAITING != 0 && !backoff.patience_spent();
            let blocked = current & WRITER != 0 || current & READERS == READERS || yielding;
            if !blocked
                && self
                    .word
                    .compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return Ok(ReadGuard { word: self.word });
            }
            if let Err(e) = backoff.wait() {
                tracing::warn!(timeout = ?self.timeout, "shared read lock timed out");
                return Err(e);
            }
        }
    }

    pub fn write(&self) -> Result<WriteGuard<'a>> {
        let mut backoff = Backoff::new(self.timeout);
        loop {
            let current = self.word.load(Ordering::Relaxed);
            if current & (WRITER | READERS) == 0 {
                if self
                    .word
                    .compare_exchange_weak(current, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(WriteGuard { word: self.word });
                }
            } else if current & WRITER_WAITING == 0 {
                self.word.fetch_or(WRITER_WAITING, Ordering::Relaxed);
            }
            if let Err(e) = backoff.wait() {
                // other waiting writers set the flag again on their next pass
                self.word.fetch_and(!WRITER_WAITING, Ordering::Relaxed);
                tracing::warn!(timeout = ?self.timeout, "shared write lock timed out");
                return Err(e);
            }
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.word.fetch_sub(1, Ordering::Release);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.word.fetch_and(!WRITER, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_readers_share() {
        let word = AtomicU32::new(0);
        let lock = SharedRwLock::new(&word, Duration::from_millis(50));
        let a = lock.read().unwrap();
        let b = lock.read().unwrap();
        assert_eq!(word.load(Ordering::SeqCst), 2);
        drop(a);
        drop(b);
        assert_eq!(word.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_writer_excludes_readers() {
        let word = AtomicU32::new(0);
        let lock = SharedRwLock::new(&word, Duration::from_millis(20));
        let guard = lock.write().unwrap();
        assert!(matches!(lock.read(), Err(ShmError::LockTimeout(_))));
        assert!(matches!(lock.write(), Err(ShmError::LockTimeout(_))));
        drop(guard);
        assert!(lock.read().is_ok());
    }

    #[test]
    fn test_reader_blocks_writer_until_released() {
        let word = AtomicU32::new(0);
        let lock = SharedRwLock::new(&word, Duration::from_millis(20));
        let reader = lock.read().unwrap();
        assert!(matches!(lock.write(), Err(ShmError::LockTimeout(_))));
        // the timed-out writer withdrew its waiting flag
        assert_eq!(word.load(Ordering::SeqCst), 1);
        drop(reader);
        let writer = lock.write().unwrap();
        assert_eq!(word.load(Ordering::SeqCst), WRITER);
        drop(writer);
        assert_eq!(word.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stale_waiting_flag_does_not_lock_out_readers() {
        // a writer that died while waiting leaves only its flag behind
        let word = AtomicU32::new(WRITER_WAITING);
        let lock = SharedRwLock::new(&word, Duration::from_millis(50));
        let reader = lock.read().unwrap();
        assert_eq!(word.load(Ordering::SeqCst), WRITER_WAITING + 1);
        drop(reader);
        assert_eq!(word.load(Ordering::SeqCst), WRITER_WAITING);

        // the next writer takes over and clears the flag
        let writer = lock.write().unwrap();
        assert_eq!(word.load(Ordering::SeqCst), WRITER);
        drop(writer);
        assert_eq!(word.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_held_writer_still_blocks_patient_readers() {
        let word = AtomicU32::new(WRITER | WRITER_WAITING);
        let lock = SharedRwLock::new(&word, Duration::from_millis(30));
        assert!(matches!(lock.read(), Err(ShmError::LockTimeout(_))));
    }

    #[test]
    fn test_counter_under_contention() {
        struct Shared {
            word: AtomicU32,
            counter: std::cell::UnsafeCell<u64>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            word: AtomicU32::new(0),
            counter: std::cell::UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    let lock = SharedRwLock::new(&shared.word, Duration::from_secs(10));
                    for _ in 0..1000 {
                        let _guard = lock.write().unwrap();
                        unsafe { *shared.counter.get() += 1 };
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(unsafe { *shared.counter.get() }, 4000);
        assert_eq!(shared.word.load(Ordering::SeqCst), 0);
    }
}
