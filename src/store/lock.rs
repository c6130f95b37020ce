//! Per-account exclusive write lock plus the cooperative IPC channel that
//! lets housekeeping and live sessions hand the lock back and forth
//! without a writer ever blocking indefinitely on another writer.
//!
//! The lock itself is a `flock`'d file under the account root, acquired
//! with bounded retries and a short sleep between attempts -- the same
//! shape as the teacher's `lock_file` helper, just non-fatal on timeout so
//! the caller can decide whether to skip this account and try again later.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Error};
use nix::fcntl::{flock, FlockArg};

const LOCK_FILE_NAME: &str = ".write.lock";
const RETRY_SLEEP: Duration = Duration::from_secs(1);

/// Held for the lifetime of a writer session (or a housekeeping pass);
/// dropping it releases the `flock`.
pub struct AccountLock {
    _file: File,
    account_root: PathBuf,
}

impl AccountLock {
    /// Try to acquire the lock, retrying up to `max_attempts` times with a
    /// 1-second sleep between attempts. Returns `Ok(None)` (not an error)
    /// if every attempt failed, so the caller can skip this account and
    /// move on rather than treat contention as a hard failure.
    pub fn try_acquire(account_root: &Path, max_attempts: u32) -> Result<Option<Self>, Error> {
        let path = account_root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;

        let fd = file.as_raw_fd();
        for attempt in 0..max_attempts.max(1) {
            match flock(fd, FlockArg::LockExclusiveNonblock) {
                Ok(()) => {
                    return Ok(Some(Self {
                        _file: file,
                        account_root: account_root.to_path_buf(),
                    }))
                }
                Err(_) if attempt + 1 < max_attempts => {
                    std::thread::sleep(RETRY_SLEEP);
                }
                Err(_) => return Ok(None),
            }
        }
        Ok(None)
    }

    pub fn account_root(&self) -> &Path {
        &self.account_root
    }
}

/// Messages a writer session or the housekeeper send each other over the
/// shared IPC channel to negotiate who holds an account's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HousekeepingSignal {
    /// A writer session is blocked on `account_id`'s lock and is asking
    /// housekeeping to release it.
    ReleaseAccount(u32),
    /// Housekeeping should stop entirely (SIGTERM-equivalent).
    Terminate,
    /// Housekeeping should reload configuration and re-scan its account
    /// list (SIGHUP-equivalent).
    Reload,
}

/// Thin wrapper over a pair of `crossbeam-channel` endpoints, used as the
/// cooperative hand-off between the housekeeper loop and live sessions:
/// a session that can't get an account's lock posts a `ReleaseAccount`
/// request, and the housekeeper polls for it between units of work and
/// yields the lock early when it sees its own account named.
pub struct HousekeepingIpc {
    sender: crossbeam_channel::Sender<HousekeepingSignal>,
    receiver: crossbeam_channel::Receiver<HousekeepingSignal>,
}

impl HousekeepingIpc {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    pub fn sender(&self) -> crossbeam_channel::Sender<HousekeepingSignal> {
        self.sender.clone()
    }

    /// Non-blocking poll, used by the housekeeper between units of work.
    pub fn poll(&self) -> Option<HousekeepingSignal> {
        self.receiver.try_recv().ok()
    }

    /// Should housekeeping yield the account it currently holds? Drains
    /// and re-queues any unrelated signals so they aren't lost.
    pub fn should_yield_account(&self, current_account: u32) -> bool {
        let mut requeue = Vec::new();
        let mut yield_now = false;
        while let Ok(signal) = self.receiver.try_recv() {
            match &signal {
                HousekeepingSignal::ReleaseAccount(id) if *id == current_account => {
                    yield_now = true;
                }
                HousekeepingSignal::Terminate => {
                    yield_now = true;
                    requeue.push(signal);
                }
                _ => requeue.push(signal),
            }
        }
        for signal in requeue {
            let _ = self.sender.send(signal);
        }
        yield_now
    }
}

impl Default for HousekeepingIpc {
    fn default() -> Self {
        Self::new()
    }
}

/// A session's bounded retry policy when a writer can't get the lock: ask
/// housekeeping to release the account, then retry with 1-second sleeps
/// up to `max_attempts` times before giving up with
/// `CannotLockStoreForWriting`.
pub fn acquire_for_writer_session(
    account_root: &Path,
    account_id: u32,
    ipc: &HousekeepingIpc,
    max_attempts: u32,
) -> Result<AccountLock, Error> {
    let _ = ipc.sender.send(HousekeepingSignal::ReleaseAccount(account_id));
    let deadline = Instant::now() + RETRY_SLEEP * max_attempts.max(1);
    loop {
        if let Some(lock) = AccountLock::try_acquire(account_root, 1)? {
            return Ok(lock);
        }
        if Instant::now() >= deadline {
            bail!("could not acquire write lock for account {}", account_id);
        }
        std::thread::sleep(RETRY_SLEEP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn single_acquire_succeeds() {
        let dir = tempdir().unwrap();
        let lock = AccountLock::try_acquire(dir.path(), 1).unwrap();
        assert!(lock.is_some());
    }

    #[test]
    fn second_acquire_blocks_until_release() {
        let dir = tempdir().unwrap();
        let lock = AccountLock::try_acquire(dir.path(), 1).unwrap().unwrap();
        let second = AccountLock::try_acquire(dir.path(), 1).unwrap();
        assert!(second.is_none());
        drop(lock);
        let third = AccountLock::try_acquire(dir.path(), 1).unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn ipc_yield_signal_is_consumed_once() {
        let ipc = HousekeepingIpc::new();
        ipc.sender().send(HousekeepingSignal::ReleaseAccount(5)).unwrap();
        assert!(ipc.should_yield_account(5));
        assert!(!ipc.should_yield_account(5));
    }

    #[test]
    fn ipc_unrelated_signals_are_requeued() {
        let ipc = HousekeepingIpc::new();
        ipc.sender().send(HousekeepingSignal::ReleaseAccount(7)).unwrap();
        assert!(!ipc.should_yield_account(5));
        assert_eq!(ipc.poll(), Some(HousekeepingSignal::ReleaseAccount(7)));
    }
}
