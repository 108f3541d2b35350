//! Hook for platforms that need a socket detached from one reactor before
//! another process-local reactor can adopt it.

use std::{
    fmt,
    os::fd::BorrowedFd,
    sync::atomic::{AtomicBool, Ordering},
};

/// The platform has no handle migration; transfers go ahead without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsupported;

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("handle migration is not supported")
    }
}

impl std::error::Error for Unsupported {}

/// Prepares a socket handle for transfer between workers.
///
/// `detach` runs before a primary listener sends an accepted socket to a
/// secondary. If the send fails, `reattach` runs before the primary keeps
/// the socket itself.
pub trait HandleMigration: Send + Sync + 'static {
    fn detach(&self, handle: BorrowedFd<'_>) -> Result<(), Unsupported>;

    fn reattach(&self, handle: BorrowedFd<'_>) -> Result<(), Unsupported>;
}

/// Default: nothing to migrate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMigration;

impl HandleMigration for NoMigration {
    #[inline]
    fn detach(&self, _: BorrowedFd<'_>) -> Result<(), Unsupported> {
        Err(Unsupported)
    }

    #[inline]
    fn reattach(&self, _: BorrowedFd<'_>) -> Result<(), Unsupported> {
        Err(Unsupported)
    }
}

/// Calls into a [`HandleMigration`] until it first reports
/// [`Unsupported`], then never again for the life of the server.
pub(crate) struct MigrationGate {
    migration: Box<dyn HandleMigration>,
    enabled: AtomicBool,
}

impl MigrationGate {
    pub(crate) fn new(migration: Box<dyn HandleMigration>) -> Self {
        Self {
            migration,
            enabled: AtomicBool::new(true),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self {
            migration: Box::new(NoMigration),
            enabled: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn detach(&self, handle: BorrowedFd<'_>) {
        if self.is_enabled() {
            self.check(self.migration.detach(handle));
        }
    }

    pub(crate) fn reattach(&self, handle: BorrowedFd<'_>) {
        if self.is_enabled() {
            self.check(self.migration.reattach(handle));
        }
    }

    fn check(&self, result: Result<(), Unsupported>) {
        if result.is_err() && self.enabled.swap(false, Ordering::Relaxed) {
            tracing::debug!("handle migration unsupported, disabled");
        }
    }
}

#[cfg(test)]
mod platform_tests {
    use super::*;
    use std::{
        os::fd::AsFd,
        sync::{atomic::AtomicUsize, Arc},
    };

    struct Counting {
        calls: Arc<AtomicUsize>,
        supported: bool,
    }

    impl HandleMigration for Counting {
        fn detach(&self, _: BorrowedFd<'_>) -> Result<(), Unsupported> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.supported.then_some(()).ok_or(Unsupported)
        }

        fn reattach(&self, handle: BorrowedFd<'_>) -> Result<(), Unsupported> {
            self.detach(handle)
        }
    }

    fn gate(supported: bool) -> (MigrationGate, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let migration = Counting {
            calls: calls.clone(),
            supported,
        };
        (MigrationGate::new(Box::new(migration)), calls)
    }

    #[test]
    fn supported_migration_is_always_called() {
        let (gate, calls) = gate(true);
        let file = std::io::stdin();

        gate.detach(file.as_fd());
        gate.reattach(file.as_fd());
        gate.detach(file.as_fd());

        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert!(gate.is_enabled());
    }

    #[test]
    fn first_unsupported_disables_gate() {
        let (gate, calls) = gate(false);
        let file = std::io::stdin();

        gate.detach(file.as_fd());
        gate.reattach(file.as_fd());
        gate.detach(file.as_fd());

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(!gate.is_enabled());
    }

    #[test]
    fn disabled_gate_skips_calls() {
        let gate = MigrationGate::disabled();
        gate.detach(std::io::stdin().as_fd());

        assert!(!gate.is_enabled());
    }
}
