//! Process privilege management.
//!
//! `uemu` must be started as root (through sudo or pkexec) but runs with the
//! invoking user's effective identity whenever it touches untrusted content.
//! Effective uid/gid are process-wide, so every transition goes through a
//! single [`Privileges`] value:
//!
//! - [`Privileges::escalate`] hands out an [`Escalation`] guard. Escalation is
//!   owned by one thread at a time and is reentrant on that thread; the guard
//!   cannot leave the thread that created it.
//! - [`Privileges::unprivileged`] hands out an [`UnprivilegedLease`]. Any number
//!   of leases may be held concurrently; escalation waits until all are gone.
//!
//! Dropping the last `Escalation` restores the unprivileged identity. If that
//! fails the process aborts rather than continue as root.

use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use uemu_error::{ProvisionError, Result};
use uemu_hal::{Identity, SystemHal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Dropped { leases: usize },
    Escalated { owner: ThreadId, depth: usize },
}

pub struct Privileges {
    hal: Arc<dyn SystemHal>,
    unprivileged: Identity,
    level: Mutex<Level>,
    changed: Condvar,
}

impl std::fmt::Debug for Privileges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Privileges")
            .field("unprivileged", &self.unprivileged)
            .field("level", &*self.lock())
            .finish()
    }
}

/// Identity of the user who invoked us through sudo or pkexec, if any.
pub fn invoking_identity() -> Option<Identity> {
    let env_id = |name: &str| std::env::var(name).ok()?.trim().parse::<u32>().ok();

    if let Some(uid) = env_id("SUDO_UID") {
        let gid = env_id("SUDO_GID").unwrap_or(uid);
        return Some(Identity::new(uid, gid));
    }
    if let Some(uid) = env_id("PKEXEC_UID") {
        let gid = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|user| user.gid.as_raw())
            .unwrap_or(uid);
        return Some(Identity::new(uid, gid));
    }
    None
}

fn require_root(hal: &dyn SystemHal) -> Result<()> {
    if hal.real_uid() != 0 {
        return Err(ProvisionError::configuration(
            "creation requires sudo/pkexec (root)",
        ));
    }
    Ok(())
}

impl Privileges {
    /// Capture the invoking user's identity and drop to it.
    ///
    /// Fails with a configuration error when the process is not running as root
    /// or when the invoking user cannot be told from `SUDO_UID`/`PKEXEC_UID`.
    pub fn capture(hal: Arc<dyn SystemHal>) -> Result<Arc<Self>> {
        require_root(hal.as_ref())?;
        let identity = invoking_identity().ok_or_else(|| {
            ProvisionError::configuration(
                "cannot tell the invoking user (SUDO_UID and PKEXEC_UID unset); run through sudo or pkexec",
            )
        })?;
        Self::with_identity(hal, identity)
    }

    /// Like [`Privileges::capture`] with an explicit unprivileged identity.
    pub fn with_identity(hal: Arc<dyn SystemHal>, unprivileged: Identity) -> Result<Arc<Self>> {
        require_root(hal.as_ref())?;
        hal.set_effective_identity(unprivileged).map_err(|err| {
            ProvisionError::Permission(format!(
                "cannot drop to uid {} gid {}: {}",
                unprivileged.uid, unprivileged.gid, err
            ))
        })?;
        log::debug!(
            "dropped privileges to uid {} gid {}",
            unprivileged.uid,
            unprivileged.gid
        );

        Ok(Arc::new(Self {
            hal,
            unprivileged,
            level: Mutex::new(Level::Dropped { leases: 0 }),
            changed: Condvar::new(),
        }))
    }

    pub fn unprivileged_identity(&self) -> Identity {
        self.unprivileged
    }

    fn lock(&self) -> MutexGuard<'_, Level> {
        self.level.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Become root until the returned guard (and any nested ones) are dropped.
    pub fn escalate(&self) -> Result<Escalation<'_>> {
        let me = thread::current().id();
        let mut level = self.lock();
        loop {
            match *level {
                Level::Escalated { owner, depth } if owner == me => {
                    *level = Level::Escalated {
                        owner,
                        depth: depth + 1,
                    };
                    break;
                }
                Level::Dropped { leases: 0 } => {
                    self.hal
                        .set_effective_identity(Identity::ROOT)
                        .map_err(|err| {
                            ProvisionError::Permission(format!("cannot escalate to root: {}", err))
                        })?;
                    log::debug!("escalated privileges");
                    *level = Level::Escalated {
                        owner: me,
                        depth: 1,
                    };
                    break;
                }
                _ => {
                    level = self
                        .changed
                        .wait(level)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }

        Ok(Escalation {
            privileges: self,
            _not_send: PhantomData,
        })
    }

    /// Hold the unprivileged identity until the returned lease is dropped.
    ///
    /// Fails if the calling thread is itself escalated, since waiting would deadlock.
    pub fn unprivileged(&self) -> Result<UnprivilegedLease<'_>> {
        let me = thread::current().id();
        let mut level = self.lock();
        loop {
            match *level {
                Level::Dropped { leases } => {
                    *level = Level::Dropped { leases: leases + 1 };
                    break;
                }
                Level::Escalated { owner, .. } if owner == me => {
                    return Err(ProvisionError::Permission(
                        "cannot run unprivileged work while this thread is escalated".to_string(),
                    ));
                }
                Level::Escalated { .. } => {
                    level = self
                        .changed
                        .wait(level)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
        Ok(UnprivilegedLease { privileges: self })
    }

    /// Whether the calling thread currently holds an escalation.
    pub fn is_escalated(&self) -> bool {
        matches!(*self.lock(), Level::Escalated { owner, .. } if owner == thread::current().id())
    }

    fn release_escalation(&self) {
        let mut level = self.lock();
        if let Level::Escalated { owner, depth } = *level {
            if depth > 1 {
                *level = Level::Escalated {
                    owner,
                    depth: depth - 1,
                };
                return;
            }
            if let Err(err) = self.hal.set_effective_identity(self.unprivileged) {
                log::error!(
                    "failed to restore uid {} gid {} after escalation: {}",
                    self.unprivileged.uid,
                    self.unprivileged.gid,
                    err
                );
                std::process::abort();
            }
            log::debug!("dropped privileges");
            *level = Level::Dropped { leases: 0 };
            self.changed.notify_all();
        }
    }

    fn release_lease(&self) {
        let mut level = self.lock();
        if let Level::Dropped { leases } = *level {
            *level = Level::Dropped {
                leases: leases.saturating_sub(1),
            };
            self.changed.notify_all();
        }
    }
}

/// Root privileges held by the current thread.
#[must_use = "privileges are dropped again as soon as the guard goes out of scope"]
pub struct Escalation<'a> {
    privileges: &'a Privileges,
    // Escalation is owned by a thread; keep the guard on it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for Escalation<'_> {
    fn drop(&mut self) {
        self.privileges.release_escalation();
    }
}

/// Shared claim on the unprivileged identity.
#[must_use = "the lease ends as soon as it goes out of scope"]
pub struct UnprivilegedLease<'a> {
    privileges: &'a Privileges,
}

impl Drop for UnprivilegedLease<'_> {
    fn drop(&mut self) {
        self.privileges.release_lease();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use uemu_hal::{FakeHal, IdentityOps};

    const USER: Identity = Identity { uid: 1000, gid: 1000 };

    fn setup() -> (FakeHal, Arc<Privileges>) {
        let hal = FakeHal::new();
        let privileges = Privileges::with_identity(Arc::new(hal.clone()), USER).unwrap();
        (hal, privileges)
    }

    #[test]
    fn capture_requires_root() {
        let hal = FakeHal::unprivileged(1000, 1000);
        let err = Privileges::with_identity(Arc::new(hal.clone()), USER).unwrap_err();
        assert!(matches!(err, ProvisionError::Configuration(_)));
        assert_eq!(hal.operation_count(), 0);
    }

    // The only test in this crate touching these variables.
    #[test]
    fn capture_needs_an_invoking_user() {
        const VARS: [&str; 3] = ["SUDO_UID", "SUDO_GID", "PKEXEC_UID"];
        let saved: Vec<_> = VARS.iter().map(|v| (*v, std::env::var(v).ok())).collect();
        for var in VARS {
            std::env::remove_var(var);
        }

        let hal = FakeHal::new();
        let err = Privileges::capture(Arc::new(hal.clone())).unwrap_err();
        assert!(matches!(err, ProvisionError::Configuration(_)));
        assert_eq!(hal.operation_count(), 0);
        assert!(hal.effective_identity().is_root());

        std::env::set_var("SUDO_UID", "1000");
        std::env::set_var("SUDO_GID", "1000");
        let privileges = Privileges::capture(Arc::new(hal.clone())).unwrap();
        assert_eq!(privileges.unprivileged_identity(), USER);
        assert_eq!(hal.effective_identity(), USER);

        for (var, value) in saved {
            match value {
                Some(value) => std::env::set_var(var, value),
                None => std::env::remove_var(var),
            }
        }
    }

    #[test]
    fn capture_drops_to_invoking_user() {
        let (hal, _privileges) = setup();
        assert_eq!(hal.effective_identity(), USER);
    }

    #[test]
    fn escalation_is_restored_on_drop() {
        let (hal, privileges) = setup();
        {
            let _root = privileges.escalate().unwrap();
            assert!(hal.effective_identity().is_root());
            assert!(privileges.is_escalated());
        }
        assert_eq!(hal.effective_identity(), USER);
        assert!(!privileges.is_escalated());
    }

    #[test]
    fn escalation_is_reentrant_on_one_thread() {
        let (hal, privileges) = setup();
        let outer = privileges.escalate().unwrap();
        {
            let _inner = privileges.escalate().unwrap();
        }
        assert!(hal.effective_identity().is_root());
        drop(outer);
        assert_eq!(hal.effective_identity(), USER);
        assert_eq!(hal.identity_changes(), vec![USER, Identity::ROOT, USER]);
    }

    #[test]
    fn escalation_restored_on_error_path() {
        let (hal, privileges) = setup();
        let failing = || -> Result<()> {
            let _root = privileges.escalate()?;
            Err(ProvisionError::mount("boom"))
        };
        assert!(failing().is_err());
        assert_eq!(hal.effective_identity(), USER);
    }

    #[test]
    fn unprivileged_lease_refused_while_escalated_here() {
        let (_hal, privileges) = setup();
        let _root = privileges.escalate().unwrap();
        assert!(matches!(
            privileges.unprivileged(),
            Err(ProvisionError::Permission(_))
        ));
    }

    #[test]
    fn escalation_waits_for_outstanding_leases() {
        let (hal, privileges) = setup();
        let (tx, rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let worker = {
            let privileges = Arc::clone(&privileges);
            thread::spawn(move || {
                let _lease = privileges.unprivileged().unwrap();
                tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };
        rx.recv().unwrap();

        let escalator = {
            let privileges = Arc::clone(&privileges);
            let hal = hal.clone();
            thread::spawn(move || {
                let _root = privileges.escalate().unwrap();
                hal.effective_identity()
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(hal.effective_identity(), USER);

        release_tx.send(()).unwrap();
        worker.join().unwrap();
        assert!(escalator.join().unwrap().is_root());
        assert_eq!(hal.effective_identity(), USER);
    }
}
