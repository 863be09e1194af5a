//! Scoped effective-UID transitions for setuid-root deployments.
//!
//! The orchestrator binary is installed setuid root and drops to the
//! calling user at startup; device configuration re-escalates through this
//! gate. Restoration is an explicit, logged step rather than a `Drop`
//! side effect: a failed restore must surface as an error, and callers
//! serialize the whole bracket behind the process-wide lock so concurrent
//! tunnels never observe each other's escalated state.

use nix::unistd::{getegid, geteuid, getgid, getuid, seteuid, Uid};
use tracing::debug;

use crate::error::{Error, Result};

/// Records the effective UID held before escalation and restores it on
/// request.
pub struct PrivilegeGuard {
    original_uid: u32,
    became_uid: u32,
    tunnel: String,
}

impl PrivilegeGuard {
    /// Switch the effective UID to `uid`, remembering the current one.
    ///
    /// A no-op (but still a guard) when the effective UID already equals
    /// `uid`. Failure to escalate is reported with a setuid-installation
    /// hint and is treated as unrecoverable by the lifecycle engine.
    pub fn become_uid(tunnel: &str, uid: u32) -> Result<PrivilegeGuard> {
        log_ids("before become", tunnel);
        let original_uid = geteuid().as_raw();
        if original_uid != uid {
            seteuid(Uid::from_raw(uid)).map_err(|e| Error::Privilege {
                message: format!(
                    "unable to change to uid {} (perhaps missing setuid mode on executable? \
                     chown 0:0 sshtun; chmod 4755 sshtun): {}",
                    uid, e
                ),
            })?;
        }
        let guard = PrivilegeGuard {
            original_uid,
            became_uid: geteuid().as_raw(),
            tunnel: tunnel.to_string(),
        };
        log_ids("after become", &guard.tunnel);
        Ok(guard)
    }

    /// Re-escalate an existing guard to `uid` without touching the
    /// recorded original.
    pub fn become_again(&mut self, uid: u32) -> Result<()> {
        log_ids("before become", &self.tunnel);
        if geteuid().as_raw() != uid {
            seteuid(Uid::from_raw(uid)).map_err(|e| Error::Privilege {
                message: format!("unable to change to uid {}: {}", uid, e),
            })?;
        }
        self.became_uid = geteuid().as_raw();
        log_ids("after become", &self.tunnel);
        Ok(())
    }

    /// Restore the originally recorded effective UID.
    pub fn unbecome(&mut self) -> Result<()> {
        log_ids("before unbecome", &self.tunnel);
        if geteuid().as_raw() != self.original_uid {
            seteuid(Uid::from_raw(self.original_uid)).map_err(|e| Error::Privilege {
                message: format!(
                    "unable to restore effective uid {}: {}",
                    self.original_uid, e
                ),
            })?;
        }
        self.became_uid = geteuid().as_raw();
        log_ids("after unbecome", &self.tunnel);
        Ok(())
    }

    /// The effective UID held when the guard was constructed.
    pub fn original_uid(&self) -> u32 {
        self.original_uid
    }

    /// The effective UID after the most recent transition.
    pub fn current_uid(&self) -> u32 {
        self.became_uid
    }
}

fn log_ids(stage: &str, tunnel: &str) {
    debug!(
        name = tunnel,
        uid = getuid().as_raw(),
        gid = getgid().as_raw(),
        euid = geteuid().as_raw(),
        egid = getegid().as_raw(),
        "Privilege transition: {}",
        stage
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    // Escalation to uid 0 needs a setuid binary or root; these tests cover
    // the no-op paths that hold for any user.

    #[test]
    fn become_current_uid_is_a_noop_guard() {
        let euid = geteuid().as_raw();
        let mut guard = PrivilegeGuard::become_uid("test", euid).expect("become");
        assert_eq!(guard.original_uid(), euid);
        assert_eq!(guard.current_uid(), euid);
        guard.unbecome().expect("unbecome");
        assert_eq!(geteuid().as_raw(), euid);
    }

    #[test]
    fn unbecome_is_idempotent() {
        let euid = geteuid().as_raw();
        let mut guard = PrivilegeGuard::become_uid("test", euid).expect("become");
        guard.unbecome().expect("first unbecome");
        guard.unbecome().expect("second unbecome");
        assert_eq!(geteuid().as_raw(), euid);
    }

    #[test]
    fn become_again_to_current_uid_succeeds() {
        let euid = geteuid().as_raw();
        let mut guard = PrivilegeGuard::become_uid("test", euid).expect("become");
        guard.become_again(euid).expect("become again");
        assert_eq!(guard.current_uid(), euid);
    }

    #[test]
    fn escalation_without_privilege_fails_with_hint() {
        if geteuid().is_root() {
            return;
        }
        let err = PrivilegeGuard::become_uid("test", 0).expect_err("must fail unprivileged");
        assert!(err.to_string().contains("setuid"));
    }
}
