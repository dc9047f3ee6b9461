//! Identity switching for sandboxed plugins.

use crate::error::SandboxError;
use nix::unistd::{chown, getegid, geteuid, setgid, setuid, User};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ROOT_USER: &str = "root";

/// Account a sandbox runs its plugin code as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Root,
    HostUser(String),
}

impl Identity {
    /// Root for plugins flagged `root`, otherwise the unprivileged host user.
    pub fn for_plugin(root: bool, host_user: &str) -> Self {
        if root {
            Identity::Root
        } else {
            Identity::HostUser(host_user.to_string())
        }
    }

    pub fn user_name(&self) -> &str {
        match self {
            Identity::Root => ROOT_USER,
            Identity::HostUser(name) => name,
        }
    }
}

pub trait Privileges: Send + Sync {
    /// Irreversibly switches the current process to `identity`.
    fn drop_to(&self, identity: &Identity) -> Result<(), SandboxError>;
}

/// Switches real and effective ids with `setgid`/`setuid`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPrivileges;

impl Privileges for SystemPrivileges {
    fn drop_to(&self, identity: &Identity) -> Result<(), SandboxError> {
        let user = lookup_user(identity.user_name())?;

        if geteuid() == user.uid {
            debug!(user = %user.name, gid = %getegid(), "Already running as target user");
            return Ok(());
        }

        // Group first; after setuid we may no longer be allowed to change it
        setgid(user.gid).map_err(|e| {
            SandboxError::Privilege(format!("setgid({}) failed: {}", user.gid, e))
        })?;
        setuid(user.uid).map_err(|e| {
            SandboxError::Privilege(format!("setuid({}) failed: {}", user.uid, e))
        })?;

        debug!(user = %user.name, uid = %user.uid, "Switched identity");
        Ok(())
    }
}

fn lookup_user(name: &str) -> Result<User, SandboxError> {
    User::from_name(name)
        .map_err(|e| SandboxError::Privilege(format!("lookup of user {name} failed: {e}")))?
        .ok_or_else(|| SandboxError::Privilege(format!("user {name} does not exist")))
}

/// Home directory of `user`, falling back to the current user's home.
pub fn home_dir_of(user: &str) -> PathBuf {
    User::from_name(user)
        .ok()
        .flatten()
        .map(|u| u.dir)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Creates `path` and, when running as root, hands it to `user`.
pub fn ensure_user_dir(path: &Path, user: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;

    if geteuid().is_root() {
        if let Some(owner) = User::from_name(user).ok().flatten() {
            chown(path, Some(owner.uid), Some(owner.gid)).map_err(std::io::Error::from)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_selection() {
        assert_eq!(Identity::for_plugin(true, "deck"), Identity::Root);
        assert_eq!(
            Identity::for_plugin(false, "deck"),
            Identity::HostUser("deck".to_string())
        );
        assert_eq!(Identity::Root.user_name(), "root");
    }

    #[test]
    fn test_unknown_user_is_rejected() {
        let identity = Identity::HostUser("no-such-user-for-plugin-tests".to_string());
        assert!(matches!(
            SystemPrivileges.drop_to(&identity),
            Err(SandboxError::Privilege(_))
        ));
    }

    #[test]
    fn test_drop_to_current_user_is_noop() {
        let Some(current) = User::from_uid(geteuid()).ok().flatten() else {
            return;
        };
        let identity = Identity::HostUser(current.name);
        assert!(SystemPrivileges.drop_to(&identity).is_ok());
    }

    #[test]
    fn test_ensure_user_dir_creates_nested() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("settings").join("demo");
        ensure_user_dir(&target, "root").unwrap();
        assert!(target.is_dir());
    }
}
