//! Drop root privileges after the privileged startup steps (binding a
//! Modbus TCP port below 1024) have completed.

use nix::unistd::{initgroups, setgid, setuid, Gid, Group, Uid, User};
use std::ffi::CString;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrivilegeError {
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("unknown group '{0}'")]
    UnknownGroup(String),
    #[error("privilege drop failed: {0}")]
    Sys(#[from] nix::Error),
}

pub fn is_root() -> bool {
    Uid::effective().is_root()
}

/// Switch to the given user (and group; the user's primary group when none
/// is given). Order matters: groups first, then the uid.
pub fn drop(user: &str, group: Option<&str>) -> Result<(), PrivilegeError> {
    let user_entry = User::from_name(user)?
        .ok_or_else(|| PrivilegeError::UnknownUser(user.to_string()))?;

    let gid: Gid = match group {
        Some(name) => Group::from_name(name)?
            .ok_or_else(|| PrivilegeError::UnknownGroup(name.to_string()))?
            .gid,
        None => user_entry.gid,
    };

    setgid(gid)?;
    let c_user =
        CString::new(user).map_err(|_| PrivilegeError::UnknownUser(user.to_string()))?;
    initgroups(&c_user, gid)?;
    setuid(user_entry.uid)?;

    Ok(())
}

pub fn current_user() -> String {
    User::from_uid(Uid::effective())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| Uid::effective().to_string())
}

pub fn current_group() -> String {
    Group::from_gid(Gid::effective())
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| Gid::effective().to_string())
}
