//! OS account lookup

use nix::unistd::{self, Uid};

/// An OS account, relative to the real user of this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub uid: u32,
    /// The superuser account
    pub is_root_user: bool,
    /// Not the account this process runs as
    pub is_other_user: bool,
}

impl User {
    /// The real user of this process
    pub fn current() -> Option<User> {
        let uid = unistd::getuid();
        let entry = unistd::User::from_uid(uid).ok().flatten()?;
        Some(Self::from_entry(entry, uid.as_raw()))
    }

    /// The superuser, whether or not a passwd entry is readable
    pub fn root(current: &User) -> User {
        User {
            name: "root".to_string(),
            uid: 0,
            is_root_user: true,
            is_other_user: current.uid != 0,
        }
    }

    /// Look up an account by name, relative to `current`
    pub fn from_name(name: &str, current: &User) -> Option<User> {
        if name == current.name {
            return Some(current.clone());
        }
        let entry = unistd::User::from_name(name).ok().flatten()?;
        Some(Self::from_entry(entry, current.uid))
    }

    /// Build an account without consulting the passwd database
    pub fn with_identity(name: impl Into<String>, uid: u32) -> User {
        User {
            name: name.into(),
            uid,
            is_root_user: uid == 0,
            is_other_user: false,
        }
    }

    fn from_entry(entry: unistd::User, current_uid: u32) -> User {
        let uid = entry.uid.as_raw();
        User {
            name: entry.name,
            uid,
            is_root_user: Uid::from_raw(uid).is_root(),
            is_other_user: uid != current_uid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_identity() {
        let user = User::with_identity("postgres", 501);
        assert_eq!(user.name, "postgres");
        assert!(!user.is_root_user);
        assert!(!user.is_other_user);
    }

    #[test]
    fn test_root_relative_to_current() {
        let current = User::with_identity("alice", 501);
        let root = User::root(&current);
        assert!(root.is_root_user);
        assert!(root.is_other_user);

        let as_root = User::with_identity("root", 0);
        assert!(!User::root(&as_root).is_other_user);
    }

    #[test]
    fn test_from_name_matches_current() {
        let current = User::with_identity("not-in-passwd-xyz", 4242);
        let found = User::from_name("not-in-passwd-xyz", &current).unwrap();
        assert_eq!(found, current);
    }

    #[test]
    fn test_from_name_unknown() {
        let current = User::with_identity("alice", 501);
        assert!(User::from_name("no-such-account-pgprefs-test", &current).is_none());
    }
}
