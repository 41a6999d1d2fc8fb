//! File access layer
//!
//! Filesystem checks and writes, either directly or through the process runner
//! as root. Writing a file for another owner always goes through the runner, so
//! the same credential covers files, processes and launchd.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::auth::AuthError;
use crate::process::{CommandSpec, Privilege, ProcessRunner, RunError};
use crate::server::User;

const INSTALL: &str = "/usr/bin/install";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    None,
    File,
    Dir,
}

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot encode {}: {reason}", .path.display())]
    Encode { path: PathBuf, reason: String },

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl FileError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn auth_error(&self) -> Option<&AuthError> {
        match self {
            Self::Auth(e) | Self::Run(RunError::Auth(e)) => Some(e),
            _ => None,
        }
    }
}

pub fn type_of(path: &Path) -> FileType {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => FileType::Dir,
        Ok(_) => FileType::File,
        Err(_) => FileType::None,
    }
}

/// Run `f` with a fresh temporary path ending in `.{extension}`.
///
/// The file is removed when `f` returns, whatever the outcome.
pub fn with_temporary_file<T, E, F>(extension: &str, f: F) -> Result<T, E>
where
    F: FnOnce(&Path) -> Result<T, E>,
    E: From<FileError>,
{
    let suffix = format!(".{}", extension.trim_start_matches('.'));
    let temp = tempfile::Builder::new()
        .prefix("pgprefs-")
        .suffix(&suffix)
        .tempfile()
        .map_err(|e| FileError::io(&std::env::temp_dir(), e))?;
    f(temp.path())
}

pub struct FileAccess {
    runner: Arc<dyn ProcessRunner>,
    current: User,
}

impl FileAccess {
    pub fn new(runner: Arc<dyn ProcessRunner>, current: User) -> Self {
        Self { runner, current }
    }

    pub fn current_user(&self) -> &User {
        &self.current
    }

    /// Writing as `owner` requires root
    pub fn needs_privilege(&self, owner: Option<&User>) -> bool {
        !self.current.is_root_user && owner.is_some_and(|o| o.name != self.current.name)
    }

    fn check_privilege(&self, owner: Option<&User>, privilege: Privilege<'_>) -> Result<(), FileError> {
        if self.needs_privilege(owner) && !privilege.is_root() {
            return Err(AuthError::Insufficient.into());
        }
        Ok(())
    }

    pub fn type_of(&self, path: &Path) -> FileType {
        type_of(path)
    }

    /// Existence check; with a root privilege, paths unreadable to the current
    /// user are checked through the runner.
    pub fn exists(&self, path: &Path, privilege: Privilege<'_>) -> Result<bool, FileError> {
        if path.exists() || !privilege.is_root() {
            return Ok(path.exists());
        }
        let test = CommandSpec::executable("/bin/test", ["-e".to_string(), path_arg(path)]);
        match self.runner.run(&test, privilege) {
            Ok(_) => Ok(true),
            Err(RunError::Failed { code: Some(1), .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `contents` to `path`, owned by `owner` (the current user if None
    /// and unprivileged, root if None and privileged).
    pub fn create_file(
        &self,
        path: &Path,
        contents: &[u8],
        owner: Option<&User>,
        privilege: Privilege<'_>,
    ) -> Result<(), FileError> {
        self.check_privilege(owner, privilege)?;
        if !privilege.is_root() {
            return write_atomic(path, contents);
        }

        with_temporary_file(extension(path), |temp| {
            fs::write(temp, contents).map_err(|e| FileError::io(temp, e))?;
            let mut args = vec!["-m".to_string(), "644".to_string()];
            if let Some(owner) = owner {
                args.extend(["-o".to_string(), owner.name.clone()]);
            }
            args.extend([path_arg(temp), path_arg(path)]);
            self.runner
                .run_quiet(&CommandSpec::executable(INSTALL, args), privilege)
                .map_err(FileError::from)
        })
    }

    pub fn create_plist_file<T: Serialize>(
        &self,
        path: &Path,
        value: &T,
        owner: Option<&User>,
        privilege: Privilege<'_>,
    ) -> Result<(), FileError> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, value).map_err(|e| FileError::Encode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        self.create_file(path, &buf, owner, privilege)
    }

    /// Remove a file or directory tree. Absent paths are not an error.
    pub fn remove(&self, path: &Path, privilege: Privilege<'_>) -> Result<(), FileError> {
        let kind = self.type_of(path);
        if kind == FileType::None {
            return Ok(());
        }
        log::debug!("Removing {}", path.display());
        if privilege.is_root() {
            let rm = CommandSpec::executable("/bin/rm", ["-rf".to_string(), path_arg(path)]);
            return Ok(self.runner.run_quiet(&rm, privilege)?);
        }
        let result = match kind {
            FileType::Dir => fs::remove_dir_all(path),
            _ => fs::remove_file(path),
        };
        result.map_err(|e| FileError::io(path, e))
    }

    /// Create `path` and any missing parents. Existing directories are left alone.
    pub fn create_dir(&self, path: &Path, owner: Option<&User>, privilege: Privilege<'_>) -> Result<(), FileError> {
        if self.type_of(path) == FileType::Dir {
            return Ok(());
        }
        self.check_privilege(owner, privilege)?;
        log::debug!("Creating directory {}", path.display());
        if !privilege.is_root() {
            return fs::create_dir_all(path).map_err(|e| FileError::io(path, e));
        }
        let mut args = vec!["-d".to_string(), "-m".to_string(), "755".to_string()];
        if let Some(owner) = owner {
            args.extend(["-o".to_string(), owner.name.clone()]);
        }
        args.push(path_arg(path));
        Ok(self.runner.run_quiet(&CommandSpec::executable(INSTALL, args), privilege)?)
    }

    pub fn move_path(&self, from: &Path, to: &Path, privilege: Privilege<'_>) -> Result<(), FileError> {
        if privilege.is_root() {
            let mv = CommandSpec::executable("/bin/mv", ["-f".to_string(), path_arg(from), path_arg(to)]);
            return Ok(self.runner.run_quiet(&mv, privilege)?);
        }
        fs::rename(from, to).map_err(|e| FileError::io(from, e))
    }

    /// Copy a file, handing it to `owner` when given
    pub fn copy_path(
        &self,
        from: &Path,
        to: &Path,
        owner: Option<&User>,
        privilege: Privilege<'_>,
    ) -> Result<(), FileError> {
        self.check_privilege(owner, privilege)?;
        if privilege.is_root() {
            let mut args = vec!["-m".to_string(), "644".to_string()];
            if let Some(owner) = owner {
                args.extend(["-o".to_string(), owner.name.clone()]);
            }
            args.extend([path_arg(from), path_arg(to)]);
            return Ok(self.runner.run_quiet(&CommandSpec::executable(INSTALL, args), privilege)?);
        }
        fs::copy(from, to).map(|_| ()).map_err(|e| FileError::io(from, e))
    }

    /// Make sure a log file exists for the server to append to
    pub fn touch(&self, path: &Path, owner: Option<&User>, privilege: Privilege<'_>) -> Result<(), FileError> {
        if self.type_of(path) == FileType::File {
            return Ok(());
        }
        self.create_file(path, b"", owner, privilege)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
}

/// Write through a temporary file in the same directory, then rename over `path`
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), FileError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| FileError::io(dir, e))?;
    temp.write_all(contents).map_err(|e| FileError::io(temp.path(), e))?;
    temp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o644))
        .map_err(|e| FileError::io(temp.path(), e))?;
    temp.persist(path).map_err(|e| FileError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, Rights};
    use crate::process::ProcessInfo;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<String>>,
        /// Every command exits with this code when set
        exit_code: Mutex<Option<i32>>,
    }

    impl ProcessRunner for RecordingRunner {
        fn run(&self, command: &CommandSpec, _privilege: Privilege<'_>) -> Result<String, RunError> {
            self.calls.lock().unwrap().push(command.to_string());
            match *self.exit_code.lock().unwrap() {
                Some(code) => Err(RunError::Failed {
                    command: command.to_string(),
                    code: Some(code),
                    stderr: String::new(),
                }),
                None => Ok(String::new()),
            }
        }

        fn start(&self, _command: &CommandSpec, _privilege: Privilege<'_>) -> Result<(), RunError> {
            Ok(())
        }

        fn list_processes(&self, _pattern: &str) -> Result<Vec<ProcessInfo>, RunError> {
            Ok(Vec::new())
        }

        fn process(&self, _pid: u32) -> Result<Option<ProcessInfo>, RunError> {
            Ok(None)
        }

        fn kill(&self, _pid: u32, _privilege: Privilege<'_>) -> Result<(), RunError> {
            Ok(())
        }
    }

    fn access() -> (FileAccess, Arc<RecordingRunner>) {
        let runner = Arc::new(RecordingRunner::default());
        (FileAccess::new(runner.clone(), User::with_identity("alice", 501)), runner)
    }

    #[test]
    fn test_type_of() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "x").unwrap();
        assert_eq!(type_of(dir.path()), FileType::Dir);
        assert_eq!(type_of(&file), FileType::File);
        assert_eq!(type_of(&dir.path().join("missing")), FileType::None);
    }

    #[test]
    fn test_create_file_and_dir_unprivileged() {
        let (files, runner) = access();
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        files.create_dir(&nested, None, Privilege::Unprivileged).unwrap();
        files.create_dir(&nested, None, Privilege::Unprivileged).unwrap();
        assert_eq!(files.type_of(&nested), FileType::Dir);

        let file = nested.join("x.plist");
        files
            .create_plist_file(&file, &vec!["a".to_string()], None, Privilege::Unprivileged)
            .unwrap();
        let text = fs::read_to_string(&file).unwrap();
        assert!(text.contains("<string>a</string>"));
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_absent_is_ok() {
        let (files, _) = access();
        let dir = tempfile::tempdir().unwrap();
        files
            .remove(&dir.path().join("missing"), Privilege::Unprivileged)
            .unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "x").unwrap();
        files.remove(&file, Privilege::Unprivileged).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn test_other_owner_needs_privilege() {
        let (files, _) = access();
        let postgres = User::with_identity("postgres", 502);
        let dir = tempfile::tempdir().unwrap();
        let err = files
            .create_file(&dir.path().join("f"), b"x", Some(&postgres), Privilege::Unprivileged)
            .unwrap_err();
        assert_eq!(err.auth_error(), Some(&AuthError::Insufficient));
    }

    #[test]
    fn test_privileged_write_goes_through_runner() {
        let (files, runner) = access();
        let postgres = User::with_identity("postgres", 502);
        let cred = Credential::new(Rights::new());
        files
            .create_file(
                Path::new("/Library/LaunchDaemons/x.plist"),
                b"<plist/>",
                Some(&postgres),
                Privilege::Root(&cred),
            )
            .unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("/usr/bin/install -m 644 -o postgres "));
        assert!(calls[0].ends_with(" /Library/LaunchDaemons/x.plist"));
    }

    #[test]
    fn test_exists() {
        let (files, runner) = access();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(files.exists(dir.path(), Privilege::Unprivileged).unwrap());
        assert!(!files.exists(&missing, Privilege::Unprivileged).unwrap());
        assert!(runner.calls.lock().unwrap().is_empty());

        // unreadable paths are asked about as root
        let cred = Credential::new(Rights::new());
        assert!(files.exists(&missing, Privilege::Root(&cred)).unwrap());
        *runner.exit_code.lock().unwrap() = Some(1);
        assert!(!files.exists(&missing, Privilege::Root(&cred)).unwrap());
        *runner.exit_code.lock().unwrap() = Some(2);
        files.exists(&missing, Privilege::Root(&cred)).unwrap_err();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], format!("/bin/test -e {}", missing.display()));
    }

    #[test]
    fn test_move_and_copy_unprivileged() {
        let (files, runner) = access();
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.log");
        let moved = dir.path().join("b.log");
        let copied = dir.path().join("c.log");
        fs::write(&from, "x").unwrap();

        files.move_path(&from, &moved, Privilege::Unprivileged).unwrap();
        assert!(!from.exists());
        files.copy_path(&moved, &copied, None, Privilege::Unprivileged).unwrap();
        assert_eq!(fs::read_to_string(&moved).unwrap(), "x");
        assert_eq!(fs::read_to_string(&copied).unwrap(), "x");
        assert!(runner.calls.lock().unwrap().is_empty());

        let err = files
            .move_path(&from, &moved, Privilege::Unprivileged)
            .unwrap_err();
        assert!(matches!(err, FileError::Io { .. }));
    }

    #[test]
    fn test_move_and_copy_privileged() {
        let (files, runner) = access();
        let postgres = User::with_identity("postgres", 502);
        let cred = Credential::new(Rights::new());
        let from = Path::new("/Library/Logs/PostgreSQL/a.log");
        let to = Path::new("/Library/Logs/PostgreSQL/b.log");

        let err = files
            .copy_path(from, to, Some(&postgres), Privilege::Unprivileged)
            .unwrap_err();
        assert_eq!(err.auth_error(), Some(&AuthError::Insufficient));

        files.move_path(from, to, Privilege::Root(&cred)).unwrap();
        files.copy_path(from, to, Some(&postgres), Privilege::Root(&cred)).unwrap();
        files.copy_path(from, to, None, Privilege::Root(&cred)).unwrap();
        assert_eq!(
            *runner.calls.lock().unwrap(),
            vec![
                "/bin/mv -f /Library/Logs/PostgreSQL/a.log /Library/Logs/PostgreSQL/b.log",
                "/usr/bin/install -m 644 -o postgres /Library/Logs/PostgreSQL/a.log /Library/Logs/PostgreSQL/b.log",
                "/usr/bin/install -m 644 /Library/Logs/PostgreSQL/a.log /Library/Logs/PostgreSQL/b.log",
            ]
        );
    }

    #[test]
    fn test_temporary_file_is_removed() {
        let mut seen = PathBuf::new();
        let result: Result<(), FileError> = with_temporary_file("plist", |path| {
            seen = path.to_path_buf();
            assert!(path.exists());
            assert_eq!(path.extension().and_then(|e| e.to_str()), Some("plist"));
            Err(FileError::Encode {
                path: path.to_path_buf(),
                reason: "early".into(),
            })
        });
        assert!(result.is_err());
        assert!(!seen.exists());
    }
}
