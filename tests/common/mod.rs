//! Fakes for the OS-facing traits, shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pgprefs::auth::{AuthDelegate, AuthError, AuthRequest, Credential, PrivilegeBroker, Rights, RIGHT_EXECUTE};
use pgprefs::controller::ServerController;
use pgprefs::launchd::{DaemonDescriptor, LaunchdError, LoadedUnit, Scope, ServiceManager};
use pgprefs::process::{CommandSpec, Privilege, ProcessInfo, ProcessRunner, RunError};
use pgprefs::server::User;
use pgprefs::store::MemoryServerStore;
use pgprefs::{ActionError, Config, Server, ServerAction, ServerDelegate, ServerSettings, Startup};

pub const FIRST_PID: u32 = 4242;

struct Unit {
    descriptor: DaemonDescriptor,
    pid: Option<u32>,
    last_exit_status: Option<i64>,
}

/// Shared state of the fake launchd and process table
pub struct FakeOs {
    units: Mutex<HashMap<(Scope, String), Unit>>,
    processes: Mutex<HashMap<u32, ProcessInfo>>,
    next_pid: AtomicU32,
    pub runner_calls: Mutex<Vec<String>>,
    pub service_calls: Mutex<Vec<String>>,
    /// How long a load takes
    pub load_delay: Mutex<Duration>,
    active_loads: AtomicUsize,
    pub max_active_loads: AtomicUsize,
    /// Loads that exit straight away instead of starting a process
    pub failing_loads: AtomicUsize,
    /// The next load reports an expired credential
    pub stale_next_load: AtomicBool,
}

impl FakeOs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            units: Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(FIRST_PID),
            runner_calls: Mutex::new(Vec::new()),
            service_calls: Mutex::new(Vec::new()),
            load_delay: Mutex::new(Duration::ZERO),
            active_loads: AtomicUsize::new(0),
            max_active_loads: AtomicUsize::new(0),
            failing_loads: AtomicUsize::new(0),
            stale_next_load: AtomicBool::new(false),
        })
    }

    /// A job loaded by someone else
    pub fn add_loaded_unit(&self, scope: Scope, descriptor: DaemonDescriptor) -> u32 {
        let pid = self.spawn(&descriptor);
        self.units.lock().unwrap().insert(
            (scope, descriptor.label.clone()),
            Unit {
                descriptor,
                pid: Some(pid),
                last_exit_status: None,
            },
        );
        pid
    }

    /// A process running outside launchd
    pub fn add_process(&self, user: &str, command: &str) -> u32 {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.processes.lock().unwrap().insert(
            pid,
            ProcessInfo {
                pid,
                ppid: 1,
                user: user.to_string(),
                command: command.to_string(),
            },
        );
        pid
    }

    pub fn is_loaded(&self, scope: Scope, label: &str) -> bool {
        self.units.lock().unwrap().contains_key(&(scope, label.to_string()))
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.processes.lock().unwrap().contains_key(&pid)
    }

    pub fn clear_calls(&self) {
        self.runner_calls.lock().unwrap().clear();
        self.service_calls.lock().unwrap().clear();
    }

    pub fn no_os_calls(&self) -> bool {
        self.runner_calls.lock().unwrap().is_empty() && self.service_calls.lock().unwrap().is_empty()
    }

    fn spawn(&self, descriptor: &DaemonDescriptor) -> u32 {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.processes.lock().unwrap().insert(
            pid,
            ProcessInfo {
                pid,
                ppid: 1,
                user: descriptor.user_name.clone().unwrap_or_default(),
                command: descriptor.program_arguments.join(" "),
            },
        );
        pid
    }
}

pub struct FakeServiceManager(pub Arc<FakeOs>);

impl FakeServiceManager {
    fn check_scope(scope: Scope, privilege: Privilege<'_>) -> Result<(), LaunchdError> {
        if scope == Scope::System && !privilege.is_root() {
            return Err(LaunchdError::Auth(AuthError::Insufficient));
        }
        Ok(())
    }

    fn record(&self, call: String) {
        self.0.service_calls.lock().unwrap().push(call);
    }
}

impl ServiceManager for FakeServiceManager {
    fn rights(&self) -> Rights {
        Rights::with_right(RIGHT_EXECUTE)
    }

    fn list_units(&self, pattern: &str, scope: Scope, privilege: Privilege<'_>) -> Result<Vec<String>, LaunchdError> {
        Self::check_scope(scope, privilege)?;
        self.record(format!("list {} {}", scope, pattern));
        let pattern = glob::Pattern::new(pattern).unwrap();
        Ok(self
            .0
            .units
            .lock()
            .unwrap()
            .keys()
            .filter(|(s, label)| *s == scope && pattern.matches(label))
            .map(|(_, label)| label.clone())
            .collect())
    }

    fn get_unit(&self, name: &str, scope: Scope, privilege: Privilege<'_>) -> Result<Option<LoadedUnit>, LaunchdError> {
        Self::check_scope(scope, privilege)?;
        self.record(format!("get {} {}", scope, name));
        Ok(self
            .0
            .units
            .lock()
            .unwrap()
            .get(&(scope, name.to_string()))
            .map(|unit| LoadedUnit {
                descriptor: unit.descriptor.clone(),
                pid: unit.pid,
                last_exit_status: unit.last_exit_status,
            }))
    }

    fn load_unit(&self, file: &Path, scope: Scope, privilege: Privilege<'_>) -> Result<(), LaunchdError> {
        Self::check_scope(scope, privilege)?;
        let os = &self.0;
        if os.stale_next_load.swap(false, Ordering::SeqCst) {
            return Err(LaunchdError::Run(RunError::Auth(AuthError::Stale)));
        }

        let active = os.active_loads.fetch_add(1, Ordering::SeqCst) + 1;
        os.max_active_loads.fetch_max(active, Ordering::SeqCst);
        let delay = *os.load_delay.lock().unwrap();
        std::thread::sleep(delay);
        os.active_loads.fetch_sub(1, Ordering::SeqCst);

        let descriptor = DaemonDescriptor::from_file(file).map_err(|e| LaunchdError::Descriptor {
            path: file.to_path_buf(),
            reason: e.to_string(),
        })?;
        self.record(format!("load {} {}", scope, descriptor.label));

        let failing = os
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let unit = if failing {
            Unit {
                descriptor,
                pid: None,
                last_exit_status: Some(1),
            }
        } else {
            let pid = os.spawn(&descriptor);
            Unit {
                descriptor,
                pid: Some(pid),
                last_exit_status: None,
            }
        };
        os.units.lock().unwrap().insert((scope, unit.descriptor.label.clone()), unit);
        Ok(())
    }

    fn unload_unit(&self, name: &str, scope: Scope, privilege: Privilege<'_>) -> Result<(), LaunchdError> {
        Self::check_scope(scope, privilege)?;
        if let Some(unit) = self.0.units.lock().unwrap().remove(&(scope, name.to_string())) {
            self.record(format!("unload {} {}", scope, name));
            if let Some(pid) = unit.pid {
                self.0.processes.lock().unwrap().remove(&pid);
            }
        }
        Ok(())
    }
}

/// Runs nothing, but acts out the file commands used for privileged writes
pub struct FakeRunner(pub Arc<FakeOs>);

impl ProcessRunner for FakeRunner {
    fn run(&self, command: &CommandSpec, _privilege: Privilege<'_>) -> Result<String, RunError> {
        self.0.runner_calls.lock().unwrap().push(command.to_string());
        if let CommandSpec::Executable { program, args } = command {
            match program.to_str() {
                Some("/usr/bin/install") if args.iter().any(|a| a == "-d") => {
                    std::fs::create_dir_all(args.last().unwrap()).unwrap();
                }
                Some("/usr/bin/install") => {
                    let n = args.len();
                    std::fs::copy(&args[n - 2], &args[n - 1]).unwrap();
                }
                Some("/bin/rm") => {
                    let _ = std::fs::remove_file(args.last().unwrap());
                }
                _ => {}
            }
        }
        Ok(String::new())
    }

    fn start(&self, command: &CommandSpec, _privilege: Privilege<'_>) -> Result<(), RunError> {
        self.0.runner_calls.lock().unwrap().push(command.to_string());
        Ok(())
    }

    fn list_processes(&self, pattern: &str) -> Result<Vec<ProcessInfo>, RunError> {
        self.0.runner_calls.lock().unwrap().push(format!("ps {}", pattern));
        let pattern = glob::Pattern::new(pattern).unwrap();
        Ok(self
            .0
            .processes
            .lock()
            .unwrap()
            .values()
            .filter(|p| pattern.matches(&p.command))
            .cloned()
            .collect())
    }

    fn process(&self, pid: u32) -> Result<Option<ProcessInfo>, RunError> {
        Ok(self.0.processes.lock().unwrap().get(&pid).cloned())
    }

    fn kill(&self, pid: u32, _privilege: Privilege<'_>) -> Result<(), RunError> {
        self.0.runner_calls.lock().unwrap().push(format!("kill {}", pid));
        self.0.processes.lock().unwrap().remove(&pid);
        Ok(())
    }
}

/// Grants or refuses every prompt, counting them
pub struct FakeAuth {
    pub prompts: AtomicUsize,
    pub grant: AtomicBool,
}

impl FakeAuth {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self {
            prompts: AtomicUsize::new(0),
            grant: AtomicBool::new(true),
        })
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

impl AuthDelegate for FakeAuth {
    fn authorize(&self, request: &AuthRequest<'_>) -> Result<Credential, AuthError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if self.grant.load(Ordering::SeqCst) {
            Ok(Credential::new(request.rights.clone()))
        } else {
            Err(AuthError::Cancelled)
        }
    }
}

/// Records every notification as a short string
#[derive(Default)]
pub struct RecordingDelegate {
    pub events: Mutex<Vec<String>>,
}

impl RecordingDelegate {
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl ServerDelegate for RecordingDelegate {
    fn did_change_status(&self, server: &Server) {
        self.push(format!("status {}", server.status()));
    }

    fn will_run_action(&self, _server: &Server, action: ServerAction) {
        self.push(format!("will {}", action));
    }

    fn did_run_action(&self, _server: &Server, action: ServerAction) {
        self.push(format!("did {}", action));
    }

    fn did_succeed_action(&self, _server: &Server, action: ServerAction) {
        self.push(format!("succeeded {}", action));
    }

    fn did_fail_action(&self, _server: &Server, action: ServerAction, _error: &ActionError) {
        self.push(format!("failed {}", action));
    }
}

/// A controller over fakes, with home and system root in temporary directories.
/// The current user is "postgres".
pub struct Fixture {
    pub home: tempfile::TempDir,
    pub root: tempfile::TempDir,
    pub os: Arc<FakeOs>,
    pub auth: Arc<FakeAuth>,
    pub store: Arc<MemoryServerStore>,
    pub delegate: Arc<RecordingDelegate>,
    pub controller: ServerController,
}

impl Fixture {
    pub fn new() -> Self {
        let home = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let mut config = Config::new(home.path(), User::with_identity("postgres", 501));
        config.system_root = root.path().to_path_buf();
        config.start_poll_attempts = 3;
        config.start_poll_interval = Duration::from_millis(10);
        config.stop_poll_attempts = 3;

        let os = FakeOs::new();
        let auth = FakeAuth::granting();
        let store = Arc::new(MemoryServerStore::new());
        let delegate = Arc::new(RecordingDelegate::default());
        let controller = ServerController::new(
            config,
            Arc::new(FakeRunner(os.clone())),
            Arc::new(FakeServiceManager(os.clone())),
            store.clone(),
            Arc::new(PrivilegeBroker::new(auth.clone())),
            delegate.clone(),
        );
        Self {
            home,
            root,
            os,
            auth,
            store,
            delegate,
            controller,
        }
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.home.path().join(format!("Library/Logs/PostgreSQL/{}.log", name))
    }

    pub fn settings(&self, name: &str, startup: Startup) -> ServerSettings {
        ServerSettings::new(
            "postgres",
            "/usr/local/bin",
            "/usr/local/pgsql/data",
            self.log_file(name).to_string_lossy(),
            "5432",
            startup,
        )
    }

    pub fn user_descriptor(&self, label: &str) -> PathBuf {
        self.home.path().join(format!("Library/LaunchAgents/{}.plist", label))
    }

    pub fn boot_descriptor(&self, label: &str) -> PathBuf {
        self.root.path().join(format!("Library/LaunchDaemons/{}.plist", label))
    }
}
