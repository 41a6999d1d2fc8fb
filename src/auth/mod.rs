//! Privilege broker
//!
//! Obtains an elevated credential from an `AuthDelegate` and caches it for the
//! session. The delegate does the prompting; the broker only decides when a prompt
//! is needed.
//!
//! `PrivilegeBroker::authorize` blocks the calling thread until the delegate
//! returns. Call it from a blocking worker (`spawn_blocking`), never from the
//! task that owns the server registry.

pub mod sudo;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Right needed to run commands as root
pub const RIGHT_EXECUTE: &str = "system.privilege.admin";

static NEXT_CREDENTIAL_ID: AtomicU64 = AtomicU64::new(1);

/// A set of named rights
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rights(BTreeSet<String>);

impl Rights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_right(name: impl Into<String>) -> Self {
        let mut rights = Self::new();
        rights.0.insert(name.into());
        rights
    }

    pub fn union(&self, other: &Rights) -> Rights {
        Rights(self.0.union(&other.0).cloned().collect())
    }

    /// True if every right in `required` is held
    pub fn contains_all(&self, required: &Rights) -> bool {
        required.0.is_subset(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Opaque proof of elevated privilege.
///
/// Only the broker keeps a credential between actions; everything else borrows
/// or clones it for the duration of one action.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    id: u64,
    rights: Rights,
}

impl Credential {
    /// Issued by an `AuthDelegate` once the user has authenticated
    pub fn new(rights: Rights) -> Self {
        Self {
            id: NEXT_CREDENTIAL_ID.fetch_add(1, Ordering::Relaxed),
            rights,
        }
    }

    pub fn rights(&self) -> &Rights {
        &self.rights
    }

    pub fn satisfies(&self, required: &Rights) -> bool {
        self.rights.contains_all(required)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Why a credential is wanted, passed through to whatever shows the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReason {
    pub action: String,
    pub target: String,
}

impl AuthReason {
    pub fn new(action: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for AuthReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.target)
    }
}

#[derive(Debug)]
pub struct AuthRequest<'a> {
    pub rights: &'a Rights,
    pub reason: &'a AuthReason,
}

/// Presents the authorization prompt. May block until the user responds.
pub trait AuthDelegate: Send + Sync {
    fn authorize(&self, request: &AuthRequest<'_>) -> Result<Credential, AuthError>;

    /// Called when the broker drops its credential
    fn deauthorize(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Authorization cancelled")]
    Cancelled,

    #[error("Authorization failed: {0}")]
    Failed(String),

    #[error("Authorization does not grant the required rights")]
    Insufficient,

    #[error("Authorization has expired")]
    Stale,
}

impl AuthError {
    /// The cached credential can no longer be trusted
    pub fn invalidates_credential(&self) -> bool {
        matches!(self, Self::Stale | Self::Insufficient)
    }
}

#[derive(Default)]
struct BrokerState {
    credential: Option<Credential>,
    /// A prompt was already shown this session
    asked: bool,
}

/// Caches at most one credential per session
pub struct PrivilegeBroker {
    delegate: Arc<dyn AuthDelegate>,
    state: Mutex<BrokerState>,
}

impl PrivilegeBroker {
    pub fn new(delegate: Arc<dyn AuthDelegate>) -> Self {
        Self {
            delegate,
            state: Mutex::new(BrokerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached credential if it grants `required`, otherwise prompt.
    ///
    /// The lock is held across the prompt so concurrent callers wait for one
    /// answer instead of stacking prompts.
    pub fn authorize(&self, required: &Rights, reason: &AuthReason) -> Result<Credential, AuthError> {
        let mut state = self.lock();
        if let Some(cred) = &state.credential {
            if cred.satisfies(required) {
                return Ok(cred.clone());
            }
        }

        // Ask for everything held so far plus the new rights
        let rights = match &state.credential {
            Some(cred) => cred.rights().union(required),
            None => required.clone(),
        };
        log::debug!("Requesting authorization to {}", reason);
        state.asked = true;
        let request = AuthRequest {
            rights: &rights,
            reason,
        };
        match self.delegate.authorize(&request) {
            Ok(cred) if cred.satisfies(required) => {
                log::info!("Authorized to {}", reason);
                state.credential = Some(cred.clone());
                Ok(cred)
            }
            Ok(_) => Err(AuthError::Insufficient),
            Err(e) => {
                log::info!("Authorization to {} not granted: {}", reason, e);
                Err(e)
            }
        }
    }

    /// Prompt at most once per session. Later calls only return the cache.
    pub fn ask_once(&self, required: &Rights, reason: &AuthReason) -> Option<Credential> {
        {
            let state = self.lock();
            if let Some(cred) = state.credential.as_ref().filter(|c| c.satisfies(required)) {
                return Some(cred.clone());
            }
            if state.asked {
                return None;
            }
        }
        self.authorize(required, reason).ok()
    }

    /// The cached credential, without prompting
    pub fn credential(&self) -> Option<Credential> {
        self.lock().credential.clone()
    }

    pub fn is_authorized(&self, required: &Rights) -> bool {
        self.lock()
            .credential
            .as_ref()
            .is_some_and(|c| c.satisfies(required))
    }

    /// Drop the cached credential if `cause` says it went stale
    pub fn invalidate(&self, cause: &AuthError) {
        if cause.invalidates_credential() {
            log::info!("Dropping credential: {}", cause);
            self.deauthorize();
        }
    }

    /// Drop the cached credential unconditionally; the next `authorize` prompts
    pub fn deauthorize(&self) {
        let had = self.lock().credential.take().is_some();
        if had {
            self.delegate.deauthorize();
        }
    }
}
