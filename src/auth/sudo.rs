//! Terminal authorization through sudo
//!
//! `sudo -v` refreshes the sudo timestamp, prompting on the controlling terminal
//! if needed. Privileged commands then run with `sudo -n`, which fails instead of
//! prompting once the timestamp has expired.

use std::process::{Command, Stdio};

use super::{AuthDelegate, AuthError, AuthRequest, Credential};

#[derive(Debug, Default)]
pub struct SudoAuthorizer;

impl SudoAuthorizer {
    pub fn new() -> Self {
        Self
    }
}

impl AuthDelegate for SudoAuthorizer {
    fn authorize(&self, request: &AuthRequest<'_>) -> Result<Credential, AuthError> {
        eprintln!("pgprefs needs administrator rights to {}", request.reason);
        let status = Command::new("sudo")
            .arg("-v")
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| AuthError::Failed(e.to_string()))?;

        if status.success() {
            return Ok(Credential::new(request.rights.clone()));
        }
        // Killed by a signal means the user interrupted the prompt
        match status.code() {
            None => Err(AuthError::Cancelled),
            Some(code) => Err(AuthError::Failed(format!("sudo exited with status {}", code))),
        }
    }

    fn deauthorize(&self) {
        if let Err(e) = Command::new("sudo").arg("-k").status() {
            log::debug!("sudo -k failed: {}", e);
        }
    }
}
