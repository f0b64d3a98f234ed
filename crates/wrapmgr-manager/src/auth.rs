//! Account credential check performed before an instance joins the pool.

use async_trait::async_trait;

use crate::error::AuthError;

/// Credentials presented for one account.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub two_factor_code: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            two_factor_code: None,
        }
    }

    pub fn with_two_factor_code(mut self, code: impl Into<String>) -> Self {
        self.two_factor_code = Some(code.into());
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("two_factor_code", &self.two_factor_code.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Decides whether an account may be brought online.
///
/// Returning [`AuthError::TwoFactorRequired`] asks the caller to collect a
/// one-time code and try again with it set.
#[async_trait]
pub trait AccountAuthenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), AuthError>;
}

/// Leaves credential handling to the worker, which is provisioned with the
/// account before the manager sees it.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerManagedAuth;

#[async_trait]
impl AccountAuthenticator for WorkerManagedAuth {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<(), AuthError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_managed_auth_accepts() {
        let auth = WorkerManagedAuth;
        assert!(auth
            .authenticate(&Credentials::new("alice", "secret"))
            .await
            .is_ok());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new("alice", "hunter2").with_two_factor_code("123456");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("123456"));
    }
}
