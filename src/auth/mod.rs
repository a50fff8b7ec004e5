//! Authentication strategies.
//!
//! A strategy owns the AuthenticationRequest / PasswordMessage exchange
//! after the startup frame and before session setup. On success it writes
//! AuthenticationOk and returns the authenticated user name; on failure the
//! connection handler sends an ErrorResponse with SQLSTATE 28P01 and closes
//! the socket.

// Standard library imports
use std::collections::HashMap;
use std::marker::Unpin;
use std::sync::Arc;

// External crate imports
use async_trait::async_trait;
use log::warn;
use tokio::io::{AsyncRead, AsyncWrite};

// Internal crate imports
use crate::constants::MD5_PASSWORD_PREFIX;
use crate::errors::Error;
use crate::messages::{
    auth_ok, md5_challenge, md5_hash_password, md5_hash_second_pass, plain_password_challenge,
    read_password, write_all_flush,
};

pub type ClientReader<'a> = dyn AsyncRead + Send + Unpin + 'a;
pub type ClientWriter<'a> = dyn AsyncWrite + Send + Unpin + 'a;

/// Polymorphic authentication capability. Implementations exchange
/// authentication messages over the given stream halves and return the user
/// name the connection runs as.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn authenticate(
        &self,
        read: &mut ClientReader<'_>,
        write: &mut ClientWriter<'_>,
        parameters: &HashMap<String, String>,
    ) -> Result<String, Error>;
}

/// The user name the client announced in its startup parameters.
fn startup_user(parameters: &HashMap<String, String>) -> Result<String, Error> {
    parameters
        .get("user")
        .cloned()
        .ok_or(Error::ClientBadStartup)
}

/// Convert a PasswordMessage payload into the password string, stripping
/// the trailing NUL.
fn password_string(mut raw: Vec<u8>) -> Result<String, Error> {
    if raw.last() == Some(&0) {
        raw.pop();
    }
    String::from_utf8(raw).map_err(|err| Error::AuthError(format!("Invalid password: {err}")))
}

/// No authentication: every connection is admitted as the startup user.
#[derive(Default)]
pub struct TrustAuth;

#[async_trait]
impl AuthStrategy for TrustAuth {
    async fn authenticate(
        &self,
        _read: &mut ClientReader<'_>,
        write: &mut ClientWriter<'_>,
        parameters: &HashMap<String, String>,
    ) -> Result<String, Error> {
        let user = startup_user(parameters)?;
        write_all_flush(write, &auth_ok()).await?;
        Ok(user)
    }
}

/// Clear-text password authentication against a host-supplied validator.
pub struct ClearTextAuth {
    validate: Arc<dyn Fn(&str, &str) -> bool + Send + Sync>,
}

impl ClearTextAuth {
    pub fn new<F>(validate: F) -> ClearTextAuth
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        ClearTextAuth {
            validate: Arc::new(validate),
        }
    }
}

#[async_trait]
impl AuthStrategy for ClearTextAuth {
    async fn authenticate(
        &self,
        read: &mut ClientReader<'_>,
        write: &mut ClientWriter<'_>,
        parameters: &HashMap<String, String>,
    ) -> Result<String, Error> {
        let user = startup_user(parameters)?;

        plain_password_challenge(write).await?;
        let password = password_string(read_password(read).await?)?;

        if !(self.validate)(&user, &password) {
            warn!("password authentication failed for user {user:?}");
            return Err(Error::AuthError(format!(
                "password authentication failed for user \"{user}\""
            )));
        }

        write_all_flush(write, &auth_ok()).await?;
        Ok(user)
    }
}

/// MD5 challenge-response authentication. The lookup returns the stored
/// credential for a user: either the clear-text password or an `md5`
/// prefixed hash as produced by `pg_authid`.
pub struct Md5Auth {
    lookup: Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl Md5Auth {
    pub fn new<F>(lookup: F) -> Md5Auth
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Md5Auth {
            lookup: Arc::new(lookup),
        }
    }
}

#[async_trait]
impl AuthStrategy for Md5Auth {
    async fn authenticate(
        &self,
        read: &mut ClientReader<'_>,
        write: &mut ClientWriter<'_>,
        parameters: &HashMap<String, String>,
    ) -> Result<String, Error> {
        let user = startup_user(parameters)?;

        let salt = md5_challenge(write).await?;
        let response = read_password(read).await?;

        let expected = match (self.lookup)(&user) {
            Some(stored) => match stored.strip_prefix(MD5_PASSWORD_PREFIX) {
                // Stored as md5<hex> the way pg_authid keeps it.
                Some(hash) => md5_hash_second_pass(hash, &salt),
                None => md5_hash_password(&user, &stored, &salt),
            },
            None => {
                warn!("password authentication failed for unknown user {user:?}");
                return Err(Error::AuthError(format!(
                    "password authentication failed for user \"{user}\""
                )));
            }
        };

        if expected != response {
            warn!("password authentication failed for user {user:?}");
            return Err(Error::AuthError(format!(
                "password authentication failed for user \"{user}\""
            )));
        }

        write_all_flush(write, &auth_ok()).await?;
        Ok(user)
    }
}
