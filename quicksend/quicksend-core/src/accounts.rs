//! Named accounts with argon2 passwords and opaque session tokens.
//!
//! `users.json` maps a username to its password hash and `sessions.json` maps
//! a token to its username. An unknown username signs up on first use.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use crate::auth;
use crate::error::{Error, Result};
use crate::storage::JsonFile;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Session {
    pub token: String,
    pub username: String,
    pub registered: bool,
}

pub struct Accounts {
    users: JsonFile,
    sessions: JsonFile,
    lock: Mutex<()>,
}

impl Accounts {
    pub fn new(users_path: impl Into<PathBuf>, sessions_path: impl Into<PathBuf>) -> Self {
        Self {
            users: JsonFile::new(users_path),
            sessions: JsonFile::new(sessions_path),
            lock: Mutex::new(()),
        }
    }

    /// Log in, or register when the username is new. Returns a fresh session.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Session> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(Error::invalid("username and password are required"));
        }

        let _guard = self.lock.lock();
        let mut users: BTreeMap<String, String> = self.users.load();
        let registered = match users.get(username) {
            Some(hash) => {
                if !auth::verify_password(hash, password) {
                    return Err(Error::forbidden("wrong username or password"));
                }
                false
            }
            None => {
                users.insert(username.to_string(), auth::hash_password(password)?);
                self.persist(&self.users, &users)?;
                info!(user = %username, "account registered");
                true
            }
        };

        let token = Uuid::new_v4().to_string();
        let mut sessions: BTreeMap<String, String> = self.sessions.load();
        sessions.insert(token.clone(), username.to_string());
        self.persist(&self.sessions, &sessions)?;

        Ok(Session {
            token,
            username: username.to_string(),
            registered,
        })
    }

    /// End a session. Unknown tokens are ignored.
    pub fn logout(&self, token: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut sessions: BTreeMap<String, String> = self.sessions.load();
        if sessions.remove(token).is_some() {
            self.persist(&self.sessions, &sessions)?;
        }
        Ok(())
    }

    pub fn whoami(&self, token: &str) -> Result<String> {
        let sessions: BTreeMap<String, String> = self.sessions.load();
        sessions
            .get(token)
            .cloned()
            .ok_or_else(|| Error::forbidden("invalid session"))
    }

    fn persist(&self, file: &JsonFile, value: &BTreeMap<String, String>) -> Result<()> {
        if file.save(value) {
            Ok(())
        } else {
            Err(Error::StorageFailure(format!(
                "could not write {}",
                file.path().display()
            )))
        }
    }
}
