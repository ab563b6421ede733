//! Privilege, ownership and password checks.
//!
//! A caller is privileged when its connection comes from this machine, either
//! over loopback or from the host's own LAN address. Privileged callers skip
//! ownership checks; everyone else may only change what they uploaded.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::RngCore;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metadata::{FileEntry, TextEntry};

/// Reports the host's current LAN address.
///
/// Asked again on every check so interface changes are picked up.
pub trait LocalAddress: Send + Sync {
    fn current(&self) -> Option<IpAddr>;
}

impl<F> LocalAddress for F
where
    F: Fn() -> Option<IpAddr> + Send + Sync,
{
    fn current(&self) -> Option<IpAddr> {
        self()
    }
}

#[derive(Clone)]
pub struct AccessGate {
    local: Arc<dyn LocalAddress>,
}

impl AccessGate {
    pub fn new(local: Arc<dyn LocalAddress>) -> Self {
        Self { local }
    }

    /// A gate that only trusts loopback connections.
    pub fn loopback_only() -> Self {
        Self::new(Arc::new(|| None::<IpAddr>))
    }

    pub fn is_privileged(&self, origin: IpAddr) -> bool {
        let origin = canonical(origin);
        if origin.is_loopback() {
            return true;
        }
        match self.local.current() {
            Some(local) => canonical(local) == origin,
            None => {
                debug!(%origin, "local address unknown, treating caller as remote");
                false
            }
        }
    }

    pub fn caller(&self, origin: IpAddr, identity: Identity) -> Caller {
        Caller {
            privileged: self.is_privileged(origin),
            identity,
        }
    }
}

fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Who the caller claims to be. Blank values count as absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub id: Option<String>,
    pub name: Option<String>,
}

impl Identity {
    pub fn new(id: Option<&str>, name: Option<&str>) -> Self {
        let clean = |v: Option<&str>| {
            v.map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            id: clean(id),
            name: clean(name),
        }
    }

    pub fn named(name: &str) -> Self {
        Self::new(None, Some(name))
    }
}

/// Something with a recorded uploader.
pub trait Owned {
    fn owner_id(&self) -> Option<&str>;
    fn owner_name(&self) -> &str;
}

impl Owned for FileEntry {
    fn owner_id(&self) -> Option<&str> {
        None
    }

    fn owner_name(&self) -> &str {
        &self.uploader
    }
}

impl Owned for TextEntry {
    fn owner_id(&self) -> Option<&str> {
        self.uploader_id.as_deref()
    }

    fn owner_name(&self) -> &str {
        &self.uploader
    }
}

/// Whether `claim` may act as the owner of `entry`.
///
/// A recorded id decides on its own; otherwise the display names must match.
/// An entry with no owner recorded accepts any claim.
pub fn check_ownership(entry: &impl Owned, claim: &Identity) -> bool {
    if let Some(owner_id) = entry.owner_id().filter(|id| !id.is_empty()) {
        return claim.id.as_deref() == Some(owner_id);
    }
    let owner_name = entry.owner_name();
    if owner_name.is_empty() {
        return true;
    }
    claim.name.as_deref() == Some(owner_name)
}

#[derive(Clone, Debug, Default)]
pub struct Caller {
    pub privileged: bool,
    pub identity: Identity,
}

impl Caller {
    pub fn local() -> Self {
        Self {
            privileged: true,
            identity: Identity::default(),
        }
    }

    pub fn remote(identity: Identity) -> Self {
        Self {
            privileged: false,
            identity,
        }
    }

    pub fn require_privileged(&self) -> Result<()> {
        if self.privileged {
            Ok(())
        } else {
            Err(Error::forbidden("only the host may do this"))
        }
    }

    /// Fail unless this caller is privileged or owns `entry`.
    pub fn authorize(&self, entry: &impl Owned, what: &str) -> Result<()> {
        if self.privileged || check_ownership(entry, &self.identity) {
            Ok(())
        } else {
            Err(Error::forbidden(format!("{what} belongs to someone else")))
        }
    }
}

pub fn hash_password(plain: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| Error::invalid(format!("cannot build salt: {e}")))?;
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::invalid(format!("cannot hash password: {e}")))
}

/// An unparsable stored hash never verifies.
pub fn verify_password(hash: &str, plain: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!(error = %e, "stored password hash is unreadable");
            false
        }
    }
}

/// Password gate for reads. No stored hash means no password is needed.
pub fn check_password(hash: Option<&str>, supplied: Option<&str>) -> bool {
    match hash.filter(|h| !h.is_empty()) {
        None => true,
        Some(hash) => supplied.map_or(false, |plain| verify_password(hash, plain)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn lan_gate(addr: &'static str) -> AccessGate {
        AccessGate::new(Arc::new(move || addr.parse::<IpAddr>().ok()))
    }

    fn text(uploader: &str, uploader_id: Option<&str>) -> TextEntry {
        TextEntry {
            uploader: uploader.into(),
            uploader_id: uploader_id.map(str::to_string),
            ..TextEntry::default()
        }
    }

    #[test]
    fn loopback_and_own_address_are_privileged() {
        let gate = lan_gate("192.168.1.10");
        assert!(gate.is_privileged(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(gate.is_privileged(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(gate.is_privileged("192.168.1.10".parse().unwrap()));
        assert!(gate.is_privileged("::ffff:192.168.1.10".parse().unwrap()));
        assert!(!gate.is_privileged("192.168.1.11".parse().unwrap()));
    }

    #[test]
    fn unknown_local_address_fails_closed() {
        let gate = AccessGate::loopback_only();
        assert!(!gate.is_privileged("192.168.1.10".parse().unwrap()));
        assert!(gate.is_privileged("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn unowned_entries_accept_any_claim() {
        let entry = text("", None);
        assert!(check_ownership(&entry, &Identity::default()));
        assert!(check_ownership(&entry, &Identity::new(Some("x"), Some("eve"))));
    }

    #[test]
    fn recorded_id_takes_precedence_over_name() {
        let entry = text("amy", Some("id-1"));
        assert!(check_ownership(&entry, &Identity::new(Some("id-1"), Some("bob"))));
        assert!(!check_ownership(&entry, &Identity::new(Some("id-2"), Some("amy"))));
        assert!(!check_ownership(&entry, &Identity::named("amy")));
    }

    #[test]
    fn name_is_compared_without_id() {
        let entry = FileEntry::new("amy");
        assert!(check_ownership(&entry, &Identity::named("amy")));
        assert!(!check_ownership(&entry, &Identity::named("bob")));
        assert!(!check_ownership(&entry, &Identity::new(None, Some("  "))));
    }

    #[test]
    fn privileged_caller_bypasses_ownership() {
        let entry = FileEntry::new("amy");
        assert!(Caller::local().authorize(&entry, "file").is_ok());
        let err = Caller::remote(Identity::named("bob"))
            .authorize(&entry, "file")
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
        assert!(Caller::remote(Identity::default()).require_privileged().is_err());
    }

    #[test]
    fn passwords_hash_and_verify() {
        let hash = hash_password("s3cret").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password(&hash, "s3cret"));
        assert!(!verify_password(&hash, "guess"));
        assert!(!verify_password("pbkdf2:sha256:legacy$salt$abc", "s3cret"));

        assert!(check_password(None, None));
        assert!(check_password(Some(""), None));
        assert!(!check_password(Some(&hash), None));
        assert!(check_password(Some(&hash), Some("s3cret")));
    }
}
