//! HTTP Basic auth credential check and the per-address tarpit
//! (spec.md §4.8).
//!
//! Grounded on `examples/original_source/targetd/utils.py`'s `Pit`/
//! `Tar` context-manager pair, redesigned per spec.md §9's
//! "context-manager `vgopen` → scoped acquisition" note into an RAII
//! guard: flagging an address returns a guard whose `Drop` clears the
//! flag on every exit path, so a panicking handler (or one that
//! returns early) can never leave an address permanently locked out.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;

use base64::Engine;

use crate::config::Config;

/// Tracks addresses currently serving out their post-bad-auth sleep.
/// While an address is flagged, any further request from it is
/// rejected immediately with 503 — credentials are not even examined.
#[derive(Default)]
pub struct Tarpit {
    flagged: Mutex<HashSet<IpAddr>>,
}

/// Clears the held address's flag when dropped, regardless of how the
/// scope that created it exits.
pub struct TarpitGuard<'a> {
    tarpit: &'a Tarpit,
    addr: IpAddr,
}

impl Drop for TarpitGuard<'_> {
    fn drop(&mut self) {
        self.tarpit.flagged.lock().expect("tarpit mutex poisoned").remove(&self.addr);
    }
}

impl Tarpit {
    /// True if `addr` is currently flagged (serving a prior failed
    /// auth's lockout window). Does not itself flag or clear anything.
    pub fn is_locked(&self, addr: IpAddr) -> bool {
        self.flagged.lock().expect("tarpit mutex poisoned").contains(&addr)
    }

    /// Flags `addr` and returns a guard that clears it on drop. The
    /// caller is expected to hold the guard across the 2-second sleep
    /// mandated by spec.md §4.8.
    pub fn flag(&self, addr: IpAddr) -> TarpitGuard<'_> {
        self.flagged.lock().expect("tarpit mutex poisoned").insert(addr);
        TarpitGuard { tarpit: self, addr }
    }
}

/// Decodes an `Authorization: Basic <base64>` header value and checks
/// it against the configured user/password. Returns `false` for a
/// missing header, malformed base64/UTF-8, missing `:` separator, or a
/// mismatched pair — the caller does not need to distinguish these.
pub fn check_credentials(config: &Config, header_value: Option<&str>) -> bool {
    let Some(header_value) = header_value else {
        return false;
    };
    let Some(encoded) = header_value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };
    let Some(expected_pass) = config.password.as_deref() else {
        return false;
    };
    user == config.user && pass == expected_pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn config_with(user: &str, pass: &str) -> Config {
        let mut c = Config::default();
        c.user = user.to_string();
        c.password = Some(pass.to_string());
        c
    }

    fn basic(user: &str, pass: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
        )
    }

    #[test]
    fn accepts_matching_credentials() {
        let config = config_with("admin", "hunter2");
        assert!(check_credentials(&config, Some(&basic("admin", "hunter2"))));
    }

    #[test]
    fn rejects_wrong_password() {
        let config = config_with("admin", "hunter2");
        assert!(!check_credentials(&config, Some(&basic("admin", "nope"))));
    }

    #[test]
    fn rejects_missing_header() {
        let config = config_with("admin", "hunter2");
        assert!(!check_credentials(&config, None));
    }

    #[test]
    fn rejects_malformed_header() {
        let config = config_with("admin", "hunter2");
        assert!(!check_credentials(&config, Some("Basic not-base64!!")));
        assert!(!check_credentials(&config, Some("Bearer sometoken")));
    }

    #[test]
    fn tarpit_locks_and_clears_on_guard_drop() {
        let tarpit = Tarpit::default();
        let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        assert!(!tarpit.is_locked(addr));
        {
            let _guard = tarpit.flag(addr);
            assert!(tarpit.is_locked(addr));
        }
        assert!(!tarpit.is_locked(addr));
    }
}
