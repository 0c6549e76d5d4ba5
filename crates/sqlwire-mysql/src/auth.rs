//! Authentication plugins as explicit state machines.
//!
//! The session feeds every "more data" packet (0x01 marker stripped) to
//! [`AuthNegotiator::step`] and writes whatever it emits. An auth-switch
//! request restarts negotiation with [`AuthNegotiator::start`] and the new
//! nonce.
//!
//! | plugin | first response | follow-ups |
//! |---|---|---|
//! | `mysql_native_password` | SHA-1 scramble | none |
//! | `mysql_clear_password` | password + NUL | none |
//! | `mysql_old_password` | 3.23 scramble + NUL | none |
//! | `caching_sha2_password` | SHA-256 scramble | status `3` done; status `4` full auth |
//! | `sha256_password` | password, key request or RSA | PEM key, then RSA |

use sqlwire_core::Error;

use crate::crypto::{
    RsaPadding, scramble_caching_sha2, scramble_native, scramble_old, sha2_rsa_encrypt,
};
use crate::error::{plugin_not_configured, protocol_error};

/// Well-known plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
    pub const MYSQL_OLD_PASSWORD: &str = "mysql_old_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
}

/// Status bytes of the caching_sha2_password exchange.
pub mod caching_sha2 {
    /// Client asks for the server's public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// sha256_password key request byte.
const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

/// A supported authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthPlugin {
    Native,
    Clear,
    Old,
    CachingSha2,
    Sha256,
}

impl AuthPlugin {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            plugins::MYSQL_NATIVE_PASSWORD => Some(AuthPlugin::Native),
            plugins::MYSQL_CLEAR_PASSWORD => Some(AuthPlugin::Clear),
            plugins::MYSQL_OLD_PASSWORD => Some(AuthPlugin::Old),
            plugins::CACHING_SHA2_PASSWORD => Some(AuthPlugin::CachingSha2),
            plugins::SHA256_PASSWORD => Some(AuthPlugin::Sha256),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            AuthPlugin::Native => plugins::MYSQL_NATIVE_PASSWORD,
            AuthPlugin::Clear => plugins::MYSQL_CLEAR_PASSWORD,
            AuthPlugin::Old => plugins::MYSQL_OLD_PASSWORD,
            AuthPlugin::CachingSha2 => plugins::CACHING_SHA2_PASSWORD,
            AuthPlugin::Sha256 => plugins::SHA256_PASSWORD,
        }
    }

    /// Pick the mechanism for the handshake response. A client-forced
    /// plugin wins; an unknown server plugin falls back to native.
    pub fn for_handshake(forced: Option<AuthPlugin>, advertised: &str) -> AuthPlugin {
        if let Some(plugin) = forced {
            return plugin;
        }
        AuthPlugin::from_name(advertised).unwrap_or_else(|| {
            if !advertised.is_empty() {
                tracing::debug!(plugin = advertised, "unknown server auth plugin, using native");
            }
            AuthPlugin::Native
        })
    }

    /// Resolve the plugin named by an auth-switch request.
    pub fn for_switch(requested: &str) -> Result<AuthPlugin, Error> {
        AuthPlugin::from_name(requested).ok_or_else(|| plugin_not_configured(requested))
    }
}

impl std::fmt::Display for AuthPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where negotiation started. Some plugins answer an empty password
/// differently in the handshake response than after a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOrigin {
    Handshake,
    Switch,
}

/// Session data the negotiator reads and updates.
#[derive(Debug)]
pub struct AuthContext<'a> {
    pub password: &'a str,
    /// TLS or local socket: the password may travel as plain text.
    pub secure: bool,
    /// Server public key (PEM), configured or cached from an earlier exchange.
    pub server_key: &'a mut Option<Vec<u8>>,
    pub padding: RsaPadding,
}

/// What the session should do after feeding server bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send these bytes as the next frame.
    Emit(Vec<u8>),
    /// Nothing more to send; the server's OK or ERR follows.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CachingStage {
    AwaitingStatus,
    AwaitingKey,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sha256Stage {
    AwaitingKey,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Native, clear and old passwords are single-shot.
    SingleShot,
    CachingSha2(CachingStage),
    Sha256(Sha256Stage),
}

/// Per-connection negotiation state for one plugin and nonce.
#[derive(Debug, Clone)]
pub struct AuthNegotiator {
    plugin: AuthPlugin,
    nonce: Vec<u8>,
    state: State,
}

impl AuthNegotiator {
    /// Begin negotiating with `plugin`. Returns the negotiator and the bytes
    /// to send (as the handshake auth response or the auth-switch reply).
    pub fn start(
        plugin: AuthPlugin,
        nonce: &[u8],
        origin: AuthOrigin,
        ctx: &mut AuthContext<'_>,
    ) -> Result<(Self, Vec<u8>), Error> {
        let password = ctx.password;
        let (state, first) = match plugin {
            AuthPlugin::Native => (State::SingleShot, scramble_native(password, nonce)),
            AuthPlugin::Clear => (State::SingleShot, nul_terminated(password)),
            AuthPlugin::Old => {
                let mut out = scramble_old(password, nonce);
                out.push(0);
                (State::SingleShot, out)
            }
            AuthPlugin::CachingSha2 => (
                State::CachingSha2(CachingStage::AwaitingStatus),
                scramble_caching_sha2(password, nonce),
            ),
            AuthPlugin::Sha256 => {
                if ctx.secure {
                    (State::Sha256(Sha256Stage::Finished), nul_terminated(password))
                } else if password.is_empty() {
                    let out = match origin {
                        AuthOrigin::Handshake => vec![0],
                        AuthOrigin::Switch => Vec::new(),
                    };
                    (State::Sha256(Sha256Stage::Finished), out)
                } else if let Some(key) = ctx.server_key.as_deref() {
                    let out = sha2_rsa_encrypt(password, nonce, key, ctx.padding)?;
                    (State::Sha256(Sha256Stage::Finished), out)
                } else {
                    (
                        State::Sha256(Sha256Stage::AwaitingKey),
                        vec![SHA256_REQUEST_PUBLIC_KEY],
                    )
                }
            }
        };
        tracing::debug!(plugin = %plugin, ?origin, "auth negotiation started");
        let negotiator = Self {
            plugin,
            nonce: nonce.to_vec(),
            state,
        };
        Ok((negotiator, first))
    }

    pub fn plugin(&self) -> AuthPlugin {
        self.plugin
    }

    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Feed one "more data" payload from the server.
    pub fn step(&mut self, data: &[u8], ctx: &mut AuthContext<'_>) -> Result<AuthStep, Error> {
        match self.state {
            State::CachingSha2(CachingStage::AwaitingStatus) => {
                match data.first().copied() {
                    Some(caching_sha2::FAST_AUTH_SUCCESS) => {
                        tracing::debug!("caching_sha2 fast auth succeeded");
                        self.state = State::CachingSha2(CachingStage::Finished);
                        Ok(AuthStep::Done)
                    }
                    Some(caching_sha2::PERFORM_FULL_AUTH) => {
                        tracing::debug!(secure = ctx.secure, "caching_sha2 full auth");
                        if ctx.secure {
                            self.state = State::CachingSha2(CachingStage::Finished);
                            return Ok(AuthStep::Emit(nul_terminated(ctx.password)));
                        }
                        if let Some(key) = ctx.server_key.as_deref() {
                            let out = sha2_rsa_encrypt(ctx.password, &self.nonce, key, ctx.padding)?;
                            self.state = State::CachingSha2(CachingStage::Finished);
                            return Ok(AuthStep::Emit(out));
                        }
                        self.state = State::CachingSha2(CachingStage::AwaitingKey);
                        Ok(AuthStep::Emit(vec![caching_sha2::REQUEST_PUBLIC_KEY]))
                    }
                    other => Err(protocol_error(format!(
                        "Unknown caching_sha2_password status: {other:?}"
                    ))),
                }
            }
            State::CachingSha2(CachingStage::AwaitingKey) => {
                let out = self.encrypt_with_new_key(data, ctx)?;
                self.state = State::CachingSha2(CachingStage::Finished);
                Ok(AuthStep::Emit(out))
            }
            State::Sha256(Sha256Stage::AwaitingKey) => {
                let out = self.encrypt_with_new_key(data, ctx)?;
                self.state = State::Sha256(Sha256Stage::Finished);
                Ok(AuthStep::Emit(out))
            }
            State::SingleShot
            | State::CachingSha2(CachingStage::Finished)
            | State::Sha256(Sha256Stage::Finished) => Err(protocol_error(format!(
                "Unexpected auth data for {} ({} bytes)",
                self.plugin,
                data.len()
            ))),
        }
    }

    fn encrypt_with_new_key(
        &self,
        pem: &[u8],
        ctx: &mut AuthContext<'_>,
    ) -> Result<Vec<u8>, Error> {
        tracing::debug!(plugin = %self.plugin, len = pem.len(), "received server public key");
        let out = sha2_rsa_encrypt(ctx.password, &self.nonce, pem, ctx.padding)?;
        *ctx.server_key = Some(pem.to_vec());
        Ok(out)
    }
}

fn nul_terminated(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::{test_key, test_key_pem};
    use crate::crypto::xor_password;
    use rsa::Pkcs1v15Encrypt;

    const NONCE: &[u8; 20] = b"abcdefghijklmnopqrst";

    fn ctx<'a>(password: &'a str, secure: bool, key: &'a mut Option<Vec<u8>>) -> AuthContext<'a> {
        AuthContext {
            password,
            secure,
            server_key: key,
            padding: RsaPadding::Pkcs1v15,
        }
    }

    #[test]
    fn plugin_names_round_trip() {
        for plugin in [
            AuthPlugin::Native,
            AuthPlugin::Clear,
            AuthPlugin::Old,
            AuthPlugin::CachingSha2,
            AuthPlugin::Sha256,
        ] {
            assert_eq!(AuthPlugin::from_name(plugin.name()), Some(plugin));
        }
    }

    #[test]
    fn selection_rules() {
        assert_eq!(
            AuthPlugin::for_handshake(None, "caching_sha2_password"),
            AuthPlugin::CachingSha2
        );
        assert_eq!(AuthPlugin::for_handshake(None, "auth_gssapi"), AuthPlugin::Native);
        assert_eq!(
            AuthPlugin::for_handshake(Some(AuthPlugin::Clear), "caching_sha2_password"),
            AuthPlugin::Clear
        );
        let err = AuthPlugin::for_switch("auth_gssapi").unwrap_err();
        assert_eq!(err.vendor_code(), Some(2059));
    }

    #[test]
    fn native_is_single_shot() {
        let mut key = None;
        let mut c = ctx("secret", false, &mut key);
        let (mut neg, first) =
            AuthNegotiator::start(AuthPlugin::Native, NONCE, AuthOrigin::Handshake, &mut c).unwrap();
        assert_eq!(first, scramble_native("secret", NONCE));
        assert!(neg.step(&[1], &mut c).is_err());
    }

    #[test]
    fn clear_and_old_are_nul_terminated() {
        let mut key = None;
        let mut c = ctx("pw", false, &mut key);
        let (_, clear) =
            AuthNegotiator::start(AuthPlugin::Clear, NONCE, AuthOrigin::Switch, &mut c).unwrap();
        assert_eq!(clear, b"pw\0");
        let (_, old) =
            AuthNegotiator::start(AuthPlugin::Old, NONCE, AuthOrigin::Switch, &mut c).unwrap();
        assert_eq!(old.len(), 9);
        assert_eq!(old.last(), Some(&0));
    }

    #[test]
    fn caching_fast_path_finishes_without_more_bytes() {
        let mut key = None;
        let mut c = ctx("secret", false, &mut key);
        let (mut neg, first) =
            AuthNegotiator::start(AuthPlugin::CachingSha2, NONCE, AuthOrigin::Handshake, &mut c)
                .unwrap();
        assert_eq!(first, scramble_caching_sha2("secret", NONCE));
        assert_eq!(neg.step(&[3], &mut c).unwrap(), AuthStep::Done);
    }

    #[test]
    fn caching_full_auth_insecure_requests_key_then_encrypts() {
        let mut key = None;
        let mut c = ctx("secret", false, &mut key);
        let (mut neg, _) =
            AuthNegotiator::start(AuthPlugin::CachingSha2, NONCE, AuthOrigin::Handshake, &mut c)
                .unwrap();
        assert_eq!(neg.step(&[4], &mut c).unwrap(), AuthStep::Emit(vec![0x02]));

        let pem = test_key_pem();
        let AuthStep::Emit(ct) = neg.step(pem.as_bytes(), &mut c).unwrap() else {
            panic!("expected ciphertext");
        };
        assert_eq!(ct.len(), 128);
        let plain = test_key().decrypt(Pkcs1v15Encrypt, &ct).unwrap();
        assert_eq!(plain, xor_password("secret", NONCE));
        assert_eq!(key.as_deref(), Some(pem.as_bytes()));
    }

    #[test]
    fn caching_full_auth_uses_cached_key() {
        let mut key = Some(test_key_pem().into_bytes());
        let mut c = ctx("secret", false, &mut key);
        let (mut neg, _) =
            AuthNegotiator::start(AuthPlugin::CachingSha2, NONCE, AuthOrigin::Handshake, &mut c)
                .unwrap();
        let AuthStep::Emit(ct) = neg.step(&[4], &mut c).unwrap() else {
            panic!("expected ciphertext");
        };
        assert_eq!(ct.len(), 128);
    }

    #[test]
    fn caching_full_auth_secure_sends_plaintext() {
        let mut key = None;
        let mut c = ctx("secret", true, &mut key);
        let (mut neg, _) =
            AuthNegotiator::start(AuthPlugin::CachingSha2, NONCE, AuthOrigin::Handshake, &mut c)
                .unwrap();
        assert_eq!(neg.step(&[4], &mut c).unwrap(), AuthStep::Emit(b"secret\0".to_vec()));
    }

    #[test]
    fn caching_unknown_status_is_protocol_error() {
        let mut key = None;
        let mut c = ctx("secret", false, &mut key);
        let (mut neg, _) =
            AuthNegotiator::start(AuthPlugin::CachingSha2, NONCE, AuthOrigin::Handshake, &mut c)
                .unwrap();
        assert!(matches!(neg.step(&[9], &mut c), Err(Error::Protocol(_))));
    }

    #[test]
    fn sha256_flows() {
        let mut key = None;
        let mut c = ctx("secret", true, &mut key);
        let (_, first) =
            AuthNegotiator::start(AuthPlugin::Sha256, NONCE, AuthOrigin::Handshake, &mut c).unwrap();
        assert_eq!(first, b"secret\0");

        let mut c = ctx("", false, &mut key);
        let (_, first) =
            AuthNegotiator::start(AuthPlugin::Sha256, NONCE, AuthOrigin::Handshake, &mut c).unwrap();
        assert_eq!(first, vec![0]);
        let (_, first) =
            AuthNegotiator::start(AuthPlugin::Sha256, NONCE, AuthOrigin::Switch, &mut c).unwrap();
        assert!(first.is_empty());

        let mut c = ctx("secret", false, &mut key);
        let (mut neg, first) =
            AuthNegotiator::start(AuthPlugin::Sha256, NONCE, AuthOrigin::Switch, &mut c).unwrap();
        assert_eq!(first, vec![1]);
        let pem = test_key_pem();
        let AuthStep::Emit(ct) = neg.step(pem.as_bytes(), &mut c).unwrap() else {
            panic!("expected ciphertext");
        };
        assert_eq!(ct.len(), 128);
        assert!(key.is_some());
    }

    #[test]
    fn restart_uses_new_nonce() {
        let mut key = None;
        let mut c = ctx("secret", false, &mut key);
        let (first_neg, _) =
            AuthNegotiator::start(AuthPlugin::CachingSha2, NONCE, AuthOrigin::Handshake, &mut c)
                .unwrap();
        let other = b"ZYXWVUTSRQPONMLKJIHG";
        let (neg, reply) =
            AuthNegotiator::start(AuthPlugin::Native, other, AuthOrigin::Switch, &mut c).unwrap();
        assert_eq!(first_neg.plugin(), AuthPlugin::CachingSha2);
        assert_eq!(neg.nonce(), other);
        assert_eq!(reply, scramble_native("secret", other));
    }
}
