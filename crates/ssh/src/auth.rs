//! SSH user authentication (RFC 4252).
//!
//! [`AuthDriver`] runs the client side of the protocol:
//!
//! 1. `ssh-userauth` service request
//! 2. A `none` attempt, only to learn which methods the server accepts
//! 3. The client's preferred methods, in order, skipping any the server does
//!    not list or that have no registered handler
//!
//! A partial success replaces the server's method list and restarts from
//! the first preferred method. This is how multi-factor logins (e.g.
//! `publickey` then `password`, or two public keys) complete. At most
//! [`MAX_AUTH_ATTEMPTS`] method attempts are made per login.
//!
//! Method handlers implement [`AuthMethodHandler`]. Bundled handlers:
//! [`PasswordAuth`] and [`PublicKeyAuth`] (Ed25519 identities).

use crate::known_hosts::UserInfo;
use crate::message::{MessageType, USERAUTH_PASSWD_CHANGEREQ};
use crate::wire::{Reader, SshBufMut};
use async_trait::async_trait;
use bytes::BufMut;
use ed25519_dalek::{Signer, SigningKey};
use fynx_platform::{FynxError, FynxResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Service requested before authentication.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";
/// Service started once authenticated.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// Default client preference order.
pub const DEFAULT_PREFERRED_AUTHENTICATIONS: &str =
    "gssapi-with-mic,publickey,keyboard-interactive,password";

/// Upper bound on method attempts in one login.
pub const MAX_AUTH_ATTEMPTS: usize = 32;

/// Packet access for authentication.
#[async_trait]
pub trait AuthTransport: Send {
    /// Sends one payload.
    async fn send(&mut self, payload: &[u8]) -> FynxResult<()>;

    /// Receives the next payload. Transport chatter (IGNORE, DEBUG) is
    /// already filtered out.
    async fn recv(&mut self) -> FynxResult<Vec<u8>>;
}

/// What a handler needs besides the transport.
pub struct AuthContext<'a> {
    /// User name to log in as.
    pub user: &'a str,
    /// Session identifier, signed by public key methods.
    pub session_id: &'a [u8],
    /// Prompts and banner display.
    pub user_info: Option<&'a dyn UserInfo>,
}

impl AuthContext<'_> {
    /// Receives the next message, showing any banners on the way.
    pub async fn recv(&self, transport: &mut dyn AuthTransport) -> FynxResult<Vec<u8>> {
        loop {
            let payload = transport.recv().await?;
            if payload.first() == Some(&(MessageType::UserauthBanner as u8)) {
                let mut r = Reader::new(&payload[1..]);
                let message = r.utf8()?;
                debug!("Received authentication banner");
                if let Some(ui) = self.user_info {
                    ui.show_message(&message);
                }
                continue;
            }
            return Ok(payload);
        }
    }
}

/// Result of one method attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Logged in.
    Success,
    /// Rejected; carries the methods that can continue.
    Failure(Vec<String>),
    /// Accepted, more methods required.
    Partial(Vec<String>),
    /// The user declined to provide credentials.
    Cancelled,
}

/// One authentication method, client side.
#[async_trait]
pub trait AuthMethodHandler: Send + Sync {
    /// Method name as used on the wire.
    fn name(&self) -> &str;

    /// Runs the method to completion.
    async fn authenticate(
        &self,
        ctx: &AuthContext<'_>,
        transport: &mut dyn AuthTransport,
    ) -> FynxResult<AuthOutcome>;
}

/// Start of a `SSH_MSG_USERAUTH_REQUEST` for `method`.
pub fn userauth_request(user: &str, method: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + user.len());
    buf.put_u8(MessageType::UserauthRequest as u8);
    buf.put_string(user.as_bytes());
    buf.put_string(CONNECTION_SERVICE.as_bytes());
    buf.put_string(method.as_bytes());
    buf
}

/// Classifies a SUCCESS or FAILURE reply.
pub fn parse_auth_reply(payload: &[u8]) -> FynxResult<AuthOutcome> {
    let mut r = Reader::new(payload);
    match r.u8()? {
        m if m == MessageType::UserauthSuccess as u8 => Ok(AuthOutcome::Success),
        m if m == MessageType::UserauthFailure as u8 => {
            let methods = r
                .name_list()?
                .into_iter()
                .map(|m| m.to_ascii_lowercase())
                .collect();
            if r.bool()? {
                Ok(AuthOutcome::Partial(methods))
            } else {
                Ok(AuthOutcome::Failure(methods))
            }
        }
        m => Err(FynxError::Protocol(format!(
            "Unexpected message {} during authentication",
            m
        ))),
    }
}

/// Drives authentication over a set of method handlers.
#[derive(Clone)]
pub struct AuthDriver {
    preferred: Vec<String>,
    handlers: HashMap<String, Arc<dyn AuthMethodHandler>>,
}

impl AuthDriver {
    /// Driver trying `preferred` methods in order.
    pub fn new(preferred: Vec<String>) -> Self {
        Self {
            preferred,
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler under its method name.
    pub fn register(&mut self, handler: Arc<dyn AuthMethodHandler>) -> &mut Self {
        self.handlers.insert(handler.name().to_string(), handler);
        self
    }

    /// True when a handler exists for `method`.
    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Runs the whole exchange. Returns the method that completed the login.
    pub async fn run(
        &self,
        ctx: &AuthContext<'_>,
        transport: &mut dyn AuthTransport,
    ) -> FynxResult<String> {
        let mut request = Vec::with_capacity(20);
        request.put_u8(MessageType::ServiceRequest as u8);
        request.put_string(USERAUTH_SERVICE.as_bytes());
        transport.send(&request).await?;

        let reply = ctx.recv(transport).await?;
        if reply.first() != Some(&(MessageType::ServiceAccept as u8)) {
            return Err(FynxError::Protocol(format!(
                "Expected SERVICE_ACCEPT, got {:?}",
                reply.first()
            )));
        }

        transport.send(&userauth_request(ctx.user, "none")).await?;
        let mut server_methods = match parse_auth_reply(&ctx.recv(transport).await?)? {
            AuthOutcome::Success => {
                info!(user = %ctx.user, "Authenticated with method none");
                return Ok("none".to_string());
            }
            AuthOutcome::Failure(methods) | AuthOutcome::Partial(methods) => methods,
            AuthOutcome::Cancelled => self.preferred.clone(),
        };
        debug!(methods = %server_methods.join(","), "Server authentication methods");

        let mut cancelled = false;
        let mut attempts = 0;
        let mut index = 0;
        while index < self.preferred.len() {
            let method = &self.preferred[index];
            index += 1;

            if !server_methods.iter().any(|m| m == method) {
                continue;
            }
            let Some(handler) = self.handlers.get(method) else {
                debug!(method = %method, "No handler for authentication method");
                continue;
            };

            if attempts == MAX_AUTH_ATTEMPTS {
                debug!(attempts, "Authentication attempt limit reached");
                break;
            }
            attempts += 1;

            debug!(method = %method, "Trying authentication method");
            cancelled = false;
            match handler.authenticate(ctx, transport).await? {
                AuthOutcome::Success => {
                    info!(user = %ctx.user, method = %method, "Authentication succeeded");
                    return Ok(method.clone());
                }
                AuthOutcome::Cancelled => {
                    debug!(method = %method, "Authentication cancelled");
                    cancelled = true;
                }
                AuthOutcome::Partial(methods) => {
                    debug!(
                        method = %method,
                        methods = %methods.join(","),
                        "Partial authentication success"
                    );
                    server_methods = methods;
                    index = 0;
                }
                AuthOutcome::Failure(_) => {
                    debug!(method = %method, "Authentication method failed");
                }
            }
        }

        if cancelled {
            Err(FynxError::AuthCancelled)
        } else {
            Err(FynxError::AuthFailed)
        }
    }
}

impl fmt::Debug for AuthDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<&String> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("AuthDriver")
            .field("preferred", &self.preferred)
            .field("handlers", &handlers)
            .finish()
    }
}

/// `password` (RFC 4252 Section 8).
///
/// Uses a fixed password when one is given, otherwise asks through
/// [`UserInfo::prompt_password`] up to `attempts` times.
pub struct PasswordAuth {
    password: Option<Zeroizing<String>>,
    attempts: usize,
}

impl PasswordAuth {
    /// Sends this password once.
    pub fn new(password: &str) -> Self {
        Self {
            password: Some(Zeroizing::new(password.to_string())),
            attempts: 1,
        }
    }

    /// Prompts for the password.
    pub fn prompt(attempts: usize) -> Self {
        Self {
            password: None,
            attempts: attempts.max(1),
        }
    }
}

#[async_trait]
impl AuthMethodHandler for PasswordAuth {
    fn name(&self) -> &str {
        "password"
    }

    async fn authenticate(
        &self,
        ctx: &AuthContext<'_>,
        transport: &mut dyn AuthTransport,
    ) -> FynxResult<AuthOutcome> {
        let mut last = AuthOutcome::Failure(Vec::new());
        for _ in 0..self.attempts {
            let password = match &self.password {
                Some(password) => password.clone(),
                None => {
                    let prompt = format!("Password for {}", ctx.user);
                    match ctx.user_info.and_then(|ui| ui.prompt_password(&prompt)) {
                        Some(password) => Zeroizing::new(password),
                        None => return Ok(AuthOutcome::Cancelled),
                    }
                }
            };

            let mut request = Zeroizing::new(userauth_request(ctx.user, "password"));
            request.put_bool(false);
            request.put_string(password.as_bytes());
            transport.send(&request).await?;

            let reply = ctx.recv(transport).await?;
            if reply.first() == Some(&USERAUTH_PASSWD_CHANGEREQ) {
                debug!("Server requested a password change; not supported");
                return Ok(AuthOutcome::Failure(Vec::new()));
            }
            last = parse_auth_reply(&reply)?;
            if !matches!(last, AuthOutcome::Failure(_)) {
                break;
            }
        }
        Ok(last)
    }
}

/// `publickey` (RFC 4252 Section 7) with Ed25519 identities.
///
/// Each identity is first offered without a signature; only keys the server
/// answers with `PK_OK` get signed.
pub struct PublicKeyAuth {
    identities: Vec<SigningKey>,
}

impl PublicKeyAuth {
    /// Handler offering `identities` in order.
    pub fn new(identities: Vec<SigningKey>) -> Self {
        Self { identities }
    }

    /// `ssh-ed25519` public key blob of an identity.
    pub fn public_key_blob(key: &SigningKey) -> Vec<u8> {
        let mut blob = Vec::with_capacity(51);
        blob.put_string(b"ssh-ed25519");
        blob.put_string(key.verifying_key().as_bytes());
        blob
    }

    /// Data covered by the signature.
    pub fn signed_data(session_id: &[u8], user: &str, algorithm: &str, blob: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(session_id.len() + blob.len() + 96);
        data.put_string(session_id);
        data.put_slice(&userauth_request(user, "publickey"));
        data.put_bool(true);
        data.put_string(algorithm.as_bytes());
        data.put_string(blob);
        data
    }
}

#[async_trait]
impl AuthMethodHandler for PublicKeyAuth {
    fn name(&self) -> &str {
        "publickey"
    }

    async fn authenticate(
        &self,
        ctx: &AuthContext<'_>,
        transport: &mut dyn AuthTransport,
    ) -> FynxResult<AuthOutcome> {
        const ALGORITHM: &str = "ssh-ed25519";
        let mut last = AuthOutcome::Failure(Vec::new());

        for key in &self.identities {
            let blob = Self::public_key_blob(key);

            let mut query = userauth_request(ctx.user, "publickey");
            query.put_bool(false);
            query.put_string(ALGORITHM.as_bytes());
            query.put_string(&blob);
            transport.send(&query).await?;

            let reply = ctx.recv(transport).await?;
            if reply.first() != Some(&(MessageType::UserauthPkOk as u8)) {
                last = parse_auth_reply(&reply)?;
                if matches!(last, AuthOutcome::Failure(_)) {
                    continue;
                }
                return Ok(last);
            }

            let data = Self::signed_data(ctx.session_id, ctx.user, ALGORITHM, &blob);
            let signature = key.sign(&data);
            let mut sig_blob = Vec::with_capacity(83);
            sig_blob.put_string(ALGORITHM.as_bytes());
            sig_blob.put_string(&signature.to_bytes());

            let mut request = userauth_request(ctx.user, "publickey");
            request.put_bool(true);
            request.put_string(ALGORITHM.as_bytes());
            request.put_string(&blob);
            request.put_string(&sig_blob);
            transport.send(&request).await?;

            last = parse_auth_reply(&ctx.recv(transport).await?)?;
            if !matches!(last, AuthOutcome::Failure(_)) {
                return Ok(last);
            }
        }
        Ok(last)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hostkey::{Ed25519Verifier, SignatureVerifier};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays canned replies and records every sent payload.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub replies: VecDeque<Vec<u8>>,
        pub sent: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl AuthTransport for ScriptedTransport {
        async fn send(&mut self, payload: &[u8]) -> FynxResult<()> {
            self.sent.push(payload.to_vec());
            Ok(())
        }

        async fn recv(&mut self) -> FynxResult<Vec<u8>> {
            self.replies
                .pop_front()
                .ok_or_else(|| FynxError::Protocol("script exhausted".to_string()))
        }
    }

    fn failure(methods: &str, partial: bool) -> Vec<u8> {
        let mut buf = vec![MessageType::UserauthFailure as u8];
        buf.put_string(methods.as_bytes());
        buf.put_bool(partial);
        buf
    }

    fn success() -> Vec<u8> {
        vec![MessageType::UserauthSuccess as u8]
    }

    fn accept() -> Vec<u8> {
        let mut buf = vec![MessageType::ServiceAccept as u8];
        buf.put_string(USERAUTH_SERVICE.as_bytes());
        buf
    }

    fn ctx<'a>(user_info: Option<&'a dyn UserInfo>) -> AuthContext<'a> {
        AuthContext {
            user: "alice",
            session_id: b"session-id",
            user_info,
        }
    }

    fn method_of(payload: &[u8]) -> String {
        let mut r = Reader::new(&payload[1..]);
        r.string().unwrap();
        r.string().unwrap();
        r.utf8().unwrap()
    }

    /// Handler returning scripted outcomes without touching the transport.
    struct Fake {
        name: &'static str,
        outcomes: Mutex<VecDeque<AuthOutcome>>,
        calls: AtomicUsize,
    }

    impl Fake {
        fn new(name: &'static str, outcomes: Vec<AuthOutcome>) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AuthMethodHandler for Fake {
        fn name(&self) -> &str {
            self.name
        }

        async fn authenticate(
            &self,
            _ctx: &AuthContext<'_>,
            _transport: &mut dyn AuthTransport,
        ) -> FynxResult<AuthOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(AuthOutcome::Failure(Vec::new())))
        }
    }

    fn preferred(list: &str) -> Vec<String> {
        list.split(',').map(str::to_string).collect()
    }

    #[tokio::test]
    async fn test_none_then_publickey_fails_then_password() {
        let mut transport = ScriptedTransport::default();
        transport.replies.extend([
            accept(),
            failure("publickey,password", false),
            failure("publickey,password", false),
            success(),
        ]);

        let mut driver = AuthDriver::new(preferred("publickey,password"));
        driver
            .register(Arc::new(PublicKeyAuth::new(vec![SigningKey::from_bytes(&[1u8; 32])])))
            .register(Arc::new(PasswordAuth::new("secret")));

        let method = driver.run(&ctx(None), &mut transport).await.unwrap();
        assert_eq!(method, "password");

        let methods: Vec<String> = transport.sent[1..].iter().map(|p| method_of(p)).collect();
        assert_eq!(methods, ["none", "publickey", "password"]);
        assert!(transport.replies.is_empty());
    }

    #[tokio::test]
    async fn test_partial_success_restarts_from_first_method() {
        let mut transport = ScriptedTransport::default();
        transport.replies.extend([accept(), failure("b", false)]);

        let a = Fake::new("a", vec![AuthOutcome::Success]);
        let b = Fake::new("b", vec![AuthOutcome::Partial(preferred("a"))]);
        let mut driver = AuthDriver::new(preferred("a,b"));
        driver.register(a.clone()).register(b.clone());

        assert_eq!(driver.run(&ctx(None), &mut transport).await.unwrap(), "a");
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_success_with_same_list_retries_method() {
        let mut transport = ScriptedTransport::default();
        transport.replies.extend([accept(), failure("publickey", false)]);

        let pk = Fake::new(
            "publickey",
            vec![AuthOutcome::Partial(preferred("publickey")), AuthOutcome::Success],
        );
        let pw = Fake::new("password", vec![AuthOutcome::Success]);
        let mut driver = AuthDriver::new(preferred("publickey,password"));
        driver.register(pk.clone()).register(pw.clone());

        assert_eq!(driver.run(&ctx(None), &mut transport).await.unwrap(), "publickey");
        assert_eq!(pk.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pw.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_endless_partial_success_is_bounded() {
        let mut transport = ScriptedTransport::default();
        transport.replies.extend([accept(), failure("publickey", false)]);

        let outcomes = vec![AuthOutcome::Partial(preferred("publickey")); MAX_AUTH_ATTEMPTS + 5];
        let pk = Fake::new("publickey", outcomes);
        let mut driver = AuthDriver::new(preferred("publickey"));
        driver.register(pk.clone());

        let err = driver.run(&ctx(None), &mut transport).await.unwrap_err();
        assert!(matches!(err, FynxError::AuthFailed));
        assert_eq!(pk.calls.load(Ordering::SeqCst), MAX_AUTH_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_unregistered_and_unlisted_methods_skipped() {
        let mut transport = ScriptedTransport::default();
        transport
            .replies
            .extend([accept(), failure("gssapi-with-mic,password", false)]);

        let pk = Fake::new("publickey", vec![AuthOutcome::Success]);
        let pw = Fake::new("password", vec![AuthOutcome::Failure(Vec::new())]);
        let mut driver = AuthDriver::new(preferred(DEFAULT_PREFERRED_AUTHENTICATIONS));
        driver.register(pk.clone()).register(pw.clone());

        let err = driver.run(&ctx(None), &mut transport).await.unwrap_err();
        assert!(matches!(err, FynxError::AuthFailed));
        assert_eq!(pk.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pw.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_reported_when_last_attempt_cancelled() {
        let mut transport = ScriptedTransport::default();
        transport.replies.extend([accept(), failure("password", false)]);

        let mut driver = AuthDriver::new(preferred("password"));
        driver.register(Arc::new(PasswordAuth::prompt(3)));
        let err = driver.run(&ctx(None), &mut transport).await.unwrap_err();
        assert!(matches!(err, FynxError::AuthCancelled));
        assert_eq!(transport.sent.len(), 2);
    }

    #[tokio::test]
    async fn test_banner_shown_and_none_success() {
        struct Banner(AtomicUsize);
        impl UserInfo for Banner {
            fn prompt_yes_no(&self, _message: &str) -> bool {
                false
            }
            fn show_message(&self, message: &str) {
                assert_eq!(message, "Welcome");
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut banner = vec![MessageType::UserauthBanner as u8];
        banner.put_string(b"Welcome");
        banner.put_string(b"en");

        let mut transport = ScriptedTransport::default();
        transport.replies.extend([accept(), banner, success()]);
        let ui = Banner(AtomicUsize::new(0));
        let driver = AuthDriver::new(preferred("password"));
        assert_eq!(driver.run(&ctx(Some(&ui)), &mut transport).await.unwrap(), "none");
        assert_eq!(ui.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publickey_signs_after_pk_ok() {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let blob = PublicKeyAuth::public_key_blob(&key);
        let mut pk_ok = vec![MessageType::UserauthPkOk as u8];
        pk_ok.put_string(b"ssh-ed25519");
        pk_ok.put_string(&blob);

        let mut transport = ScriptedTransport::default();
        transport.replies.extend([pk_ok, success()]);
        let handler = PublicKeyAuth::new(vec![key]);
        let outcome = handler.authenticate(&ctx(None), &mut transport).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Success);

        let signed = &transport.sent[1];
        let mut r = Reader::new(&signed[1..]);
        assert_eq!(r.utf8().unwrap(), "alice");
        r.string().unwrap();
        assert_eq!(r.utf8().unwrap(), "publickey");
        assert!(r.bool().unwrap());
        assert_eq!(r.utf8().unwrap(), "ssh-ed25519");
        assert_eq!(r.string().unwrap(), blob.as_slice());
        let sig = r.string().unwrap();

        let data = PublicKeyAuth::signed_data(b"session-id", "alice", "ssh-ed25519", &blob);
        assert!(Ed25519Verifier.verify(&blob, &data, sig).unwrap());
    }

    #[tokio::test]
    async fn test_password_change_request_is_failure() {
        let mut transport = ScriptedTransport::default();
        let mut change = vec![USERAUTH_PASSWD_CHANGEREQ];
        change.put_string(b"expired");
        change.put_string(b"");
        transport.replies.push_back(change);
        let outcome = PasswordAuth::new("old")
            .authenticate(&ctx(None), &mut transport)
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Failure(_)));
    }
}
