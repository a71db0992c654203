use super::derive::KeyDeriver;
use super::{
    negotiate, AlgorithmGuess, Category, KexContext, KexInit, KexOutput, KexStep, KeyExchange,
};
use crate::algorithm::{AlgorithmRegistry, Cipher, CipherMode, Mac};
use crate::message::MessageType;
use fynx_platform::{FynxError, FynxResult};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Where the coordinator is in a key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexState {
    /// Nothing exchanged yet.
    Idle,
    /// Our KEXINIT is out, the peer's is awaited.
    SentKexinit,
    /// Both KEXINITs seen, algorithms chosen.
    Negotiated,
    /// The method's own messages are in flight.
    KexRunning,
    /// H is signed and verified; waiting for the peer's NEWKEYS.
    NewkeysPending,
    /// Keys in use. A new KEXINIT from either side starts over.
    Established,
}

/// What the session has to do after feeding a key exchange message.
#[derive(Debug)]
pub enum KexProgress {
    /// Send this payload.
    Send(Vec<u8>),
    /// The exchange hash is verified; check trust for this host key blob, then
    /// send NEWKEYS.
    HostKey(Vec<u8>),
    /// Message dropped (the peer's wrong first guess).
    Ignored,
}

/// One direction's freshly keyed algorithms.
pub struct DirectionKeys {
    /// Keyed cipher.
    pub cipher: Box<dyn Cipher>,
    /// Keyed MAC, `None` for `none`.
    pub mac: Option<Box<dyn Mac>>,
    /// Negotiated compression method; the session decides when it starts.
    pub compression: String,
}

impl fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher.name())
            .field("mac", &self.mac.as_ref().map(|m| m.name().to_string()))
            .field("compression", &self.compression)
            .finish()
    }
}

/// Keys produced by a completed exchange, for both directions.
#[derive(Debug)]
pub struct NewKeys {
    /// Client to server
    pub outbound: DirectionKeys,
    /// Server to client
    pub inbound: DirectionKeys,
}

/// Client side key exchange state machine.
///
/// Pure protocol logic: it consumes payloads and returns payloads to send.
/// Socket I/O, host key trust and key installation belong to the session.
pub struct KexCoordinator {
    state: KexState,
    registry: Arc<AlgorithmRegistry>,
    proposal: [Vec<String>; 10],
    client_version: String,
    server_version: String,
    client_kexinit: Option<Vec<u8>>,
    guess: Option<AlgorithmGuess>,
    method: Option<Box<dyn KeyExchange>>,
    output: Option<KexOutput>,
    session_id: Option<Vec<u8>>,
    authenticated: bool,
    skip_guessed_packet: bool,
    exchanges: u32,
}

impl KexCoordinator {
    /// New coordinator for one session.
    pub fn new(
        registry: Arc<AlgorithmRegistry>,
        proposal: [Vec<String>; 10],
        client_version: &str,
        server_version: &str,
    ) -> Self {
        Self {
            state: KexState::Idle,
            registry,
            proposal,
            client_version: client_version.to_string(),
            server_version: server_version.to_string(),
            client_kexinit: None,
            guess: None,
            method: None,
            output: None,
            session_id: None,
            authenticated: false,
            skip_guessed_packet: false,
            exchanges: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> KexState {
        self.state
    }

    /// True between our KEXINIT and the peer's NEWKEYS.
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, KexState::Idle | KexState::Established)
    }

    /// Session identifier, the H of the first exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Algorithms of the latest negotiation.
    pub fn guess(&self) -> Option<&AlgorithmGuess> {
        self.guess.as_ref()
    }

    /// Completed exchanges, rekeys included.
    pub fn exchanges(&self) -> u32 {
        self.exchanges
    }

    /// Lifts the pre-authentication null cipher guard for later rekeys.
    pub fn set_authenticated(&mut self) {
        self.authenticated = true;
    }

    /// Builds our KEXINIT and enters `SentKexinit`.
    pub fn send_kexinit(&mut self) -> FynxResult<Vec<u8>> {
        if self.in_progress() {
            return Err(FynxError::Protocol(
                "Key exchange already in progress".to_string(),
            ));
        }
        let payload = KexInit::new(self.proposal.clone()).to_bytes();
        self.client_kexinit = Some(payload.clone());
        self.state = KexState::SentKexinit;
        debug!(exchange = self.exchanges + 1, "Sent KEXINIT");
        Ok(payload)
    }

    /// Handles the peer's KEXINIT. Returns the payloads to send, in order:
    /// our own KEXINIT when the peer started the exchange, then the method's
    /// first message.
    pub fn receive_kexinit(&mut self, payload: &[u8]) -> FynxResult<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(2);
        match self.state {
            KexState::Idle | KexState::Established => out.push(self.send_kexinit()?),
            KexState::SentKexinit => {}
            state => {
                return Err(FynxError::Protocol(format!(
                    "Unexpected KEXINIT in state {:?}",
                    state
                )))
            }
        }

        let server = KexInit::from_bytes(payload)?;
        let i_c = self
            .client_kexinit
            .clone()
            .ok_or_else(|| FynxError::Protocol("KEXINIT state lost".to_string()))?;
        let client = KexInit::from_bytes(&i_c)?;

        let guess = negotiate(&client, &server)?;
        guess.check_cipher_policy(self.authenticated)?;
        debug!(algorithms = %guess, "Negotiated algorithms");

        self.skip_guessed_packet = server.first_kex_packet_follows()
            && (server.list(Category::Kex).first().map(String::as_str) != Some(guess.kex())
                || server.list(Category::HostKey).first().map(String::as_str)
                    != Some(guess.host_key()));
        self.state = KexState::Negotiated;

        let mut method = self.registry.kex(guess.kex())?;
        let first = method.start(KexContext {
            client_version: self.client_version.clone(),
            server_version: self.server_version.clone(),
            client_kexinit: i_c,
            server_kexinit: payload.to_vec(),
        })?;
        out.push(first);

        self.method = Some(method);
        self.guess = Some(guess);
        self.state = KexState::KexRunning;
        Ok(out)
    }

    /// Feeds one method message (numbers 30 to 49).
    pub fn receive_kex_message(&mut self, payload: &[u8]) -> FynxResult<KexProgress> {
        if self.state != KexState::KexRunning {
            return Err(FynxError::Protocol(format!(
                "Unexpected key exchange message in state {:?}",
                self.state
            )));
        }
        if self.skip_guessed_packet {
            self.skip_guessed_packet = false;
            debug!("Ignoring the peer's wrongly guessed key exchange packet");
            return Ok(KexProgress::Ignored);
        }

        let method = self
            .method
            .as_mut()
            .ok_or_else(|| FynxError::Protocol("No key exchange method running".to_string()))?;
        let msg = payload.first().copied().unwrap_or_default();
        if method.expected_message() != Some(msg) {
            return Err(FynxError::Protocol(format!(
                "{}: unexpected message {}, expected {:?}",
                method.name(),
                msg,
                method.expected_message()
            )));
        }
        trace!(msg, method = method.name(), "Key exchange message");

        match method.next(payload)? {
            KexStep::Send(reply) => Ok(KexProgress::Send(reply)),
            KexStep::Done(output) => {
                let host_key = self.verify_signature(&output)?;
                if self.session_id.is_none() {
                    self.session_id = Some(output.exchange_hash.clone());
                }
                self.output = Some(output);
                self.method = None;
                self.state = KexState::NewkeysPending;
                Ok(KexProgress::HostKey(host_key))
            }
        }
    }

    fn verify_signature(&self, output: &KexOutput) -> FynxResult<Vec<u8>> {
        let algorithm = self
            .guess
            .as_ref()
            .map(|g| g.host_key().to_string())
            .unwrap_or_default();
        let verifier = self.registry.signature(&algorithm)?;
        if !verifier.verify(&output.host_key, &output.exchange_hash, &output.signature)? {
            return Err(FynxError::Security(format!(
                "Host key signature verification failed ({})",
                algorithm
            )));
        }
        debug!(algorithm = %algorithm, "Host key signature verified");
        Ok(output.host_key.clone())
    }

    /// Our NEWKEYS payload.
    pub fn newkeys_message() -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Handles the peer's NEWKEYS: derives and keys both directions.
    pub fn receive_newkeys(&mut self) -> FynxResult<NewKeys> {
        if self.state != KexState::NewkeysPending {
            return Err(FynxError::Protocol(format!(
                "Unexpected NEWKEYS in state {:?}",
                self.state
            )));
        }
        let output = self
            .output
            .take()
            .ok_or_else(|| FynxError::Protocol("NEWKEYS before exchange hash".to_string()))?;
        let guess = self
            .guess
            .clone()
            .ok_or_else(|| FynxError::Protocol("NEWKEYS before negotiation".to_string()))?;
        let session_id = self
            .session_id
            .clone()
            .unwrap_or_else(|| output.exchange_hash.clone());

        let deriver = KeyDeriver::new(output.hash, &output.shared_secret, &output.exchange_hash);
        let keys = deriver.derive(&session_id);

        let outbound = self.build_direction(
            &deriver,
            CipherMode::Encrypt,
            &guess,
            true,
            (
                keys.enc_c2s.as_slice(),
                keys.iv_c2s.as_slice(),
                keys.mac_c2s.as_slice(),
            ),
        )?;
        let inbound = self.build_direction(
            &deriver,
            CipherMode::Decrypt,
            &guess,
            false,
            (
                keys.enc_s2c.as_slice(),
                keys.iv_s2c.as_slice(),
                keys.mac_s2c.as_slice(),
            ),
        )?;

        self.client_kexinit = None;
        self.exchanges += 1;
        self.state = KexState::Established;
        debug!(exchange = self.exchanges, "New keys derived");
        Ok(NewKeys { outbound, inbound })
    }

    fn build_direction(
        &self,
        deriver: &KeyDeriver,
        mode: CipherMode,
        guess: &AlgorithmGuess,
        outbound: bool,
        (enc, iv, mac_key): (&[u8], &[u8], &[u8]),
    ) -> FynxResult<DirectionKeys> {
        let mut cipher = self.registry.cipher(guess.cipher(outbound))?;
        let key = deriver.extend(enc, cipher.key_size());
        let iv = deriver.extend(iv, cipher.iv_size());
        cipher.init(mode, &key, &iv)?;

        let mac = match guess.mac(outbound) {
            "none" => None,
            name => {
                let mut mac = self.registry.mac(name)?;
                let key = deriver.extend(mac_key, mac.key_size());
                mac.init(&key)?;
                Some(mac)
            }
        };

        Ok(DirectionKeys {
            cipher,
            mac,
            compression: guess.compression(outbound).to_string(),
        })
    }
}

impl fmt::Debug for KexCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KexCoordinator")
            .field("state", &self.state)
            .field("guess", &self.guess)
            .field("exchanges", &self.exchanges)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}
