//! In-process scripted SSH server for integration tests.
//!
//! Speaks just enough of the server side to drive a client session over a
//! `tokio::io::duplex` pipe: identification, `diffie-hellman-group14-sha1`
//! with an `ssh-rsa` host key, `aes128-ctr` and `hmac-sha1`, user
//! authentication and raw connection protocol messages. Each test scripts
//! the messages it expects and sends.

#![allow(dead_code)]

use fynx_ssh::algorithm::{Cipher, CipherMode, Mac};
use fynx_ssh::connection::{ChannelOpen, ChannelOpenConfirmation};
use fynx_ssh::kex::derive::KeyDeriver;
use fynx_ssh::kex::dh::GROUP14_P;
use fynx_ssh::kex::{KexContext, KexHash, KexInit};
use fynx_ssh::message::{Disconnect, MessageType};
use fynx_ssh::version::{read_identification, send_identification};
use fynx_ssh::wire::{Reader, SshBufMut};
use fynx_ssh::{AlgorithmRegistry, PacketReader, PacketWriter, SessionConfig, StrictHostKeyChecking};
use num_bigint::{BigUint, RandBigInt};
use sha1::{Digest, Sha1};
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

pub const SERVER_VERSION: &str = "SSH-2.0-ScriptedServer_1.0";

const KEX: &str = "diffie-hellman-group14-sha1";
const HOST_KEY: &str = "ssh-rsa";
const CIPHER: &str = "aes128-ctr";
const MAC: &str = "hmac-sha1";

/// DigestInfo prefix for SHA-1 (RFC 8017 Section 9.2).
const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];

const RSA_N: &[&str] = &[
    "9cdc89daa9f26920fa818ed05c88a4e20d27cf178d03a7c9df547413eef61a33",
    "2724e9928be05083d7fb5fd77c251ae2a002c6b78af8a648d7f547b52093e600",
    "db1bbae0d7aa52dd1c5fd1eda7fb111a58f724471c448f4a6cbf48b0ee7a05a7",
    "9f89735da358a0ef8f30b5bc21be34fb0b090f6c0bee55950f4d7d64460fab73",
    "2d02fc5be833cf632ddb87ba57a755fcdedf523eb13d681a13b38df5e9cd9bff",
    "8cc5281a7fd170bca6f56bd3c1b8f2200101298b978a654ac02961c43f87a077",
    "a03df6146ee0c0f7d17184c09eb87dd4a4bcc56b5282ae1851d4d45162127702",
    "f719e07c1ac9e075c0e8b0cfbbb71727048d71236c57a71ee9eb3cd6bdbd09d9",
];

const RSA_D: &[&str] = &[
    "5b4b2fcb07fb81f179054bc29103263e3a3c8a6c6bdca371a67d574c52ae569e",
    "a19050db6dcabbe6eac94405521cf657779bfb5e7a3a2fed580df5676c47d27c",
    "2509da9609c44e3df4c9aa90904d060338f6d3325fe2b728306a93e55b5116ac",
    "1c4f64742c76e4be5daee7d6a57ce25b9f1742d68b8b1c5c336fd22438c7ddec",
    "5cd06957eca6f3cdead7cd16098c17ad0998ee57fbaf050c7057bff91d6cf55d",
    "2cef6fda4a7394edbbcd0c3354667ccc8a9fb92ccd1b92e90256349056127cfc",
    "453d345be8d4a2c69b4f3edac87caf887435e61bc8b83e6749360931e521e44a",
    "6636998059ba45b97d252f5e8d81864f4712dce0564142b110fd28593db0681",
];

/// Fixed 2048-bit RSA host key.
pub struct RsaHostKey {
    n: BigUint,
    d: BigUint,
}

impl RsaHostKey {
    pub fn fixed() -> Self {
        let parse = |parts: &[&str]| BigUint::parse_bytes(parts.concat().as_bytes(), 16).unwrap();
        Self {
            n: parse(RSA_N),
            d: parse(RSA_D),
        }
    }

    /// `ssh-rsa` public key blob.
    pub fn public_blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.put_string(b"ssh-rsa");
        blob.put_mpint(&[0x01, 0x00, 0x01]);
        blob.put_mpint(&self.n.to_bytes_be());
        blob
    }

    /// PKCS#1 v1.5 SHA-1 signature blob over `data`.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let k = (self.n.bits() as usize + 7) / 8;
        let digest = Sha1::digest(data);
        let mut em = vec![0x00, 0x01];
        em.resize(k - SHA1_DIGEST_INFO.len() - digest.len() - 1, 0xff);
        em.push(0x00);
        em.extend_from_slice(&SHA1_DIGEST_INFO);
        em.extend_from_slice(&digest);

        let s = BigUint::from_bytes_be(&em).modpow(&self.d, &self.n).to_bytes_be();
        let mut padded = vec![0u8; k - s.len()];
        padded.extend_from_slice(&s);

        let mut blob = Vec::new();
        blob.put_string(HOST_KEY.as_bytes());
        blob.put_string(&padded);
        blob
    }
}

/// Client configuration matching what the scripted server offers.
pub fn client_config() -> SessionConfig {
    SessionConfig::new()
        .with_kex(KEX)
        .with_server_host_key(HOST_KEY)
        .with_ciphers(CIPHER)
        .with_macs(MAC)
        .with_compression("none")
        .with_strict_host_key_checking(StrictHostKeyChecking::No)
}

/// Logs at debug level when `RUST_LOG` is unset; silent unless the test
/// fails or runs with `--nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("fynx_ssh=debug")
        .with_test_writer()
        .try_init();
}

/// Client and server ends of a fresh pipe.
pub fn pair() -> (DuplexStream, ScriptedServer) {
    init_tracing();
    let (client, server) = tokio::io::duplex(1 << 16);
    (client, ScriptedServer::new(server))
}

fn name_lists(names: [&str; 5]) -> [Vec<String>; 10] {
    let one = |s: &str| vec![s.to_string()];
    [
        one(names[0]),
        one(names[1]),
        one(names[2]),
        one(names[2]),
        one(names[3]),
        one(names[3]),
        one(names[4]),
        one(names[4]),
        Vec::new(),
        Vec::new(),
    ]
}

pub struct ScriptedServer {
    reader: PacketReader<ReadHalf<DuplexStream>>,
    writer: PacketWriter<WriteHalf<DuplexStream>>,
    registry: AlgorithmRegistry,
    host_key: RsaHostKey,
    client_version: String,
    session_id: Option<Vec<u8>>,
    /// Methods named in each USERAUTH_REQUEST, in order.
    pub auth_log: Vec<String>,
    /// Completed key exchanges.
    pub exchanges: u32,
    /// Reason code of the client's DISCONNECT, once seen.
    pub disconnect_reason: Option<u32>,
}

impl ScriptedServer {
    fn new(stream: DuplexStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: PacketReader::new(read_half),
            writer: PacketWriter::new(write_half),
            registry: AlgorithmRegistry::with_defaults(),
            host_key: RsaHostKey::fixed(),
            client_version: String::new(),
            session_id: None,
            auth_log: Vec::new(),
            exchanges: 0,
            disconnect_reason: None,
        }
    }

    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    pub async fn send(&mut self, payload: &[u8]) {
        self.writer.write_packet(payload).await.unwrap();
    }

    /// Next packet, skipping SSH_MSG_IGNORE.
    pub async fn recv(&mut self) -> Vec<u8> {
        loop {
            let payload = self.reader.read_packet().await.unwrap();
            if payload[0] != MessageType::Ignore as u8 {
                return payload;
            }
        }
    }

    /// Next packet, or `None` if nothing arrives within `limit`.
    pub async fn try_recv(&mut self, limit: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(limit, self.reader.read_packet())
            .await
            .ok()
            .map(Result::unwrap)
    }

    /// Next packet, which must be of type `kind`.
    pub async fn expect(&mut self, kind: MessageType) -> Vec<u8> {
        let payload = self.recv().await;
        assert_eq!(
            payload[0], kind as u8,
            "expected {}, got message {}",
            kind, payload[0]
        );
        payload
    }

    /// Identification exchange and the first key exchange.
    pub async fn handshake(&mut self) {
        send_identification(self.writer.get_mut(), SERVER_VERSION)
            .await
            .unwrap();
        let version = read_identification(&mut self.reader).await.unwrap();
        self.client_version = version.as_str().to_string();

        let server_kexinit = self.kexinit();
        self.send(&server_kexinit).await;
        let client_kexinit = self.expect(MessageType::KexInit).await;
        self.run_kex(client_kexinit, server_kexinit).await;
    }

    /// Answers a key exchange the client started.
    pub async fn answer_rekey(&mut self) {
        let client_kexinit = self.expect(MessageType::KexInit).await;
        self.answer_kexinit(client_kexinit).await;
    }

    /// Answers a client KEXINIT that was already read.
    pub async fn answer_kexinit(&mut self, client_kexinit: Vec<u8>) {
        let server_kexinit = self.kexinit();
        self.send(&server_kexinit).await;
        self.run_kex(client_kexinit, server_kexinit).await;
    }

    /// Starts a key exchange from the server side.
    pub async fn start_rekey(&mut self) {
        let server_kexinit = self.kexinit();
        self.send(&server_kexinit).await;
        let client_kexinit = self.expect(MessageType::KexInit).await;
        self.run_kex(client_kexinit, server_kexinit).await;
    }

    fn kexinit(&self) -> Vec<u8> {
        KexInit::new(name_lists([KEX, HOST_KEY, CIPHER, MAC, "none"])).to_bytes()
    }

    async fn run_kex(&mut self, client_kexinit: Vec<u8>, server_kexinit: Vec<u8>) {
        let init = self.expect(MessageType::KexdhInit).await;
        let mut r = Reader::new(&init[1..]);
        let e = BigUint::from_bytes_be(r.mpint().unwrap());

        let y = rand::thread_rng().gen_biguint(256);
        let f = BigUint::from(2u32).modpow(&y, &GROUP14_P);
        let k = e.modpow(&y, &GROUP14_P).to_bytes_be();

        let host_key = self.host_key.public_blob();
        let ctx = KexContext {
            client_version: self.client_version.clone(),
            server_version: SERVER_VERSION.to_string(),
            client_kexinit,
            server_kexinit,
        };
        let mut buf = ctx.hash_prefix();
        buf.put_string(&host_key);
        buf.put_mpint(&e.to_bytes_be());
        buf.put_mpint(&f.to_bytes_be());
        buf.put_mpint(&k);
        let h = KexHash::Sha1.digest(&buf);

        let mut reply = vec![MessageType::KexdhReply as u8];
        reply.put_string(&host_key);
        reply.put_mpint(&f.to_bytes_be());
        reply.put_string(&self.host_key.sign(&h));
        self.send(&reply).await;

        let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();
        let deriver = KeyDeriver::new(KexHash::Sha1, &k, &h);
        let keys = deriver.derive(&session_id);

        self.send(&[MessageType::NewKeys as u8]).await;
        let (cipher, mac) = self.keyed(
            &deriver,
            CipherMode::Encrypt,
            (keys.enc_s2c.as_slice(), keys.iv_s2c.as_slice(), keys.mac_s2c.as_slice()),
        );
        self.writer.set_keys(cipher, Some(mac));

        self.expect(MessageType::NewKeys).await;
        let (cipher, mac) = self.keyed(
            &deriver,
            CipherMode::Decrypt,
            (keys.enc_c2s.as_slice(), keys.iv_c2s.as_slice(), keys.mac_c2s.as_slice()),
        );
        self.reader.set_keys(cipher, Some(mac));
        self.exchanges += 1;
    }

    fn keyed(
        &self,
        deriver: &KeyDeriver,
        mode: CipherMode,
        (enc, iv, mac_key): (&[u8], &[u8], &[u8]),
    ) -> (Box<dyn Cipher>, Box<dyn Mac>) {
        let mut cipher = self.registry.cipher(CIPHER).unwrap();
        let key = deriver.extend(enc, cipher.key_size());
        let iv = deriver.extend(iv, cipher.iv_size());
        cipher.init(mode, &key, &iv).unwrap();

        let mut mac = self.registry.mac(MAC).unwrap();
        mac.init(&deriver.extend(mac_key, mac.key_size())).unwrap();
        (cipher, mac)
    }

    /// Serves the userauth service until a login succeeds (`true`) or the
    /// client gives up with a DISCONNECT (`false`). Only `password` with
    /// `password` succeeds.
    pub async fn serve_auth(&mut self, password: &str) -> bool {
        loop {
            let payload = self.recv().await;
            let mut r = Reader::new(&payload[1..]);
            match MessageType::from_u8(payload[0]) {
                Some(MessageType::ServiceRequest) => {
                    assert_eq!(r.utf8().unwrap(), "ssh-userauth");
                    let mut accept = vec![MessageType::ServiceAccept as u8];
                    accept.put_string(b"ssh-userauth");
                    self.send(&accept).await;
                }
                Some(MessageType::UserauthRequest) => {
                    let _user = r.utf8().unwrap();
                    assert_eq!(r.utf8().unwrap(), "ssh-connection");
                    let method = r.utf8().unwrap();
                    self.auth_log.push(method.clone());

                    let accepted = method == "password" && {
                        r.bool().unwrap();
                        r.utf8().unwrap() == password
                    };
                    if accepted {
                        self.send(&[MessageType::UserauthSuccess as u8]).await;
                        return true;
                    }
                    let mut failure = vec![MessageType::UserauthFailure as u8];
                    failure.put_name_list(&["publickey", "password"]);
                    failure.put_bool(false);
                    self.send(&failure).await;
                }
                Some(MessageType::Disconnect) => {
                    let d = Disconnect::from_bytes(&payload).unwrap();
                    self.disconnect_reason = Some(d.reason_code);
                    return false;
                }
                other => panic!("unexpected message during authentication: {:?}", other),
            }
        }
    }

    /// Full login with the given password.
    pub async fn accept_login(&mut self, password: &str) {
        self.handshake().await;
        assert!(self.serve_auth(password).await, "login refused");
    }

    /// Reads a CHANNEL_OPEN and confirms it as `server_id`.
    pub async fn accept_channel(
        &mut self,
        server_id: u32,
        window: u32,
        max_packet: u32,
    ) -> ChannelOpen {
        let payload = self.expect(MessageType::ChannelOpen).await;
        let open = ChannelOpen::from_bytes(&payload).unwrap();
        let confirmation = ChannelOpenConfirmation {
            recipient_channel: open.sender_channel,
            sender_channel: server_id,
            initial_window_size: window,
            maximum_packet_size: max_packet,
        };
        self.send(&confirmation.to_bytes()).await;
        open
    }
}
