//! Bundled ciphers: `none`, AES in counter mode and AES in CBC mode.
//!
//! Counter mode uses the `ctr` crate keystream; CBC chains across packets, so
//! each instance keeps its encryptor or decryptor for the life of the keys.

use super::{AlgorithmRegistry, Cipher, CipherMode};
use aes::{Aes128, Aes192, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use fynx_platform::{FynxError, FynxResult};

const AES_BLOCK: usize = 16;

pub(crate) fn register_defaults(registry: &mut AlgorithmRegistry) {
    registry
        .register_cipher("none", || Box::new(NoneCipher))
        .register_cipher("aes128-ctr", || Box::new(AesCtr::new(16)))
        .register_cipher("aes192-ctr", || Box::new(AesCtr::new(24)))
        .register_cipher("aes256-ctr", || Box::new(AesCtr::new(32)))
        .register_cipher("aes128-cbc", || Box::new(AesCbc::new(16)))
        .register_cipher("aes256-cbc", || Box::new(AesCbc::new(32)));
}

/// The null cipher used before the first key exchange completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneCipher;

impl Cipher for NoneCipher {
    fn name(&self) -> &str {
        "none"
    }

    fn block_size(&self) -> usize {
        8
    }

    fn iv_size(&self) -> usize {
        8
    }

    fn key_size(&self) -> usize {
        16
    }

    fn init(&mut self, _mode: CipherMode, _key: &[u8], _iv: &[u8]) -> FynxResult<()> {
        Ok(())
    }

    fn update(&mut self, _data: &mut [u8]) -> FynxResult<()> {
        Ok(())
    }

    fn is_none(&self) -> bool {
        true
    }
}

enum CtrState {
    Aes128(ctr::Ctr128BE<Aes128>),
    Aes192(ctr::Ctr128BE<Aes192>),
    Aes256(ctr::Ctr128BE<Aes256>),
}

/// `aes{128,192,256}-ctr` (RFC 4344).
pub struct AesCtr {
    name: &'static str,
    key_size: usize,
    state: Option<CtrState>,
}

impl AesCtr {
    /// Creates an unkeyed instance for a 16, 24 or 32 byte key.
    pub fn new(key_size: usize) -> Self {
        let name = match key_size {
            16 => "aes128-ctr",
            24 => "aes192-ctr",
            _ => "aes256-ctr",
        };
        Self {
            name,
            key_size,
            state: None,
        }
    }
}

impl Cipher for AesCtr {
    fn name(&self) -> &str {
        self.name
    }

    fn block_size(&self) -> usize {
        AES_BLOCK
    }

    fn iv_size(&self) -> usize {
        AES_BLOCK
    }

    fn key_size(&self) -> usize {
        self.key_size
    }

    fn init(&mut self, _mode: CipherMode, key: &[u8], iv: &[u8]) -> FynxResult<()> {
        let (key, iv) = sized(key, self.key_size, iv, AES_BLOCK)?;
        let name = self.name;
        let invalid = |_| FynxError::Security(format!("{}: invalid key length", name));
        self.state = Some(match self.key_size {
            16 => CtrState::Aes128(ctr::Ctr128BE::new_from_slices(key, iv).map_err(invalid)?),
            24 => CtrState::Aes192(ctr::Ctr128BE::new_from_slices(key, iv).map_err(invalid)?),
            _ => CtrState::Aes256(ctr::Ctr128BE::new_from_slices(key, iv).map_err(invalid)?),
        });
        Ok(())
    }

    fn update(&mut self, data: &mut [u8]) -> FynxResult<()> {
        match self.state.as_mut() {
            Some(CtrState::Aes128(c)) => c.apply_keystream(data),
            Some(CtrState::Aes192(c)) => c.apply_keystream(data),
            Some(CtrState::Aes256(c)) => c.apply_keystream(data),
            None => return Err(not_keyed(self.name)),
        }
        Ok(())
    }
}

enum CbcState {
    Enc128(cbc::Encryptor<Aes128>),
    Dec128(cbc::Decryptor<Aes128>),
    Enc256(cbc::Encryptor<Aes256>),
    Dec256(cbc::Decryptor<Aes256>),
}

/// `aes128-cbc` and `aes256-cbc` (RFC 4253).
pub struct AesCbc {
    name: &'static str,
    key_size: usize,
    state: Option<CbcState>,
}

impl AesCbc {
    /// Creates an unkeyed instance for a 16 or 32 byte key.
    pub fn new(key_size: usize) -> Self {
        let name = if key_size == 16 {
            "aes128-cbc"
        } else {
            "aes256-cbc"
        };
        Self {
            name,
            key_size,
            state: None,
        }
    }
}

impl Cipher for AesCbc {
    fn name(&self) -> &str {
        self.name
    }

    fn block_size(&self) -> usize {
        AES_BLOCK
    }

    fn iv_size(&self) -> usize {
        AES_BLOCK
    }

    fn key_size(&self) -> usize {
        self.key_size
    }

    fn init(&mut self, mode: CipherMode, key: &[u8], iv: &[u8]) -> FynxResult<()> {
        let (key, iv) = sized(key, self.key_size, iv, AES_BLOCK)?;
        let name = self.name;
        let invalid = |_| FynxError::Security(format!("{}: invalid key length", name));
        self.state = Some(match (self.key_size, mode) {
            (16, CipherMode::Encrypt) => {
                CbcState::Enc128(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (16, CipherMode::Decrypt) => {
                CbcState::Dec128(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (_, CipherMode::Encrypt) => {
                CbcState::Enc256(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (_, CipherMode::Decrypt) => {
                CbcState::Dec256(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
        });
        Ok(())
    }

    fn update(&mut self, data: &mut [u8]) -> FynxResult<()> {
        if data.len() % AES_BLOCK != 0 {
            return Err(FynxError::Protocol(format!(
                "{}: {} bytes is not a whole number of blocks",
                self.name,
                data.len()
            )));
        }
        let state = self.state.as_mut().ok_or_else(|| not_keyed(self.name))?;
        for block in data.chunks_exact_mut(AES_BLOCK) {
            let block = GenericArray::from_mut_slice(block);
            match state {
                CbcState::Enc128(c) => c.encrypt_block_mut(block),
                CbcState::Dec128(c) => c.decrypt_block_mut(block),
                CbcState::Enc256(c) => c.encrypt_block_mut(block),
                CbcState::Dec256(c) => c.decrypt_block_mut(block),
            }
        }
        Ok(())
    }
}

fn sized<'a>(
    key: &'a [u8],
    key_size: usize,
    iv: &'a [u8],
    iv_size: usize,
) -> FynxResult<(&'a [u8], &'a [u8])> {
    if key.len() < key_size || iv.len() < iv_size {
        return Err(FynxError::Security(format!(
            "Key material too short: key {} of {}, iv {} of {}",
            key.len(),
            key_size,
            iv.len(),
            iv_size
        )));
    }
    Ok((&key[..key_size], &iv[..iv_size]))
}

fn not_keyed(name: &str) -> FynxError {
    FynxError::Security(format!("{} used before init", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(name: &str) -> (Box<dyn Cipher>, Box<dyn Cipher>) {
        let registry = AlgorithmRegistry::with_defaults();
        let mut enc = registry.cipher(name).unwrap();
        let mut dec = registry.cipher(name).unwrap();
        let key = vec![0x42u8; 40];
        let iv = vec![0x24u8; 20];
        enc.init(CipherMode::Encrypt, &key, &iv).unwrap();
        dec.init(CipherMode::Decrypt, &key, &iv).unwrap();
        (enc, dec)
    }

    #[test]
    fn test_ctr_stream_continues_across_calls() {
        let (mut enc, mut dec) = pair("aes128-ctr");
        let plain: Vec<u8> = (0..64u8).collect();

        let mut first = plain[..32].to_vec();
        let mut second = plain[32..].to_vec();
        enc.update(&mut first).unwrap();
        enc.update(&mut second).unwrap();
        assert_ne!(&first[..], &plain[..32]);

        dec.update(&mut first).unwrap();
        dec.update(&mut second).unwrap();
        assert_eq!([first, second].concat(), plain);
    }

    #[test]
    fn test_cbc_roundtrip_and_block_check() {
        let (mut enc, mut dec) = pair("aes256-cbc");
        let mut data = vec![7u8; 48];
        enc.update(&mut data).unwrap();
        dec.update(&mut data).unwrap();
        assert_eq!(data, vec![7u8; 48]);

        let mut odd = vec![0u8; 15];
        assert!(enc.update(&mut odd).is_err());
    }

    #[test]
    fn test_short_key_rejected() {
        let mut cipher = AesCtr::new(32);
        let err = cipher
            .init(CipherMode::Encrypt, &[0u8; 16], &[0u8; 16])
            .unwrap_err();
        assert!(matches!(err, FynxError::Security(_)));
    }

    #[test]
    fn test_unkeyed_update_fails() {
        let mut cipher = AesCtr::new(16);
        assert!(cipher.update(&mut [0u8; 16]).is_err());
        assert!(NoneCipher.is_none());
    }
}
