use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey,
};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

use crate::error::ClientError;
use crate::protocol::{PublicKey, SymmetricKey};
use crate::{PUBLIC_KEY_SIZE, SYMMETRIC_KEY_SIZE};

pub const RSA_BITS: usize = 1024;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

// The relay protocol fixes the IV to all zeros, so identical plaintexts
// under the same key produce identical ciphertexts. A client targeting a
// different relay should switch to an AEAD mode with random nonces.
const AES_IV: [u8; 16] = [0u8; 16];

/// Long-term 1024-bit RSA identity keypair.
///
/// The public half serializes to PKCS#1 DER and is shipped inside the fixed
/// 160-byte wire field, zero-padded past the end of the DER document. The
/// private half serializes to PKCS#1 DER as well and is what lands
/// base64-encoded in the identity file.
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeyPair {
    /// Generate a fresh keypair from the OS entropy source.
    pub fn generate() -> Result<RsaKeyPair, ClientError> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|e| ClientError::Crypto(format!("RSA key generation failed: {e}")))?;
        let public = RsaPublicKey::from(&private);
        Ok(RsaKeyPair { private, public })
    }

    /// Load a keypair from its serialized private key.
    pub fn from_der(der: &[u8]) -> Result<RsaKeyPair, ClientError> {
        let private = RsaPrivateKey::from_pkcs1_der(der)
            .map_err(|e| ClientError::Crypto(format!("couldn't parse private key: {e}")))?;
        let public = RsaPublicKey::from(&private);
        Ok(RsaKeyPair { private, public })
    }

    pub fn private_der(&self) -> Result<Vec<u8>, ClientError> {
        let der = self
            .private
            .to_pkcs1_der()
            .map_err(|e| ClientError::Crypto(format!("couldn't serialize private key: {e}")))?;
        Ok(der.as_bytes().to_vec())
    }

    /// The 160-byte wire form of the public key.
    pub fn public_wire(&self) -> Result<PublicKey, ClientError> {
        let der = self
            .public
            .to_pkcs1_der()
            .map_err(|e| ClientError::Crypto(format!("couldn't serialize public key: {e}")))?;
        let der = der.as_bytes();
        if der.len() > PUBLIC_KEY_SIZE {
            return Err(ClientError::Crypto(format!(
                "public key serialization is {} bytes, larger than the {}-byte wire field",
                der.len(),
                PUBLIC_KEY_SIZE
            )));
        }
        let mut field = [0u8; PUBLIC_KEY_SIZE];
        field[..der.len()].copy_from_slice(der);
        Ok(PublicKey(field))
    }

    /// RSA-OAEP decryption with the private key. Used only for inbound
    /// session keys; anything that doesn't decrypt to a sane length is the
    /// caller's problem to reject.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ClientError> {
        self.private
            .decrypt(Oaep::new::<Sha1>(), ciphertext)
            .map_err(|_| ClientError::Crypto("RSA decryption failed".into()))
    }
}

/// RSA-OAEP encryption under a peer's wire-format public key. Produces a
/// fixed 128-byte ciphertext per operation.
pub fn rsa_encrypt(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, ClientError> {
    let der = der_document(&recipient.0)?;
    let key = RsaPublicKey::from_pkcs1_der(der)
        .map_err(|e| ClientError::Crypto(format!("couldn't parse peer public key: {e}")))?;
    key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), plaintext)
        .map_err(|_| ClientError::Crypto("RSA encryption failed".into()))
}

/// Recover the DER document from the zero-padded 160-byte wire field by
/// reading the length out of the outer SEQUENCE header.
fn der_document(field: &[u8]) -> Result<&[u8], ClientError> {
    let malformed = || ClientError::Crypto("malformed public key field".into());
    if field.len() < 2 || field[0] != 0x30 {
        return Err(malformed());
    }
    let (length, header) = match field[1] {
        short if short < 0x80 => (short as usize, 2),
        0x81 => {
            if field.len() < 3 {
                return Err(malformed());
            }
            (field[2] as usize, 3)
        }
        0x82 => {
            if field.len() < 4 {
                return Err(malformed());
            }
            (u16::from_be_bytes([field[2], field[3]]) as usize, 4)
        }
        _ => return Err(malformed()),
    };
    field.get(..header + length).ok_or_else(malformed)
}

/// Fill a fresh 16-byte AES key from the OS entropy source.
pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// AES-128-CBC encryption with PKCS#7 padding.
pub fn aes_encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), (&AES_IV).into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// AES-128-CBC decryption. Fails on an empty or non-block-aligned
/// ciphertext and on bad padding.
pub fn aes_decrypt(key: &SymmetricKey, ciphertext: &[u8]) -> Result<Vec<u8>, ClientError> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(ClientError::Crypto(
            "ciphertext length is not a whole number of blocks".into(),
        ));
    }
    Aes128CbcDec::new(key.into(), (&AES_IV).into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ClientError::Crypto("AES decryption failed".into()))
}
