// Copyright 2024 The matrix-e2ee Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The low level cryptographic primitives everything else is built on.
//!
//! All functions take byte slices and return either the produced bytes or a
//! [`CipherError`]; failures are never swallowed.

use aes::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use vodozemac::{
    pk_encryption::{Message, PkDecryption, PkEncryption},
    Curve25519PublicKey, Curve25519SecretKey, Ed25519PublicKey, Ed25519Signature,
};
use zeroize::Zeroizing;

use crate::{
    error::CipherError,
    utilities::{decode, encode},
};

pub const AES_256_KEY_LENGTH: usize = 32;
pub const AES_BLOCK_SIZE: usize = 16;
pub const HMAC_KEY_LENGTH: usize = 32;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// The maximum payload size the cipher layer accepts in one call.
const MAX_PAYLOAD_SIZE: usize = i32::MAX as usize;

/// Encrypt with AES-CTR-256 under the given key and caller-supplied IV.
pub fn aes_ctr_256_encrypt(
    plaintext: &[u8],
    key: &[u8; AES_256_KEY_LENGTH],
    iv: &[u8; AES_BLOCK_SIZE],
) -> Result<Vec<u8>, CipherError> {
    if plaintext.len() > MAX_PAYLOAD_SIZE {
        return Err(CipherError::PayloadTooLong(plaintext.len()));
    }

    let mut cipher = Aes256Ctr::new(key.into(), iv.into());
    let mut ciphertext = plaintext.to_vec();
    cipher.try_apply_keystream(&mut ciphertext).map_err(|_| CipherError::Aes)?;

    Ok(ciphertext)
}

/// Decrypt an AES-CTR-256 ciphertext.
pub fn aes_ctr_256_decrypt(
    ciphertext: &[u8],
    key: &[u8; AES_256_KEY_LENGTH],
    iv: &[u8; AES_BLOCK_SIZE],
) -> Result<Vec<u8>, CipherError> {
    if ciphertext.len() > MAX_PAYLOAD_SIZE {
        return Err(CipherError::PayloadTooLong(ciphertext.len()));
    }

    let mut cipher = Aes256Ctr::new(key.into(), iv.into());
    let mut plaintext = ciphertext.to_vec();
    cipher.try_apply_keystream(&mut plaintext).map_err(|_| CipherError::Aes)?;

    Ok(plaintext)
}

/// Generate a random IV for AES-CTR-256.
pub fn random_iv() -> [u8; AES_BLOCK_SIZE] {
    let mut iv = [0u8; AES_BLOCK_SIZE];
    crate::secure_buffer::fill_from_secure_rng(&mut iv);
    iv
}

/// Derive `output_length` bytes with HKDF-SHA-256.
pub fn hkdf_sha256(
    key: &[u8],
    salt: &[u8],
    info: &[u8],
    output_length: usize,
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), key);
    let mut output = Zeroizing::new(vec![0u8; output_length]);

    hkdf.expand(info, &mut output)
        .map_err(|_| CipherError::WrongDerivedKeyLength(output_length))?;

    Ok(output)
}

/// Compute an HMAC-SHA-256 tag over the data.
pub fn hmac_sha256(key: &[u8; HMAC_KEY_LENGTH], data: &[u8]) -> [u8; 32] {
    let mut hmac = Hmac::<Sha256>::new_from_slice(key)
        .expect("HMAC can be initialised with a 32 byte key");
    hmac.update(data);

    hmac.finalize().into_bytes().into()
}

/// Check an HMAC-SHA-256 tag in constant time.
pub fn hmac_sha256_verify(
    key: &[u8; HMAC_KEY_LENGTH],
    data: &[u8],
    tag: &[u8],
) -> Result<(), CipherError> {
    let expected = hmac_sha256(key, data);

    if expected.ct_eq(tag).into() {
        Ok(())
    } else {
        Err(CipherError::Hmac)
    }
}

/// Stretch a passphrase with PBKDF2-HMAC-SHA-512.
pub fn pbkdf2_hmac_sha512(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
    output_length: usize,
) -> Zeroizing<Vec<u8>> {
    let mut output = Zeroizing::new(vec![0u8; output_length]);
    pbkdf2::pbkdf2::<Hmac<Sha512>>(passphrase, salt, iterations, &mut output)
        .expect("HMAC can be initialised with any key length");
    output
}

/// Fill a buffer from the OS entropy source. See
/// [`fill_from_secure_rng`](crate::secure_buffer::fill_from_secure_rng) for
/// the word-aligned variant used for fixed buffers.
pub fn random_bytes(length: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Decode a string in the base58 alphabet Matrix recovery keys use.
///
/// Leading `'1'` characters decode to leading zero bytes.
pub fn base58_decode(encoded: &str) -> Result<Vec<u8>, CipherError> {
    bs58::decode(encoded).into_vec().map_err(|_| CipherError::InvalidBase58)
}

/// The triplet produced by the Curve25519 hybrid encryption scheme.
///
/// All three fields are unpadded base64.
#[derive(Clone, Debug)]
pub struct Curve25519Encrypted {
    pub ciphertext: String,
    pub mac: String,
    pub ephemeral: String,
}

/// Encrypt a payload for a Curve25519 public key.
pub fn curve25519_aes_sha2_encrypt(
    plaintext: &[u8],
    public_key: &str,
) -> Result<Curve25519Encrypted, CipherError> {
    let key = Curve25519PublicKey::from_base64(public_key)?;
    let message = PkEncryption::from_key(key).encrypt(plaintext);

    Ok(Curve25519Encrypted {
        ciphertext: encode(&message.ciphertext),
        mac: encode(&message.mac),
        ephemeral: message.ephemeral_key.to_base64(),
    })
}

/// Decrypt a Curve25519 hybrid triplet with the recipient's private key.
pub fn curve25519_aes_sha2_decrypt(
    encrypted: &Curve25519Encrypted,
    private_key: &[u8; 32],
) -> Result<Vec<u8>, CipherError> {
    let message = Message {
        ciphertext: decode(&encrypted.ciphertext).map_err(|_| CipherError::InvalidBase64)?,
        mac: decode(&encrypted.mac).map_err(|_| CipherError::InvalidBase64)?,
        ephemeral_key: Curve25519PublicKey::from_base64(&encrypted.ephemeral)?,
    };

    let decryption = PkDecryption::from_key(Curve25519SecretKey::from_slice(private_key));
    decryption.decrypt(&message).map_err(|_| CipherError::Curve25519Decrypt)
}

/// Verify an Ed25519 signature given the unpadded base64 encodings of the key
/// and the signature.
pub fn ed25519_verify(
    key: &str,
    message: &[u8],
    signature: &str,
) -> Result<(), CipherError> {
    let key = Ed25519PublicKey::from_base64(key)?;
    let signature = Ed25519Signature::from_base64(signature)?;

    Ok(key.verify(message, &signature)?)
}
