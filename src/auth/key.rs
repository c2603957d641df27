//! # RSA Credentials
//!
//! A [`Credential`] is a 2048-bit RSA key pair (public exponent 65537) plus
//! an optional human-readable name.
//!
//! Two protocol-specific details live here:
//!
//! - **Signing**: the remote's 20-byte challenge is already a digest-sized
//!   token; it is wrapped in PKCS#1 v1.5 SHA-1 `DigestInfo` padding and
//!   signed directly, without hashing it again. This is not standard
//!   sign-the-message semantics.
//! - **Public-key payload**: the bootstrap-trust encoding the device expects
//!   is not a standard key format. It carries the modulus and two
//!   precomputed Montgomery constants (`n0inv`, `R² mod N`) in a fixed-size
//!   little-endian layout, base64-encoded with the key name appended.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey};
use sha1::Sha1;
use tracing::debug;

use crate::error::{BridgeError, Result};

/// RSA modulus size in bits.
pub const KEY_BITS: usize = 2048;

/// Modulus size in bytes.
const MODULUS_LEN: usize = KEY_BITS / 8;

/// Modulus size in 32-bit words, the first field of the encoded key.
const MODULUS_WORDS: u32 = (MODULUS_LEN / 4) as u32;

/// Fixed public exponent.
const EXPONENT: u32 = 65537;

/// Modular inverse of `a` over `m` by the extended Euclidean algorithm.
///
/// Returns `None` when no inverse exists: `m <= 1`, or `a` and `m` are not
/// coprime.
pub fn mod_inverse(a: u64, m: u64) -> Option<u64> {
    if m <= 1 {
        return None;
    }
    let a = (a % m) as i128;
    let m = m as i128;

    let (mut old_r, mut r) = (a, m);
    let (mut old_s, mut s) = (1i128, 0i128);
    while r != 0 {
        let q = old_r / r;
        (old_r, r) = (r, old_r - q * r);
        (old_s, s) = (s, old_s - q * s);
    }
    if old_r != 1 {
        return None;
    }
    Some(old_s.rem_euclid(m) as u64)
}

/// An RSA private key and the name attached to it.
pub struct Credential {
    key: RsaPrivateKey,
    name: String,
}

impl Credential {
    /// Wrap an existing private key.
    pub fn new(key: RsaPrivateKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
        }
    }

    /// Generate a fresh 2048-bit key pair. Used when no stored credential is
    /// accepted by the remote.
    pub fn generate(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        debug!(name = %name, "generating new credential");
        let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, KEY_BITS)
            .map_err(|e| BridgeError::Crypto(format!("key generation failed: {e}")))?;
        Ok(Self { key, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.key
    }

    /// Sign an authentication challenge.
    ///
    /// The challenge is treated as a precomputed SHA-1 digest: PKCS#1 v1.5
    /// `DigestInfo` padding is applied around the raw token and signed.
    pub fn sign(&self, challenge: &[u8]) -> Result<Vec<u8>> {
        self.key
            .sign(Pkcs1v15Sign::new::<Sha1>(), challenge)
            .map_err(|e| BridgeError::Crypto(format!("signing failed: {e}")))
    }

    /// Encode the public half in the bootstrap-trust wire format:
    /// `base64(n_words | n0inv | modulus_le | rr_le | exponent)`, a space,
    /// the key name, and a terminating NUL.
    pub fn public_key_payload(&self) -> Result<Vec<u8>> {
        let encoded = self.encode_public_key()?;
        let mut payload = BASE64.encode(encoded).into_bytes();
        payload.push(b' ');
        payload.extend_from_slice(self.name.as_bytes());
        payload.push(0);
        Ok(payload)
    }

    fn encode_public_key(&self) -> Result<Vec<u8>> {
        let n = self.key.n();

        // Montgomery negative inverse of the modulus low word over 2^32.
        let n_le = n.to_bytes_le();
        let mut low = [0u8; 4];
        low[..n_le.len().min(4)].copy_from_slice(&n_le[..n_le.len().min(4)]);
        let n_low = u64::from(u32::from_le_bytes(low));
        let inv = mod_inverse(n_low, 1u64 << 32)
            .ok_or_else(|| BridgeError::Crypto("modulus has no inverse mod 2^32".into()))?;
        let n0inv = ((1u64 << 32) - inv) as u32;

        // R^2 mod N with R = 2^KEY_BITS.
        let rr = (BigUint::from(1u32) << (2 * KEY_BITS)) % n;

        let mut out = Vec::with_capacity(8 + 2 * MODULUS_LEN + 4);
        out.extend_from_slice(&MODULUS_WORDS.to_le_bytes());
        out.extend_from_slice(&n0inv.to_le_bytes());
        out.extend_from_slice(&to_le_fixed(n, MODULUS_LEN)?);
        out.extend_from_slice(&to_le_fixed(&rr, MODULUS_LEN)?);
        out.extend_from_slice(&EXPONENT.to_le_bytes());
        Ok(out)
    }
}

impl std::fmt::Debug for Credential {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("bits", &KEY_BITS)
            .finish_non_exhaustive()
    }
}

/// Little-endian encoding of a big integer, zero-padded to `len` bytes.
fn to_le_fixed(value: &BigUint, len: usize) -> Result<Vec<u8>> {
    let mut bytes = value.to_bytes_le();
    if bytes.len() > len {
        return Err(BridgeError::Crypto(format!(
            "integer does not fit in {len} bytes"
        )));
    }
    bytes.resize(len, 0);
    Ok(bytes)
}
