//! Password scrambles and the RSA encryption used during authentication.
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(nonce[..20] + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password (fast path)
//!
//! ```text
//! SHA256(password) XOR SHA256(SHA256(SHA256(password)) + nonce)
//! ```
//!
//! # RSA (full authentication without a secure channel)
//!
//! The NUL-terminated password is XOR-ed with the nonce, padded, and
//! raised to the key's public exponent. The key arrives as PEM; its DER
//! body is walked strictly first and scanned for INTEGERs if that fails.
//! Only the public operation is needed, so `rsa::BigUint` supplies the
//! arithmetic and everything else is done here.

#![allow(clippy::cast_possible_truncation)]

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::BigUint;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sqlwire_core::Error;

use crate::error::rsa_error;

/// Nonce bytes used by the SHA-1 and RSA paths.
pub const SCRAMBLE_LENGTH: usize = 20;

/// Nonce bytes used by the pre-4.1 scramble.
pub const SCRAMBLE_LENGTH_323: usize = 8;

/// PKCS#1 v1.5 overhead: `00 02`, at least 8 padding bytes, `00`.
const PKCS1_OVERHEAD: usize = 11;

/// Rounds of fresh randomness before padding falls back to a fixed filler.
const PAD_RETRIES: usize = 8;

/// Padding scheme for the RSA password exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RsaPadding {
    /// PKCS#1 v1.5 (`00 02 PS 00 M`)
    #[default]
    Pkcs1v15,
    /// OAEP with SHA-1 and MGF1-SHA-1, required by servers from 8.0.5
    Oaep,
}

/// Compute the mysql_native_password response. Empty for an empty password.
pub fn scramble_native(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let nonce = &nonce[..nonce.len().min(SCRAMBLE_LENGTH)];

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Compute the caching_sha2_password fast-path response (32 bytes).
/// Empty for an empty password.
pub fn scramble_caching_sha2(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let p1: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let p2: [u8; 32] = Sha256::digest(p1).into();
    let mut hasher = Sha256::new();
    hasher.update(p2);
    hasher.update(nonce);
    let p3: [u8; 32] = hasher.finalize().into();

    p1.iter().zip(p3.iter()).map(|(a, b)| a ^ b).collect()
}

/// The 3.23-era password hash: two 31-bit words. Spaces and tabs are skipped.
fn hash_323(bytes: &[u8]) -> (u64, u64) {
    let mut nr: u64 = 1_345_345_333;
    let mut add: u64 = 7;
    let mut nr2: u64 = 0x1234_5671;
    for &c in bytes.iter().filter(|&&b| b != b' ' && b != b'\t') {
        let c = u64::from(c);
        nr ^= ((((nr & 63) + add) * c) + (nr << 8)) & 0xFFFF_FFFF;
        nr2 = (nr2 + ((nr2 << 8) ^ nr)) & 0xFFFF_FFFF;
        add = (add + c) & 0xFFFF_FFFF;
    }
    (nr & 0x7FFF_FFFF, nr2 & 0x7FFF_FFFF)
}

struct Rand323 {
    seed1: u64,
    seed2: u64,
}

impl Rand323 {
    const MAX: u64 = 0x3FFF_FFFF;

    fn new(seed1: u64, seed2: u64) -> Self {
        Self {
            seed1: seed1 % Self::MAX,
            seed2: seed2 % Self::MAX,
        }
    }

    fn next(&mut self) -> f64 {
        self.seed1 = (self.seed1 * 3 + self.seed2) % Self::MAX;
        self.seed2 = (self.seed1 + self.seed2 + 33) % Self::MAX;
        self.seed1 as f64 / Self::MAX as f64
    }
}

/// Compute the legacy (pre-4.1) old-password scramble over `nonce[..8]`.
/// Empty for an empty password.
pub fn scramble_old(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let message = &nonce[..nonce.len().min(SCRAMBLE_LENGTH_323)];
    let (p1, p2) = hash_323(password.as_bytes());
    let (m1, m2) = hash_323(message);
    let mut rng = Rand323::new(p1 ^ m1, p2 ^ m2);

    let mut out: Vec<u8> = (0..message.len())
        .map(|_| (rng.next() * 31.0).floor() as u8 + 64)
        .collect();
    let extra = (rng.next() * 31.0).floor() as u8;
    for b in &mut out {
        *b ^= extra;
    }
    out
}

/// XOR the NUL-terminated password with the nonce, repeating the nonce.
pub fn xor_password(password: &str, nonce: &[u8]) -> Vec<u8> {
    let mut out = password.as_bytes().to_vec();
    out.push(0);
    let nonce = &nonce[..nonce.len().min(SCRAMBLE_LENGTH)];
    if !nonce.is_empty() {
        for (i, b) in out.iter_mut().enumerate() {
            *b ^= nonce[i % nonce.len()];
        }
    }
    out
}

/// An RSA public key recovered from the server's PEM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    pub modulus: BigUint,
    pub exponent: BigUint,
    /// Modulus width in bytes; every ciphertext has exactly this length.
    pub size: usize,
}

impl RsaPublicKey {
    fn from_integers(modulus: &[u8], exponent: &[u8]) -> Result<Self, Error> {
        let modulus = strip_leading_zeros(modulus);
        let exponent = strip_leading_zeros(exponent);
        if modulus.len() < PKCS1_OVERHEAD + 1 || exponent.is_empty() {
            return Err(rsa_error("RSA public key has an unusable modulus or exponent"));
        }
        Ok(Self {
            size: modulus.len(),
            modulus: BigUint::from_bytes_be(modulus),
            exponent: BigUint::from_bytes_be(exponent),
        })
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Parse a PEM public key (`BEGIN PUBLIC KEY` or `BEGIN RSA PUBLIC KEY`).
pub fn parse_public_key(pem: &[u8]) -> Result<RsaPublicKey, Error> {
    let der = pem_to_der(pem)?;
    if let Some((n, e)) = walk_public_key(&der) {
        return RsaPublicKey::from_integers(n, e);
    }
    tracing::debug!(len = der.len(), "strict key walk failed, scanning for integers");
    let (n, e) = scan_integers(&der)
        .ok_or_else(|| rsa_error("Malformed RSA public key: no modulus found"))?;
    RsaPublicKey::from_integers(n, e)
}

fn pem_to_der(pem: &[u8]) -> Result<Vec<u8>, Error> {
    let text = std::str::from_utf8(pem)
        .map_err(|e| rsa_error(format!("RSA public key is not valid PEM text: {e}")))?;
    let body: String = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    if body.is_empty() {
        return Err(rsa_error("RSA public key PEM has no body"));
    }
    STANDARD
        .decode(body.as_bytes())
        .map_err(|e| rsa_error(format!("RSA public key PEM is not base64: {e}")))
}

const TAG_INTEGER: u8 = 0x02;
const TAG_BIT_STRING: u8 = 0x03;
const TAG_SEQUENCE: u8 = 0x30;

/// One DER element: tag, contents, and the remainder after it.
fn read_tlv(data: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = data.split_first()?;
    let (&first, mut rest) = rest.split_first()?;
    let len = if first < 0x80 {
        usize::from(first)
    } else {
        let count = usize::from(first & 0x7F);
        if count == 0 || count > 4 || rest.len() < count {
            return None;
        }
        let len = rest[..count]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
        rest = &rest[count..];
        len
    };
    if rest.len() < len {
        return None;
    }
    Some((tag, &rest[..len], &rest[len..]))
}

/// SubjectPublicKeyInfo or PKCS#1 RSAPublicKey.
fn walk_public_key(der: &[u8]) -> Option<(&[u8], &[u8])> {
    let (tag, body, _) = read_tlv(der)?;
    if tag != TAG_SEQUENCE {
        return None;
    }
    let (first_tag, first, rest) = read_tlv(body)?;
    match first_tag {
        TAG_INTEGER => {
            let (tag, exponent, _) = read_tlv(rest)?;
            (tag == TAG_INTEGER).then_some((first, exponent))
        }
        // AlgorithmIdentifier, then BIT STRING wrapping the PKCS#1 key
        TAG_SEQUENCE => {
            let (tag, bits, _) = read_tlv(rest)?;
            if tag != TAG_BIT_STRING {
                return None;
            }
            let (&unused, inner) = bits.split_first()?;
            if unused != 0 {
                return None;
            }
            walk_public_key(inner)
        }
        _ => None,
    }
}

/// Permissive fallback: the largest INTEGER is the modulus and the INTEGER
/// after it is the exponent.
fn scan_integers(der: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut integers = Vec::new();
    let mut pos = 0;
    while pos < der.len() {
        if der[pos] == TAG_INTEGER {
            if let Some((_, value, rest)) = read_tlv(&der[pos..]) {
                if !value.is_empty() {
                    integers.push(value);
                    pos = der.len() - rest.len();
                    continue;
                }
            }
        }
        pos += 1;
    }
    let (idx, _) = integers
        .iter()
        .enumerate()
        .max_by_key(|(i, v)| (strip_leading_zeros(v).len(), std::cmp::Reverse(*i)))?;
    let exponent = *integers.get(idx + 1)?;
    Some((integers[idx], exponent))
}

/// Random non-zero bytes. If the OS source keeps failing or keeps returning
/// zeros, the remainder is filled with `0xFF`.
fn nonzero_random(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..PAD_RETRIES {
        let missing = len - out.len();
        if missing == 0 {
            break;
        }
        let mut buf = vec![0u8; missing + 8];
        if OsRng.try_fill_bytes(&mut buf).is_err() {
            continue;
        }
        out.extend(buf.into_iter().filter(|&b| b != 0).take(missing));
    }
    if out.len() < len {
        tracing::warn!(
            missing = len - out.len(),
            "secure random source exhausted, padding with fixed filler"
        );
        out.resize(len, 0xFF);
    }
    out
}

/// PKCS#1 v1.5 encryption padding: `00 02 PS 00 M`, `PS` non-zero random.
pub fn pkcs1_v15_pad(message: &[u8], key_bytes: usize) -> Result<Vec<u8>, Error> {
    if message.len() + PKCS1_OVERHEAD > key_bytes {
        return Err(rsa_error(format!(
            "Password too long for RSA key: {} bytes, limit {}",
            message.len(),
            key_bytes.saturating_sub(PKCS1_OVERHEAD)
        )));
    }
    let ps_len = key_bytes - message.len() - 3;
    let mut out = Vec::with_capacity(key_bytes);
    out.extend_from_slice(&[0x00, 0x02]);
    out.extend(nonzero_random(ps_len));
    out.push(0x00);
    out.extend_from_slice(message);
    Ok(out)
}

fn mgf1_sha1(seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 20);
    let mut counter: u32 = 0;
    while out.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(seed);
        hasher.update(counter.to_be_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

/// OAEP encoding with SHA-1, MGF1-SHA-1 and an empty label.
pub fn oaep_sha1_pad(message: &[u8], key_bytes: usize) -> Result<Vec<u8>, Error> {
    const H_LEN: usize = 20;
    if message.len() + 2 * H_LEN + 2 > key_bytes {
        return Err(rsa_error(format!(
            "Password too long for RSA key: {} bytes, limit {}",
            message.len(),
            key_bytes.saturating_sub(2 * H_LEN + 2)
        )));
    }
    let db_len = key_bytes - H_LEN - 1;
    let mut db = Vec::with_capacity(db_len);
    db.extend_from_slice(&Sha1::digest(b""));
    db.resize(db_len - message.len() - 1, 0);
    db.push(0x01);
    db.extend_from_slice(message);

    let mut seed = [0u8; H_LEN];
    OsRng
        .try_fill_bytes(&mut seed)
        .map_err(|e| rsa_error(format!("Secure random source unavailable: {e}")))?;

    for (b, m) in db.iter_mut().zip(mgf1_sha1(&seed, db_len)) {
        *b ^= m;
    }
    for (b, m) in seed.iter_mut().zip(mgf1_sha1(&db, H_LEN)) {
        *b ^= m;
    }

    let mut out = Vec::with_capacity(key_bytes);
    out.push(0x00);
    out.extend_from_slice(&seed);
    out.extend_from_slice(&db);
    Ok(out)
}

/// Pad `message` and compute `m^e mod n`, big-endian at the key's width.
pub fn rsa_encrypt(
    message: &[u8],
    key: &RsaPublicKey,
    padding: RsaPadding,
) -> Result<Vec<u8>, Error> {
    let padded = match padding {
        RsaPadding::Pkcs1v15 => pkcs1_v15_pad(message, key.size)?,
        RsaPadding::Oaep => oaep_sha1_pad(message, key.size)?,
    };
    let m = BigUint::from_bytes_be(&padded);
    let c = m.modpow(&key.exponent, &key.modulus).to_bytes_be();

    let mut out = vec![0u8; key.size.saturating_sub(c.len())];
    out.extend_from_slice(&c);
    Ok(out)
}

/// The full RSA password exchange: XOR with the nonce, parse the key, encrypt.
pub fn sha2_rsa_encrypt(
    password: &str,
    nonce: &[u8],
    public_key_pem: &[u8],
    padding: RsaPadding,
) -> Result<Vec<u8>, Error> {
    let message = xor_password(password, nonce);
    let key = parse_public_key(public_key_pem)?;
    rsa_encrypt(&message, &key, padding)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::{Oaep, Pkcs1v15Encrypt, RsaPrivateKey};
    use std::sync::OnceLock;

    const NONCE: [u8; 20] = [
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
    ];

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// One 1024-bit key shared by every test in the crate.
    pub(crate) fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 1024).expect("generate RSA key"))
    }

    pub(crate) fn test_key_pem() -> String {
        test_key()
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("encode public key")
    }

    #[test]
    fn native_scramble_known_vector() {
        assert_eq!(
            hex(&scramble_native("secret", &NONCE)),
            "b32bb3a583e1340c0a1108d58b1be49781ad8c2f"
        );
        // only the first 20 nonce bytes count
        let mut long = NONCE.to_vec();
        long.push(0);
        assert_eq!(scramble_native("secret", &long), scramble_native("secret", &NONCE));
    }

    #[test]
    fn caching_scramble_known_vector() {
        assert_eq!(
            hex(&scramble_caching_sha2("secret", &NONCE)),
            "746ebe205d56a0707acb3e796e834e0dd7b1d61743b26bd5202c7a623230c7c9"
        );
    }

    #[test]
    fn scrambles_are_empty_for_empty_password() {
        assert!(scramble_native("", &NONCE).is_empty());
        assert!(scramble_caching_sha2("", &NONCE).is_empty());
        assert!(scramble_old("", &NONCE).is_empty());
    }

    #[test]
    fn scrambles_are_sensitive_to_every_input() {
        let mut nonce = NONCE;
        nonce[19] ^= 1;
        assert_ne!(scramble_native("secret", &NONCE), scramble_native("secret", &nonce));
        assert_ne!(scramble_native("secret", &NONCE), scramble_native("secreT", &NONCE));
        assert_ne!(
            scramble_caching_sha2("secret", &NONCE),
            scramble_caching_sha2("secret", &nonce)
        );
        assert_ne!(
            scramble_caching_sha2("secret", &NONCE),
            scramble_caching_sha2("secreT", &NONCE)
        );
    }

    #[test]
    fn old_password_hash_matches_server() {
        // OLD_PASSWORD('password') = 5d2e19393cc5ef67
        assert_eq!(hash_323(b"password"), (0x5d2e_1939, 0x3cc5_ef67));
    }

    #[test]
    fn old_scramble_known_vector_ignores_whitespace() {
        assert_eq!(hex(&scramble_old("secret", &NONCE)), "415b5a4d404e5e50");
        assert_eq!(scramble_old("se cr\tet", &NONCE), scramble_old("secret", &NONCE));
    }

    #[test]
    fn xor_password_cycles_nonce() {
        let out = xor_password("ab", &[1, 2]);
        assert_eq!(out, vec![b'a' ^ 1, b'b' ^ 2, 1]);
        assert_eq!(xor_password("", &[]), vec![0]);
    }

    #[test]
    fn pkcs1_padding_shape() {
        let message = b"hello";
        let a = pkcs1_v15_pad(message, 128).unwrap();
        let b = pkcs1_v15_pad(message, 128).unwrap();
        for padded in [&a, &b] {
            assert_eq!(padded.len(), 128);
            assert_eq!(&padded[..2], &[0x00, 0x02]);
            let ps = &padded[2..128 - message.len() - 1];
            assert!(ps.len() >= 8);
            assert!(ps.iter().all(|&x| x != 0));
            assert_eq!(padded[128 - message.len() - 1], 0);
            assert!(padded.ends_with(message));
        }
        assert_ne!(a, b);
    }

    #[test]
    fn pkcs1_rejects_long_message() {
        assert!(pkcs1_v15_pad(&[1u8; 117], 128).is_ok());
        let err = pkcs1_v15_pad(&[1u8; 118], 128).unwrap_err();
        assert_eq!(err.vendor_code(), Some(2061));
    }

    #[test]
    fn parses_spki_and_pkcs1_pem() {
        let public = test_key().to_public_key();
        let spki = parse_public_key(test_key_pem().as_bytes()).unwrap();
        let pkcs1_pem = public.to_pkcs1_pem(LineEnding::LF).unwrap();
        let pkcs1 = parse_public_key(pkcs1_pem.as_bytes()).unwrap();
        assert_eq!(spki, pkcs1);
        assert_eq!(spki.size, 128);
        assert_eq!(spki.exponent, BigUint::from(65_537u32));
    }

    #[test]
    fn integer_scan_recovers_wrapped_key() {
        let der = test_key().to_public_key().to_pkcs1_der().unwrap();
        let mut wrapped = vec![0x04, 0x00];
        wrapped.extend_from_slice(der.as_bytes());
        let pem = format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            STANDARD.encode(&wrapped)
        );
        assert!(walk_public_key(&wrapped).is_none());
        let key = parse_public_key(pem.as_bytes()).unwrap();
        assert_eq!(key.size, 128);
        assert_eq!(key.exponent, BigUint::from(65_537u32));
    }

    #[test]
    fn malformed_key_is_rejected() {
        assert!(parse_public_key(b"not a key").is_err());
        assert!(parse_public_key(b"-----BEGIN PUBLIC KEY-----\n!!!\n-----END PUBLIC KEY-----").is_err());
    }

    #[test]
    fn rsa_ciphertext_decrypts_with_private_key() {
        let pem = test_key_pem();
        let ct = sha2_rsa_encrypt("secret", &NONCE, pem.as_bytes(), RsaPadding::Pkcs1v15).unwrap();
        assert_eq!(ct.len(), 128);
        let plain = test_key().decrypt(Pkcs1v15Encrypt, &ct).unwrap();
        assert_eq!(plain, xor_password("secret", &NONCE));
    }

    #[test]
    fn oaep_ciphertext_decrypts_with_private_key() {
        let pem = test_key_pem();
        let ct = sha2_rsa_encrypt("secret", &NONCE, pem.as_bytes(), RsaPadding::Oaep).unwrap();
        assert_eq!(ct.len(), 128);
        let plain = test_key().decrypt(Oaep::new::<Sha1>(), &ct).unwrap();
        assert_eq!(plain, xor_password("secret", &NONCE));
    }
}
