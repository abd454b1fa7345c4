//! Cryptographic primitives for ForgeChain

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Number of checksum bytes appended to the public key hash inside an address.
pub const CHECKSUM_LENGTH: usize = 4;

/// Length of a RIPEMD-160 public key hash.
pub const PUBLIC_KEY_HASH_SIZE: usize = 20;

pub type Sha256Hash = [u8; 32];

/// SHA-256 of arbitrary data.
pub fn sha256(data: &[u8]) -> Sha256Hash {
    Sha256::digest(data).into()
}

/// The locking hash of a public key: RIPEMD-160 over the raw key bytes.
pub fn public_key_hash(public_key: &[u8]) -> Vec<u8> {
    Ripemd160::digest(public_key).to_vec()
}

/// First four bytes of a double SHA-256.
pub fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LENGTH] {
    let second = Sha256::digest(Sha256::digest(payload));
    let mut out = [0u8; CHECKSUM_LENGTH];
    out.copy_from_slice(&second[..CHECKSUM_LENGTH]);
    out
}

/// Encodes a public key hash as a base58 address with a trailing checksum.
pub fn address_from_pub_key_hash(pub_key_hash: &[u8]) -> String {
    let mut full = pub_key_hash.to_vec();
    full.extend_from_slice(&checksum(pub_key_hash));
    bs58::encode(full).into_string()
}

/// Decodes an address back to its public key hash, verifying the checksum.
pub fn pub_key_hash_from_address(address: &str) -> Result<Vec<u8>, ChainError> {
    let full = bs58::decode(address)
        .into_vec()
        .map_err(|e| ChainError::InvalidAddress(format!("{}: {}", address, e)))?;
    if full.len() <= CHECKSUM_LENGTH {
        return Err(ChainError::InvalidAddress(format!(
            "{}: too short ({} bytes)",
            address,
            full.len()
        )));
    }
    let (hash, actual) = full.split_at(full.len() - CHECKSUM_LENGTH);
    if checksum(hash).as_slice() != actual {
        return Err(ChainError::InvalidAddress(format!(
            "{}: checksum mismatch",
            address
        )));
    }
    Ok(hash.to_vec())
}

pub fn validate_address(address: &str) -> bool {
    pub_key_hash_from_address(address).is_ok()
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Result<Self, ChainError> {
        let secret_key = SecretKey::new(&mut OsRng);
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    /// Creates a KeyPair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        Ok(Self::from_secret_key(secret_key))
    }

    /// Returns the KeyPair's public key as a compressed byte array.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    pub fn public_key_hash(&self) -> Vec<u8> {
        public_key_hash(&self.public_key_bytes())
    }

    /// Checksummed base58 address of this key pair.
    pub fn address(&self) -> String {
        address_from_pub_key_hash(&self.public_key_hash())
    }

    /// Signs a message (which is first hashed using SHA-256) and returns the compact signature bytes.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE], ChainError> {
        let digest = Sha256::digest(message);

        let message = Message::from_digest_slice(&digest)
            .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;

        let signature = SECP256K1_CONTEXT.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_compact())
    }
}

/// Verifies an ECDSA signature given the raw public key bytes, message, and signature bytes.
pub fn verify_signature(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), ChainError> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))?;

    let digest = Sha256::digest(message);

    let message = Message::from_digest_slice(&digest)
        .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;

    let signature = Signature::from_compact(signature_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let keypair = KeyPair::generate().unwrap();
        assert_eq!(keypair.public_key_bytes().len(), PUBLIC_KEY_SIZE);
        assert_eq!(keypair.secret_key.as_ref().len(), SECRET_KEY_SIZE);
    }

    #[test]
    fn test_address_round_trip() {
        let keypair = KeyPair::generate().unwrap();
        let address = keypair.address();

        assert!(validate_address(&address));
        let hash = pub_key_hash_from_address(&address).unwrap();
        assert_eq!(hash.len(), PUBLIC_KEY_HASH_SIZE);
        assert_eq!(hash, keypair.public_key_hash());
    }

    #[test]
    fn test_corrupted_address_rejected() {
        let keypair = KeyPair::generate().unwrap();
        let mut bytes = bs58::decode(keypair.address()).into_vec().unwrap();
        bytes[0] ^= 0xFF;
        let corrupted = bs58::encode(bytes).into_string();

        assert!(!validate_address(&corrupted));
        assert!(matches!(
            pub_key_hash_from_address(&corrupted),
            Err(ChainError::InvalidAddress(_))
        ));
        assert!(!validate_address("0OIl"));
        assert!(!validate_address(""));
    }

    #[test]
    fn test_signing_and_verification() {
        let keypair = KeyPair::generate().unwrap();
        let message = b"Hello, ForgeChain!";

        let signature = keypair.sign(message).unwrap();
        let pubkey_bytes = keypair.public_key_bytes();

        assert!(verify_signature(&pubkey_bytes, message, &signature).is_ok());
        assert_eq!(signature.len(), COMPACT_SIGNATURE_SIZE);
    }

    #[test]
    fn test_invalid_signature() {
        let keypair1 = KeyPair::generate().unwrap();
        let keypair2 = KeyPair::generate().unwrap();

        let message = b"Test message";
        let signature = keypair1.sign(message).unwrap();

        let result = verify_signature(&keypair2.public_key_bytes(), message, &signature);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Cryptographic error: Signature verification failed"
        );
    }

    #[test]
    fn test_invalid_key_or_sig_length_check() {
        let keypair = KeyPair::generate().unwrap();
        let message = b"Test";
        let signature = keypair.sign(message).unwrap();
        let pubkey_bytes = keypair.public_key_bytes();

        let result = verify_signature(&pubkey_bytes[1..], message, &signature);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Public key must be exactly"));

        let result = verify_signature(&pubkey_bytes, message, &signature[1..]);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Signature must be exactly"));
    }

    #[test]
    fn test_from_secret_bytes_invalid_length() {
        let short_bytes = [0u8; SECRET_KEY_SIZE - 1];
        let result = KeyPair::from_secret_bytes(&short_bytes);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Secret key must be"));
    }
}
