//! The opaque crypto facade consumed by the key manager.
//!
//! Splits in two: [`CryptoRandom`] covers key generation and is all the
//! metadata mutators need, while [`Crypto`] adds the device-private
//! asymmetric operations (the local secret keys never leave the
//! implementation). [`LocalCrypto`] is the production implementation backed
//! by the OS RNG and the caller device's key ring.

use std::future::Future;

use rand::{rngs::OsRng, RngCore};

use crate::{
    error::CryptoError,
    keys::{
        BlockServerHalf, ClientHalf, DevicePrivateKey, DevicePublicKey, EncryptedClientHalf,
        EphemeralPrivateKey, EphemeralPublicKey, FolderKey, ServerHalf, TlfPrivateKey,
        TlfPublicKey, KEY_SIZE,
    },
    seal::{open_client_half, NONCE_RANDOM_SIZE},
};

/// One per-device wrapping offered to the any-device decryption path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateClientHalf {
    /// The device the wrapping is sealed to.
    pub device: DevicePublicKey,
    /// The ephemeral key it was sealed under.
    pub ephemeral: EphemeralPublicKey,
    /// The sealed client half.
    pub encrypted: EncryptedClientHalf,
}

/// Key-generation half of the crypto facade.
///
/// # Invariants
///
/// - `random_bytes` uses cryptographically secure entropy in production
/// - Generated key pairs are fresh on every call
pub trait CryptoRandom: Send + Sync {
    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a fresh server half.
    fn random_server_half(&self) -> ServerHalf {
        let mut bytes = [0u8; KEY_SIZE];
        self.random_bytes(&mut bytes);
        ServerHalf::from_bytes(bytes)
    }

    /// Generates a fresh server half for one block's key.
    fn random_block_server_half(&self) -> BlockServerHalf {
        let mut bytes = [0u8; KEY_SIZE];
        self.random_bytes(&mut bytes);
        BlockServerHalf::from_bytes(bytes)
    }

    /// Generates a fresh nonce suffix for the sealing operations.
    fn random_nonce_suffix(&self) -> [u8; NONCE_RANDOM_SIZE] {
        let mut bytes = [0u8; NONCE_RANDOM_SIZE];
        self.random_bytes(&mut bytes);
        bytes
    }

    /// Generates a fresh folder key pair and symmetric folder key for a new
    /// key generation.
    fn random_folder_keypair(&self) -> (TlfPublicKey, TlfPrivateKey, FolderKey) {
        let mut bytes = [0u8; KEY_SIZE];
        self.random_bytes(&mut bytes);
        let private = TlfPrivateKey::from_bytes(bytes);
        let public = private.public_key();

        let mut key_bytes = [0u8; KEY_SIZE];
        self.random_bytes(&mut key_bytes);
        (public, private, FolderKey::from_bytes(key_bytes))
    }

    /// Generates a fresh ephemeral key pair for one rekey pass.
    fn random_ephemeral_keypair(&self) -> (EphemeralPublicKey, EphemeralPrivateKey) {
        let mut bytes = [0u8; KEY_SIZE];
        self.random_bytes(&mut bytes);
        let private = EphemeralPrivateKey::from_bytes(bytes);
        (private.public_key(), private)
    }
}

/// The full crypto facade: randomness plus device-private decryption.
///
/// The asymmetric operations are async because a real implementation may
/// have to reach a key agent or prompt the user for a paper key.
pub trait Crypto: CryptoRandom + Clone + Send + Sync + 'static {
    /// Open a sealed client half with the current device's key.
    fn decrypt_client_half(
        &self,
        ephemeral: &EphemeralPublicKey,
        encrypted: &EncryptedClientHalf,
    ) -> impl Future<Output = Result<ClientHalf, CryptoError>> + Send;

    /// Try each candidate wrapping until one opens, returning the opened
    /// half and the index of the candidate that worked.
    ///
    /// Paper-key-derived device keys are consulted only when `prompt_paper`
    /// is set, since using one requires user interaction.
    ///
    /// # Errors
    ///
    /// - `NoSecretKey`: no local key opened any candidate
    fn decrypt_client_half_any(
        &self,
        candidates: Vec<CandidateClientHalf>,
        prompt_paper: bool,
    ) -> impl Future<Output = Result<(ClientHalf, usize), CryptoError>> + Send;
}

/// Production crypto facade holding the caller device's private keys.
///
/// Cloning shares nothing mutable; the key material is copied.
#[derive(Clone)]
pub struct LocalCrypto {
    device_key: DevicePrivateKey,
    paper_keys: Vec<DevicePrivateKey>,
}

impl LocalCrypto {
    /// Creates a facade for a device with no paper keys provisioned.
    pub fn new(device_key: DevicePrivateKey) -> Self {
        Self { device_key, paper_keys: Vec::new() }
    }

    /// Creates a facade for a device with paper-derived backup keys.
    pub fn with_paper_keys(device_key: DevicePrivateKey, paper_keys: Vec<DevicePrivateKey>) -> Self {
        Self { device_key, paper_keys }
    }

    /// The public key of the device this facade decrypts for.
    pub fn device_public_key(&self) -> DevicePublicKey {
        self.device_key.public_key()
    }

    fn try_open_any(
        &self,
        candidates: &[CandidateClientHalf],
        prompt_paper: bool,
    ) -> Result<(ClientHalf, usize), CryptoError> {
        for (index, candidate) in candidates.iter().enumerate() {
            if let Ok(half) =
                open_client_half(&self.device_key, &candidate.ephemeral, &candidate.encrypted)
            {
                return Ok((half, index));
            }
        }
        if prompt_paper {
            for paper in &self.paper_keys {
                for (index, candidate) in candidates.iter().enumerate() {
                    if let Ok(half) =
                        open_client_half(paper, &candidate.ephemeral, &candidate.encrypted)
                    {
                        return Ok((half, index));
                    }
                }
            }
        }
        Err(CryptoError::NoSecretKey { tried: candidates.len() })
    }
}

impl CryptoRandom for LocalCrypto {
    fn random_bytes(&self, buffer: &mut [u8]) {
        OsRng.fill_bytes(buffer);
    }
}

impl Crypto for LocalCrypto {
    fn decrypt_client_half(
        &self,
        ephemeral: &EphemeralPublicKey,
        encrypted: &EncryptedClientHalf,
    ) -> impl Future<Output = Result<ClientHalf, CryptoError>> + Send {
        let result = open_client_half(&self.device_key, ephemeral, encrypted);
        async move { result }
    }

    fn decrypt_client_half_any(
        &self,
        candidates: Vec<CandidateClientHalf>,
        prompt_paper: bool,
    ) -> impl Future<Output = Result<(ClientHalf, usize), CryptoError>> + Send {
        let result = self.try_open_any(&candidates, prompt_paper);
        async move { result }
    }
}
