//! LoRaWAN cryptographic operations
//!
//! This module provides cryptographic functions for LoRaWAN security:
//! - Message Integrity Code (MIC) computation
//! - Payload encryption/decryption
//! - Join accept encryption
//! - Session key derivation

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use heapless::Vec;
use thiserror::Error;

use crate::config::device::{AESKey, AppNonce, DevAddr, DevNonce, NetID};

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

/// Block size for AES-128
pub const BLOCK_SIZE: usize = 16;

/// Largest FRMPayload carried by a single frame
pub const MAX_FRM_PAYLOAD_SIZE: usize = 242;

/// Direction identifiers for cryptographic operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Uplink (device to network)
    Up = 0,
    /// Downlink (network to device)
    Down = 1,
}

/// Session key selector used as the first byte of the derivation block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    /// Network session key
    NwkSKey = 0x01,
    /// Application session key
    AppSKey = 0x02,
}

/// Errors from session key derivation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyDerivationError {
    /// Root key is not a valid AES-128 key
    #[error("key derivation: root key must be 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Derivation input does not form exactly one cipher block
    #[error("key derivation: block-size of {BLOCK_SIZE} bytes is expected, got {0}")]
    InvalidBlockSize(usize),
}

/// Errors from payload and join accept ciphers
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CipherError {
    /// Payload does not fit in a single frame
    #[error("payload of {0} bytes exceeds the {MAX_FRM_PAYLOAD_SIZE} byte frame limit")]
    PayloadTooLarge(usize),

    /// Join accept ciphertext is not one or two cipher blocks
    #[error("join accept ciphertext must be 16 or 32 bytes, got {0}")]
    InvalidJoinAcceptLength(usize),
}

fn cipher(key: &AESKey) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key.as_bytes()))
}

fn cmac(key: &AESKey) -> Cmac<Aes128> {
    <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key.as_bytes()))
}

fn truncate_mic(tag: &[u8]) -> [u8; MIC_SIZE] {
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&tag[..MIC_SIZE]);
    mic
}

/// Compute Message Integrity Code (MIC) for a LoRaWAN data message
///
/// # Arguments
/// * `key` - Network session key
/// * `data` - MHDR and MACPayload of the frame
/// * `dev_addr` - Device address
/// * `fcnt` - Full 32-bit frame counter
/// * `dir` - Message direction
pub fn compute_mic(
    key: &AESKey,
    data: &[u8],
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
) -> [u8; MIC_SIZE] {
    let mut b0 = [0u8; BLOCK_SIZE];
    b0[0] = 0x49; // MIC block identifier
    b0[5] = dir as u8;
    b0[6..10].copy_from_slice(&dev_addr.to_wire());
    b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b0[15] = data.len() as u8;

    let mut mac = cmac(key);
    mac.update(&b0);
    mac.update(data);
    truncate_mic(&mac.finalize().into_bytes())
}

/// Compute the MIC of a join request or a decrypted join accept.
///
/// Both are a plain AES-CMAC over MHDR and payload.
pub fn compute_join_mic(key: &AESKey, data: &[u8]) -> [u8; MIC_SIZE] {
    let mut mac = cmac(key);
    mac.update(data);
    truncate_mic(&mac.finalize().into_bytes())
}

/// Encrypt or decrypt payload using AES-128 in CTR mode
///
/// The keystream is length preserving, so the same call decrypts.
///
/// # Arguments
/// * `key` - AES key for encryption/decryption
/// * `dev_addr` - Device address
/// * `fcnt` - Frame counter
/// * `dir` - Message direction
/// * `payload` - Data to encrypt/decrypt
pub fn encrypt_payload(
    key: &AESKey,
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
    payload: &[u8],
) -> Result<Vec<u8, MAX_FRM_PAYLOAD_SIZE>, CipherError> {
    if payload.len() > MAX_FRM_PAYLOAD_SIZE {
        return Err(CipherError::PayloadTooLarge(payload.len()));
    }

    let cipher = cipher(key);
    let mut result = Vec::new();

    for (i, chunk) in payload.chunks(BLOCK_SIZE).enumerate() {
        let mut a = [0u8; BLOCK_SIZE];
        a[0] = 0x01; // Data encryption
        a[5] = dir as u8;
        a[6..10].copy_from_slice(&dev_addr.to_wire());
        a[10..14].copy_from_slice(&fcnt.to_le_bytes());
        a[15] = (i + 1) as u8;

        cipher.encrypt_block((&mut a).into());

        for (b, s) in chunk.iter().zip(a.iter()) {
            result
                .push(b ^ s)
                .map_err(|_| CipherError::PayloadTooLarge(payload.len()))?;
        }
    }

    Ok(result)
}

/// Decrypt a join accept as received by the device.
///
/// The network encrypts with AES decrypt, so the device applies AES encrypt
/// to each block of payload and MIC.
pub fn decrypt_join_accept(key: &AESKey, data: &[u8]) -> Result<Vec<u8, 32>, CipherError> {
    join_accept_blocks(key, data, |cipher, block| cipher.encrypt_block(block))
}

/// Encrypt a join accept the way a network server does before sending it.
pub fn encrypt_join_accept(key: &AESKey, data: &[u8]) -> Result<Vec<u8, 32>, CipherError> {
    join_accept_blocks(key, data, |cipher, block| cipher.decrypt_block(block))
}

fn join_accept_blocks<F>(key: &AESKey, data: &[u8], apply: F) -> Result<Vec<u8, 32>, CipherError>
where
    F: Fn(&Aes128, &mut aes::Block),
{
    if data.len() != BLOCK_SIZE && data.len() != 2 * BLOCK_SIZE {
        return Err(CipherError::InvalidJoinAcceptLength(data.len()));
    }

    let cipher = cipher(key);
    let mut result = Vec::new();
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(chunk);
        apply(&cipher, (&mut block).into());
        result
            .extend_from_slice(&block)
            .map_err(|_| CipherError::InvalidJoinAcceptLength(data.len()))?;
    }

    Ok(result)
}

/// Derive a single session key.
///
/// The block is the key type, followed by the network nonce, network id and
/// device nonce each in little-endian order, zero padded to one AES block and
/// encrypted with the root key.
///
/// # Arguments
/// * `key_type` - Which session key to derive
/// * `root_key` - Application (root) key, must be 16 bytes
/// * `net_id` - Network ID from join accept
/// * `dev_nonce` - Device nonce from join request
/// * `app_nonce` - Network nonce from join accept
pub fn derive_session_key(
    key_type: KeyType,
    root_key: &[u8],
    net_id: NetID,
    dev_nonce: DevNonce,
    app_nonce: AppNonce,
) -> Result<AESKey, KeyDerivationError> {
    let cipher = Aes128::new_from_slice(root_key)
        .map_err(|_| KeyDerivationError::InvalidKeyLength(root_key.len()))?;

    let mut b: Vec<u8, BLOCK_SIZE> = Vec::new();
    let too_long = KeyDerivationError::InvalidBlockSize(BLOCK_SIZE + 1);
    b.push(key_type as u8).map_err(|_| too_long.clone())?;
    for field in [
        &app_nonce.to_wire()[..],
        &net_id.to_wire()[..],
        &dev_nonce.to_wire()[..],
        &[0u8; 7][..],
    ] {
        b.extend_from_slice(field).map_err(|_| too_long.clone())?;
    }

    if b.len() != BLOCK_SIZE {
        return Err(KeyDerivationError::InvalidBlockSize(b.len()));
    }

    let mut block = [0u8; BLOCK_SIZE];
    block.copy_from_slice(&b);
    cipher.encrypt_block((&mut block).into());
    Ok(AESKey::new(block))
}

/// Derive network and application session keys from join accept
///
/// Returns `(nwk_skey, app_skey)`.
pub fn derive_session_keys(
    app_key: &AESKey,
    app_nonce: AppNonce,
    net_id: NetID,
    dev_nonce: DevNonce,
) -> Result<(AESKey, AESKey), KeyDerivationError> {
    let nwk_skey =
        derive_session_key(KeyType::NwkSKey, app_key.as_bytes(), net_id, dev_nonce, app_nonce)?;
    let app_skey =
        derive_session_key(KeyType::AppSKey, app_key.as_bytes(), net_id, dev_nonce, app_nonce)?;
    Ok((nwk_skey, app_skey))
}
