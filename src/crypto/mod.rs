//! LoRaWAN cryptographic operations
//!
//! Network-side frame security:
//! - Uplink MIC verification (LoRaWAN 1.0.x single key, 1.1 split F/S keys)
//! - Downlink MIC computation
//! - FRMPayload and FOpts encryption (AES-128 CTR)
//! - Join-request MIC

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::config::device::{AESKey, DevAddr};

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

/// Block size for AES-128
const BLOCK_SIZE: usize = 16;

/// Direction identifiers for cryptographic operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Uplink (device to network)
    Up = 0,
    /// Downlink (network to device)
    Down = 1,
}

fn cmac(key: &AESKey, blocks: &[&[u8]]) -> [u8; BLOCK_SIZE] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key.as_bytes()));
    for block in blocks {
        mac.update(block);
    }
    mac.finalize().into_bytes().into()
}

fn b0(dir: Direction, conf_f_cnt: u16, dev_addr: DevAddr, f_cnt: u32, len: usize) -> [u8; BLOCK_SIZE] {
    let mut b = [0u8; BLOCK_SIZE];
    b[0] = 0x49;
    b[1..3].copy_from_slice(&conf_f_cnt.to_le_bytes());
    b[5] = dir as u8;
    b[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    b[10..14].copy_from_slice(&f_cnt.to_le_bytes());
    b[15] = len as u8;
    b
}

/// Compute the MIC of a LoRaWAN 1.0.x uplink
///
/// `payload` is MHDR through FRMPayload, without the MIC.
pub fn compute_legacy_uplink_mic(
    nwk_s_key: &AESKey,
    dev_addr: DevAddr,
    f_cnt: u32,
    payload: &[u8],
) -> [u8; MIC_SIZE] {
    let b0 = b0(Direction::Up, 0, dev_addr, f_cnt, payload.len());
    let full = cmac(nwk_s_key, &[&b0, payload]);
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&full[..MIC_SIZE]);
    mic
}

/// Compute the MIC of a LoRaWAN 1.1 uplink
///
/// The first half comes from the serving network key over B1, which binds the
/// acknowledged downlink counter, the data rate and the channel index. The
/// second half is the 1.0.x-compatible MIC under the forwarding network key.
#[allow(clippy::too_many_arguments)]
pub fn compute_uplink_mic(
    s_nwk_s_int_key: &AESKey,
    f_nwk_s_int_key: &AESKey,
    conf_f_cnt_down: u32,
    tx_dr_index: u8,
    tx_ch_index: u8,
    dev_addr: DevAddr,
    f_cnt: u32,
    payload: &[u8],
) -> [u8; MIC_SIZE] {
    let mut b1 = b0(Direction::Up, conf_f_cnt_down as u16, dev_addr, f_cnt, payload.len());
    b1[3] = tx_dr_index;
    b1[4] = tx_ch_index;
    let cmac_s = cmac(s_nwk_s_int_key, &[&b1, payload]);
    let cmac_f = compute_legacy_uplink_mic(f_nwk_s_int_key, dev_addr, f_cnt, payload);
    [cmac_s[0], cmac_s[1], cmac_f[0], cmac_f[1]]
}

/// Compute the MIC of a downlink
///
/// `conf_f_cnt_up` is the counter of the acknowledged confirmed uplink for
/// LoRaWAN 1.1 sessions and zero otherwise.
pub fn compute_downlink_mic(
    key: &AESKey,
    conf_f_cnt_up: u32,
    dev_addr: DevAddr,
    f_cnt: u32,
    payload: &[u8],
) -> [u8; MIC_SIZE] {
    let b0 = b0(Direction::Down, conf_f_cnt_up as u16, dev_addr, f_cnt, payload.len());
    let full = cmac(key, &[&b0, payload]);
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&full[..MIC_SIZE]);
    mic
}

/// Encrypt or decrypt FRMPayload using AES-128 in CTR mode
///
/// # Arguments
/// * `key` - NwkSEncKey for port 0, AppSKey otherwise
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
) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut result = Vec::with_capacity(payload.len());

    for (i, chunk) in payload.chunks(BLOCK_SIZE).enumerate() {
        let mut a = [0u8; BLOCK_SIZE];
        a[0] = 0x01;
        a[5] = dir as u8;
        a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
        a[10..14].copy_from_slice(&fcnt.to_le_bytes());
        a[15] = (i + 1) as u8;

        let mut s = GenericArray::from(a);
        cipher.encrypt_block(&mut s);
        result.extend(chunk.iter().zip(s.iter()).map(|(p, k)| p ^ k));
    }

    result
}

/// Encrypt or decrypt FOpts of a LoRaWAN 1.1 frame with NwkSEncKey
pub fn encrypt_fopts(
    nwk_s_enc_key: &AESKey,
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
    fopts: &[u8],
) -> Vec<u8> {
    // FOpts never exceed one block, so this is the first keystream block.
    encrypt_payload(nwk_s_enc_key, dev_addr, fcnt, dir, fopts)
}

/// Compute the MIC of a join-request
///
/// `data` is MHDR | JoinEUI | DevEUI | DevNonce.
pub fn compute_join_request_mic(key: &AESKey, data: &[u8]) -> [u8; MIC_SIZE] {
    let full = cmac(key, &[data]);
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&full[..MIC_SIZE]);
    mic
}
