//! AES-256 counter-mode engine seam.
//!
//! The block cipher is an external primitive; this module only carries its
//! parameters and output sizing.

/// Cipher block size in bytes.
pub const BLOCK_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
/// Round-key material produced by the key schedule.
pub const ROUND_KEYS_LEN: usize = 13 * 16;

#[derive(Clone, PartialEq, Eq)]
pub struct RoundKeys(pub [u8; ROUND_KEYS_LEN]);

impl std::fmt::Debug for RoundKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RoundKeys(..)")
    }
}

/// Everything one counter-mode call needs.
#[derive(Debug, Clone)]
pub struct AesCtrParams {
    pub counter: u32,
    pub nonce: [u8; NONCE_LEN],
    pub key: [u8; KEY_LEN],
    pub round_keys: RoundKeys,
}

pub trait CtrCipher {
    fn key_schedule(&self, key: &[u8; KEY_LEN]) -> RoundKeys;

    /// Encrypt `input` into `output`, which holds at least
    /// `padded_len(input.len())` bytes.
    fn encrypt_ctr(&self, params: &AesCtrParams, input: &[u8], output: &mut [u8]);
}

impl AesCtrParams {
    pub fn new(
        cipher: &impl CtrCipher,
        key: [u8; KEY_LEN],
        nonce: [u8; NONCE_LEN],
        counter: u32,
    ) -> Self {
        Self {
            counter,
            nonce,
            round_keys: cipher.key_schedule(&key),
            key,
        }
    }
}

/// Output length for `len` input bytes: whole blocks.
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(BLOCK_LEN) * BLOCK_LEN
}

/// Encrypt into a freshly sized buffer.
pub fn encrypt_to_vec(cipher: &impl CtrCipher, params: &AesCtrParams, input: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; padded_len(input.len())];
    cipher.encrypt_ctr(params, input, &mut out);
    out
}
