//! Bit vectors for JTAG shifts.
//!
//! Bits are stored least-significant-bit first: bit 0 is the first bit
//! clocked into or out of the scan chain. The length in bits is tracked
//! separately from the packed byte storage, and any padding bits in the
//! final byte are always zero.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Not enough bits to extract required data.")]
    NotEnoughBits,
    #[error("Unknown word size.")]
    InvalidWordSize,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitVec {
    bytes: Vec<u8>,
    len: usize,
}

impl BitVec {
    /// Create an empty BitVec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a BitVec of `len` zero bits.
    pub fn zeros(len: usize) -> Self {
        BitVec { bytes: vec![0; bytes_for_bits(len)], len }
    }

    /// Create a BitVec of `len` one bits.
    pub fn ones(len: usize) -> Self {
        let mut bv = Self::zeros(len);
        for idx in 0..len {
            bv.set(idx, true);
        }
        bv
    }

    /// Create a BitVec holding the first `len` bits of `bytes`.
    ///
    /// Returns an error if `bytes` holds fewer than `len` bits.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        let nbytes = bytes_for_bits(len);
        if bytes.len() < nbytes {
            return Err(Error::NotEnoughBits);
        }
        let mut bv = BitVec { bytes: bytes[..nbytes].to_vec(), len };
        bv.clear_padding();
        Ok(bv)
    }

    /// Create a BitVec from a slice of bools, first element shifted first.
    pub fn from_bits(bits: &[bool]) -> Self {
        BitVec { bytes: bits_to_bytes(bits), len: bits.len() }
    }

    /// Create a BitVec from the low `len` bits of `word`.
    ///
    /// Panics if `len` exceeds 64.
    pub fn from_u64(word: u64, len: usize) -> Self {
        assert!(len <= 64, "from_u64: len must not exceed 64");
        let mut bv = BitVec { bytes: word.to_le_bytes()[..bytes_for_bits(len)].to_vec(), len };
        bv.clear_padding();
        bv
    }

    /// Number of bits held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Packed storage, LSB-first, with zeroed padding.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get bit `idx`, or None if out of range.
    pub fn get(&self, idx: usize) -> Option<bool> {
        if idx < self.len {
            Some((self.bytes[idx / 8] >> (idx % 8)) & 1 == 1)
        } else {
            None
        }
    }

    /// Set bit `idx`.
    ///
    /// Panics if `idx` is out of range.
    pub fn set(&mut self, idx: usize, bit: bool) {
        assert!(idx < self.len, "set: bit index out of range");
        if bit {
            self.bytes[idx / 8] |= 1 << (idx % 8);
        } else {
            self.bytes[idx / 8] &= !(1 << (idx % 8));
        }
    }

    /// Append a single bit.
    pub fn push(&mut self, bit: bool) {
        if self.len % 8 == 0 {
            self.bytes.push(0);
        }
        self.len += 1;
        self.set(self.len - 1, bit);
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(move |idx| (self.bytes[idx / 8] >> (idx % 8)) & 1 == 1)
    }

    /// Interpret the first `n` bits as a word, least significant bit first.
    ///
    /// Returns an error if fewer than `n` bits are held or if n > 64.
    pub fn word(&self, n: usize) -> Result<u64> {
        if n > 64 {
            Err(Error::InvalidWordSize)
        } else if self.len < n {
            Err(Error::NotEnoughBits)
        } else {
            Ok(self.iter().take(n).enumerate().fold(0, |w, (idx, bit)| w | ((bit as u64) << idx)))
        }
    }

    /// Interpret all held bits as a word; errors if more than 64 bits are held.
    pub fn to_u64(&self) -> Result<u64> {
        self.word(self.len)
    }

    fn clear_padding(&mut self) {
        let rem = self.len % 8;
        if rem != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= (1 << rem) - 1;
            }
        }
    }
}

/// Convert a slice of bits to a Vec of u8s, least-significant-bit first.
///
/// If `bits` is not a multiple of 8, the final byte has the higher-order
/// bits set to 0.
pub fn bits_to_bytes(bits: &[bool]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(bytes_for_bits(bits.len()));
    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (idx, bit) in chunk.iter().enumerate() {
            byte |= (*bit as u8) << idx;
        }
        bytes.push(byte);
    }
    bytes
}

/// Returns number of whole bytes required to hold `n` bits.
pub fn bytes_for_bits(n: usize) -> usize {
    (n + 7) / 8
}

/// Convenience macro for creating a &[bool] from &[u8] of 0/1.
#[cfg(test)]
macro_rules! bv {
    ($($x:expr),*) => {
        &[ $(($x != 0),)* ] as &[bool]
    }
}

#[test]
fn test_bits_to_bytes() {
    assert_eq!(bits_to_bytes(&[]),                                      vec![]);
    assert_eq!(bits_to_bytes(bv![1, 1, 1, 0]),                          vec![0x07]);
    assert_eq!(bits_to_bytes(bv![1, 1, 1, 0, 0, 1, 0, 0]),              vec![0x27]);
    assert_eq!(bits_to_bytes(bv![1, 1, 1, 0, 0, 1, 0, 0, 0, 0, 0, 1]),  vec![0x27, 0x08]);
}

#[test]
fn test_from_bytes_clears_padding() {
    let bv = BitVec::from_bytes(&[0xFF, 0xFF], 10).unwrap();
    assert_eq!(bv.len(), 10);
    assert_eq!(bv.as_bytes(), &[0xFF, 0x03]);
    assert!(BitVec::from_bytes(&[0xFF], 9).is_err());
}

#[test]
fn test_from_u64() {
    let bv = BitVec::from_u64(0x7_DEAD_BEEF, 35);
    assert_eq!(bv.len(), 35);
    assert_eq!(bv.as_bytes(), &[0xEF, 0xBE, 0xAD, 0xDE, 0x07]);
    assert_eq!(bv.to_u64().unwrap(), 0x7_DEAD_BEEF);
    assert_eq!(BitVec::from_u64(0xFF, 3).as_bytes(), &[0x07]);
}

#[test]
fn test_push_and_get() {
    let mut bv = BitVec::new();
    for bit in bv![1, 0, 1, 1, 0, 0, 0, 0, 1] {
        bv.push(*bit);
    }
    assert_eq!(bv.len(), 9);
    assert_eq!(bv.as_bytes(), &[0x0D, 0x01]);
    assert_eq!(bv.get(0), Some(true));
    assert_eq!(bv.get(1), Some(false));
    assert_eq!(bv.get(8), Some(true));
    assert_eq!(bv.get(9), None);
}

#[test]
fn test_word() {
    let bv = BitVec::from_bits(bv![1, 0, 0, 0, 1, 0, 1, 0, 1, 1]);
    assert_eq!(bv.word(8).unwrap(), 0x51);
    assert_eq!(bv.word(10).unwrap(), 0x351);
    assert!(bv.word(11).is_err());
    assert!(BitVec::zeros(70).word(65).is_err());
}

#[test]
fn test_ones_and_zeros() {
    assert_eq!(BitVec::ones(12).as_bytes(), &[0xFF, 0x0F]);
    assert_eq!(BitVec::zeros(12).as_bytes(), &[0x00, 0x00]);
    assert!(BitVec::new().is_empty());
}
