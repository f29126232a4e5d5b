//! Wire format versions.
//!
//! The trailing byte of every base format names the layout used for the rest
//! of the message. Each version fixes the width of the classical public key in
//! the base format and of the post-quantum key in the encrypted format.

use sigil_crypto::{Csidh512, FfDh, Nike};

use crate::errors::{ProtocolError, Result};

/// Field widths selected by a [`WireVersion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatLayout {
    /// Classical (DH) public key width in the base format
    pub public_key_size: usize,
    /// Post-quantum public key width in the encrypted format
    pub pq_key_size: usize,
}

/// Known wire versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WireVersion {
    /// Finite-field DH outer key, CSIDH-512 inner key
    V1 = 1,
}

impl WireVersion {
    /// Version used for everything this implementation sends.
    pub const CURRENT: Self = Self::V1;

    /// Encoded version byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Decode a version byte.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnsupportedVersion` for unknown bytes
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::V1),
            other => Err(ProtocolError::UnsupportedVersion(other)),
        }
    }

    /// Field widths for this version.
    pub fn layout(self) -> FormatLayout {
        match self {
            Self::V1 => FormatLayout {
                public_key_size: FfDh::PUBLIC_KEY_SIZE,
                pq_key_size: Csidh512::PUBLIC_KEY_SIZE,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_layout() {
        let layout = WireVersion::V1.layout();
        assert_eq!(layout.public_key_size, 256);
        assert_eq!(layout.pq_key_size, 64);
    }

    #[test]
    fn unknown_versions_rejected() {
        assert_eq!(WireVersion::from_byte(0), Err(ProtocolError::UnsupportedVersion(0)));
        assert_eq!(WireVersion::from_byte(2), Err(ProtocolError::UnsupportedVersion(2)));
        assert_eq!(WireVersion::from_byte(WireVersion::CURRENT.to_byte()), Ok(WireVersion::V1));
    }
}
