//! Negotiation message framing.
//!
//! Requests and confirms are nested fixed-layout structures that exactly fill
//! one transport payload:
//!
//! ```text
//! BaseFormat:    [ public key ][ encrypted payload ...... ][ version ]
//!                               │
//!                               ▼ (auth_decrypt)
//! EcrFormat:     [ ownership proof : 32 ][ pq public key ][ payload ... ]
//!                                                          │
//!                                                          ▼ (requests only)
//! RequestFormat: [ sender id : 32 ][ fact;fact; ][ zero padding ]
//! ```
//!
//! Widths of the two public keys come from the [`WireVersion`]. Every format
//! has one `encode`/`decode` pair; `encode` takes the exact output length so
//! padding is explicit.

use sigil_crypto::{OWNERSHIP_PROOF_LEN, OwnershipProof};

use crate::{
    PartnerId, WireVersion,
    errors::{ProtocolError, Result},
};

/// Separator terminating each fact.
pub const FACT_TERMINATOR: u8 = b';';

const VERSION_LEN: usize = 1;

/// Outer, unencrypted layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseFormat {
    version: WireVersion,
    public_key: Vec<u8>,
    ecr_payload: Vec<u8>,
}

impl BaseFormat {
    /// Build a base format.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::WrongWidth` if `public_key` does not match the
    ///   version's layout
    pub fn new(version: WireVersion, public_key: Vec<u8>, ecr_payload: Vec<u8>) -> Result<Self> {
        let expected = version.layout().public_key_size;
        if public_key.len() != expected {
            return Err(ProtocolError::WrongWidth {
                what: "base public key",
                expected,
                actual: public_key.len(),
            });
        }
        Ok(Self { version, public_key, ecr_payload })
    }

    /// Space left for the encrypted payload in a message of `total_len` bytes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::TooShort` if `total_len` cannot hold the fixed fields
    pub fn ecr_len(version: WireVersion, total_len: usize) -> Result<usize> {
        let fixed = version.layout().public_key_size + VERSION_LEN;
        total_len.checked_sub(fixed).ok_or(ProtocolError::TooShort {
            what: "base format",
            expected: fixed,
            actual: total_len,
        })
    }

    /// Serialize as `[public key][encrypted payload][version]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(self.public_key.len() + self.ecr_payload.len() + VERSION_LEN);
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.ecr_payload);
        out.push(self.version.to_byte());
        out
    }

    /// Parse, dispatching on the trailing version byte.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::TooShort` if the buffer is empty or shorter than the
    ///   version's public key
    /// - `ProtocolError::UnsupportedVersion` for unknown versions
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some((&version_byte, body)) = bytes.split_last() else {
            return Err(ProtocolError::TooShort {
                what: "base format",
                expected: VERSION_LEN,
                actual: 0,
            });
        };

        let version = WireVersion::from_byte(version_byte)?;
        match version {
            WireVersion::V1 => {
                let key_len = version.layout().public_key_size;
                if body.len() < key_len {
                    return Err(ProtocolError::TooShort {
                        what: "base format",
                        expected: key_len + VERSION_LEN,
                        actual: bytes.len(),
                    });
                }
                let (public_key, ecr_payload) = body.split_at(key_len);
                Ok(Self { version, public_key: public_key.to_vec(), ecr_payload: ecr_payload.to_vec() })
            },
        }
    }

    /// Wire version.
    pub fn version(&self) -> WireVersion {
        self.version
    }

    /// Sender's ephemeral classical public key.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Encrypted [`EcrFormat`] bytes.
    pub fn ecr_payload(&self) -> &[u8] {
        &self.ecr_payload
    }
}

/// Encrypted middle layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcrFormat {
    /// Proof over historical key material
    pub ownership: OwnershipProof,
    /// Sender's post-quantum public key
    pub pq_public_key: Vec<u8>,
    /// Inner payload, zero padded to fill
    pub payload: Vec<u8>,
}

impl EcrFormat {
    /// Space left for the inner payload in an encrypted format of `len` bytes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::TooShort` if `len` cannot hold the fixed fields
    pub fn payload_len(version: WireVersion, len: usize) -> Result<usize> {
        let fixed = OWNERSHIP_PROOF_LEN + version.layout().pq_key_size;
        len.checked_sub(fixed).ok_or(ProtocolError::TooShort {
            what: "encrypted format",
            expected: fixed,
            actual: len,
        })
    }

    /// Serialize to exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::WrongWidth` if the PQ key does not match the layout
    /// - `ProtocolError::TooLarge` if the payload does not fit
    pub fn encode(&self, version: WireVersion, len: usize) -> Result<Vec<u8>> {
        let pq_len = version.layout().pq_key_size;
        if self.pq_public_key.len() != pq_len {
            return Err(ProtocolError::WrongWidth {
                what: "pq public key",
                expected: pq_len,
                actual: self.pq_public_key.len(),
            });
        }
        let max = Self::payload_len(version, len)?;
        if self.payload.len() > max {
            return Err(ProtocolError::TooLarge {
                what: "encrypted format payload",
                size: self.payload.len(),
                max,
            });
        }

        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(self.ownership.as_bytes());
        out.extend_from_slice(&self.pq_public_key);
        out.extend_from_slice(&self.payload);
        out.resize(len, 0);
        Ok(out)
    }

    /// Parse decrypted bytes laid out for `version`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::TooShort` if the fixed fields do not fit
    pub fn decode(version: WireVersion, bytes: &[u8]) -> Result<Self> {
        let payload_len = Self::payload_len(version, bytes.len())?;
        let pq_len = version.layout().pq_key_size;

        let (ownership, rest) = bytes.split_at(OWNERSHIP_PROOF_LEN);
        let (pq_public_key, payload) = rest.split_at(pq_len);
        debug_assert_eq!(payload.len(), payload_len);

        let mut proof = [0u8; OWNERSHIP_PROOF_LEN];
        proof.copy_from_slice(ownership);
        Ok(Self {
            ownership: OwnershipProof::new(proof),
            pq_public_key: pq_public_key.to_vec(),
            payload: payload.to_vec(),
        })
    }
}

/// Innermost layer of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFormat {
    /// Requester identity
    pub sender: PartnerId,
    /// Free-form facts the requester shares about itself
    pub facts: Vec<String>,
}

impl RequestFormat {
    /// Serialize to exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidFact` if a fact is empty or contains the
    ///   terminator or a NUL byte
    /// - `ProtocolError::TooLarge` if the facts do not fit
    pub fn encode(&self, len: usize) -> Result<Vec<u8>> {
        let max = len.checked_sub(PartnerId::LEN).ok_or(ProtocolError::TooShort {
            what: "request format",
            expected: PartnerId::LEN,
            actual: len,
        })?;

        let facts = encode_facts(&self.facts)?;
        if facts.len() > max {
            return Err(ProtocolError::TooLarge { what: "request facts", size: facts.len(), max });
        }

        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(&facts);
        out.resize(len, 0);
        Ok(out)
    }

    /// Parse, stripping the zero padding.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::TooShort` if the sender id does not fit
    /// - `ProtocolError::InvalidFact` if the fact text is not UTF-8
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PartnerId::LEN {
            return Err(ProtocolError::TooShort {
                what: "request format",
                expected: PartnerId::LEN,
                actual: bytes.len(),
            });
        }
        let (sender, rest) = bytes.split_at(PartnerId::LEN);
        let end = rest.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);

        Ok(Self { sender: PartnerId::from_slice(sender)?, facts: decode_facts(&rest[..end])? })
    }
}

fn encode_facts(facts: &[String]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for fact in facts {
        let invalid = |reason| ProtocolError::InvalidFact { fact: fact.clone(), reason };
        if fact.is_empty() {
            return Err(invalid("empty"));
        }
        if fact.bytes().any(|b| b == FACT_TERMINATOR) {
            return Err(invalid("contains terminator"));
        }
        if fact.bytes().any(|b| b == 0) {
            return Err(invalid("contains NUL"));
        }
        out.extend_from_slice(fact.as_bytes());
        out.push(FACT_TERMINATOR);
    }
    Ok(out)
}

fn decode_facts(bytes: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidFact {
        fact: String::from_utf8_lossy(bytes).into_owned(),
        reason: "not UTF-8",
    })?;
    Ok(text
        .split(FACT_TERMINATOR as char)
        .filter(|fact| !fact.is_empty())
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: usize = 1024;

    fn request() -> RequestFormat {
        RequestFormat {
            sender: PartnerId::new([9; 32]),
            facts: vec!["Ualice".to_string(), "Ealice@example.com".to_string()],
        }
    }

    #[test]
    fn nested_layout_fills_payload() {
        let version = WireVersion::V1;
        let ecr_len = BaseFormat::ecr_len(version, PAYLOAD).unwrap();
        assert_eq!(ecr_len, PAYLOAD - 256 - 1);

        let inner_len = EcrFormat::payload_len(version, ecr_len).unwrap();
        let inner = request().encode(inner_len).unwrap();
        let ecr = EcrFormat {
            ownership: OwnershipProof::new([3; 32]),
            pq_public_key: vec![4; 64],
            payload: inner,
        }
        .encode(version, ecr_len)
        .unwrap();
        assert_eq!(ecr.len(), ecr_len);

        let base = BaseFormat::new(version, vec![5; 256], ecr).unwrap().encode();
        assert_eq!(base.len(), PAYLOAD);
        assert_eq!(base[PAYLOAD - 1], 1);

        let decoded = BaseFormat::decode(&base).unwrap();
        let ecr = EcrFormat::decode(decoded.version(), decoded.ecr_payload()).unwrap();
        assert_eq!(ecr.ownership, OwnershipProof::new([3; 32]));
        assert_eq!(RequestFormat::decode(&ecr.payload).unwrap(), request());
    }

    #[test]
    fn base_rejects_wrong_key_width() {
        let err = BaseFormat::new(WireVersion::V1, vec![0; 255], vec![]).unwrap_err();
        assert!(matches!(err, ProtocolError::WrongWidth { expected: 256, actual: 255, .. }));
    }

    #[test]
    fn base_rejects_unknown_version() {
        let mut bytes = vec![0u8; 300];
        bytes[299] = 7;
        assert_eq!(BaseFormat::decode(&bytes), Err(ProtocolError::UnsupportedVersion(7)));
    }

    #[test]
    fn base_rejects_truncated() {
        assert!(matches!(BaseFormat::decode(&[]), Err(ProtocolError::TooShort { .. })));
        assert!(matches!(BaseFormat::decode(&[0u8, 1]), Err(ProtocolError::TooShort { .. })));
    }

    #[test]
    fn facts_must_fit() {
        let big = RequestFormat { sender: PartnerId::new([0; 32]), facts: vec!["x".repeat(100)] };
        assert!(matches!(big.encode(64), Err(ProtocolError::TooLarge { .. })));
    }

    #[test]
    fn facts_reject_terminator() {
        let bad = RequestFormat { sender: PartnerId::new([0; 32]), facts: vec!["a;b".to_string()] };
        assert!(matches!(bad.encode(128), Err(ProtocolError::InvalidFact { .. })));
    }

    #[test]
    fn no_facts_decodes_empty() {
        let empty = RequestFormat { sender: PartnerId::new([1; 32]), facts: vec![] };
        assert_eq!(RequestFormat::decode(&empty.encode(80).unwrap()).unwrap(), empty);
    }

    #[test]
    fn ecr_payload_too_large() {
        let ecr = EcrFormat {
            ownership: OwnershipProof::new([0; 32]),
            pq_public_key: vec![0; 64],
            payload: vec![1; 10],
        };
        assert!(matches!(ecr.encode(WireVersion::V1, 100), Err(ProtocolError::TooLarge { .. })));
    }
}
