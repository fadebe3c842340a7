//! Wire format of the admission socket.
//!
//! A request is the hex encoded raw transaction, optionally `0x` prefixed,
//! ended by a newline or by the client closing its write side. A response
//! is a 4 byte big endian status code followed, on acceptance only, by the
//! transaction hash as 64 hex characters without prefix.

use txrelay_core::{RelayProtocolError, TxHash, H256};

/// Size of the status header
pub const HEADER_LEN: usize = 4;

/// Status code of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// Queued, hash follows
    Accepted,
    /// Not queued, no body
    Rejected,
}

impl ResponseCode {
    fn as_u32(self) -> u32 {
        match self {
            ResponseCode::Accepted => 0,
            ResponseCode::Rejected => 1,
        }
    }
}

/// A decoded response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// The transaction was queued under this hash
    Accepted(TxHash),
    /// The request was refused with a nonzero code
    Rejected(u32),
}

impl Response {
    /// Bytes sent back to the client
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::Accepted(hash) => {
                let mut out = ResponseCode::Accepted.as_u32().to_be_bytes().to_vec();
                out.extend_from_slice(hex::encode(hash.as_bytes()).as_bytes());
                out
            }
            Response::Rejected(code) => code.to_be_bytes().to_vec(),
        }
    }

    /// A rejection with the default code
    pub fn rejected() -> Self {
        Response::Rejected(ResponseCode::Rejected.as_u32())
    }

    /// Parse a full response
    pub fn decode(bytes: &[u8]) -> Result<Self, RelayProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(RelayProtocolError::InvalidLength {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let (header, body) = bytes.split_at(HEADER_LEN);
        let mut code = [0u8; HEADER_LEN];
        code.copy_from_slice(header);
        let code = u32::from_be_bytes(code);
        if code != ResponseCode::Accepted.as_u32() {
            return Ok(Response::Rejected(code));
        }
        let hash = hex::decode(body).map_err(|err| {
            RelayProtocolError::IoError(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        })?;
        if hash.len() != H256::len_bytes() {
            return Err(RelayProtocolError::InvalidLength {
                expected: H256::len_bytes(),
                actual: hash.len(),
            });
        }
        Ok(Response::Accepted(H256::from_slice(&hash)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_carries_unprefixed_hash() {
        let hash = H256::repeat_byte(0xab);
        let bytes = Response::Accepted(hash).encode();
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..], "ab".repeat(32).as_bytes());
        assert_eq!(Response::decode(&bytes).unwrap(), Response::Accepted(hash));
    }

    #[test]
    fn rejected_is_header_only() {
        let bytes = Response::rejected().encode();
        assert_eq!(bytes, vec![0, 0, 0, 1]);
        assert_eq!(Response::decode(&bytes).unwrap(), Response::Rejected(1));
    }

    #[test]
    fn truncated_response_is_an_error() {
        assert!(Response::decode(&[0, 0]).is_err());
        assert!(Response::decode(&[0, 0, 0, 0, b'a', b'b']).is_err());
    }
}
