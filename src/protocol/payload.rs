use bincode::{Decode, Encode};

use super::{ProtocolError, header::wire_config};

/// Identity of a cached value as the master sees it.
#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct RequestKey {
    /// Whether the client keeps the connection open after the response.
    pub persistent: bool,
    pub build_label: String,
    pub data_type: String,
    pub historical: bool,
    /// Database the client is currently reading from.
    pub database: String,
    pub key: Vec<u8>,
}

impl RequestKey {
    pub fn as_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::encode_to_vec(self, wire_config())?)
    }
}

impl TryFrom<&[u8]> for RequestKey {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let (key, read): (RequestKey, usize) = bincode::decode_from_slice(value, wire_config())?;
        if read != value.len() {
            return Err(ProtocolError::TrailingBytes(value.len() - read));
        }
        Ok(key)
    }
}
