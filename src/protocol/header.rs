use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
};

use super::{ProtocolError, Status};

/// Magic value carried by every frame. The low byte is the protocol version.
pub const MAGIC: u32 = 0x5243_4302;

pub const MAGIC_SIZE: usize = size_of::<u32>();
pub const REQUEST_ID_SIZE: usize = size_of::<u64>();
pub const DAO_VERSION_SIZE: usize = size_of::<u32>();
pub const PAYLOAD_SIZE_SIZE: usize = size_of::<u32>();
pub const STATUS_SIZE: usize = size_of::<i32>();
pub const HEADER_SIZE: usize =
    MAGIC_SIZE + REQUEST_ID_SIZE + DAO_VERSION_SIZE + PAYLOAD_SIZE_SIZE + STATUS_SIZE;

/// Largest payload a peer may announce.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

pub(crate) fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Fixed-size frame header shared by requests and responses.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub request_id: u64,
    pub dao_version: u32,
    pub payload_size: u32,
    pub status: i32,
}

impl Header {
    pub fn new(request_id: u64, dao_version: u32, payload_size: u32, status: Status) -> Self {
        Self {
            magic: MAGIC,
            request_id,
            dao_version,
            payload_size,
            status: status.code(),
        }
    }

    pub fn status(&self) -> Status {
        Status::from_code(self.status)
    }

    pub fn as_bytes(&self) -> Result<[u8; HEADER_SIZE], ProtocolError> {
        let mut buf = [0; HEADER_SIZE];
        let written = bincode::encode_into_slice(self, &mut buf, wire_config())?;
        debug_assert_eq!(written, HEADER_SIZE);
        Ok(buf)
    }

    /// Checks the fields a receiver must trust before reading the payload.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.magic != MAGIC {
            if self.magic >> 8 == MAGIC >> 8 {
                return Err(ProtocolError::Version {
                    expected: MAGIC & 0xff,
                    found: self.magic & 0xff,
                });
            }
            return Err(ProtocolError::Magic(self.magic));
        }
        if self.payload_size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(self.payload_size));
        }
        Ok(())
    }
}

impl TryFrom<&[u8; HEADER_SIZE]> for Header {
    type Error = ProtocolError;

    fn try_from(value: &[u8; HEADER_SIZE]) -> Result<Self, Self::Error> {
        let (header, _): (Header, usize) =
            bincode::decode_from_slice(&value[..], wire_config())?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_fixed() {
        let header = Header::new(u64::MAX, u32::MAX, 0, Status::Unknown(i32::MIN));
        let bytes = header.as_bytes().unwrap();
        assert_eq!(bytes.len(), 24);
    }

    #[test]
    fn header_round_trip() {
        let header = Header::new(42, 7, 128, Status::ValueFound);
        let bytes = header.as_bytes().unwrap();
        let decoded = Header::try_from(&bytes).unwrap();

        assert_eq!(decoded, header);
        assert_eq!(decoded.status(), Status::ValueFound);
    }

    #[test]
    fn header_is_big_endian() {
        let header = Header::new(1, 2, 3, Status::NotFound);
        let bytes = header.as_bytes().unwrap();

        assert_eq!(&bytes[0..4], &MAGIC.to_be_bytes());
        assert_eq!(&bytes[4..12], &1u64.to_be_bytes());
        assert_eq!(&bytes[12..16], &2u32.to_be_bytes());
        assert_eq!(&bytes[16..20], &3u32.to_be_bytes());
        assert_eq!(&bytes[20..24], &Status::NotFound.code().to_be_bytes());
    }

    #[test]
    fn validate_rejects_foreign_magic() {
        let mut header = Header::new(1, 1, 0, Status::None);
        header.magic = 0xdead_beef;
        assert!(matches!(header.validate(), Err(ProtocolError::Magic(0xdead_beef))));
    }

    #[test]
    fn validate_reports_version_mismatch() {
        let mut header = Header::new(1, 1, 0, Status::None);
        header.magic = (MAGIC & !0xff) | 0x01;
        assert!(matches!(
            header.validate(),
            Err(ProtocolError::Version { found: 1, .. })
        ));
    }

    #[test]
    fn validate_rejects_huge_payload() {
        let header = Header::new(1, 1, MAX_PAYLOAD_SIZE + 1, Status::None);
        assert!(matches!(
            header.validate(),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }
}
