//! On-wire formats: the connection handshake blob and the credit stream.
//!
//! Both formats are packed with explicit big-endian fields; neither grows
//! implicitly. Receivers tolerate trailing bytes for forward compatibility.

use crate::error::{Error, ErrorKind, Result};
use crate::session::Direction;

/// Protocol magic carried in the CM private-data slot ("RDMA").
pub(crate) const PROTOCOL_ID: u32 = 0x5244_4D41;
pub(crate) const PROTOCOL_VERSION: u8 = 1;
pub(crate) const OLDEST_COMPATIBLE_VERSION: u8 = 1;

/// Encoded size of the handshake blob.
pub(crate) const CONNECTION_DATA_LEN: usize = 7;

/// Maximum credits carried by one credit message.
pub(crate) const MAX_CREDITS_PER_MESSAGE: usize = 100;

/// Size of one credit message buffer.
pub(crate) const CREDIT_MESSAGE_SIZE: usize = MAX_CREDITS_PER_MESSAGE * 8;

/// Depth of the auxiliary credit queue.
pub(crate) const NUM_CREDIT_BUFFERS: usize = 100;

/// Build the handshake blob announcing our protocol and declared direction.
pub(crate) fn encode_connection_data(direction: Direction) -> Vec<u8> {
    let mut out = Vec::with_capacity(CONNECTION_DATA_LEN);
    out.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    out.push(PROTOCOL_VERSION);
    out.push(OLDEST_COMPATIBLE_VERSION);
    out.push(direction as u8);
    out
}

/// Validate the peer's handshake blob against our local direction.
///
/// Acceptance: matching protocol id, peer's oldest compatible version not
/// newer than ours, and the peer's declared direction opposite to ours.
/// Trailing bytes (private-data padding) are ignored.
pub(crate) fn validate_connection_data(buffer: &[u8], my_direction: Direction) -> Result<()> {
    if buffer.len() < CONNECTION_DATA_LEN {
        return Err(Error::new(ErrorKind::IncompatibleProtocol));
    }
    let protocol_id = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    if protocol_id != PROTOCOL_ID {
        return Err(Error::new(ErrorKind::IncompatibleProtocol));
    }
    let oldest_compatible = buffer[5];
    if oldest_compatible > PROTOCOL_VERSION {
        return Err(Error::new(ErrorKind::IncompatibleVersion));
    }
    debug_assert!(my_direction != Direction::Unknown);
    let expected = my_direction.opposite();
    if buffer[6] != expected as u8 {
        return Err(Error::new(ErrorKind::InvalidDirection));
    }
    Ok(())
}

/// Encode up to [`MAX_CREDITS_PER_MESSAGE`] credits into a credit message
/// buffer, returning the number of bytes written.
pub(crate) fn encode_credits(sizes: &[u64], out: &mut [u8]) -> usize {
    debug_assert!(sizes.len() <= MAX_CREDITS_PER_MESSAGE);
    for (i, size) in sizes.iter().enumerate() {
        out[i * 8..i * 8 + 8].copy_from_slice(&size.to_be_bytes());
    }
    sizes.len() * 8
}

/// Decode the credits held in a completed credit message.
pub(crate) fn decode_credits(payload: &[u8]) -> Vec<u64> {
    payload
        .chunks_exact(8)
        .map(|chunk| u64::from_be_bytes(chunk.try_into().unwrap()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_data_layout() {
        let data = encode_connection_data(Direction::Send);
        assert_eq!(data.len(), CONNECTION_DATA_LEN);
        assert_eq!(&data[..4], &[0x52, 0x44, 0x4D, 0x41]);
        assert_eq!(data[4], 1);
        assert_eq!(data[5], 1);
        assert_eq!(data[6], 0x00);
        assert_eq!(encode_connection_data(Direction::Receive)[6], 0x01);
    }

    #[test]
    fn validate_accepts_opposite_direction() {
        let data = encode_connection_data(Direction::Send);
        validate_connection_data(&data, Direction::Receive).unwrap();
        assert_eq!(
            validate_connection_data(&data, Direction::Send)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidDirection
        );
    }

    #[test]
    fn validate_tolerates_trailing_padding() {
        let mut data = encode_connection_data(Direction::Receive);
        data.extend_from_slice(&[0u8; 41]); // CM private data arrives padded
        validate_connection_data(&data, Direction::Send).unwrap();
    }

    #[test]
    fn validate_rejects_bad_blobs() {
        assert_eq!(
            validate_connection_data(&[1, 2, 3], Direction::Send)
                .unwrap_err()
                .kind(),
            ErrorKind::IncompatibleProtocol
        );

        let mut wrong_magic = encode_connection_data(Direction::Receive);
        wrong_magic[0] = 0x00;
        assert_eq!(
            validate_connection_data(&wrong_magic, Direction::Send)
                .unwrap_err()
                .kind(),
            ErrorKind::IncompatibleProtocol
        );

        let mut future = encode_connection_data(Direction::Receive);
        future[5] = PROTOCOL_VERSION + 1; // peer requires a newer library
        assert_eq!(
            validate_connection_data(&future, Direction::Send)
                .unwrap_err()
                .kind(),
            ErrorKind::IncompatibleVersion
        );
    }

    #[test]
    fn credit_codec_roundtrip() {
        let sizes = [4096u64, 1, 0, u64::MAX];
        let mut buf = [0u8; CREDIT_MESSAGE_SIZE];
        let written = encode_credits(&sizes, &mut buf);
        assert_eq!(written, 32);
        assert_eq!(decode_credits(&buf[..written]), sizes);
        // Big-endian on the wire.
        assert_eq!(&buf[..8], &[0, 0, 0, 0, 0, 0, 0x10, 0]);
    }
}
