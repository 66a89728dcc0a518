use crate::encoding::{self, Decode, EncodingError, MAX_BYTES, MAX_ITEMS};

#[test]
fn truncated_buffer_is_rejected() {
    let err = u64::decode(&[1, 2, 3]).unwrap_err();
    assert!(matches!(
        err,
        EncodingError::UnexpectedEnd {
            needed: 8,
            available: 3
        }
    ));
}

#[test]
fn oversized_byte_length_is_rejected() {
    // A length field claiming more than MAX_BYTES must fail before any
    // allocation happens.
    let mut buf = Vec::new();
    buf.extend_from_slice(&(MAX_BYTES + 1).to_le_bytes());
    let err = Vec::<u8>::decode(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOutOfRange(_)));
}

#[test]
fn oversized_sequence_count_is_rejected() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(MAX_ITEMS + 1).to_le_bytes());
    let err = encoding::decode_seq::<u64>(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOutOfRange(_)));
}

#[test]
fn invalid_bool_byte_is_rejected() {
    let err = bool::decode(&[2]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidBool(2)));
}

#[test]
fn invalid_option_tag_is_rejected() {
    let err = Option::<u8>::decode(&[9]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidTag { tag: 9, .. }));
}

#[test]
fn length_claim_beyond_buffer_is_rejected() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&100u32.to_le_bytes());
    buf.extend_from_slice(&[1, 2, 3]);
    let err = Vec::<u8>::decode(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEnd { .. }));
}
