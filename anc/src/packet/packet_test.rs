use bytes::Bytes;

use super::*;

fn caption_packet(words: usize) -> AncPacket {
    AncPacket {
        c_not_y_channel: false,
        line_number: 9,
        horizontal_offset: 0,
        source_stream_valid: true,
        source_stream_number: 1,
        did: 0x61,
        sdid: 0x01,
        user_data: (0..words).map(|i| (i as u16 * 37) & 0x3FF).collect(),
    }
}

#[test]
fn test_with_parity() {
    let tests = vec![
        // (byte, expected 10-bit word)
        (0x00, 0x200),
        (0x01, 0x101),
        (0x60, 0x260),
        (0x61, 0x161),
        (0xFF, 0x2FF),
    ];

    for (v, expected) in tests {
        assert_eq!(with_parity(v), expected, "parity word for {v:#04x}");
        let (back, ok) = strip_parity(expected);
        assert_eq!(back, v);
        assert!(ok, "parity bits for {v:#04x} should verify");
    }
}

#[test]
fn test_strip_parity_detects_damage() {
    let word = with_parity(0x61);
    // Flip the b8 parity bit.
    let (_, ok) = strip_parity(word ^ 0x100);
    assert!(!ok);
    // Flip the b9 inverse-parity bit.
    let (_, ok) = strip_parity(word ^ 0x200);
    assert!(!ok);
}

#[test]
fn test_packed_words() {
    let tests = vec![(0, 3), (1, 3), (2, 3), (3, 4), (16, 8), (255, 82)];
    for (count, expected) in tests {
        assert_eq!(packed_words(count), expected, "packed_words({count})");
    }
}

#[test]
fn test_empty_packet_round_trip() -> Result<()> {
    let payload = AncPayload {
        field_kind: FieldKind::Progressive,
        packets: vec![AncPacket {
            user_data: vec![],
            ..caption_packet(0)
        }],
    };

    let raw = payload.marshal()?;
    assert_eq!(raw.len(), PAYLOAD_HEADER_SIZE + packed_words(0) * 4);

    let (parsed, status) = AncPayload::unmarshal(&raw)?;
    assert_eq!(parsed, payload);
    assert!(parsed.packets[0].user_data.is_empty());
    assert_eq!(status, AncParseStatus::default());

    Ok(())
}

#[test]
fn test_round_trip_all_phases() -> Result<()> {
    // 10-bit words drift through the 32-bit groups with a period of 16, so
    // cover a full period plus the wrap on either side.
    for words in [1, 2, 3, 7, 15, 16, 17, 32, 255] {
        let payload = AncPayload {
            field_kind: FieldKind::Field1,
            packets: vec![caption_packet(words)],
        };

        let raw = payload.marshal()?;
        assert_eq!(
            raw.len(),
            PAYLOAD_HEADER_SIZE + packed_words(words) * 4,
            "{words} user data words"
        );

        let (parsed, status) = AncPayload::unmarshal(&raw)?;
        assert_eq!(parsed, payload, "{words} user data words");
        assert_eq!(status, AncParseStatus::default(), "{words} user data words");
    }

    Ok(())
}

#[test]
fn test_multi_packet_payload_round_trip() -> Result<()> {
    let payload = AncPayload {
        field_kind: FieldKind::Field2,
        packets: vec![caption_packet(5), caption_packet(0), caption_packet(23)],
    };

    let raw = payload.marshal()?;
    let (parsed, status) = AncPayload::unmarshal(&raw)?;
    assert_eq!(parsed, payload);
    assert_eq!(status, AncParseStatus::default());

    Ok(())
}

#[test]
fn test_known_encoding_empty_packet() -> Result<()> {
    // Hand-packed vector: line 9, stream 1 valid, DID 0x61, SDID 0x01,
    // count 0, then the checksum word.
    let payload = AncPayload {
        field_kind: FieldKind::Unspecified,
        packets: vec![AncPacket {
            c_not_y_channel: false,
            line_number: 9,
            horizontal_offset: 0,
            source_stream_valid: true,
            source_stream_number: 1,
            did: 0x61,
            sdid: 0x01,
            user_data: vec![],
        }],
    };

    let raw = payload.marshal()?;

    // Payload header: one packet, field kind 0.
    assert_eq!(&raw[..4], &[0x00, 0x01, 0x00, 0x00]);

    // First group: c=0, line=9 (11 bits), offset=0 (12 bits), s=1, num=1.
    let word0 = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    assert_eq!(word0, (9 << 20) | (1 << 7) | 1);

    // Second group: did10 | sdid10 | count10 | top 2 bits of the checksum.
    let did10 = u32::from(with_parity(0x61));
    let sdid10 = u32::from(with_parity(0x01));
    let count10 = u32::from(with_parity(0));
    let sum9 = (did10 + sdid10 + count10) & 0x1FF;
    let checksum = sum9 | ((!sum9 & 0x100) << 1);
    let word1 = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
    assert_eq!(word1, (did10 << 22) | (sdid10 << 12) | (count10 << 2) | (checksum >> 8));

    // Third group: low 8 checksum bits then zero padding.
    let word2 = u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]);
    assert_eq!(word2, (checksum & 0xFF) << 24);

    Ok(())
}

#[test]
fn test_parity_damage_is_counted_not_fatal() -> Result<()> {
    let payload = AncPayload {
        field_kind: FieldKind::Field1,
        packets: vec![caption_packet(4)],
    };
    let mut raw = payload.marshal()?.to_vec();

    // The DID word starts at bit 32 of the packet body; flipping its b8
    // parity bit also perturbs the running checksum.
    raw[PAYLOAD_HEADER_SIZE + 4] ^= 0x80;

    let (parsed, status) = AncPayload::unmarshal(&Bytes::from(raw))?;
    assert_eq!(status.parity_err_count, 1);
    assert_eq!(status.checksum_err_count, 1);
    assert_eq!(parsed.packets.len(), 1);

    Ok(())
}

#[test]
fn test_user_data_damage_fails_checksum_only() -> Result<()> {
    let payload = AncPayload {
        field_kind: FieldKind::Field1,
        packets: vec![caption_packet(16)],
    };
    let mut raw = payload.marshal()?.to_vec();

    // Bit 64 of the packet body is the top of UDW0's low 8 bits.
    raw[PAYLOAD_HEADER_SIZE + 8] ^= 0x80;

    let (_, status) = AncPayload::unmarshal(&Bytes::from(raw))?;
    assert_eq!(status.parity_err_count, 0);
    assert_eq!(status.checksum_err_count, 1);

    Ok(())
}

#[test]
fn test_truncated_payload() {
    let payload = AncPayload {
        field_kind: FieldKind::Field1,
        packets: vec![caption_packet(8)],
    };
    let raw = payload.marshal().unwrap();
    let truncated = raw.slice(..raw.len() - 8);
    assert_eq!(
        AncPayload::unmarshal(&truncated),
        Err(Error::ErrPayloadTruncated)
    );
}

#[test]
fn test_field_range_checks() {
    let tests = vec![
        (
            AncPacket {
                line_number: MAX_LINE_NUMBER + 1,
                ..AncPacket::default()
            },
            Error::ErrLineNumberRange,
        ),
        (
            AncPacket {
                horizontal_offset: MAX_HORIZONTAL_OFFSET + 1,
                ..AncPacket::default()
            },
            Error::ErrHorizontalOffsetRange,
        ),
        (
            AncPacket {
                source_stream_number: MAX_SOURCE_STREAM_NUMBER + 1,
                ..AncPacket::default()
            },
            Error::ErrStreamNumberRange,
        ),
        (
            AncPacket {
                user_data: vec![0; MAX_USER_DATA_WORDS + 1],
                ..AncPacket::default()
            },
            Error::ErrUserDataTooLong,
        ),
    ];

    for (packet, expected) in tests {
        let payload = AncPayload {
            field_kind: FieldKind::Unspecified,
            packets: vec![packet],
        };
        assert_eq!(payload.marshal(), Err(expected));
    }
}
