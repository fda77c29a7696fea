use super::*;

#[test]
fn test_common_header_round_trip() -> Result<()> {
    let header = PacketHeader::Data(CommonHeader {
        payload_type: PayloadType::Data,
        packet_sequence_num: 7,
        payload_num: 42,
    });

    let raw = header.marshal()?;
    assert_eq!(raw.len(), COMMON_HEADER_SIZE);

    let parsed = PacketHeader::unmarshal(&raw)?;
    assert_eq!(parsed, header);

    Ok(())
}

#[test]
fn test_data_offset_round_trip() -> Result<()> {
    let header = PacketHeader::DataOffset {
        common: CommonHeader {
            payload_type: PayloadType::DataOffset,
            packet_sequence_num: 3,
            payload_num: 9,
        },
        payload_data_offset: 2940,
    };

    let raw = header.marshal()?;
    assert_eq!(raw.len(), DATA_OFFSET_HEADER_SIZE);
    assert_eq!(PacketHeader::unmarshal(&raw)?, header);

    Ok(())
}

#[test]
fn test_num0_round_trip() -> Result<()> {
    let tests = vec![
        ("empty extra data", Bytes::new()),
        ("with extra data", Bytes::from_static(b"per-frame metadata")),
    ];

    for (name, extra_data) in tests {
        let header = PacketHeader::Num0 {
            common: CommonHeader {
                payload_type: PayloadType::Data,
                packet_sequence_num: 0,
                payload_num: 255,
            },
            total_payload_size: 5_184_000,
            max_latency_microsecs: 16_666,
            origination_ptp_timestamp: PtpTimestamp {
                seconds: 1_700_000_000,
                nanoseconds: 999_999_999,
            },
            payload_user_data: 0xDEAD_BEEF_CAFE_F00D,
            extra_data: extra_data.clone(),
        };

        let raw = header.marshal()?;
        assert_eq!(
            raw.len(),
            NUM0_FIXED_HEADER_SIZE + extra_data.len(),
            "{name}: unexpected encoded size"
        );
        assert_eq!(PacketHeader::unmarshal(&raw)?, header, "{name}");
    }

    Ok(())
}

#[test]
fn test_num0_rejects_nonzero_sequence() {
    let header = PacketHeader::Num0 {
        common: CommonHeader {
            payload_type: PayloadType::Data,
            packet_sequence_num: 1,
            payload_num: 0,
        },
        total_payload_size: 100,
        max_latency_microsecs: 0,
        origination_ptp_timestamp: PtpTimestamp::default(),
        payload_user_data: 0,
        extra_data: Bytes::new(),
    };

    assert_eq!(header.marshal(), Err(Error::ErrNum0SequenceNonZero));
}

#[test]
fn test_keep_alive_packet_zero_is_num0() -> Result<()> {
    let header = PacketHeader::Num0 {
        common: CommonHeader {
            payload_type: PayloadType::KeepAlive,
            packet_sequence_num: 0,
            payload_num: 17,
        },
        total_payload_size: 1,
        max_latency_microsecs: 0,
        origination_ptp_timestamp: PtpTimestamp::default(),
        payload_user_data: 0,
        extra_data: Bytes::new(),
    };

    let raw = header.marshal()?;
    match PacketHeader::unmarshal(&raw)? {
        PacketHeader::Num0 { common, .. } => {
            assert_eq!(common.payload_type, PayloadType::KeepAlive);
        }
        other => panic!("expected Num0 header, got {other}"),
    }

    Ok(())
}

#[test]
fn test_unmarshal_too_small() {
    let tests = vec![
        ("empty", Bytes::new()),
        ("short common", Bytes::from_static(&[0, 0, 0])),
        // DataOffset type with only the common prefix present.
        ("short offset", Bytes::from_static(&[1, 0, 1, 0])),
        // sequence 0 Data packet cut before the num0 fixed fields end.
        ("short num0", Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 1])),
    ];

    for (name, raw) in tests {
        assert_eq!(
            PacketHeader::unmarshal(&raw),
            Err(Error::ErrPacketHeaderTooSmall),
            "{name}"
        );
    }
}

#[test]
fn test_unmarshal_truncated_extra_data() -> Result<()> {
    let header = PacketHeader::Num0 {
        common: CommonHeader {
            payload_type: PayloadType::Data,
            packet_sequence_num: 0,
            payload_num: 1,
        },
        total_payload_size: 16,
        max_latency_microsecs: 0,
        origination_ptp_timestamp: PtpTimestamp::default(),
        payload_user_data: 0,
        extra_data: Bytes::from_static(b"0123456789"),
    };

    let raw = header.marshal()?;
    let truncated = raw.slice(..raw.len() - 4);
    assert_eq!(
        PacketHeader::unmarshal(&truncated),
        Err(Error::ErrExtraDataTruncated)
    );

    Ok(())
}

#[test]
fn test_unknown_payload_type() {
    let raw = Bytes::from_static(&[200, 0, 0, 0]);
    assert_eq!(
        PacketHeader::unmarshal(&raw),
        Err(Error::ErrPayloadTypeUnknown)
    );
}
