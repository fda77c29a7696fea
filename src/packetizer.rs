
use wire::{CommonHeader, PacketHeader, PayloadType};

use crate::adapter::memory::MemRegion;
use crate::error::Result;
use crate::pool::{Pool, PoolIdx};
use crate::tx_payload::{TxPayloadState, WorkRequest};

/// Outcome of one packetizer turn.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PacketizeStatus {
    /// A pool or the transmit region was empty; retry after completions
    /// return resources. No cursor state was advanced.
    NotReady,
    Packet {
        work_id: PoolIdx,
        last: bool,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum PacketizerState {
    Inactive,
    AddingHeader,
    AddingEntries,
}

/// Converts a payload's source scatter-gather list into wire packets, one
/// per call, respecting the packet size limit and the per-packet source
/// slice cap.
#[derive(Debug)]
pub(crate) struct Packetizer {
    max_packet_size: usize,
    max_tx_sgl_entries: usize,
    state: PacketizerState,
}

impl Packetizer {
    pub(crate) fn new(max_packet_size: usize, max_tx_sgl_entries: usize) -> Self {
        Packetizer {
            max_packet_size,
            max_tx_sgl_entries,
            state: PacketizerState::Inactive,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = PacketizerState::Inactive;
    }

    /// Produces the payload's next packet.
    ///
    /// Packet 0 is always the number-0 header variant; every later packet
    /// of a payload that did not fit in one packet carries the data-offset
    /// header so the receiver can place fragments that arrive out of
    /// order.
    pub(crate) fn next_packet(
        &mut self,
        payload_idx: PoolIdx,
        payload: &mut TxPayloadState,
        work_pool: &mut Pool<WorkRequest>,
        region: &mut MemRegion,
    ) -> Result<PacketizeStatus> {
        if self.state == PacketizerState::Inactive {
            self.state = PacketizerState::AddingHeader;
        }

        // AddingHeader: build and place the header inside the transmit
        // region. Failure leaves the state untouched so the caller can
        // retry the same packet.
        let sequence_num = payload.packet_state.packet_sequence_num;
        let common = CommonHeader {
            payload_type: payload.wire_payload_type(),
            packet_sequence_num: sequence_num,
            payload_num: payload.payload_num,
        };
        let header = if sequence_num == 0 {
            PacketHeader::Num0 {
                common,
                total_payload_size: payload.source_sgl.total_data_size() as u32,
                max_latency_microsecs: payload.max_latency_microsecs,
                origination_ptp_timestamp: payload.origination_ptp_timestamp,
                payload_user_data: payload.payload_user_data,
                extra_data: payload.extra_data.clone(),
            }
        } else if payload.packet_state.use_data_offset {
            PacketHeader::DataOffset {
                common: CommonHeader {
                    payload_type: PayloadType::DataOffset,
                    ..common
                },
                payload_data_offset: payload.packet_state.payload_byte_offset as u32,
            }
        } else {
            PacketHeader::Data(common)
        };
        let encoded = header.marshal()?;

        let Some(work_id) = work_pool.get(WorkRequest::new(
            payload_idx,
            payload.payload_num,
            sequence_num,
        )) else {
            return Ok(PacketizeStatus::NotReady);
        };
        let Some(header_block) = region.alloc(encoded.len()) else {
            work_pool.put(work_id);
            return Ok(PacketizeStatus::NotReady);
        };
        region.write(&header_block, &encoded);

        let mut max_payload_bytes = self.max_packet_size - encoded.len();
        if payload.group_size_bytes > 0 {
            if payload.group_size_bytes <= max_payload_bytes {
                max_payload_bytes -= max_payload_bytes % payload.group_size_bytes;
            } else if !payload.group_warned {
                payload.group_warned = true;
                log::warn!(
                    "payload group size {} exceeds packet capacity {}, groups will straddle packets",
                    payload.group_size_bytes,
                    max_payload_bytes
                );
            }
        }

        self.state = PacketizerState::AddingEntries;

        // AddingEntries: slice the source cursor forward until the packet
        // is full, the slice cap is hit or the payload is consumed.
        let mut entry_index = payload.packet_state.source_entry_index;
        let mut entry_offset = payload.packet_state.source_entry_offset;
        let mut entries = Vec::new();
        let mut packet_bytes = 0usize;
        while packet_bytes < max_payload_bytes && entries.len() < self.max_tx_sgl_entries {
            let Some(source) = payload.source_sgl.entries().get(entry_index) else {
                break;
            };
            let remaining_in_entry = source.len() - entry_offset;
            if remaining_in_entry == 0 {
                entry_index += 1;
                entry_offset = 0;
                continue;
            }
            let take = remaining_in_entry.min(max_payload_bytes - packet_bytes);
            entries.push(source.slice(entry_offset..entry_offset + take));
            entry_offset += take;
            packet_bytes += take;
            if entry_offset == source.len() {
                entry_index += 1;
                entry_offset = 0;
            }
        }

        payload.packet_state.source_entry_index = entry_index;
        payload.packet_state.source_entry_offset = entry_offset;
        payload.packet_state.payload_byte_offset += packet_bytes;
        payload.packet_state.packet_sequence_num = sequence_num.wrapping_add(1);

        let last = payload.packet_state.payload_byte_offset >= payload.source_sgl.total_data_size();
        if !last {
            payload.packet_state.use_data_offset = true;
        }

        let request = work_pool
            .get_mut(work_id)
            .expect("work request allocated above");
        request.header_block = header_block;
        request.packet_payload_size = packet_bytes;
        request.entries = entries;

        self.state = PacketizerState::Inactive;
        Ok(PacketizeStatus::Packet { work_id, last })
    }
}
