//! Stream framing over buffer chains.
//!
//! Turns a byte stream into complete MariaDB packets and answers the
//! response-walking questions the backend state machine asks: where does a
//! result set end, is a prepared-statement response complete, what did a
//! real OK packet say about session state.

use crate::buffer::BufferChain;
use crate::protocol::packet::{
    get_lenenc_int, payload_len, EOF_PAYLOAD_MAX_LEN, HEADER_LEN, REPLY_AUTH_SWITCH, REPLY_EOF,
    REPLY_ERR, REPLY_LOCAL_INFILE, REPLY_OK, SERVER_MORE_RESULTS_EXIST,
    SERVER_SESSION_STATE_CHANGED,
};

/// Split all complete packets off the front of `chain`, leaving any partial
/// trailing packet behind. Returns `None` when no complete packet is
/// available.
pub fn extract_complete(chain: &mut BufferChain) -> Option<BufferChain> {
    let mut complete_len = 0usize;
    loop {
        let header = match chain.copy_bytes(complete_len, HEADER_LEN) {
            Some(h) => h,
            None => break,
        };
        let total = HEADER_LEN + payload_len(&header);
        if complete_len + total > chain.len() {
            break;
        }
        complete_len += total;
    }
    if complete_len == 0 {
        return None;
    }
    Some(chain.split_to(complete_len))
}

/// Count the complete packets in `chain`. Trailing partial bytes are not
/// counted.
pub fn packet_count(chain: &BufferChain) -> usize {
    let mut count = 0;
    let mut offset = 0;
    while let Some(header) = chain.copy_bytes(offset, HEADER_LEN) {
        let total = HEADER_LEN + payload_len(&header);
        if offset + total > chain.len() {
            break;
        }
        offset += total;
        count += 1;
    }
    count
}

/// Split the first complete packet (header included) off the chain.
pub fn next_packet(chain: &mut BufferChain) -> Option<BufferChain> {
    let header = chain.copy_bytes(0, HEADER_LEN)?;
    let total = HEADER_LEN + payload_len(&header);
    if total > chain.len() {
        return None;
    }
    Some(chain.split_to(total))
}

/// First payload byte of the first packet, if a complete header and at
/// least one payload byte are present.
pub fn reply_byte(chain: &BufferChain) -> Option<u8> {
    chain.peek_u8(HEADER_LEN)
}

/// Payload length of the first packet.
pub fn first_payload_len(chain: &BufferChain) -> Option<usize> {
    chain.copy_bytes(0, HEADER_LEN).map(|h| payload_len(&h))
}

/// Sequence number of the first packet.
pub fn first_sequence(chain: &BufferChain) -> Option<u8> {
    chain.peek_u8(3)
}

pub fn is_ok_packet(chain: &BufferChain) -> bool {
    reply_byte(chain) == Some(REPLY_OK)
}

pub fn is_err_packet(chain: &BufferChain) -> bool {
    reply_byte(chain) == Some(REPLY_ERR)
}

/// An EOF packet shares its first byte with the AuthSwitchRequest; the
/// payload length (≤ 5) disambiguates.
pub fn is_eof_packet(chain: &BufferChain) -> bool {
    reply_byte(chain) == Some(REPLY_EOF)
        && first_payload_len(chain).is_some_and(|l| l <= EOF_PAYLOAD_MAX_LEN)
}

pub fn is_auth_switch(chain: &BufferChain) -> bool {
    reply_byte(chain) == Some(REPLY_AUTH_SWITCH)
        && first_payload_len(chain).is_some_and(|l| l > EOF_PAYLOAD_MAX_LEN)
}

pub fn is_local_infile(chain: &BufferChain) -> bool {
    reply_byte(chain) == Some(REPLY_LOCAL_INFILE)
}

/// True when the first packet opens a result set (i.e. is none of the
/// single-packet replies).
pub fn is_result_set(chain: &BufferChain) -> bool {
    match reply_byte(chain) {
        Some(REPLY_OK) | Some(REPLY_ERR) | Some(REPLY_LOCAL_INFILE) => false,
        Some(REPLY_EOF) if is_eof_packet(chain) => false,
        Some(_) => true,
        None => false,
    }
}

/// Error code of a leading ERR packet.
pub fn error_code(chain: &BufferChain) -> Option<u16> {
    if !is_err_packet(chain) {
        return None;
    }
    chain
        .copy_bytes(HEADER_LEN + 1, 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

/// Human-readable message of a leading ERR packet.
pub fn error_message(chain: &BufferChain) -> Option<String> {
    if !is_err_packet(chain) {
        return None;
    }
    let plen = first_payload_len(chain)?;
    if plen < 3 {
        return None;
    }
    let mut body = chain.copy_bytes(HEADER_LEN + 3, plen - 3)?;
    // Skip the '#' + 5-byte SQL state marker when present.
    if body.first() == Some(&b'#') && body.len() >= 6 {
        body.drain(..6);
    }
    Some(String::from_utf8_lossy(&body).into_owned())
}

/// Result-set signal bookkeeping: EOF and ERR packets terminate (or, with
/// the more-results flag, continue) a text result.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalCount {
    /// EOF and ERR packets seen.
    pub signals: usize,
    /// More-results flag of the last EOF seen.
    pub more_results: bool,
    /// An ERR packet was seen.
    pub err: bool,
}

/// Walk the complete packets of `chain` counting result-set signal packets.
pub fn count_signal_packets(chain: &BufferChain) -> SignalCount {
    let mut out = SignalCount::default();
    let mut offset = 0;
    while let Some(header) = chain.copy_bytes(offset, HEADER_LEN) {
        let plen = payload_len(&header);
        if offset + HEADER_LEN + plen > chain.len() {
            break;
        }
        match chain.peek_u8(offset + HEADER_LEN) {
            Some(REPLY_EOF) if plen <= EOF_PAYLOAD_MAX_LEN => {
                out.signals += 1;
                // EOF payload: 0xfe, warnings u16, status u16
                if let Some(status) = chain.copy_bytes(offset + HEADER_LEN + 3, 2) {
                    out.more_results =
                        u16::from_le_bytes([status[0], status[1]]) & SERVER_MORE_RESULTS_EXIST != 0;
                }
            }
            Some(REPLY_ERR) if offset > 0 => {
                out.signals += 1;
                out.more_results = false;
                out.err = true;
            }
            _ => {}
        }
        offset += HEADER_LEN + plen;
    }
    out
}

/// Header fields of a COM_STMT_PREPARE OK reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsResponse {
    pub statement_id: u32,
    pub columns: u16,
    pub parameters: u16,
}

/// True when the first packet looks like a COM_STMT_PREPARE OK header.
pub fn is_prep_stmt_ok(chain: &BufferChain) -> bool {
    reply_byte(chain) == Some(REPLY_OK) && first_payload_len(chain).is_some_and(|l| l >= 12)
}

/// Parse the COM_STMT_PREPARE OK header of the first packet.
pub fn parse_ps_response(chain: &BufferChain) -> Option<PsResponse> {
    if !is_prep_stmt_ok(chain) {
        return None;
    }
    let body = chain.copy_bytes(HEADER_LEN + 1, 8)?;
    Some(PsResponse {
        statement_id: u32::from_le_bytes([body[0], body[1], body[2], body[3]]),
        columns: u16::from_le_bytes([body[4], body[5]]),
        parameters: u16::from_le_bytes([body[6], body[7]]),
    })
}

/// Compare the packet count of a prepared-statement response to the count
/// its OK header promises: the header itself, column definitions plus one
/// EOF when columns > 0, parameter definitions plus one EOF when
/// parameters > 0.
pub fn ps_response_complete(chain: &BufferChain) -> bool {
    let Some(resp) = parse_ps_response(chain) else {
        return false;
    };
    let mut expected = 1usize;
    if resp.columns > 0 {
        expected += resp.columns as usize + 1;
    }
    if resp.parameters > 0 {
        expected += resp.parameters as usize + 1;
    }
    packet_count(chain) == expected
}

/// Session-state entries extracted from a real OK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackEntry {
    Schema(String),
    SystemVariable(String, String),
    Other(u8),
}

/// Parsed OK packet, including any session-state trailer.
#[derive(Debug, Clone, Default)]
pub struct OkResponse {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
    pub track: Vec<TrackEntry>,
}

fn get_lenenc_str(data: &[u8]) -> Option<(String, usize)> {
    let (len, used) = get_lenenc_int(data)?;
    let len = len as usize;
    if data.len() < used + len {
        return None;
    }
    Some((
        String::from_utf8_lossy(&data[used..used + len]).into_owned(),
        used + len,
    ))
}

/// Parse the first packet of `chain` as an OK packet with optional
/// session-state tracking data.
///
/// This must only be fed "real" OK packets: the OK sent in response to
/// COM_STMT_PREPARE has a different layout and is skipped by the caller.
pub fn parse_ok_response(chain: &BufferChain) -> Option<OkResponse> {
    if !is_ok_packet(chain) {
        return None;
    }
    let plen = first_payload_len(chain)?;
    let payload = chain.copy_bytes(HEADER_LEN, plen)?;
    let mut pos = 1usize;

    let (affected_rows, used) = get_lenenc_int(&payload[pos..])?;
    pos += used;
    let (last_insert_id, used) = get_lenenc_int(&payload[pos..])?;
    pos += used;
    if payload.len() < pos + 4 {
        return None;
    }
    let status = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
    let warnings = u16::from_le_bytes([payload[pos + 2], payload[pos + 3]]);
    pos += 4;

    let mut out = OkResponse {
        affected_rows,
        last_insert_id,
        status,
        warnings,
        track: Vec::new(),
    };

    // Human-readable info string, present when anything follows.
    if pos < payload.len() {
        let (_info, used) = get_lenenc_str(&payload[pos..])?;
        pos += used;
    }

    if status & SERVER_SESSION_STATE_CHANGED != 0 && pos < payload.len() {
        let (state_len, used) = get_lenenc_int(&payload[pos..])?;
        pos += used;
        let end = (pos + state_len as usize).min(payload.len());
        let mut cursor = pos;
        while cursor < end {
            let entry_type = payload[cursor];
            cursor += 1;
            let (entry_len, used) = get_lenenc_int(&payload[cursor..end])?;
            cursor += used;
            let data = &payload[cursor..(cursor + entry_len as usize).min(end)];
            cursor += entry_len as usize;
            match entry_type {
                // SESSION_TRACK_SYSTEM_VARIABLES
                0 => {
                    let (name, used) = get_lenenc_str(data)?;
                    let (value, _) = get_lenenc_str(&data[used..])?;
                    out.track.push(TrackEntry::SystemVariable(name, value));
                }
                // SESSION_TRACK_SCHEMA
                1 => {
                    let (schema, _) = get_lenenc_str(data)?;
                    out.track.push(TrackEntry::Schema(schema));
                }
                other => out.track.push(TrackEntry::Other(other)),
            }
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::Packet;

    fn packets(specs: &[(u8, &[u8])]) -> BufferChain {
        let mut chain = BufferChain::new();
        for (seq, payload) in specs {
            chain.append_bytes(Packet::new(*seq, payload.to_vec()).to_vec());
        }
        chain
    }

    fn eof_payload(status: u16) -> Vec<u8> {
        let mut p = vec![0xfe, 0, 0];
        p.extend_from_slice(&status.to_le_bytes());
        p
    }

    #[test]
    fn test_extract_complete_splits_residue() {
        let mut chain = packets(&[(0, b"ab"), (1, b"cd")]);
        chain.append_bytes(vec![9, 0, 0, 2, 1]); // partial third packet
        let complete = extract_complete(&mut chain).unwrap();
        assert_eq!(packet_count(&complete), 2);
        assert_eq!(chain.len(), 5);
        assert!(extract_complete(&mut chain).is_none());
    }

    #[test]
    fn test_packet_roundtrip_concatenation() {
        let original = packets(&[(0, b"one"), (1, b"two"), (2, b"three")]);
        let reference = original.to_vec();
        let mut chain = original;
        let mut rebuilt = Vec::new();
        while let Some(pkt) = next_packet(&mut chain) {
            rebuilt.extend_from_slice(&pkt.to_vec());
        }
        assert_eq!(rebuilt, reference);
    }

    #[test]
    fn test_eof_and_auth_switch_disambiguation() {
        let eof = packets(&[(5, &eof_payload(0))]);
        assert!(is_eof_packet(&eof));
        assert!(!is_auth_switch(&eof));

        let mut payload = vec![0xfe];
        payload.extend_from_slice(b"mysql_native_password\0");
        payload.extend_from_slice(&[b'Z'; 20]);
        payload.push(0);
        let switch = packets(&[(2, &payload)]);
        assert!(!is_eof_packet(&switch));
        assert!(is_auth_switch(&switch));
    }

    #[test]
    fn test_error_code_and_message() {
        let mut payload = vec![0xff];
        payload.extend_from_slice(&1129u16.to_le_bytes());
        payload.extend_from_slice(b"#HY000");
        payload.extend_from_slice(b"Host blocked");
        let err = packets(&[(1, &payload)]);
        assert!(is_err_packet(&err));
        assert_eq!(error_code(&err), Some(1129));
        assert_eq!(error_message(&err).as_deref(), Some("Host blocked"));
    }

    #[test]
    fn test_count_signal_packets_complete_result() {
        // column count, column def, EOF, row, EOF
        let chain = packets(&[
            (1, &[0x01]),
            (2, b"coldef"),
            (3, &eof_payload(0)),
            (4, b"\x011"),
            (5, &eof_payload(0)),
        ]);
        let sig = count_signal_packets(&chain);
        assert_eq!(sig.signals, 2);
        assert!(!sig.more_results);
        assert!(!sig.err);
    }

    #[test]
    fn test_count_signal_packets_more_results() {
        let chain = packets(&[
            (1, &[0x01]),
            (2, b"coldef"),
            (3, &eof_payload(0)),
            (4, b"\x011"),
            (5, &eof_payload(SERVER_MORE_RESULTS_EXIST)),
        ]);
        let sig = count_signal_packets(&chain);
        assert_eq!(sig.signals, 2);
        assert!(sig.more_results);
    }

    #[test]
    fn test_ps_response_complete() {
        // COM_STMT_PREPARE OK header: id=1, 2 columns, 1 parameter
        let mut header = vec![0x00];
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&2u16.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.push(0);
        header.extend_from_slice(&0u16.to_le_bytes());

        let mut chain = packets(&[(1, &header), (2, b"param"), (3, &eof_payload(0))]);
        assert!(is_prep_stmt_ok(&chain));
        assert_eq!(
            parse_ps_response(&chain),
            Some(PsResponse {
                statement_id: 1,
                columns: 2,
                parameters: 1
            })
        );
        // 1 header + 2 cols + eof + 1 param + eof = 6 packets expected
        assert!(!ps_response_complete(&chain));

        chain.append(packets(&[(4, b"col1"), (5, b"col2"), (6, &eof_payload(0))]));
        assert!(ps_response_complete(&chain));
    }

    #[test]
    fn test_parse_ok_with_schema_track() {
        // OK: affected 0, insert id 0, status with session-state bit
        let mut payload = vec![0x00, 0x00, 0x00];
        payload.extend_from_slice(&SERVER_SESSION_STATE_CHANGED.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.push(0); // empty info string
        // session state: type 1 (schema), entry "test" wrapped in lenenc
        let entry = {
            let mut e = vec![1u8];
            e.push(5); // entry length
            e.push(4); // lenenc schema name length
            e.extend_from_slice(b"test");
            e
        };
        payload.push(entry.len() as u8);
        payload.extend_from_slice(&entry);

        let chain = packets(&[(1, &payload)]);
        let ok = parse_ok_response(&chain).unwrap();
        assert_eq!(ok.affected_rows, 0);
        assert_eq!(ok.track, vec![TrackEntry::Schema("test".into())]);
    }

    #[test]
    fn test_parse_ok_plain() {
        let payload = vec![0x00, 0x02, 0x00, 0x02, 0x00, 0x00, 0x00];
        let chain = packets(&[(1, &payload)]);
        let ok = parse_ok_response(&chain).unwrap();
        assert_eq!(ok.affected_rows, 2);
        assert_eq!(ok.status, 2);
        assert!(ok.track.is_empty());
    }
}
