// =============================================================================
// FIX 4.4 tag=value codec
// =============================================================================
//
// Encoding builds the standard header (8, 9, 35, 34, 49, 56, 52), the body,
// and the trailing checksum (10). Decoding validates BodyLength and CheckSum
// before any field is interpreted. Field order inside the body is preserved
// so repeating groups survive a round trip.
// =============================================================================

use crate::errors::CoreError;

/// Field delimiter (SOH).
pub const SOH: u8 = 0x01;

/// Protocol identity sent in tag 8.
pub const BEGIN_STRING: &str = "FIX.4.4";

/// Tag numbers used by this session layer.
pub mod tags {
    pub const BEGIN_STRING: u32 = 8;
    pub const BODY_LENGTH: u32 = 9;
    pub const CHECKSUM: u32 = 10;
    pub const CL_ORD_ID: u32 = 11;
    pub const CUM_QTY: u32 = 14;
    pub const MSG_SEQ_NUM: u32 = 34;
    pub const MSG_TYPE: u32 = 35;
    pub const ORDER_ID: u32 = 37;
    pub const ORDER_QTY: u32 = 38;
    pub const ORD_STATUS: u32 = 39;
    pub const ORD_TYPE: u32 = 40;
    pub const PRICE: u32 = 44;
    pub const SENDER_COMP_ID: u32 = 49;
    pub const SENDING_TIME: u32 = 52;
    pub const SIDE: u32 = 54;
    pub const SYMBOL: u32 = 55;
    pub const TARGET_COMP_ID: u32 = 56;
    pub const TEXT: u32 = 58;
    pub const TIME_IN_FORCE: u32 = 59;
    pub const TRANSACT_TIME: u32 = 60;
    pub const AVG_PX: u32 = 6;
    pub const BEGIN_SEQ_NO: u32 = 7;
    pub const END_SEQ_NO: u32 = 16;
    pub const LAST_PX: u32 = 31;
    pub const LAST_QTY: u32 = 32;
    pub const NEW_SEQ_NO: u32 = 36;
    pub const POSS_DUP_FLAG: u32 = 43;
    pub const REF_SEQ_NUM: u32 = 45;
    pub const ENCRYPT_METHOD: u32 = 98;
    pub const HEART_BT_INT: u32 = 108;
    pub const TEST_REQ_ID: u32 = 112;
    pub const GAP_FILL_FLAG: u32 = 123;
    pub const RESET_SEQ_NUM_FLAG: u32 = 141;
    pub const NO_RELATED_SYM: u32 = 146;
    pub const EXEC_TYPE: u32 = 150;
    pub const MD_REQ_ID: u32 = 262;
    pub const SUBSCRIPTION_REQUEST_TYPE: u32 = 263;
    pub const MARKET_DEPTH: u32 = 264;
    pub const NO_MD_ENTRY_TYPES: u32 = 267;
    pub const NO_MD_ENTRIES: u32 = 268;
    pub const MD_ENTRY_TYPE: u32 = 269;
    pub const MD_ENTRY_PX: u32 = 270;
    pub const MD_UPDATE_ACTION: u32 = 279;
    pub const MD_REQ_REJ_REASON: u32 = 281;
    pub const USERNAME: u32 = 553;
    pub const PASSWORD: u32 = 554;
}

/// Message type values (tag 35).
pub mod msg_type {
    pub const HEARTBEAT: &str = "0";
    pub const TEST_REQUEST: &str = "1";
    pub const RESEND_REQUEST: &str = "2";
    pub const REJECT: &str = "3";
    pub const SEQUENCE_RESET: &str = "4";
    pub const LOGOUT: &str = "5";
    pub const EXECUTION_REPORT: &str = "8";
    pub const LOGON: &str = "A";
    pub const NEW_ORDER_SINGLE: &str = "D";
    pub const ORDER_CANCEL_REQUEST: &str = "F";
    pub const MARKET_DATA_REQUEST: &str = "V";
    pub const MARKET_DATA_SNAPSHOT: &str = "W";
    pub const MARKET_DATA_INCREMENTAL: &str = "X";
    pub const MARKET_DATA_REQUEST_REJECT: &str = "Y";
}

// ---------------------------------------------------------------------------
// Message model
// ---------------------------------------------------------------------------

/// A decoded FIX message: ordered `(tag, value)` pairs, header included.
#[derive(Debug, Clone)]
pub struct FixMessage {
    pub fields: Vec<(u32, String)>,
}

impl FixMessage {
    /// First value for `tag`, if present.
    pub fn get(&self, tag: u32) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_parsed<T: std::str::FromStr>(&self, tag: u32) -> Option<T> {
        self.get(tag).and_then(|v| v.parse().ok())
    }

    pub fn msg_type(&self) -> Option<&str> {
        self.get(tags::MSG_TYPE)
    }

    pub fn seq_num(&self) -> Option<u64> {
        self.get_parsed(tags::MSG_SEQ_NUM)
    }

    pub fn is_poss_dup(&self) -> bool {
        self.get(tags::POSS_DUP_FLAG) == Some("Y")
    }

    /// All values for `tag` in body order; used for repeating groups.
    pub fn get_all(&self, tag: u32) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Iterate `(tag, value)` pairs starting after the first occurrence of
    /// `group_start`. Used by repeating-group walkers.
    pub fn fields_from(&self, group_start: u32) -> &[(u32, String)] {
        match self.fields.iter().position(|(t, _)| *t == group_start) {
            Some(idx) => &self.fields[idx + 1..],
            None => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Serialize one message. `body` holds everything after the standard header
/// fields; the sending time is stamped here.
pub fn encode(
    msg_type: &str,
    seq_num: u64,
    sender: &str,
    target: &str,
    body: &[(u32, String)],
) -> Vec<u8> {
    let sending_time = chrono::Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string();

    let mut inner = Vec::with_capacity(128);
    push_field(&mut inner, tags::MSG_TYPE, msg_type);
    push_field(&mut inner, tags::MSG_SEQ_NUM, &seq_num.to_string());
    push_field(&mut inner, tags::SENDER_COMP_ID, sender);
    push_field(&mut inner, tags::TARGET_COMP_ID, target);
    push_field(&mut inner, tags::SENDING_TIME, &sending_time);
    for (tag, value) in body {
        push_field(&mut inner, *tag, value);
    }

    let mut out = Vec::with_capacity(inner.len() + 32);
    push_field(&mut out, tags::BEGIN_STRING, BEGIN_STRING);
    push_field(&mut out, tags::BODY_LENGTH, &inner.len().to_string());
    out.extend_from_slice(&inner);

    let checksum: u32 = out.iter().map(|b| *b as u32).sum::<u32>() % 256;
    push_field(&mut out, tags::CHECKSUM, &format!("{checksum:03}"));
    out
}

fn push_field(buf: &mut Vec<u8>, tag: u32, value: &str) {
    buf.extend_from_slice(tag.to_string().as_bytes());
    buf.push(b'=');
    buf.extend_from_slice(value.as_bytes());
    buf.push(SOH);
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Try to take one complete message off the front of `buf`. Returns `None`
/// when more bytes are needed. On success the consumed bytes are drained.
pub fn extract_message(buf: &mut Vec<u8>) -> Result<Option<FixMessage>, CoreError> {
    // Resynchronize on the protocol preamble if garbage precedes it.
    let preamble = b"8=FIX";
    let start = match find_subslice(buf, preamble) {
        Some(idx) => idx,
        None => {
            // No preamble yet; retain a small tail in case it is split.
            if buf.len() > preamble.len() {
                buf.drain(..buf.len() - preamble.len());
            }
            return Ok(None);
        }
    };
    if start > 0 {
        buf.drain(..start);
    }

    // Locate tag 9 to learn the body length.
    let header_end = match find_nth_soh(buf, 2) {
        Some(idx) => idx,
        None => return Ok(None),
    };
    let header = &buf[..header_end];
    let body_len = parse_body_length(header)?;

    // Body starts after the second SOH; trailer is "10=NNN<SOH>".
    let body_start = header_end + 1;
    let trailer_len = 7;
    let total = body_start + body_len + trailer_len;
    if buf.len() < total {
        return Ok(None);
    }

    let raw: Vec<u8> = buf.drain(..total).collect();
    parse_message(&raw).map(Some)
}

fn parse_body_length(header: &[u8]) -> Result<usize, CoreError> {
    let text = std::str::from_utf8(header)
        .map_err(|_| CoreError::MalformedMessage("non-utf8 header".into()))?;
    let field = text
        .split('\x01')
        .find(|f| f.starts_with("9="))
        .ok_or_else(|| CoreError::MalformedMessage("missing BodyLength".into()))?;
    field[2..]
        .parse()
        .map_err(|_| CoreError::MalformedMessage(format!("bad BodyLength: {field}")))
}

/// Parse and checksum-validate one complete raw message.
pub fn parse_message(raw: &[u8]) -> Result<FixMessage, CoreError> {
    if raw.len() < 8 {
        return Err(CoreError::MalformedMessage("truncated message".into()));
    }
    let checksum_field_start = raw.len() - 7;
    let expected: u32 = raw[..checksum_field_start]
        .iter()
        .map(|b| *b as u32)
        .sum::<u32>()
        % 256;

    let mut fields = Vec::with_capacity(16);
    for part in raw.split(|b| *b == SOH) {
        if part.is_empty() {
            continue;
        }
        let text = std::str::from_utf8(part)
            .map_err(|_| CoreError::MalformedMessage("non-utf8 field".into()))?;
        let eq = text
            .find('=')
            .ok_or_else(|| CoreError::MalformedMessage(format!("field without '=': {text}")))?;
        let tag: u32 = text[..eq]
            .parse()
            .map_err(|_| CoreError::MalformedMessage(format!("bad tag: {text}")))?;
        fields.push((tag, text[eq + 1..].to_string()));
    }

    let msg = FixMessage { fields };
    let declared: u32 = msg
        .get_parsed(tags::CHECKSUM)
        .ok_or_else(|| CoreError::MalformedMessage("missing CheckSum".into()))?;
    if declared != expected {
        return Err(CoreError::MalformedMessage(format!(
            "checksum mismatch: declared {declared}, computed {expected}"
        )));
    }
    Ok(msg)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn find_nth_soh(buf: &[u8], n: usize) -> Option<usize> {
    let mut seen = 0;
    for (idx, b) in buf.iter().enumerate() {
        if *b == SOH {
            seen += 1;
            if seen == n {
                return Some(idx);
            }
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg_type: &str, body: &[(u32, String)]) -> FixMessage {
        let raw = encode(msg_type, 7, "HELIOS", "LP1", body);
        parse_message(&raw).expect("encoded message must parse")
    }

    #[test]
    fn encode_produces_valid_header_and_checksum() {
        let msg = round_trip(msg_type::HEARTBEAT, &[]);
        assert_eq!(msg.get(tags::BEGIN_STRING), Some("FIX.4.4"));
        assert_eq!(msg.msg_type(), Some("0"));
        assert_eq!(msg.seq_num(), Some(7));
        assert_eq!(msg.get(tags::SENDER_COMP_ID), Some("HELIOS"));
        assert_eq!(msg.get(tags::TARGET_COMP_ID), Some("LP1"));
    }

    #[test]
    fn body_fields_survive_round_trip_in_order() {
        let body = vec![
            (tags::NO_MD_ENTRIES, "2".to_string()),
            (tags::MD_ENTRY_TYPE, "0".to_string()),
            (tags::MD_ENTRY_PX, "1.0900".to_string()),
            (tags::MD_ENTRY_TYPE, "1".to_string()),
            (tags::MD_ENTRY_PX, "1.0902".to_string()),
        ];
        let msg = round_trip(msg_type::MARKET_DATA_SNAPSHOT, &body);
        let types = msg.get_all(tags::MD_ENTRY_TYPE);
        let prices = msg.get_all(tags::MD_ENTRY_PX);
        assert_eq!(types, vec!["0", "1"]);
        assert_eq!(prices, vec!["1.0900", "1.0902"]);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut raw = encode(msg_type::HEARTBEAT, 1, "A", "B", &[]);
        // Flip a byte inside the body.
        let idx = raw.len() / 2;
        raw[idx] ^= 0x01;
        assert!(matches!(
            parse_message(&raw),
            Err(CoreError::MalformedMessage(_))
        ));
    }

    #[test]
    fn extract_handles_partial_and_concatenated_input() {
        let one = encode(msg_type::HEARTBEAT, 1, "A", "B", &[]);
        let two = encode(
            msg_type::TEST_REQUEST,
            2,
            "A",
            "B",
            &[(tags::TEST_REQ_ID, "ping-1".to_string())],
        );

        let mut buf = Vec::new();
        buf.extend_from_slice(&one[..10]);
        assert!(extract_message(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&one[10..]);
        buf.extend_from_slice(&two);

        let first = extract_message(&mut buf).unwrap().unwrap();
        assert_eq!(first.msg_type(), Some("0"));
        let second = extract_message(&mut buf).unwrap().unwrap();
        assert_eq!(second.msg_type(), Some("1"));
        assert_eq!(second.get(tags::TEST_REQ_ID), Some("ping-1"));
        assert!(extract_message(&mut buf).unwrap().is_none());
    }

    #[test]
    fn extract_resynchronizes_past_garbage() {
        let msg = encode(msg_type::HEARTBEAT, 5, "A", "B", &[]);
        let mut buf = b"garbage-bytes".to_vec();
        buf.extend_from_slice(&msg);
        let parsed = extract_message(&mut buf).unwrap().unwrap();
        assert_eq!(parsed.seq_num(), Some(5));
    }

    #[test]
    fn poss_dup_flag_detection() {
        let body = vec![(tags::POSS_DUP_FLAG, "Y".to_string())];
        let msg = round_trip(msg_type::HEARTBEAT, &body);
        assert!(msg.is_poss_dup());
    }
}
