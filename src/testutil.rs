use std::str::FromStr;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::BinEncodable;

/// Wire-format recursive query with a single question, no EDNS.
pub fn build_query(id: u16, qname: &str, qtype: RecordType) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(qname).expect("name"), qtype));
    msg.to_bytes().expect("encode query")
}

/// Upstream-style answer to `query`, keeping its id and question bytes.
pub fn fake_upstream_reply(query: &[u8], rdata: [u8; 4]) -> Vec<u8> {
    let mut resp = query.to_vec();
    resp[2] = 0x81;
    resp[3] = 0x80;
    resp[7] = 0x01;
    resp.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0x0E, 0x10, 0, 4]);
    resp.extend_from_slice(&rdata);
    resp
}
