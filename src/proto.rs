use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

/// Encode a message to wire format.
pub fn encode(msg: &Message) -> anyhow::Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder).context("encode dns message")?;
    }
    Ok(Bytes::from(out))
}

/// Build a synthetic reply to `req` carrying only an rcode (SERVFAIL, FORMERR,
/// REFUSED). The question section is echoed back.
pub fn build_reply(req: &Message, rcode: ResponseCode) -> anyhow::Result<Bytes> {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
    msg.set_response_code(rcode);

    let queries: Vec<Query> = req.queries().to_vec();
    msg.add_queries(queries);

    encode(&msg)
}

/// Response-validity check: a response corresponds to a query when the
/// transaction IDs are equal and the question sections match. Upstreams that
/// echo a different question get replaced with FORMERR by the dispatcher.
pub fn response_matches(req: &Message, resp: &Message) -> bool {
    if req.id() != resp.id() {
        return false;
    }
    match (req.queries().first(), resp.queries().first()) {
        (Some(q), Some(r)) => {
            q.name() == r.name()
                && q.query_type() == r.query_type()
                && q.query_class() == r.query_class()
        }
        (None, None) => true,
        _ => false,
    }
}
