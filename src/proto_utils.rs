use std::net::Ipv4Addr;

use anyhow::{bail, ensure, Context, Result};
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

use crate::ipset::RamSet;

/// TTL used when a hosts record line carries none.
const DEFAULT_RECORD_TTL: u32 = 3600;

/// Serialize a message to wire format.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut out);
    msg.emit(&mut encoder).context("encode dns message")?;
    Ok(out)
}

/// Turn `reply` into a response to `request`: copy the transaction id,
/// opcode and RD flag, set QR/RA, and carry the question over if the
/// reply does not already hold one.
pub fn set_reply(reply: &mut Message, request: &Message) {
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(request.op_code());
    reply.set_recursion_desired(request.recursion_desired());
    reply.set_recursion_available(true);
    if reply.queries().is_empty() {
        if let Some(question) = request.queries().first() {
            reply.add_query(question.clone());
        }
    }
}

/// All IPv4 addresses carried by A records in the answer section.
pub fn answer_ipv4s(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        })
        .collect()
}

/// Whether every A-record address of `msg` lies inside `set`. A message
/// with no A records passes vacuously; AAAA records are not consulted.
pub fn all_in_range(msg: &Message, set: &RamSet) -> bool {
    answer_ipv4s(msg).into_iter().all(|ip| set.contains(ip))
}

/// Minimum TTL across answer records, if any.
pub fn min_answer_ttl(msg: &Message) -> Option<u32> {
    msg.answers().iter().map(Record::ttl).min()
}

/// Decrease every answer TTL by `elapsed` seconds, saturating at zero.
pub fn decrement_ttls(msg: &mut Message, elapsed: u32) {
    let answers: Vec<Record> = msg
        .take_answers()
        .into_iter()
        .map(|mut record| {
            let ttl = record.ttl().saturating_sub(elapsed);
            record.set_ttl(ttl);
            record
        })
        .collect();
    msg.insert_answers(answers);
}

/// Parse a textual record line as produced by the hosts readers:
/// `name [ttl] [IN] A|AAAA address`.
pub fn parse_rr_line(line: &str) -> Result<Record> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    ensure!(tokens.len() >= 3, "record line too short: {line:?}");

    let name = Name::from_ascii(tokens[0]).with_context(|| format!("bad owner name in {line:?}"))?;

    let mut idx = 1;
    let mut ttl = DEFAULT_RECORD_TTL;
    if let Ok(parsed) = tokens[idx].parse::<u32>() {
        ttl = parsed;
        idx += 1;
    }
    if idx < tokens.len() && tokens[idx].eq_ignore_ascii_case("IN") {
        idx += 1;
    }
    ensure!(idx + 2 == tokens.len(), "malformed record line: {line:?}");

    let rdata = match tokens[idx].to_ascii_uppercase().as_str() {
        "A" => RData::A(A(tokens[idx + 1]
            .parse()
            .with_context(|| format!("bad ipv4 address in {line:?}"))?)),
        "AAAA" => RData::AAAA(AAAA(tokens[idx + 1]
            .parse()
            .with_context(|| format!("bad ipv6 address in {line:?}"))?)),
        other => bail!("unsupported record type {other} in {line:?}"),
    };
    Ok(Record::from_rdata(name, ttl, rdata))
}
