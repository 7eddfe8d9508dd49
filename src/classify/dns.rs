use std::net::IpAddr;

use chrono::{DateTime, Utc};
use domain::base::message::Message;
use domain::rdata::AllRecordData;
use thiserror::Error;

use super::FiveTuple;

/// Well-known DNS server port; responses are captured from it.
pub const DNS_PORT: u16 = 53;

#[derive(Debug, Error)]
pub enum DnsParseError {
    #[error("payload truncated: {0}")]
    Truncated(#[from] domain::base::octets::ShortBuf),
    #[error("payload failed to parse: {0}")]
    Parse(#[from] domain::base::octets::ParseError),
    #[error("message is not a response")]
    NotResponse,
    #[error("message does not carry exactly one question")]
    MalformedQuestion,
}

/// A normalized single-question DNS response ready for persistence.
///
/// Answer addresses and TTLs are parallel comma-joined lists, which is the
/// form the store dedupes on.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsResponseRecord {
    pub timestamp: DateTime<Utc>,
    pub tuple: FiveTuple,
    pub host: String,
    pub opcode: u8,
    pub response_code: u8,
    pub answer_ips: String,
    pub answer_ttls: String,
}

/// Parse a UDP payload known to come from the DNS port.
///
/// Only well-formed responses with exactly one question are accepted, due to
/// ambiguity in the standard for anything else. CNAME chains are followed so
/// the recorded addresses are the terminal A/AAAA answers for the query name.
pub fn parse_response(
    payload: &[u8],
    tuple: FiveTuple,
) -> Result<DnsResponseRecord, DnsParseError> {
    let message = Message::from_octets(payload)?;

    let header = message.header();
    if !header.qr() {
        return Err(DnsParseError::NotResponse);
    }
    if message.header_counts().qdcount() != 1 {
        return Err(DnsParseError::MalformedQuestion);
    }
    let question = message
        .first_question()
        .ok_or(DnsParseError::MalformedQuestion)?;
    let query_name = question.qname().clone();

    let mut addresses: Vec<IpAddr> = Vec::new();
    let mut ttls: Vec<u32> = Vec::new();
    let mut current_canonical_name = query_name.clone();

    for record in message.answer()?.limit_to_in::<AllRecordData<_, _>>() {
        let record = record?;
        if record.owner().ne(&current_canonical_name) {
            continue;
        }

        match record.data() {
            AllRecordData::A(a) => {
                addresses.push(IpAddr::V4(a.addr()));
                ttls.push(record.ttl());
            }
            AllRecordData::Aaaa(aaaa) => {
                addresses.push(IpAddr::V6(aaaa.addr()));
                ttls.push(record.ttl());
            }
            AllRecordData::Cname(cname) => {
                current_canonical_name = cname.cname().clone();
            }
            _ => continue,
        }
    }

    Ok(DnsResponseRecord {
        timestamp: Utc::now(),
        tuple,
        host: query_name.to_string().trim_end_matches('.').to_owned(),
        opcode: header.opcode().to_int(),
        response_code: header.rcode().to_int(),
        answer_ips: addresses
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(","),
        answer_ttls: ttls
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(","),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const A_RESPONSE: &str = "c87f8180000100040000000004786b636403636f6d0000010001c00c0001000100000c97000497650043c00c0001000100000c97000497654043c00c0001000100000c97000497658043c00c0001000100000c9700049765c043";
    const AAAA_RESPONSE: &str = "e5428180000100040000000004786b636403636f6d00001c0001c00c001c00010000065800102a044e42000000000000000000000067c00c001c00010000065800102a044e42020000000000000000000067c00c001c00010000065800102a044e42040000000000000000000067c00c001c00010000065800102a044e42060000000000000000000067";
    const CNAME_RESPONSE: &str = "9af181800001000400000000046f6373700a676c6f62616c7369676e03636f6d0000010001c00c000500010000545d001106676c6f62616c037072640363646ec011c0310005000100000333002a0363646e0d676c6f62616c7369676e63646e03636f6d0363646e0a636c6f7564666c617265036e657400c04e000100010000012b0004681215e2c04e000100010000012b0004681214e2";
    const TRUNCATED_RESPONSE: &str = "9af181800001000400000000046f637370";
    const PLAIN_QUERY: &str = "12340100000100000000000004786b636403636f6d0000010001";

    fn decode_hex(input: &str) -> Vec<u8> {
        (0..input.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&input[i..i + 2], 16).unwrap())
            .collect()
    }

    fn tuple() -> FiveTuple {
        FiveTuple {
            src: "8.8.8.8".parse().unwrap(),
            dst: "10.45.0.7".parse().unwrap(),
            src_port: 53,
            dst_port: 40123,
            protocol: 17,
        }
    }

    #[test]
    fn parses_a_response() {
        let record = parse_response(&decode_hex(A_RESPONSE), tuple()).unwrap();
        assert_eq!(record.host, "xkcd.com");
        assert_eq!(record.opcode, 0);
        assert_eq!(record.response_code, 0);
        assert_eq!(
            record.answer_ips,
            "151.101.0.67,151.101.64.67,151.101.128.67,151.101.192.67"
        );
        assert_eq!(record.answer_ttls, "3223,3223,3223,3223");
    }

    #[test]
    fn parses_aaaa_response() {
        let record = parse_response(&decode_hex(AAAA_RESPONSE), tuple()).unwrap();
        assert_eq!(record.host, "xkcd.com");
        assert_eq!(
            record.answer_ips,
            "2a04:4e42::67,2a04:4e42:200::67,2a04:4e42:400::67,2a04:4e42:600::67"
        );
        assert_eq!(record.answer_ttls, "1624,1624,1624,1624");
    }

    #[test]
    fn follows_cname_chain() {
        let record = parse_response(&decode_hex(CNAME_RESPONSE), tuple()).unwrap();
        assert_eq!(record.host, "ocsp.globalsign.com");
        assert_eq!(record.answer_ips, "104.18.21.226,104.18.20.226");
        assert_eq!(record.answer_ttls, "299,299");
    }

    #[test]
    fn rejects_truncated_payload() {
        assert!(parse_response(&decode_hex(TRUNCATED_RESPONSE), tuple()).is_err());
    }

    #[test]
    fn rejects_plain_query() {
        assert!(matches!(
            parse_response(&decode_hex(PLAIN_QUERY), tuple()),
            Err(DnsParseError::NotResponse)
        ));
    }
}
