use combine::error::StreamError;
use combine::parser::char::*;
use combine::stream::StreamErrorFor;
use combine::*;
use combine::{ParseError, Parser, Stream};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use crate::io::{Protocol, TcpType};
use crate::sdp::SdpError;
use crate::{Candidate, CandidateKind};

/// Parse a candidate string into a [Candidate].
///
/// Takes the attribute value with or without the `a=` prefix. A trailing
/// line end is ignored.
pub fn parse_candidate(s: &str) -> Result<Candidate, SdpError> {
    let s = s.trim_end_matches(&['\r', '\n'][..]);
    let s = s.strip_prefix("a=").unwrap_or(s);

    let (c, rest) = candidate().parse(s)?;

    if !rest.trim().is_empty() {
        return Err(SdpError::Inconsistent(format!(
            "trailing data in candidate: {}",
            rest
        )));
    }

    Ok(c)
}

/// Fields before the extensions.
type Head = (String, u16, Protocol, u32, SocketAddr, CandidateKind);

/// Parser for candidate, without attribute prefix (a=).
fn candidate<Input>() -> impl Parser<Input, Output = Candidate>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let port = || {
        not_sp::<Input>().and_then(|s| {
            s.parse::<u16>()
                .map_err(StreamErrorFor::<Input>::message_format)
        })
    };

    let ip_addr = || {
        not_sp().and_then(|s| {
            s.parse::<IpAddr>()
                .map_err(StreamErrorFor::<Input>::message_format)
        })
    };

    let kind = choice((
        string("host").map(|_| CandidateKind::Host),
        string("prflx").map(|_| CandidateKind::PeerReflexive),
        string("srflx").map(|_| CandidateKind::ServerReflexive),
        string("relay").map(|_| CandidateKind::Relayed),
    ));

    // Extensions come as " key value". Which ones there are and their order
    // differ between implementations.
    let extension = attempt((token(' '), not_sp(), token(' '), not_sp()))
        .map(|(_, key, _, value)| (key, value));

    (
        string("candidate:"),
        not_sp(),
        token(' '),
        not_sp().and_then(|s| {
            s.parse::<u16>()
                .map_err(StreamErrorFor::<Input>::message_format)
        }),
        token(' '),
        not_sp().and_then(|s| {
            s.as_str().try_into().map_err(|_| {
                StreamErrorFor::<Input>::message_format(format!("invalid protocol: {}", s))
            })
        }),
        token(' '),
        not_sp().and_then(|s| {
            s.parse::<u32>()
                .map_err(StreamErrorFor::<Input>::message_format)
        }),
        token(' '),
        ip_addr(),
        token(' '),
        port(),
        string(" typ "),
        kind,
        many::<Vec<(String, String)>, _, _>(extension),
    )
        .and_then(
            |(_, found, _, comp_id, _, proto, _, prio, _, addr, _, port, _, kind, extensions)| {
                let head = (
                    found,
                    comp_id,
                    proto,
                    prio, // remote candidates calculate prio on their side
                    SocketAddr::from((addr, port)),
                    kind,
                );
                build(head, extensions).map_err(StreamErrorFor::<Input>::message_format)
            },
        )
}

fn build(head: Head, extensions: Vec<(String, String)>) -> Result<Candidate, String> {
    let (found, comp_id, proto, prio, addr, kind) = head;

    if comp_id < 1 {
        return Err("component id must be at least 1".into());
    }

    let mut raddr = None;
    let mut rport = None;
    let mut tcptype = None;
    let mut ufrag = None;

    for (key, value) in extensions {
        match key.as_str() {
            "raddr" => raddr = Some(value.parse::<IpAddr>().map_err(|e| e.to_string())?),
            "rport" => rport = Some(value.parse::<u16>().map_err(|e| e.to_string())?),
            "tcptype" => tcptype = Some(value.parse::<TcpType>().map_err(|e| e.to_string())?),
            "ufrag" => ufrag = Some(value),
            // generation, network-id, network-cost
            _ => {}
        }
    }

    // 0.0.0.0 0 stands in for a related address that is withheld.
    let raddr = match (raddr, rport) {
        (Some(ip), Some(port)) if !ip.is_unspecified() => Some(SocketAddr::from((ip, port))),
        _ => None,
    };

    if proto != Protocol::Udp && tcptype.is_none() {
        trace!("Candidate without tcptype: {}", addr);
    }

    Ok(Candidate::parsed(
        foundation_value(&found),
        comp_id,
        proto,
        prio,
        addr,
        kind,
        raddr,
        tcptype,
        ufrag,
    ))
}

/// Foundations are strings of up to 32 ice-chars. Most peers send numbers,
/// anything else is hashed.
fn foundation_value(s: &str) -> u32 {
    if let Ok(v) = s.parse::<u32>() {
        return v;
    }
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    let hash = hasher.finish();
    (hash >> 32) as u32 ^ hash as u32
}

/// Parser for a=candidate lines.
pub(crate) fn candidate_attribute<Input>() -> impl Parser<Input, Output = Candidate>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    // a=candidate:1 1 udp 2113929471 203.0.113.100 10100 typ host
    // a=candidate:1 2 udp 2113929470 203.0.113.100 10101 typ host
    // a=candidate:1 1 udp 1845494015 198.51.100.100 11100 typ srflx raddr 203.0.113.100 rport 10100
    // a=candidate:1 1 udp 255 192.0.2.100 12100 typ relay raddr 198.51.100.100 rport 11100
    // a=candidate:2501718406 1 tcp 1518280447 10.217.229.219 9 typ host tcptype active generation 0 network-id 1 network-cost 900

    (string("a="), candidate(), optional(line_end())).map(|(_, c, _)| c)
}

/// Parse all `a=candidate` lines, skipping anything else.
pub(crate) fn parse_candidate_lines(s: &str) -> Result<Vec<Candidate>, SdpError> {
    let mut out = vec![];

    for line in s.lines() {
        let line = line.trim_end_matches('\r');
        if !line.starts_with("a=candidate:") && !line.starts_with("candidate:") {
            continue;
        }
        let c = if line.starts_with("a=") {
            candidate_attribute().parse(line).map(|(c, _)| c)?
        } else {
            parse_candidate(line)?
        };
        out.push(c);
    }

    Ok(out)
}

/// CRLF, LF or end of input.
fn line_end<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    choice((crlf().map(|_| ()), newline().map(|_| ()), eof()))
}

/// Not SP, \r or \n
fn not_sp<Input>() -> impl Parser<Input, Output = String>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(satisfy(|c| c != ' ' && c != '\r' && c != '\n'))
}
