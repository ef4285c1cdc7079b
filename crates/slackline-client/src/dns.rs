//! Minimal DNS client: A-record queries over UDP to one nameserver.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;
use tracing::{debug, instrument};

use slackline_core::ResolveError;

use crate::resolver::{literal_addrs, Resolver};

const DNS_PORT: u16 = 53;
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DATAGRAM: usize = 1232;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;
const RCODE_MASK: u16 = 0x000f;
const RCODE_NXDOMAIN: u16 = 3;

/// Resolves hosts by asking a single nameserver directly.
#[derive(Clone, Debug)]
pub struct NameserverResolver {
    server: SocketAddr,
    timeout: Duration,
}

impl NameserverResolver {
    pub fn new(server: IpAddr) -> Self {
        Self::with_address(SocketAddr::new(server, DNS_PORT))
    }

    pub fn with_address(server: SocketAddr) -> Self {
        Self {
            server,
            timeout: QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    async fn query(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let io_err = |e: std::io::Error| ResolveError::Io {
            host: host.to_string(),
            reason: e.to_string(),
        };

        let id = rand::random::<u16>();
        let request = encode_query(id, host)?;

        let unspecified = if self.server.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        let bind = SocketAddr::new(unspecified, 0);
        let socket = UdpSocket::bind(bind).await.map_err(io_err)?;
        let _ = socket.send_to(&request, self.server).await.map_err(io_err)?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let exchange = async {
            loop {
                let (len, from) = socket.recv_from(&mut buf).await.map_err(io_err)?;
                if from != self.server {
                    continue;
                }
                match decode_response(id, host, &self.server.to_string(), &buf[..len]) {
                    Err(ResolveError::Protocol(reason)) if reason == MISMATCHED_ID => continue,
                    other => return other,
                }
            }
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ResolveError::Timeout {
                host: host.to_string(),
            })?
    }
}

#[async_trait]
impl Resolver for NameserverResolver {
    #[instrument(skip(self), fields(server = %self.server))]
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if let Some(addrs) = literal_addrs(host) {
            return Ok(addrs);
        }
        let addrs = self.query(host).await?;
        debug!(host, count = addrs.len(), "nameserver answered");
        Ok(addrs)
    }
}

const MISMATCHED_ID: &str = "response id does not match query";

fn encode_query(id: u16, host: &str) -> Result<BytesMut, ResolveError> {
    let mut buf = BytesMut::with_capacity(12 + host.len() + 6);
    buf.put_u16(id);
    buf.put_u16(FLAG_RECURSION_DESIRED);
    buf.put_u16(1); // questions
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);

    for label in host.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ResolveError::Protocol(format!("invalid hostname `{host}`")));
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    buf.put_u16(TYPE_A);
    buf.put_u16(CLASS_IN);
    Ok(buf)
}

fn read_u16(msg: &[u8], pos: usize) -> Result<u16, ResolveError> {
    msg.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| ResolveError::Protocol("truncated message".into()))
}

/// Position just past the (possibly compressed) name starting at `pos`.
fn skip_name(msg: &[u8], mut pos: usize) -> Result<usize, ResolveError> {
    loop {
        let len = *msg
            .get(pos)
            .ok_or_else(|| ResolveError::Protocol("truncated name".into()))?;
        match len {
            0 => return Ok(pos + 1),
            l if l & 0xc0 == 0xc0 => {
                if pos + 2 > msg.len() {
                    return Err(ResolveError::Protocol("truncated name pointer".into()));
                }
                return Ok(pos + 2);
            }
            l => pos += 1 + l as usize,
        }
    }
}

fn decode_response(
    id: u16,
    host: &str,
    server: &str,
    msg: &[u8],
) -> Result<Vec<IpAddr>, ResolveError> {
    if msg.len() < 12 {
        return Err(ResolveError::Protocol("message shorter than header".into()));
    }
    if read_u16(msg, 0)? != id {
        return Err(ResolveError::Protocol(MISMATCHED_ID.into()));
    }
    let flags = read_u16(msg, 2)?;
    if flags & FLAG_RESPONSE == 0 {
        return Err(ResolveError::Protocol("message is not a response".into()));
    }
    match flags & RCODE_MASK {
        0 => {}
        RCODE_NXDOMAIN => {
            return Err(ResolveError::NotFound {
                host: host.to_string(),
            })
        }
        code => {
            return Err(ResolveError::ServerFailure {
                host: host.to_string(),
                server: server.to_string(),
                code: rcode_name(code).to_string(),
            })
        }
    }

    let questions = read_u16(msg, 4)?;
    let answers = read_u16(msg, 6)?;
    let mut pos = 12;
    for _ in 0..questions {
        pos = skip_name(msg, pos)? + 4;
    }

    let mut addrs = Vec::new();
    for _ in 0..answers {
        pos = skip_name(msg, pos)?;
        let rtype = read_u16(msg, pos)?;
        let class = read_u16(msg, pos + 2)?;
        let rdlen = read_u16(msg, pos + 8)? as usize;
        let rdata = msg
            .get(pos + 10..pos + 10 + rdlen)
            .ok_or_else(|| ResolveError::Protocol("truncated record data".into()))?;
        if (rtype, class, rdlen) == (TYPE_A, CLASS_IN, 4) {
            addrs.push(IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])));
        }
        pos += 10 + rdlen;
    }

    if addrs.is_empty() {
        return Err(ResolveError::NotFound {
            host: host.to_string(),
        });
    }
    Ok(addrs)
}

fn rcode_name(code: u16) -> &'static str {
    match code {
        1 => "FORMERR",
        2 => "SERVFAIL",
        4 => "NOTIMP",
        5 => "REFUSED",
        _ => "UNKNOWN",
    }
}
