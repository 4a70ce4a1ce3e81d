//! Wire protocol definitions
//!
//! Both the bootstrap protocol (UDP) and the peer protocol (TCP) are
//! tilde-delimited text. Every message travels inside a frame: a 4-digit
//! decimal length, a space, then the payload. The length counts the whole
//! frame, prefix included, so `REG~1.2.3.4~5000~bob` becomes
//! `0025 REG~1.2.3.4~5000~bob`.

use crate::{Error, NodeId, Result, RoutingTableEntry};
use std::net::{IpAddr, SocketAddr};

/// Field separator inside a payload
pub const SEPARATOR: char = '~';

/// Largest frame the 4-digit prefix can describe
pub const MAX_FRAME_LEN: usize = 9999;

/// Length of `"NNNN "`
const PREFIX_LEN: usize = 5;

/// Message commands
pub mod commands {
    pub const REG: &str = "REG";
    pub const UNREG: &str = "UNREG";
    pub const REGOK: &str = "REGOK";
    pub const UNREGOK: &str = "UNREGOK";

    pub const GET_ROUTING_TABLE: &str = "GETRTBL";
    pub const NEW_NODE: &str = "NEWNODE";
    pub const SYNC: &str = "SYNC";
    pub const PING: &str = "PING";
    pub const LEAVE: &str = "LEAVE";

    pub const RESPONSE_OK: &str = "OK";
    pub const RESPONSE_FAILURE: &str = "FAILED";

    /// Sync payload types
    pub const TYPE_ROUTING: &str = "RTBL";
    pub const TYPE_ENTRIES: &str = "ETBL";
}

/// Bootstrap status codes
pub mod status {
    /// Codes `0..=MAX_PEERS` announce how many peers follow
    pub const MAX_PEERS: u32 = 3;

    pub const OK: u32 = 0;
    pub const COMMAND_ERROR: u32 = 9999;
    pub const ALREADY_REGISTERED: u32 = 9998;
    pub const PORT_UNAVAILABLE: u32 = 9997;
    pub const NETWORK_FULL: u32 = 9996;

    pub fn describe(code: u32) -> &'static str {
        match code {
            0..=MAX_PEERS => "ok",
            COMMAND_ERROR => "error in command",
            ALREADY_REGISTERED => "already registered",
            PORT_UNAVAILABLE => "port not available",
            NETWORK_FULL => "network full",
            _ => "unknown status",
        }
    }
}

/// Wrap a payload in a length-prefixed frame
pub fn frame(payload: &str) -> Result<String> {
    let len = payload.len() + PREFIX_LEN;
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }
    Ok(format!("{:04} {}", len, payload))
}

/// Strip and validate the length prefix of a frame, returning the payload
pub fn unframe(raw: &str) -> Result<&str> {
    let raw = raw.trim_end_matches(['\r', '\n', '\0']);
    let declared = parse_prefix(raw.as_bytes())?;
    if declared != raw.len() {
        return Err(Error::Malformed(format!(
            "frame declares {} bytes but has {}",
            declared,
            raw.len()
        )));
    }
    Ok(&raw[PREFIX_LEN..])
}

/// Parse the `"NNNN "` prefix, returning the declared frame length
pub fn parse_prefix(prefix: &[u8]) -> Result<usize> {
    if prefix.len() < PREFIX_LEN {
        return Err(Error::Malformed("frame shorter than its prefix".to_string()));
    }
    let digits = &prefix[..4];
    if !digits.iter().all(u8::is_ascii_digit) || prefix[4] != b' ' {
        return Err(Error::Malformed(format!(
            "bad length prefix {:?}",
            String::from_utf8_lossy(&prefix[..PREFIX_LEN])
        )));
    }
    let len = digits
        .iter()
        .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0'));
    if len < PREFIX_LEN {
        return Err(Error::Malformed(format!("declared length {} too small", len)));
    }
    Ok(len)
}

/// Build a socket address from separate ip and port fields
pub fn parse_address(ip: &str, port: &str) -> Result<SocketAddr> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("bad ip {:?}", ip)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("bad port {:?}", port)))?;
    Ok(SocketAddr::new(ip, port))
}

fn parse_number<T: std::str::FromStr>(field: &str, what: &str) -> Result<T> {
    field
        .parse()
        .map_err(|_| Error::Malformed(format!("bad {} {:?}", what, field)))
}

/// Bootstrap servers differ on separators; accept `~` and whitespace alike
fn tokens(payload: &str) -> Vec<&str> {
    payload
        .split(|c: char| c == SEPARATOR || c.is_ascii_whitespace())
        .filter(|t| !t.is_empty())
        .collect()
}

// Bootstrap messages

/// Requests sent to the bootstrap server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapRequest {
    Register {
        ip: IpAddr,
        port: u16,
        username: String,
    },
    Unregister {
        ip: IpAddr,
        port: u16,
        username: String,
    },
}

impl BootstrapRequest {
    pub fn command(&self) -> &'static str {
        match self {
            BootstrapRequest::Register { .. } => commands::REG,
            BootstrapRequest::Unregister { .. } => commands::UNREG,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            BootstrapRequest::Register { ip, port, username }
            | BootstrapRequest::Unregister { ip, port, username } => {
                format!("{}~{}~{}~{}", self.command(), ip, port, username)
            }
        }
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let parts = tokens(payload);
        let (command, ip, port, username) = match parts.as_slice() {
            [command, ip, port, username] => (*command, *ip, *port, username.to_string()),
            _ => return Err(Error::Malformed(format!("bad bootstrap request {:?}", payload))),
        };
        let addr = parse_address(ip, port)?;
        match command {
            commands::REG => Ok(BootstrapRequest::Register {
                ip: addr.ip(),
                port: addr.port(),
                username,
            }),
            commands::UNREG => Ok(BootstrapRequest::Unregister {
                ip: addr.ip(),
                port: addr.port(),
                username,
            }),
            other => Err(Error::Malformed(format!("unknown bootstrap command {:?}", other))),
        }
    }
}

/// Replies from the bootstrap server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapResponse {
    /// `REGOK` with a peer count of 0 to 3 followed by that many addresses
    Registered { peers: Vec<SocketAddr> },
    /// `REGOK` carrying one of the 999x error codes
    RegisterFailed { code: u32 },
    /// `UNREGOK` with its status code, 0 on success
    Unregistered { code: u32 },
}

impl BootstrapResponse {
    pub fn encode(&self) -> String {
        match self {
            BootstrapResponse::Registered { peers } => {
                let mut out = format!("{}~{}", commands::REGOK, peers.len());
                for peer in peers {
                    out.push_str(&format!("~{}~{}", peer.ip(), peer.port()));
                }
                out
            }
            BootstrapResponse::RegisterFailed { code } => format!("{}~{}", commands::REGOK, code),
            BootstrapResponse::Unregistered { code } => format!("{}~{}", commands::UNREGOK, code),
        }
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let parts = tokens(payload);
        let (command, code, rest) = match parts.as_slice() {
            [command, code, rest @ ..] => (*command, parse_number::<u32>(code, "status code")?, rest),
            _ => return Err(Error::Malformed(format!("bad bootstrap response {:?}", payload))),
        };

        match command {
            commands::REGOK if code <= status::MAX_PEERS => {
                if rest.len() != code as usize * 2 {
                    return Err(Error::Malformed(format!(
                        "peer count {} does not match {} address fields",
                        code,
                        rest.len()
                    )));
                }
                let peers = rest
                    .chunks(2)
                    .map(|pair| parse_address(pair[0], pair[1]))
                    .collect::<Result<Vec<_>>>()
                    .map_err(|e| Error::Malformed(e.to_string()))?;
                Ok(BootstrapResponse::Registered { peers })
            }
            commands::REGOK => Ok(BootstrapResponse::RegisterFailed { code }),
            commands::UNREGOK => Ok(BootstrapResponse::Unregistered { code }),
            other => Err(Error::Malformed(format!("unknown bootstrap reply {:?}", other))),
        }
    }
}

// Peer messages

/// Which table a `SYNC` pushes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    RoutingTable,
    EntryTable,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::RoutingTable => commands::TYPE_ROUTING,
            SyncKind::EntryTable => commands::TYPE_ENTRIES,
        }
    }
}

/// Requests one overlay node sends another
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequest {
    /// Fetch the receiver's routing table
    GetRoutingTable,
    /// Announce a member that just joined
    NewNode(RoutingTableEntry),
    /// Push a serialized table to be merged
    Sync {
        kind: SyncKind,
        entries: Vec<RoutingTableEntry>,
    },
    /// Liveness probe carrying the sender's table; answered with the receiver's
    Ping {
        node_id: NodeId,
        entries: Vec<RoutingTableEntry>,
    },
    /// The member at `address` is leaving
    Leave { address: SocketAddr },
}

impl PeerRequest {
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            PeerRequest::GetRoutingTable => commands::GET_ROUTING_TABLE.to_string(),
            PeerRequest::NewNode(entry) => format!(
                "{}~{}~{}~{}",
                commands::NEW_NODE,
                entry.address.ip(),
                entry.address.port(),
                entry.node_id
            ),
            PeerRequest::Sync { kind, entries } => format!(
                "{}~{}~{}",
                commands::SYNC,
                kind.as_str(),
                encode_entries(entries)?
            ),
            PeerRequest::Ping { node_id, entries } => format!(
                "{}~{}~{}",
                commands::PING,
                node_id,
                encode_entries(entries)?
            ),
            PeerRequest::Leave { address } => format!(
                "{}~{}~{}",
                commands::LEAVE,
                address.ip(),
                address.port()
            ),
        })
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let payload = payload.trim();
        let (command, rest) = payload
            .split_once(SEPARATOR)
            .unwrap_or((payload, ""));

        match command {
            commands::GET_ROUTING_TABLE => Ok(PeerRequest::GetRoutingTable),
            commands::NEW_NODE => match rest.split(SEPARATOR).collect::<Vec<_>>().as_slice() {
                [ip, port, node_id] => Ok(PeerRequest::NewNode(RoutingTableEntry::new(
                    parse_address(ip, port)?,
                    parse_number(node_id, "node id")?,
                ))),
                _ => Err(Error::Malformed(format!("bad NEWNODE {:?}", rest))),
            },
            commands::SYNC => {
                let (kind, body) = rest.split_once(SEPARATOR).unwrap_or((rest, ""));
                let kind = match kind {
                    commands::TYPE_ROUTING => SyncKind::RoutingTable,
                    commands::TYPE_ENTRIES => SyncKind::EntryTable,
                    other => return Err(Error::Malformed(format!("unknown sync type {:?}", other))),
                };
                Ok(PeerRequest::Sync {
                    kind,
                    entries: decode_entries(body)?,
                })
            }
            commands::PING => {
                let (node_id, body) = rest.split_once(SEPARATOR).unwrap_or((rest, ""));
                Ok(PeerRequest::Ping {
                    node_id: parse_number(node_id, "node id")?,
                    entries: decode_entries(body)?,
                })
            }
            commands::LEAVE => match rest.split(SEPARATOR).collect::<Vec<_>>().as_slice() {
                [ip, port] => Ok(PeerRequest::Leave {
                    address: parse_address(ip, port)?,
                }),
                _ => Err(Error::Malformed(format!("bad LEAVE {:?}", rest))),
            },
            other => Err(Error::Malformed(format!("unknown peer command {:?}", other))),
        }
    }
}

/// Replies to a [`PeerRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerResponse {
    Ok,
    Failed,
    /// Snapshot of the responder's routing table
    Table(Vec<RoutingTableEntry>),
}

impl PeerResponse {
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            PeerResponse::Ok => commands::RESPONSE_OK.to_string(),
            PeerResponse::Failed => commands::RESPONSE_FAILURE.to_string(),
            PeerResponse::Table(entries) => {
                format!("{}~{}", commands::TYPE_ROUTING, encode_entries(entries)?)
            }
        })
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let payload = payload.trim();
        match payload.split_once(SEPARATOR) {
            Some((commands::TYPE_ROUTING, body)) => Ok(PeerResponse::Table(decode_entries(body)?)),
            None if payload == commands::RESPONSE_OK => Ok(PeerResponse::Ok),
            None if payload == commands::RESPONSE_FAILURE => Ok(PeerResponse::Failed),
            _ => Err(Error::Malformed(format!("unknown peer reply {:?}", payload))),
        }
    }
}

fn encode_entries(entries: &[RoutingTableEntry]) -> Result<String> {
    Ok(serde_json::to_string(entries)?)
}

fn decode_entries(body: &str) -> Result<Vec<RoutingTableEntry>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(body)?)
}
