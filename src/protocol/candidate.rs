//! ICE candidate text records carried by `CANDIDATEADD` signals
//!
//! ```text
//! candidate:<foundation> 1 udp <priority> <address> <port> typ <type>
//!     [raddr <a> rport <p>] generation 0 ufrag <ufrag> network-id <n> network-cost 0
//! ```

use std::fmt;

use crate::network::NetworkError;

/// ICE candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Srflx => "srflx",
            Self::Prflx => "prflx",
            Self::Relay => "relay",
        }
    }

    /// Whether the record carries `raddr`/`rport`
    fn has_related_address(&self) -> bool {
        matches!(self, Self::Srflx | Self::Relay)
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "host" => Some(Self::Host),
            "srflx" => Some(Self::Srflx),
            "prflx" => Some(Self::Prflx),
            "relay" => Some(Self::Relay),
            _ => None,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single UDP ICE candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u16,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub typ: CandidateType,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
}

impl IceCandidate {
    /// Encode with the local ICE ufrag and the candidate's index in the
    /// gathered list (written as `network-id`)
    pub fn encode(&self, ufrag: &str, index: usize) -> String {
        let mut record = format!(
            "candidate:{} {} udp {} {} {} typ {}",
            self.foundation, self.component, self.priority, self.address, self.port, self.typ
        );

        if self.typ.has_related_address() {
            record.push_str(&format!(
                " raddr {} rport {}",
                self.related_address.as_deref().unwrap_or("0.0.0.0"),
                self.related_port.unwrap_or(0)
            ));
        }

        record.push_str(&format!(
            " generation 0 ufrag {} network-id {} network-cost 0",
            ufrag, index
        ));
        record
    }

    /// Parse a candidate record. Unrecognised trailing attributes are ignored.
    pub fn parse(record: &str) -> Result<Self, NetworkError> {
        let bad = |reason: &str| {
            NetworkError::InvalidSignal(format!("{}: {:?}", reason, record))
        };

        let record = record.trim();
        let record = record.strip_prefix("a=").unwrap_or(record);
        let record = record.strip_prefix("candidate:").unwrap_or(record);

        let fields: Vec<&str> = record.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(bad("truncated candidate"));
        }

        let foundation = fields[0].to_string();
        let component = fields[1]
            .parse::<u16>()
            .map_err(|_| bad("invalid component"))?;
        if !fields[2].eq_ignore_ascii_case("udp") {
            return Err(bad("unsupported transport"));
        }
        let priority = fields[3]
            .parse::<u32>()
            .map_err(|_| bad("invalid priority"))?;
        let address = fields[4].to_string();
        let port = fields[5].parse::<u16>().map_err(|_| bad("invalid port"))?;
        if fields[6] != "typ" {
            return Err(bad("missing typ"));
        }
        let typ = CandidateType::parse(fields[7]).ok_or_else(|| bad("unknown candidate type"))?;

        let mut related_address = None;
        let mut related_port = None;
        for pair in fields[8..].chunks(2) {
            match pair {
                ["raddr", value] => related_address = Some(value.to_string()),
                ["rport", value] => {
                    related_port = Some(value.parse::<u16>().map_err(|_| bad("invalid rport"))?)
                }
                _ => {}
            }
        }

        Ok(Self {
            foundation,
            component,
            priority,
            address,
            port,
            typ,
            related_address,
            related_port,
        })
    }
}
