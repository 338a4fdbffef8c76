//! Minimal SDP offers and answers for a single data channel media section
//!
//! Only ICE credentials, one DTLS fingerprint, the DTLS setup role and the
//! SCTP max message size are meaningful. The remaining lines are fixed and
//! exist for interoperability with other NetherNet implementations.

use std::fmt;

use crate::network::NetworkError;

/// SCTP port advertised in every description
pub const SCTP_PORT: u16 = 5000;

/// Default SCTP max message size advertised when the transport reports none
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 262_144;

/// DTLS setup role negotiated through the `a=setup` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setup {
    ActPass,
    Active,
    Passive,
}

impl Setup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActPass => "actpass",
            Self::Active => "active",
            Self::Passive => "passive",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "actpass" => Some(Self::ActPass),
            "active" => Some(Self::Active),
            "passive" => Some(Self::Passive),
            _ => None,
        }
    }
}

/// DTLS certificate fingerprint (`a=fingerprint:<algorithm> <hex bytes>`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub algorithm: String,
    pub value: String,
}

/// Parameters carried by an offer or answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub session_id: u64,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub fingerprint: Fingerprint,
    pub setup: Setup,
    pub max_message_size: u32,
}

impl SessionDescription {
    /// Encode into the canonical offer/answer text
    pub fn encode(&self) -> String {
        let lines = [
            "v=0".to_string(),
            format!("o=- {} 2 IN IP4 127.0.0.1", self.session_id),
            "s=-".to_string(),
            "t=0 0".to_string(),
            "a=group:BUNDLE 0".to_string(),
            "a=extmap-allow-mixed".to_string(),
            "a=msid-semantic: WMS".to_string(),
            "m=application 9 UDP/DTLS/SCTP webrtc-datachannel".to_string(),
            "c=IN IP4 0.0.0.0".to_string(),
            format!("a=ice-ufrag:{}", self.ice_ufrag),
            format!("a=ice-pwd:{}", self.ice_pwd),
            "a=ice-options:trickle".to_string(),
            format!(
                "a=fingerprint:{} {}",
                self.fingerprint.algorithm, self.fingerprint.value
            ),
            format!("a=setup:{}", self.setup.as_str()),
            "a=mid:0".to_string(),
            format!("a=sctp-port:{}", SCTP_PORT),
            format!("a=max-message-size:{}", self.max_message_size),
        ];

        let mut sdp = lines.join("\r\n");
        sdp.push_str("\r\n");
        sdp
    }

    /// Parse a remote description
    ///
    /// Fails with [`NetworkError::BadRemoteDescription`] unless there is
    /// exactly one `application` media section and `ice-ufrag`, `ice-pwd`,
    /// `fingerprint` and `max-message-size` are all present.
    pub fn parse(sdp: &str) -> Result<Self, NetworkError> {
        let bad = |reason: String| NetworkError::BadRemoteDescription(reason);

        let mut session_id = 0;
        let mut media_sections = 0;
        let mut ice_ufrag = None;
        let mut ice_pwd = None;
        let mut fingerprint = None;
        let mut setup = None;
        let mut max_message_size = None;

        for line in sdp.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(origin) = line.strip_prefix("o=") {
                session_id = origin
                    .split_whitespace()
                    .nth(1)
                    .and_then(|id| id.parse().ok())
                    .unwrap_or(0);
                continue;
            }

            if let Some(media) = line.strip_prefix("m=") {
                media_sections += 1;
                if !media.starts_with("application ") {
                    return Err(bad(format!("unsupported media section {:?}", media)));
                }
                continue;
            }

            let Some(attribute) = line.strip_prefix("a=") else {
                continue;
            };
            let (key, value) = attribute.split_once(':').unwrap_or((attribute, ""));

            match key {
                "ice-ufrag" => ice_ufrag = Some(value.to_string()),
                "ice-pwd" => ice_pwd = Some(value.to_string()),
                "fingerprint" => {
                    let (algorithm, hex) = value
                        .split_once(' ')
                        .ok_or_else(|| bad(format!("malformed fingerprint {:?}", value)))?;
                    fingerprint = Some(Fingerprint {
                        algorithm: algorithm.to_string(),
                        value: hex.trim().to_string(),
                    });
                }
                "setup" => {
                    setup = Some(
                        Setup::parse(value)
                            .ok_or_else(|| bad(format!("unknown setup role {:?}", value)))?,
                    );
                }
                "max-message-size" => {
                    max_message_size =
                        Some(value.parse::<u32>().map_err(|e| {
                            bad(format!("invalid max-message-size {:?}: {}", value, e))
                        })?);
                }
                _ => {}
            }
        }

        if media_sections != 1 {
            return Err(bad(format!(
                "expected exactly one media section, found {}",
                media_sections
            )));
        }

        Ok(Self {
            session_id,
            ice_ufrag: ice_ufrag.ok_or_else(|| bad("missing ice-ufrag".to_string()))?,
            ice_pwd: ice_pwd.ok_or_else(|| bad("missing ice-pwd".to_string()))?,
            fingerprint: fingerprint.ok_or_else(|| bad("missing fingerprint".to_string()))?,
            setup: setup.unwrap_or(Setup::ActPass),
            max_message_size: max_message_size
                .ok_or_else(|| bad("missing max-message-size".to_string()))?,
        })
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
