//! # Banner & Feature Negotiation
//!
//! Parsing for the remote's connect banner and the capability set negotiated
//! from it.
//!
//! A banner looks like
//! `"device::ro.product.name=P;ro.product.model=M;ro.product.device=D;features=a,b,c"`.
//! Unknown property keys are ignored and unknown feature names are preserved
//! as [`Feature::Unknown`], so newly declared remote capabilities never break
//! parsing.
//!
//! The effective feature set of a session is the intersection of what the
//! remote declared with what this side declared, computed exactly once when
//! the handshake completes and read-only afterward.

/// Connection state the remote reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Device,
    Bootloader,
    Recovery,
    Sideload,
    Unauthorized,
    Host,
    /// A state string this implementation does not recognize.
    Other(String),
}

impl DeviceState {
    fn parse(s: &str) -> Self {
        match s {
            "device" => DeviceState::Device,
            "bootloader" => DeviceState::Bootloader,
            "recovery" => DeviceState::Recovery,
            "sideload" => DeviceState::Sideload,
            "unauthorized" => DeviceState::Unauthorized,
            "host" => DeviceState::Host,
            other => DeviceState::Other(other.to_string()),
        }
    }
}

/// A protocol capability name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Feature {
    ShellV2,
    Cmd,
    StatV2,
    LsV2,
    SendRecvV2,
    DelayedAck,
    /// A feature declared by the remote that this implementation does not
    /// recognize. Carried through parsing, never negotiated into effect.
    Unknown(String),
}

impl Feature {
    /// Parse a declared feature name.
    pub fn parse(name: &str) -> Self {
        match name {
            "shell_v2" => Feature::ShellV2,
            "cmd" => Feature::Cmd,
            "stat_v2" => Feature::StatV2,
            "ls_v2" => Feature::LsV2,
            "sendrecv_v2" => Feature::SendRecvV2,
            "delayed_ack" => Feature::DelayedAck,
            other => Feature::Unknown(other.to_string()),
        }
    }

    /// The wire name of this feature.
    pub fn name(&self) -> &str {
        match self {
            Feature::ShellV2 => "shell_v2",
            Feature::Cmd => "cmd",
            Feature::StatV2 => "stat_v2",
            Feature::LsV2 => "ls_v2",
            Feature::SendRecvV2 => "sendrecv_v2",
            Feature::DelayedAck => "delayed_ack",
            Feature::Unknown(name) => name,
        }
    }
}

/// The effective capability set of a session, in declared order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet {
    features: Vec<Feature>,
}

impl FeatureSet {
    /// Intersect remotely declared features with the locally declared names,
    /// preserving the remote's declaration order.
    pub fn negotiate(remote: &[Feature], local: &[String]) -> Self {
        let features = remote
            .iter()
            .filter(|f| local.iter().any(|name| name == f.name()))
            .cloned()
            .collect();
        Self { features }
    }

    pub fn contains(&self, feature: &Feature) -> bool {
        self.features.contains(feature)
    }

    pub fn delayed_ack(&self) -> bool {
        self.contains(&Feature::DelayedAck)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// The remote's self-described identity, parsed once per handshake from the
/// payload of its connect packet. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    pub state: DeviceState,
    pub product: String,
    pub model: String,
    pub device: String,
    /// Features as the remote declared them, in declared order.
    pub features: Vec<Feature>,
}

impl Banner {
    /// Parse a connect-packet payload. A trailing NUL is tolerated; missing
    /// properties yield empty strings rather than errors, matching devices
    /// that omit them.
    pub fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim_end_matches('\0');

        let (state, props) = match text.split_once("::") {
            Some((state, props)) => (state, props),
            None => (text, ""),
        };

        let mut banner = Banner {
            state: DeviceState::parse(state),
            product: String::new(),
            model: String::new(),
            device: String::new(),
            features: Vec::new(),
        };

        for prop in props.split(';').filter(|p| !p.is_empty()) {
            let Some((key, value)) = prop.split_once('=') else {
                continue;
            };
            match key {
                "ro.product.name" => banner.product = value.to_string(),
                "ro.product.model" => banner.model = value.to_string(),
                "ro.product.device" => banner.device = value.to_string(),
                "features" => {
                    banner.features = value
                        .split(',')
                        .filter(|f| !f.is_empty())
                        .map(Feature::parse)
                        .collect();
                }
                // Devices ship plenty of extra keys; ignore them.
                _ => {}
            }
        }

        banner
    }
}

/// Build the local connect-packet payload declaring our identity and features.
pub fn local_banner(features: &[String]) -> Vec<u8> {
    let mut payload = format!("host::features={}", features.join(",")).into_bytes();
    payload.push(0);
    payload
}
