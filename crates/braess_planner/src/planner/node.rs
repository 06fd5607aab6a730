use std::{fmt, time::Duration};

use bon::Builder;
use url::Url;

/// Where and how long to wait when calling one side of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownstreamEndpoint {
    pub url: Url,
    pub timeout: Duration,
}

impl DownstreamEndpoint {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(url: Url, timeout: Duration) -> Self {
        Self { url, timeout }
    }
}

/// A logical downstream dependency with a primary and an optional alternate
/// endpoint. Node names are compared case-insensitively.
#[derive(Clone, Debug, Builder)]
pub struct DownstreamNode {
    #[builder(into)]
    pub name: String,
    pub primary: DownstreamEndpoint,
    pub alternate: Option<DownstreamEndpoint>,
    #[builder(default)]
    pub mandatory: bool,
    /// Per-node cap on the share of requests sent to the alternate.
    #[builder(default = 0.2)]
    pub max_detour_share: f64,
}

impl DownstreamNode {
    pub fn has_alternate(&self) -> bool {
        self.alternate.is_some()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EndpointSelection {
    #[default]
    Primary,
    Alternate,
}

impl EndpointSelection {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EndpointSelection::Primary => "primary",
            EndpointSelection::Alternate => "alternate",
        }
    }

    pub const fn is_alternate(&self) -> bool {
        matches!(self, EndpointSelection::Alternate)
    }
}

impl fmt::Display for EndpointSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
