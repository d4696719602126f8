//! User-data content types and content sniffing
//!
//! Parts whose declared content type has no registered handler are routed
//! by the marker their body starts with.

use std::fmt;

/// Content types with a recognizable body marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Shell script (#!)
    ShellScript,
    /// Cloud-config YAML (#cloud-config)
    CloudConfig,
    /// Upstart job (#upstart-job)
    UpstartJob,
    /// Handler definition (#part-handler)
    PartHandler,
    /// Appliance description (<appliance>)
    ApplianceConfig,
}

impl ContentType {
    /// Sniffing order
    pub const ALL: [ContentType; 5] = [
        Self::ShellScript,
        Self::CloudConfig,
        Self::UpstartJob,
        Self::PartHandler,
        Self::ApplianceConfig,
    ];

    /// Get the MIME type string for this content type
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::ShellScript => "text/x-shellscript",
            Self::CloudConfig => "text/cloud-config",
            Self::UpstartJob => "text/upstart-job",
            Self::PartHandler => "text/part-handler",
            Self::ApplianceConfig => "text/x-appliance-config",
        }
    }

    /// Marker a body of this type starts with
    pub fn marker(&self) -> &'static str {
        match self {
            Self::ShellScript => "#!",
            Self::CloudConfig => "#cloud-config",
            Self::UpstartJob => "#upstart-job",
            Self::PartHandler => "#part-handler",
            Self::ApplianceConfig => "<appliance>",
        }
    }

    /// Detect content type from the start of a body
    pub fn sniff(body: &[u8]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|ct| body.starts_with(ct.marker().as_bytes()))
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mime_type())
    }
}

/// MIME type without parameters, lower-cased: `Text/Plain; charset=x` -> `text/plain`
pub fn essence(mime: &str) -> String {
    mime.split(';').next().unwrap_or(mime).trim().to_lowercase()
}

/// Whether a MIME type names a container of parts
pub fn is_multipart(mime: &str) -> bool {
    essence(mime).starts_with("multipart/")
}
