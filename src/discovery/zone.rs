//! Zones and discovery provider specs.
//!
//! A provider spec selects the discovery fabric and the zones to consult,
//! in descending order of preference:
//!
//! ```text
//! scheme://[rack.][az.]region[,...]
//! ```
//!
//! Zone labels are addressed from the tail so operators can omit leading
//! labels: `us-east-1`, `zone.us-east-1` and `rack.zone.us-east-1` are all
//! valid.

use std::fmt;

use super::DiscoveryError;

/// An availability zone: an ordered sequence of dotted labels ending in the
/// region. Immutable after parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone(Vec<String>);

impl Zone {
    /// Parse a dotted zone identifier.
    pub fn parse(input: &str) -> Result<Zone, DiscoveryError> {
        let labels: Vec<String> = input
            .split('.')
            .map(|label| label.trim().to_string())
            .collect();
        if labels.is_empty() || labels.iter().any(|label| label.is_empty()) {
            return Err(DiscoveryError::MalformedProvider);
        }
        Ok(Zone(labels))
    }

    /// The zone's region: always the last label.
    pub fn region(&self) -> &str {
        self.label_from_tail(1)
    }

    /// The zone's availability zone, when present.
    pub fn az(&self) -> &str {
        self.label_from_tail(2)
    }

    /// The zone's rack, when present.
    pub fn rack(&self) -> &str {
        self.label_from_tail(3)
    }

    fn label_from_tail(&self, n: usize) -> &str {
        if self.0.len() >= n {
            &self.0[self.0.len() - n]
        } else {
            ""
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// A parsed discovery provider spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    pub scheme: String,
    pub zones: Vec<Zone>,
}

impl ProviderSpec {
    /// Parse a provider spec of the form `scheme://zone[,zone...]`.
    pub fn parse(input: &str) -> Result<ProviderSpec, DiscoveryError> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or(DiscoveryError::MalformedProvider)?;
        if scheme.is_empty() {
            return Err(DiscoveryError::MalformedProvider);
        }

        let zones = rest
            .split(',')
            .map(Zone::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if zones.is_empty() {
            return Err(DiscoveryError::MalformedProvider);
        }

        Ok(ProviderSpec {
            scheme: scheme.to_string(),
            zones,
        })
    }
}

impl fmt::Display for ProviderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        for (i, zone) in self.zones.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", zone)?;
        }
        Ok(())
    }
}
