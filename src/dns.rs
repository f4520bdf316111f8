use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::server::Cloud;

/// A record change: `previous_name` is removed, `name` is pointed at the
/// server. Either side may be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsChange {
    pub id: i64,
    pub previous_name: Option<String>,
    pub name: Option<String>,
    pub cloud: Cloud,
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Whether an external DNS integration is actually configured.
    fn has_dns(&self) -> bool {
        true
    }

    async fn make_dns_change(&self, change: &DnsChange) -> Result<()>;
}

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Check hostname syntax: dot-separated labels of lowercase letters, digits
/// and inner hyphens.
pub fn validate_dns_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("DNS name must not be empty");
    }
    if name.len() > MAX_NAME_LEN {
        bail!("DNS name '{}' is longer than {} characters", name, MAX_NAME_LEN);
    }
    let label = regex::Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$")?;
    for part in name.split('.') {
        if part.len() > MAX_LABEL_LEN {
            bail!(
                "DNS label '{}' is longer than {} characters",
                part,
                MAX_LABEL_LEN
            );
        }
        if !label.is_match(part) {
            bail!(
                "Invalid DNS name '{}': labels must be lowercase letters, digits or inner hyphens",
                name
            );
        }
    }
    Ok(())
}
