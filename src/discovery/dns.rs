//! Zone endpoint resolution.
//!
//! Each zone's discovery endpoints are published as a TXT record at
//! `<zone>[.<domain>]` whose payload is a comma-separated endpoint list.

use hickory_resolver::TokioAsyncResolver;

use super::{DiscoveryError, Zone};

/// Resolve the discovery endpoints for a zone. The first record's payload
/// is split on commas; an empty record fails the zone.
pub async fn zone_endpoints(
    resolver: &TokioAsyncResolver,
    domain: &str,
    zone: &Zone,
) -> Result<Vec<String>, DiscoveryError> {
    let mut query = zone.to_string();
    if !domain.is_empty() {
        query.push('.');
        query.push_str(domain);
    }

    let lookup = resolver
        .txt_lookup(query.clone())
        .await
        .map_err(|err| DiscoveryError::Dns(format!("{}: {}", query, err)))?;

    let record = lookup
        .iter()
        .next()
        .ok_or_else(|| DiscoveryError::Dns(format!("no records for zone: {}", query)))?;

    let payload: String = record
        .txt_data()
        .iter()
        .map(|data| String::from_utf8_lossy(data))
        .collect();

    let endpoints: Vec<String> = payload
        .split(',')
        .map(|endpoint| endpoint.trim().to_string())
        .filter(|endpoint| !endpoint.is_empty())
        .collect();

    if endpoints.is_empty() {
        return Err(DiscoveryError::Dns(format!(
            "empty record for zone: {}",
            query
        )));
    }

    Ok(endpoints)
}
