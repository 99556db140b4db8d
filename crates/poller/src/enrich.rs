//! Event enrichment: domain extraction, organization resolution, CIDR tests
//!
//! Shared across the source collectors. Resolution never errors; anything
//! that cannot be resolved degrades to the bare domain string so the
//! dashboard still shows something sensible.

use std::collections::HashSet;
use std::net::IpAddr;
use tracing::warn;

use pulsefeed_refdata::OrganizationDirectory;

/// Rendered when an email has an empty domain part.
pub const UNKNOWN_DOMAIN: &str = "domain unknown";

/// Extract the domain from an email address. Addresses that do not split
/// into exactly two parts on '@' are malformed and dropped by the caller.
pub fn email_domain(email: &str) -> Option<String> {
    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        warn!(email = %email, "Email does not consist of exactly one '@', dropping record");
        return None;
    }
    if parts[1].is_empty() {
        return Some(UNKNOWN_DOMAIN.to_string());
    }
    Some(parts[1].to_string())
}

/// Pick the domain used for organization lookup. Guests keep their inviter's
/// organization; guests invited directly by an administrator carry no
/// inviter and fall back to the configured default domain.
pub fn resolve_lookup_domain(
    directory: &OrganizationDirectory,
    user_domain: &str,
    invited_from_domain: &str,
    guest_fallback_domain: &str,
) -> String {
    if directory.organizations.contains_key(user_domain) {
        user_domain.to_string()
    } else if directory.organizations.contains_key(invited_from_domain) {
        invited_from_domain.to_string()
    } else {
        guest_fallback_domain.to_string()
    }
}

/// Display name for a directory-listed domain. `None` when the domain is not
/// in the directory at all; an empty stored name falls back to the domain.
pub fn display_name(directory: &OrganizationDirectory, domain: &str) -> Option<String> {
    directory.organizations.get(domain).map(|organization| {
        if organization.display_name.is_empty() {
            domain.to_string()
        } else {
            organization.display_name.clone()
        }
    })
}

/// Disambiguate a duplicate domain by probing the user's addresses against
/// each range group in load order; the first containing group names the
/// organization. No match keeps the bare domain.
pub fn resolve_duplicate_display_name(
    directory: &OrganizationDirectory,
    domain: &str,
    addresses: &[String],
) -> String {
    if let Some(organization) = directory.organizations.get(domain) {
        for address in addresses {
            for group in &organization.ip_range_groups {
                if ip_within_ranges(&group.ip_ranges, address) {
                    return group.display_name.clone();
                }
            }
        }
    }
    domain.to_string()
}

/// True when `address` parses and lies within any of the CIDR ranges.
pub fn ip_within_ranges(ranges: &HashSet<String>, address: &str) -> bool {
    let Ok(address) = address.parse::<IpAddr>() else {
        warn!(address = %address, "Could not parse address for range test");
        return false;
    };
    ranges.iter().any(|range| cidr_contains(range, address))
}

fn cidr_contains(cidr: &str, address: IpAddr) -> bool {
    let Some((network, prefix)) = cidr.split_once('/') else {
        warn!(range = %cidr, "Could not determine if address is in range");
        return false;
    };
    let (Ok(network), Ok(prefix)) = (network.parse::<IpAddr>(), prefix.parse::<u32>()) else {
        warn!(range = %cidr, "Could not determine if address is in range");
        return false;
    };
    match (network, address) {
        (IpAddr::V4(network), IpAddr::V4(address)) => {
            if prefix > 32 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            u32::from(network) & mask == u32::from(address) & mask
        }
        (IpAddr::V6(network), IpAddr::V6(address)) => {
            if prefix > 128 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            u128::from(network) & mask == u128::from(address) & mask
        }
        _ => false,
    }
}

/// Backends occasionally report negative sizes and counts; those are data
/// anomalies, not errors, and clamp to zero.
pub fn clamp_non_negative_i64(value: i64, field: &str) -> i64 {
    if value < 0 {
        warn!(field = field, value = value, "Value was smaller than 0, setting it to 0");
        0
    } else {
        value
    }
}

pub fn clamp_non_negative_i32(value: i32, field: &str) -> i32 {
    if value < 0 {
        warn!(field = field, value = value, "Value was smaller than 0, setting it to 0");
        0
    } else {
        value
    }
}

pub fn clamp_non_negative_f64(value: f64, field: &str) -> f64 {
    if value < 0.0 {
        warn!(field = field, value = value, "Value was smaller than 0, setting it to 0");
        0.0
    } else {
        value
    }
}
