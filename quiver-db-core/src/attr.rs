//! Namespaced attribute conventions.
//!
//! Every predicate and type name on disk carries its tenant namespace as a
//! prefix: `<namespace as 16 hex digits>-<name>`. The hex form sorts and
//! JSON-marshals cleanly. Two historical forms still appear in old backups:
//!
//! - pre-namespace backups (version 0) store bare names; restoring them means
//!   prepending the default ("galaxy") namespace tag,
//! - the 2103 release stored `<namespace as 8 raw bytes BE>|<name>`, which
//!   broke JSON marshalling and was replaced by the hex form in 2105.

use crate::error::{Error, Result};

/// The default namespace every pre-namespace deployment maps onto.
pub const GALAXY_NS: u64 = 0;

/// Length of the hex namespace prefix, without the `-` separator.
const NS_HEX_LEN: usize = 16;

/// Qualify `name` with `ns` in the on-disk `<ns hex>-<name>` form.
pub fn namespace_attr(ns: u64, name: &str) -> String {
    format!("{ns:016x}-{name}")
}

/// Qualify `name` with the default namespace.
pub fn galaxy_attr(name: &str) -> String {
    namespace_attr(GALAXY_NS, name)
}

/// Split a namespaced attribute into `(namespace, bare name)`.
pub fn parse_namespace_attr(attr: &str) -> Result<(u64, &str)> {
    let bytes = attr.as_bytes();
    if bytes.len() < NS_HEX_LEN + 1 || bytes[NS_HEX_LEN] != b'-' {
        return Err(Error::malformed_attr(format!(
            "attribute {attr:?} is missing the namespace prefix"
        )));
    }
    let ns = u64::from_str_radix(&attr[..NS_HEX_LEN], 16)
        .map_err(|e| Error::malformed_attr(format!("attribute {attr:?}: {e}")))?;
    Ok((ns, &attr[NS_HEX_LEN + 1..]))
}

/// Rewrite a 2103-format attribute (`<ns 8 bytes BE>|<name>`) into the
/// current `<ns hex>-<name>` form.
pub fn attr_from_2103(attr: &str) -> Result<String> {
    let bytes = attr.as_bytes();
    if bytes.len() < 9 || bytes[8] != b'|' {
        return Err(Error::malformed_attr(format!(
            "attribute {attr:?} is not in the 2103 format"
        )));
    }
    let ns = u64::from_be_bytes(bytes[..8].try_into().unwrap());
    let name = attr.get(9..).ok_or_else(|| {
        Error::malformed_attr(format!("attribute {attr:?} has a truncated name"))
    })?;
    Ok(namespace_attr(ns, name))
}

// ============================================================================
// Tests
// ============================================================================
