//! Deterministic names for generated objects
//!
//! Every name the provisioner creates is a pure function of the owning
//! cluster's namespace/name and, where relevant, the node pool name.

use aws_lc_rs::digest::{digest, SHA256};
use data_encoding::HEXLOWER;

/// Longest name that is returned unchanged by [`safe_concat_name`]
const MAX_NAME_LEN: usize = 63;

/// Join `parts` with `-`, shortening the result to a valid object name
///
/// Names of 63 bytes or fewer are returned as-is. Longer names are cut to 57
/// bytes (56 if the 57th is not `[a-z0-9]`) and suffixed with `-` plus the
/// first five hex characters of the SHA-256 of the full join, so distinct long
/// inputs stay distinct.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= MAX_NAME_LEN {
        return full;
    }

    let hash = HEXLOWER.encode(digest(&SHA256, full.as_bytes()).as_ref());
    let bytes = full.as_bytes();
    let cut = if matches!(bytes[56], b'a'..=b'z' | b'0'..=b'9') {
        57
    } else {
        56
    };
    format!("{}-{}", String::from_utf8_lossy(&bytes[..cut]), &hash[..5])
}

/// Name of the secret holding a cluster's kubeconfig
pub fn kubeconfig_secret_name(cluster: &str) -> String {
    format!("{cluster}-kubeconfig")
}

/// Name of the bootstrap template shared by all pools of a cluster
pub fn bootstrap_template_name(cluster: &str) -> String {
    safe_concat_name(&[cluster, "bootstrap", "template"])
}

/// Name of the machine template and machine deployment of a node pool
pub fn node_pool_name(cluster: &str, pool: &str) -> String {
    safe_concat_name(&[cluster, "nodepool", pool])
}

/// Name of the management cluster record backing a cluster
///
/// `c-m-` followed by eight hex characters of the SHA-256 of `namespace/name`.
pub fn management_cluster_name(namespace: &str, name: &str) -> String {
    let hash = digest(&SHA256, format!("{namespace}/{name}").as_bytes());
    format!("c-m-{}", &HEXLOWER.encode(hash.as_ref())[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::short(&["demo", "nodepool", "pool-a"], "demo-nodepool-pool-a")]
    #[case::bootstrap(&["demo", "bootstrap", "template"], "demo-bootstrap-template")]
    #[case::single(&["x"], "x")]
    fn short_names_are_joined(#[case] parts: &[&str], #[case] expected: &str) {
        assert_eq!(safe_concat_name(parts), expected);
    }

    #[test]
    fn sixty_three_bytes_is_kept() {
        let name = "a".repeat(63);
        assert_eq!(safe_concat_name(&[&name]), name);
    }

    #[test]
    fn long_names_are_truncated_with_hash_suffix() {
        let cluster = "a".repeat(60);
        let name = safe_concat_name(&[&cluster, "nodepool", "pool"]);
        assert_eq!(name.len(), 63);
        assert!(name.starts_with(&"a".repeat(57)));
        assert_eq!(&name[57..58], "-");
        assert!(name[58..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cut_drops_trailing_separator() {
        // byte 56 is '-', so the name is cut one byte earlier
        let prefix = "b".repeat(56);
        let name = safe_concat_name(&[&prefix, "tail-that-is-long-enough"]);
        assert_eq!(name.len(), 62);
        assert!(name.starts_with(&prefix));
        assert_eq!(&name[56..57], "-");
    }

    #[test]
    fn truncation_is_stable_and_distinct() {
        let a = "x".repeat(70);
        let b = format!("{}y", "x".repeat(69));
        assert_eq!(safe_concat_name(&[&a]), safe_concat_name(&[&a]));
        assert_ne!(safe_concat_name(&[&a]), safe_concat_name(&[&b]));
    }

    #[test]
    fn distinct_pools_never_collide() {
        assert_ne!(node_pool_name("demo", "a"), node_pool_name("demo", "b"));
        assert_ne!(node_pool_name("demo", "a"), bootstrap_template_name("demo"));
    }

    #[test]
    fn management_cluster_name_is_deterministic() {
        let a = management_cluster_name("ns1", "demo");
        assert_eq!(a, management_cluster_name("ns1", "demo"));
        assert_ne!(a, management_cluster_name("ns2", "demo"));
        assert!(a.starts_with("c-m-"));
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn kubeconfig_secret_suffix() {
        assert_eq!(kubeconfig_secret_name("demo"), "demo-kubeconfig");
    }
}
