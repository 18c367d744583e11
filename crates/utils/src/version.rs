//! Kubernetes-aware API version ordering.

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stability {
    Alpha,
    Beta,
    Ga,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ParsedVersion {
    major: u32,
    stability: Stability,
    minor: u32,
}

/// Parses a Kubernetes API version string such as `v1`, `v2beta3` or
/// `v1alpha1`. Returns `None` for strings that do not follow the scheme.
fn parse(version: &str) -> Option<ParsedVersion> {
    let rest = version.strip_prefix('v')?;

    let major_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if major_len == 0 {
        return None;
    }
    let major: u32 = rest[..major_len].parse().ok()?;
    let suffix = &rest[major_len..];

    if suffix.is_empty() {
        return Some(ParsedVersion {
            major,
            stability: Stability::Ga,
            minor: 0,
        });
    }

    let (stability, minor_str) = if let Some(n) = suffix.strip_prefix("beta") {
        (Stability::Beta, n)
    } else if let Some(n) = suffix.strip_prefix("alpha") {
        (Stability::Alpha, n)
    } else {
        return None;
    };

    let minor: u32 = minor_str.parse().ok()?;
    Some(ParsedVersion {
        major,
        stability,
        minor,
    })
}

/// Compares two Kubernetes API versions the way the API server orders
/// them: GA releases sort above beta, beta above alpha, and within the
/// same stability level the higher numeric components win. Strings that
/// do not parse sort below every conforming version and fall back to
/// lexicographic order among themselves.
pub fn compare_kube_aware_versions(a: &str, b: &str) -> Ordering {
    match (parse(a), parse(b)) {
        (Some(pa), Some(pb)) => pa
            .stability
            .cmp(&pb.stability)
            .then(pa.major.cmp(&pb.major))
            .then(pa.minor.cmp(&pb.minor)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ga_beats_beta_and_alpha() {
        assert_eq!(compare_kube_aware_versions("v1", "v1beta1"), Ordering::Greater);
        assert_eq!(compare_kube_aware_versions("v1", "v2beta1"), Ordering::Greater);
        assert_eq!(compare_kube_aware_versions("v1alpha2", "v1"), Ordering::Less);
    }

    #[test]
    fn numeric_components_order_within_stability() {
        assert_eq!(compare_kube_aware_versions("v2", "v1"), Ordering::Greater);
        assert_eq!(
            compare_kube_aware_versions("v1beta2", "v1beta1"),
            Ordering::Greater
        );
        assert_eq!(
            compare_kube_aware_versions("v2alpha1", "v1alpha1"),
            Ordering::Greater
        );
    }

    #[test]
    fn malformed_versions_sort_lowest() {
        assert_eq!(compare_kube_aware_versions("foo", "v1alpha1"), Ordering::Less);
        assert_eq!(compare_kube_aware_versions("v1", "bar"), Ordering::Greater);
        assert_eq!(compare_kube_aware_versions("abc", "abd"), Ordering::Less);
    }

    #[test]
    fn equal_versions_compare_equal() {
        assert_eq!(compare_kube_aware_versions("v1", "v1"), Ordering::Equal);
        assert_eq!(
            compare_kube_aware_versions("v2beta3", "v2beta3"),
            Ordering::Equal
        );
    }
}
