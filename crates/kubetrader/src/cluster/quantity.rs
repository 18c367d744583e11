//! Parsing for Kubernetes resource quantities (`100m`, `2`, `128Mi`,
//! `1Gi`, ...) into the units the metric model uses.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Parses a quantity into its base unit (cores for CPU, bytes for
/// memory). Returns `None` for malformed strings.
pub fn parse_quantity(quantity: &Quantity) -> Option<f64> {
    let s = quantity.0.trim();
    if s.is_empty() {
        return None;
    }

    let suffixes: [(&str, f64); 11] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0_f64.powi(3)),
        ("Ti", 1024.0_f64.powi(4)),
        ("Pi", 1024.0_f64.powi(5)),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
    ];

    for (suffix, factor) in suffixes {
        if let Some(number) = s.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|v| v * factor);
        }
    }

    s.parse::<f64>().ok()
}

/// CPU quantity in millicores.
pub fn quantity_to_millicores(quantity: &Quantity) -> Option<f64> {
    parse_quantity(quantity).map(|cores| cores * 1000.0)
}

/// Memory quantity in KiB.
pub fn quantity_to_kib(quantity: &Quantity) -> Option<f64> {
    parse_quantity(quantity).map(|bytes| bytes / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn parses_cpu_quantities() {
        assert_eq!(quantity_to_millicores(&q("100m")), Some(100.0));
        assert_eq!(quantity_to_millicores(&q("2")), Some(2000.0));
        assert_eq!(quantity_to_millicores(&q("1.5")), Some(1500.0));
    }

    #[test]
    fn parses_memory_quantities() {
        assert_eq!(quantity_to_kib(&q("1024")), Some(1.0));
        assert_eq!(quantity_to_kib(&q("128Mi")), Some(128.0 * 1024.0));
        assert_eq!(quantity_to_kib(&q("1Gi")), Some(1024.0 * 1024.0));
        assert_eq!(quantity_to_kib(&q("1M")), Some(1_000_000.0 / 1024.0));
    }

    #[test]
    fn rejects_malformed_quantities() {
        assert_eq!(parse_quantity(&q("")), None);
        assert_eq!(parse_quantity(&q("abc")), None);
        assert_eq!(parse_quantity(&q("12xy")), None);
    }
}
