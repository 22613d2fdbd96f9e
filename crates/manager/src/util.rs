use once_cell::sync::Lazy;
use regex::Regex;

static GPU_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/dev/nvidia([0-9]+)$").expect("gpu path pattern"));

/// Check that a path names a concrete GPU device node.
pub fn is_valid_gpu_path(path: &str) -> bool {
    GPU_PATH_RE.is_match(path)
}

/// Extract the minor id from a `/dev/nvidiaN` path.
pub fn gpu_minor_id(path: &str) -> Option<u32> {
    GPU_PATH_RE
        .captures(path)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Compare two device-id lists as multisets. The kubelet checkpoint does
/// not guarantee ordering between what it stores and what it sends.
pub fn same_id_set(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<&str> = a.iter().map(String::as_str).collect();
    let mut b: Vec<&str> = b.iter().map(String::as_str).collect();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_path_matching() {
        assert!(is_valid_gpu_path("/dev/nvidia0"));
        assert!(is_valid_gpu_path("/dev/nvidia12"));
        assert!(!is_valid_gpu_path("/dev/nvidiactl"));
        assert!(!is_valid_gpu_path("/dev/nvidia-uvm"));
        assert_eq!(gpu_minor_id("/dev/nvidia3"), Some(3));
        assert_eq!(gpu_minor_id("/dev/nvidia"), None);
    }

    #[test]
    fn id_set_comparison_ignores_order() {
        let a = vec!["b".to_string(), "a".to_string()];
        let b = vec!["a".to_string(), "b".to_string()];
        assert!(same_id_set(&a, &b));
        assert!(!same_id_set(&a, &b[..1].to_vec()));
    }
}
