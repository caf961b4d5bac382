use std::collections::BTreeMap;

/// Child arguments for a model: its override list when one exists and is
/// non-empty, the defaults otherwise. Never merges the two.
pub fn resolve_args(
    default_args: &[String],
    overrides: &BTreeMap<String, Vec<String>>,
    base_name: &str,
) -> Vec<String> {
    match overrides.get(base_name) {
        Some(args) if !args.is_empty() => args.clone(),
        _ => default_args.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_override_is_used_verbatim() {
        let defaults = strings(&["--ctx-size", "8192"]);
        let mut overrides = BTreeMap::new();
        overrides.insert("modelX".to_string(), strings(&["--ctx-size", "2048", "-ngl", "10"]));

        assert_eq!(
            resolve_args(&defaults, &overrides, "modelX"),
            strings(&["--ctx-size", "2048", "-ngl", "10"])
        );
        assert_eq!(resolve_args(&defaults, &overrides, "modelY"), defaults);
    }

    #[test]
    fn test_empty_override_falls_back() {
        let defaults = strings(&["--flash-attn", "on"]);
        let mut overrides = BTreeMap::new();
        overrides.insert("modelX".to_string(), Vec::new());

        assert_eq!(resolve_args(&defaults, &overrides, "modelX"), defaults);
        assert!(resolve_args(&[], &BTreeMap::new(), "anything").is_empty());
    }
}
