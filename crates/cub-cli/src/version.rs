pub const FULL: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+git.",
    env!("CUB_GIT_COUNT"),
    ".",
    env!("CUB_GIT_SHA"),
    env!("CUB_GIT_DIRTY")
);

#[cfg(test)]
mod tests {
    use super::FULL;

    #[test]
    fn version_includes_build_sha() {
        let output = std::process::Command::new("git")
            .args(["rev-parse", "--short", "HEAD"])
            .current_dir(env!("CARGO_MANIFEST_DIR"))
            .output();
        let expected = match output {
            Ok(out) if out.status.success() => String::from_utf8(out.stdout)
                .expect("utf8")
                .trim()
                .to_string(),
            // Built outside a git checkout.
            _ => "nogit".to_string(),
        };
        assert!(
            FULL.starts_with(env!("CARGO_PKG_VERSION")),
            "version={FULL}"
        );
        assert!(
            FULL.contains(&expected),
            "version string does not include git sha; version={FULL} sha={expected}"
        );
    }
}
