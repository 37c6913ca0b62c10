use tracing::debug;

/// Represents the subset of `/etc/nix/nix.conf` that's relevant for the
/// garbage collector and remote build dispatch.
/// Unknown keys are skipped, so a full Nix config file can be read.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NixConfig<'a> {
    pub keep_outputs: Option<bool>,
    pub keep_derivations: Option<bool>,
    pub min_free: Option<u64>,
    pub max_free: Option<u64>,
    pub min_free_check_interval: Option<u64>,
    pub gc_reserved_space: Option<u64>,
    pub max_jobs: Option<u64>,
    pub system: Option<&'a str>,
    pub extra_platforms: Option<Vec<&'a str>>,
    pub system_features: Option<Vec<&'a str>>,
    pub builders: Option<&'a str>,
    pub builders_use_substitutes: Option<bool>,
}

impl<'a> NixConfig<'a> {
    /// Parses configuration from a file like `/etc/nix/nix.conf`, returning
    /// a [NixConfig] with all known values contained in there.
    /// It does not support parsing multiple config files, merging semantics,
    /// and also does not understand `include` and `!include` statements.
    pub fn parse(input: &'a str) -> Result<Self, Error> {
        let mut out = Self::default();

        for line in input.lines() {
            // strip comments at the end of the line
            let line = match line.split_once('#') {
                Some((line, _comment)) => line,
                None => line,
            };

            if line.trim().is_empty() {
                continue;
            }

            let (tag, val) = line
                .split_once('=')
                .ok_or_else(|| Error::InvalidLine(line.to_string()))?;

            let tag = tag.trim();
            let val = val.trim();

            match out.parse_val(tag, val) {
                Some(true) => {}
                Some(false) => debug!(key = tag, "ignoring unknown nix.conf key"),
                None => return Err(Error::InvalidValue(tag.to_string(), val.to_string())),
            }
        }

        Ok(out)
    }

    /// Returns `Some(true)` if the value was applied, `Some(false)` for an
    /// unknown key and `None` if the value didn't parse.
    fn parse_val(&mut self, tag: &str, val: &'a str) -> Option<bool> {
        match tag {
            "keep-outputs" => self.keep_outputs = Some(parse_bool(val)?),
            "keep-derivations" => self.keep_derivations = Some(parse_bool(val)?),
            "min-free" => self.min_free = Some(parse_size(val)?),
            "max-free" => self.max_free = Some(parse_size(val)?),
            "min-free-check-interval" => self.min_free_check_interval = Some(val.parse().ok()?),
            "gc-reserved-space" => self.gc_reserved_space = Some(parse_size(val)?),
            "max-jobs" => self.max_jobs = Some(val.parse().ok()?),
            "system" => self.system = Some(val),
            "extra-platforms" => self.extra_platforms = Some(val.split_whitespace().collect()),
            "system-features" => self.system_features = Some(val.split_whitespace().collect()),
            "builders" => self.builders = Some(val),
            "builders-use-substitutes" => self.builders_use_substitutes = Some(parse_bool(val)?),
            _ => return Some(false),
        }
        Some(true)
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Parses a byte size, optionally suffixed with `K`, `M`, `G` or `T`.
pub fn parse_size(val: &str) -> Option<u64> {
    let (num, shift) = match val.as_bytes().last()? {
        b'K' => (&val[..val.len() - 1], 10),
        b'M' => (&val[..val.len() - 1], 20),
        b'G' => (&val[..val.len() - 1], 30),
        b'T' => (&val[..val.len() - 1], 40),
        _ => (val, 0),
    };

    num.parse::<u64>().ok()?.checked_mul(1 << shift)
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid line: {0}")]
    InvalidLine(String),
    #[error("Invalid value '{1}' for key '{0}'")]
    InvalidValue(String, String),
}

#[cfg(test)]
mod tests {
    use super::{parse_size, Error, NixConfig};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const NIX_CONF: &str = r#"
# the collector
keep-outputs = true
keep-derivations = false   # derivations can go
min-free = 1G
max-free	=	4294967296
min-free-check-interval = 5

system = x86_64-linux
extra-platforms = aarch64-linux i686-linux
builders = @/etc/nix/machines
builders-use-substitutes = true
sandbox = true
"#;

    #[test]
    fn parse() {
        let config = NixConfig::parse(NIX_CONF).expect("must parse");

        assert_eq!(
            NixConfig {
                keep_outputs: Some(true),
                keep_derivations: Some(false),
                min_free: Some(1 << 30),
                max_free: Some(4294967296),
                min_free_check_interval: Some(5),
                system: Some("x86_64-linux"),
                extra_platforms: Some(vec!["aarch64-linux", "i686-linux"]),
                builders: Some("@/etc/nix/machines"),
                builders_use_substitutes: Some(true),
                ..Default::default()
            },
            config
        );
    }

    #[test]
    fn invalid() {
        assert_eq!(
            Error::InvalidLine("keep-outputs".to_string()),
            NixConfig::parse("keep-outputs").expect_err("must fail")
        );
        assert_eq!(
            Error::InvalidValue("min-free".to_string(), "lots".to_string()),
            NixConfig::parse("min-free = lots").expect_err("must fail")
        );
    }

    #[rstest]
    #[case::plain("100", Some(100))]
    #[case::kilo("2K", Some(2048))]
    #[case::mega("3M", Some(3 << 20))]
    #[case::tera("1T", Some(1 << 40))]
    #[case::empty("", None)]
    #[case::garbage("1X", None)]
    #[case::overflow("18446744073709551615K", None)]
    fn sizes(#[case] val: &str, #[case] expected: Option<u64>) {
        assert_eq!(expected, parse_size(val));
    }
}
