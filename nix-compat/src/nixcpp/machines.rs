//! Parser for the remote builders list, as found in `/etc/nix/machines` or
//! inline in the `builders` setting.
//!
//! Machines are separated by newlines or `;`, and each consists of
//! whitespace-separated fields:
//!
//! ```text
//! uri systems ssh-key max-jobs speed-factor supported-features mandatory-features public-host-key
//! ```
//!
//! All fields but the URI are optional, `-` leaves a field at its default.
//! Lists are comma-separated. `#` starts a comment.

use std::collections::BTreeSet;

#[derive(Clone, Debug, PartialEq)]
pub struct Machine {
    pub store_uri: String,
    pub system_types: Vec<String>,
    pub ssh_key: Option<String>,
    pub max_jobs: u64,
    pub speed_factor: f32,
    pub supported_features: BTreeSet<String>,
    pub mandatory_features: BTreeSet<String>,
    pub ssh_public_host_key: Option<String>,

    /// Cleared once connecting failed, the machine is not considered again.
    pub enabled: bool,
}

impl Machine {
    /// A machine with default settings, building for `system`.
    pub fn new(store_uri: &str, system: &str) -> Self {
        Self {
            store_uri: normalize_uri(store_uri),
            system_types: vec![system.to_string()],
            ssh_key: None,
            max_jobs: 1,
            speed_factor: 1.0,
            supported_features: BTreeSet::new(),
            mandatory_features: BTreeSet::new(),
            ssh_public_host_key: None,
            enabled: true,
        }
    }

    /// Whether all of `features` are supported (or mandatory) on this machine.
    pub fn all_supported<'a>(&self, features: impl IntoIterator<Item = &'a String>) -> bool {
        features
            .into_iter()
            .all(|f| self.supported_features.contains(f) || self.mandatory_features.contains(f))
    }

    /// Whether all mandatory features of this machine are among `features`.
    pub fn mandatory_met(&self, features: &BTreeSet<String>) -> bool {
        self.mandatory_features.is_subset(features)
    }

    /// Parses a list of machines. Machines without systems build for
    /// `default_system`.
    pub fn parse_many(input: &str, default_system: &str) -> Result<Vec<Self>, Error> {
        input
            .split(['\n', ';'])
            .map(|line| match line.split_once('#') {
                Some((line, _comment)) => line,
                None => line,
            })
            .filter(|line| !line.trim().is_empty())
            .map(|line| Self::parse(line, default_system))
            .collect()
    }

    fn parse(line: &str, default_system: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = line.split_whitespace().collect();

        if fields.len() > 8 {
            return Err(Error::TooManyFields(line.trim().to_string()));
        }

        // `-` and missing fields both mean the default.
        let field = |i: usize| fields.get(i).copied().filter(|f| *f != "-" && !f.is_empty());
        let list = |i: usize| -> Vec<String> {
            field(i)
                .map(|f| {
                    f.split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut machine = Self::new(fields[0], default_system);

        let systems = list(1);
        if !systems.is_empty() {
            machine.system_types = systems;
        }

        machine.ssh_key = field(2).map(str::to_string);

        if let Some(max_jobs) = field(3) {
            machine.max_jobs = max_jobs
                .parse()
                .map_err(|_| Error::InvalidMaxJobs(max_jobs.to_string()))?;
        }

        if let Some(speed_factor) = field(4) {
            machine.speed_factor = speed_factor
                .parse()
                .ok()
                .filter(|s: &f32| s.is_finite() && *s > 0.0)
                .ok_or_else(|| Error::InvalidSpeedFactor(speed_factor.to_string()))?;
        }

        machine.supported_features = list(5).into_iter().collect();
        machine.mandatory_features = list(6).into_iter().collect();
        machine.ssh_public_host_key = field(7).map(str::to_string);

        Ok(machine)
    }
}

/// Host names without a scheme are reached over SSH.
fn normalize_uri(uri: &str) -> String {
    if uri.contains("://")
        || uri.starts_with('/')
        || ["local", "remote", "auto"]
            .iter()
            .any(|prefix| uri.starts_with(prefix))
    {
        uri.to_string()
    } else {
        format!("ssh://{}", uri)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("bad machine specification: too many fields in '{0}'")]
    TooManyFields(String),
    #[error("bad machine specification: invalid max-jobs '{0}'")]
    InvalidMaxJobs(String),
    #[error("bad machine specification: invalid speed factor '{0}'")]
    InvalidSpeedFactor(String),
}
