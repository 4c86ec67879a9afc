// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits,
};
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Fom domain options.
mod domain_config {
    pub const SECTION_NAME: &str = "fom_domain";
    // Number of localities.
    pub const LOCALITIES: &str = "localities";
    // Threads created per locality at init.
    pub const IDLE_THREADS: &str = "idle_threads";
    // Soft cap on threads per locality.
    pub const MAX_THREADS: &str = "max_threads";
    // What to do when the soft cap is reached.
    pub const OVERFLOW_POLICY: &str = "overflow_policy";
    // Handler sleep on an empty run queue.
    pub const RUN_TIMEOUT_MS: &str = "run_timeout_ms";
    // Pin locality threads to their CPU.
    pub const BIND_CPUS: &str = "bind_cpus";
}

/// Prefix of environment variables overriding configuration options.
const ENV_PREFIX: &str = "fom_";

//======================================================================================================================
// Structures
//======================================================================================================================

/// What block-enter does when growing the pool would exceed the thread cap of a locality.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OverflowPolicy {
    /// Grow anyway, with a warning.
    #[default]
    Grow,
    /// Do not grow. The blocking call proceeds and the locality stalls until a thread unblocks.
    Degrade,
    /// Fail the blocking section with `EAGAIN`.
    Reject,
}

/// Settings of a fom domain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DomainConfig {
    /// Number of localities. Online CPUs when unset.
    pub localities: Option<usize>,
    pub idle_threads: usize,
    /// Soft cap on threads per locality. Unbounded when unset.
    pub max_threads: Option<usize>,
    pub overflow_policy: OverflowPolicy,
    pub run_timeout: Duration,
    pub bind_cpus: bool,
}

/// Fom domain configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::from_str(&config_s)
    }

    /// Parses a configuration document.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration ({})", e);
                error!("from_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            [c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };

        Ok(Self(config_obj.clone()))
    }

    fn get_domain_config(&self) -> Option<&Yaml> {
        let section: &Yaml = self.0.index(domain_config::SECTION_NAME);
        match section {
            Yaml::Hash(_) => Some(section),
            _ => None,
        }
    }

    /// Reads every option, environment variables first, then the configuration file, then defaults.
    pub fn domain_config(&self) -> Result<DomainConfig, Fail> {
        let defaults: DomainConfig = DomainConfig::default();
        let localities: Option<usize> = self.usize_option(domain_config::LOCALITIES)?;
        if let Some(n) = localities {
            if n == 0 || n > limits::MAX_LOCALITIES {
                let cause: String = format!("parameter \"{}\" is out of range", domain_config::LOCALITIES);
                return Err(Fail::new(libc::ERANGE, &cause));
            }
        }
        let idle_threads: usize = self
            .usize_option(domain_config::IDLE_THREADS)?
            .unwrap_or(defaults.idle_threads);
        if idle_threads == 0 {
            let cause: String = format!("parameter \"{}\" must be positive", domain_config::IDLE_THREADS);
            return Err(Fail::new(libc::ERANGE, &cause));
        }
        let overflow_policy: OverflowPolicy = match self.str_option(domain_config::OVERFLOW_POLICY)? {
            Some(policy) => policy.parse()?,
            None => defaults.overflow_policy,
        };
        let max_threads: Option<usize> = self.usize_option(domain_config::MAX_THREADS)?;
        if max_threads == Some(0) {
            let cause: String = format!("parameter \"{}\" must be positive", domain_config::MAX_THREADS);
            return Err(Fail::new(libc::ERANGE, &cause));
        }
        let run_timeout: Duration = match self.usize_option(domain_config::RUN_TIMEOUT_MS)? {
            Some(0) => {
                let cause: String = format!("parameter \"{}\" must be positive", domain_config::RUN_TIMEOUT_MS);
                return Err(Fail::new(libc::ERANGE, &cause));
            },
            Some(ms) => Duration::from_millis(ms as u64),
            None => defaults.run_timeout,
        };
        let bind_cpus: bool = self
            .bool_option(domain_config::BIND_CPUS)?
            .unwrap_or(defaults.bind_cpus);

        Ok(DomainConfig {
            localities,
            idle_threads,
            max_threads,
            overflow_policy,
            run_timeout,
            bind_cpus,
        })
    }

    //======================================================================================================================
    // Static Functions
    //======================================================================================================================

    fn usize_option(&self, index: &str) -> Result<Option<usize>, Fail> {
        if let Some(value) = Self::get_typed_env_option(index)? {
            return Ok(Some(value));
        }
        match self.get_domain_config().map(|section| section.index(index)) {
            None | Some(Yaml::BadValue) => Ok(None),
            Some(Yaml::Integer(value)) => match usize::try_from(*value) {
                Ok(value) => Ok(Some(value)),
                Err(_) => {
                    let message: String = format!("parameter \"{}\" is out of range", index);
                    Err(Fail::new(libc::ERANGE, message.as_str()))
                },
            },
            Some(_) => Err(Self::unexpected_type(index)),
        }
    }

    fn bool_option(&self, index: &str) -> Result<Option<bool>, Fail> {
        if let Some(value) = Self::get_typed_env_option(index)? {
            return Ok(Some(value));
        }
        match self.get_domain_config().map(|section| section.index(index)) {
            None | Some(Yaml::BadValue) => Ok(None),
            Some(Yaml::Boolean(value)) => Ok(Some(*value)),
            Some(_) => Err(Self::unexpected_type(index)),
        }
    }

    fn str_option(&self, index: &str) -> Result<Option<String>, Fail> {
        if let Some(value) = Self::get_typed_env_option::<String>(index)? {
            return Ok(Some(value));
        }
        match self.get_domain_config().map(|section| section.index(index)) {
            None | Some(Yaml::BadValue) => Ok(None),
            Some(Yaml::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(Self::unexpected_type(index)),
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        // Check for the environment variable.
        let name: String = format!("{}{}", ENV_PREFIX, index).to_uppercase();
        if let Ok(var) = ::std::env::var(name) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    fn unexpected_type(index: &str) -> Fail {
        let message: String = format!("parameter {} has unexpected type", index);
        Fail::new(libc::EINVAL, message.as_str())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            localities: None,
            idle_threads: limits::DEFAULT_IDLE_THREADS,
            max_threads: None,
            overflow_policy: OverflowPolicy::default(),
            run_timeout: Duration::from_millis(limits::DEFAULT_RUN_TIMEOUT_MS),
            bind_cpus: cfg!(target_os = "linux"),
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = Fail;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "grow" => Ok(OverflowPolicy::Grow),
            "degrade" => Ok(OverflowPolicy::Degrade),
            "reject" => Ok(OverflowPolicy::Reject),
            _ => {
                let cause: String = format!("unknown overflow policy \"{}\"", s);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
