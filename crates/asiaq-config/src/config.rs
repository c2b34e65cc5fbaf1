//! asiaq.toml configuration parser.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use asiaq_core::{DeploymentStrategy, ImageStage, MetanetworkName, is_truthy};
use asiaq_network::{Cidr, InboundRule, NatRoute, PortRange};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// One TOML table of `key[@env] = value` pairs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub(crate) struct Section(BTreeMap<String, toml::Value>);

impl Section {
    fn get(&self, key: &str, env: Option<&str>) -> Option<&toml::Value> {
        env.and_then(|env| self.0.get(&format!("{key}@{env}")))
            .or_else(|| self.0.get(key))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    asiaq: Section,
    #[serde(default)]
    envtype: BTreeMap<String, Section>,
    #[serde(default)]
    env: BTreeMap<String, Section>,
    #[serde(default)]
    hostclass: BTreeMap<String, Section>,
    #[serde(default)]
    test: Section,
}

// ── Key catalog ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Flag,
    Count,
    Cidr,
    CidrOrAuto,
    Cidrs,
    Rules,
    Ports,
    NatRoutes,
    Metanetwork,
    Metanetworks,
    Strategy,
    Stage,
    List,
}

const SETTINGS_KEYS: &[(&str, Kind)] = &[
    ("default_environment", Kind::Text),
    ("default_env_type", Kind::Text),
    ("zones", Kind::List),
    ("smoke_timeout_secs", Kind::Count),
    ("smoke_poll_secs", Kind::Count),
    ("autoscale_timeout_secs", Kind::Count),
    ("health_timeout_secs", Kind::Count),
    ("max_parallel", Kind::Count),
    ("launch_retries", Kind::Count),
    ("retry_backoff_secs", Kind::Count),
    ("ami_stage", Kind::Stage),
    ("ssh_user", Kind::Text),
];

const HOSTCLASS_KEYS: &[(&str, Kind)] = &[
    ("meta_network", Kind::Metanetwork),
    ("instance_type", Kind::Text),
    ("chaos", Kind::Flag),
    ("deployment_strategy", Kind::Strategy),
    ("elb", Kind::Flag),
    ("ip_address", Kind::Text),
    ("public_ip", Kind::Flag),
    ("smoke_test", Kind::Flag),
    ("deployable", Kind::Flag),
    ("integration_test", Kind::Text),
    ("test_hostclass", Kind::Text),
    ("test_user", Kind::Text),
    ("test_command", Kind::Text),
];

const TEST_KEYS: &[(&str, Kind)] = &[
    ("test_hostclass", Kind::Text),
    ("test_user", Kind::Text),
    ("test_command", Kind::Text),
];

const NETWORK_KEYS: &[(&str, Kind)] = &[
    ("env_type", Kind::Text),
    ("ip_space", Kind::Cidr),
    ("vpc_cidr", Kind::Cidr),
    ("vpc_cidr_size", Kind::Count),
    ("zones", Kind::List),
    ("metanetworks", Kind::Metanetworks),
    ("nat_gateway_routes", Kind::NatRoutes),
    ("customer_ports", Kind::Ports),
    ("customer_cidr", Kind::Cidrs),
];

const NETWORK_SUFFIXES: &[(&str, Kind)] = &[
    ("_cidr", Kind::CidrOrAuto),
    ("_sg_rules", Kind::Rules),
    ("_igw_routes", Kind::Cidrs),
    ("_vgw_routes", Kind::Cidrs),
];

fn hostclass_default_kind(key: &str) -> Option<Kind> {
    let base = key.strip_prefix("default_")?;
    HOSTCLASS_KEYS.iter().find(|(k, _)| *k == base).map(|(_, kind)| *kind)
}

fn network_kind(key: &str) -> Option<Kind> {
    if let Some((_, kind)) = NETWORK_KEYS.iter().find(|(k, _)| *k == key) {
        return Some(*kind);
    }
    NETWORK_SUFFIXES.iter().find_map(|(suffix, kind)| {
        let net = key.strip_suffix(suffix)?;
        net.parse::<MetanetworkName>().ok().map(|_| *kind)
    })
}

fn find_kind(table: &[(&str, Kind)], key: &str) -> Option<Kind> {
    table.iter().find(|(k, _)| *k == key).map(|(_, kind)| *kind)
}

// ── Value access ───────────────────────────────────────────────────

fn value_text(section: &str, key: &str, value: &toml::Value) -> ConfigResult<String> {
    match value {
        toml::Value::String(s) => Ok(s.trim().to_string()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Array(items) => items
            .iter()
            .map(|item| value_text(section, key, item))
            .collect::<ConfigResult<Vec<_>>>()
            .map(|parts| parts.join(",")),
        other => Err(ConfigError::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            reason: format!("unsupported value {other}"),
        }),
    }
}

/// Comma and whitespace separated list items.
pub(crate) fn split_list(text: &str) -> Vec<String> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_as<T>(section: &str, key: &str, text: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    text.parse::<T>().map_err(|e| ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn check_kind(section: &str, key: &str, kind: Kind, value: &toml::Value) -> ConfigResult<()> {
    let text = value_text(section, key, value)?;
    let invalid = |reason: String| ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        reason,
    };
    match kind {
        Kind::Text | Kind::List => Ok(()),
        Kind::Flag => Ok(()),
        Kind::Count => parse_as::<u64>(section, key, &text).map(|_| ()),
        Kind::Cidr => parse_as::<Cidr>(section, key, &text).map(|_| ()),
        Kind::CidrOrAuto if text == "auto" => Ok(()),
        Kind::CidrOrAuto => parse_as::<Cidr>(section, key, &text).map(|_| ()),
        Kind::Cidrs => split_list(&text)
            .iter()
            .try_for_each(|c| parse_as::<Cidr>(section, key, c).map(|_| ())),
        Kind::Rules => InboundRule::parse_list(&text)
            .map(|_| ())
            .map_err(|e| invalid(e.to_string())),
        Kind::Ports => split_list(&text)
            .iter()
            .try_for_each(|p| parse_as::<PortRange>(section, key, p).map(|_| ())),
        Kind::NatRoutes => NatRoute::parse_list(&text)
            .map(|_| ())
            .map_err(|e| invalid(e.to_string())),
        Kind::Metanetwork => parse_as::<MetanetworkName>(section, key, &text).map(|_| ()),
        Kind::Metanetworks => split_list(&text)
            .iter()
            .try_for_each(|n| parse_as::<MetanetworkName>(section, key, n).map(|_| ())),
        Kind::Strategy => parse_as::<DeploymentStrategy>(section, key, &text).map(|_| ()),
        Kind::Stage => parse_as::<ImageStage>(section, key, &text).map(|_| ()),
    }
}

/// Layered lookup: the first layer holding the key wins, and within a layer
/// `key@env` beats `key`.
pub(crate) struct Lookup<'a> {
    layers: Vec<(String, &'a Section, &'static str)>,
    env: Option<&'a str>,
}

impl<'a> Lookup<'a> {
    pub(crate) fn new(env: Option<&'a str>) -> Self {
        Self {
            layers: Vec::new(),
            env,
        }
    }

    /// Add a lower-priority layer; `prefix` is prepended to every key.
    pub(crate) fn layer(mut self, name: impl Into<String>, section: Option<&'a Section>, prefix: &'static str) -> Self {
        if let Some(section) = section {
            self.layers.push((name.into(), section, prefix));
        }
        self
    }

    pub(crate) fn text(&self, key: &str) -> ConfigResult<Option<String>> {
        for (name, section, prefix) in &self.layers {
            let full = format!("{prefix}{key}");
            if let Some(value) = section.get(&full, self.env) {
                let text = value_text(name, &full, value)?;
                return Ok(Some(text));
            }
        }
        Ok(None)
    }

    /// Like [`Lookup::text`] but treats an empty value as unset.
    pub(crate) fn non_empty(&self, key: &str) -> ConfigResult<Option<String>> {
        Ok(self.text(key)?.filter(|t| !t.is_empty()))
    }

    pub(crate) fn parse<T>(&self, key: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.non_empty(key)? {
            Some(text) => parse_as(&self.describe(), key, &text).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn flag(&self, key: &str) -> ConfigResult<Option<bool>> {
        Ok(self.text(key)?.map(|t| is_truthy(&t)))
    }

    pub(crate) fn list(&self, key: &str) -> ConfigResult<Option<Vec<String>>> {
        Ok(self.text(key)?.map(|t| split_list(&t)))
    }

    pub(crate) fn describe(&self) -> String {
        self.layers
            .first()
            .map(|(name, _, _)| name.clone())
            .unwrap_or_else(|| "asiaq".to_string())
    }
}

// ── Settings ───────────────────────────────────────────────────────

/// Run-wide defaults from `[asiaq]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub default_environment: Option<String>,
    pub default_env_type: Option<String>,
    pub zones: Vec<String>,
    pub smoke_timeout: Duration,
    pub smoke_poll: Duration,
    pub autoscale_timeout: Duration,
    pub health_timeout: Duration,
    pub max_parallel: usize,
    pub launch_retries: u32,
    pub retry_backoff: Duration,
    /// Stage of images picked when a pipeline entry pins none.
    pub ami_stage: ImageStage,
    pub ssh_user: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_environment: None,
            default_env_type: None,
            zones: Vec::new(),
            smoke_timeout: Duration::from_secs(600),
            smoke_poll: Duration::from_secs(15),
            autoscale_timeout: Duration::from_secs(300),
            health_timeout: Duration::from_secs(300),
            max_parallel: 8,
            launch_retries: 3,
            retry_backoff: Duration::from_secs(5),
            ami_stage: ImageStage::Tested,
            ssh_user: "asiaq".to_string(),
        }
    }
}

// ── AsiaqConfig ────────────────────────────────────────────────────

/// Parsed and validated `asiaq.toml`.
#[derive(Debug, Clone, Default)]
pub struct AsiaqConfig {
    raw: RawConfig,
}

impl AsiaqConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::parse(&content)?;
        debug!(?path, "configuration loaded");
        Ok(config)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        let config = Self { raw };
        config.validate()?;
        Ok(config)
    }

    /// Reject unknown keys and malformed values anywhere in the file.
    fn validate(&self) -> ConfigResult<()> {
        let check = |section: String, table: &Section, kind_of: &dyn Fn(&str) -> Option<Kind>| {
            for (key, value) in &table.0 {
                let (base, env) = match key.split_once('@') {
                    Some((base, env)) => (base, Some(env)),
                    None => (key.as_str(), None),
                };
                if env.is_some_and(str::is_empty) {
                    return Err(ConfigError::UnknownKey {
                        section: section.clone(),
                        key: key.clone(),
                    });
                }
                let kind = kind_of(base).ok_or_else(|| ConfigError::UnknownKey {
                    section: section.clone(),
                    key: key.clone(),
                })?;
                check_kind(&section, key, kind, value)?;
            }
            Ok(())
        };

        check("asiaq".to_string(), &self.raw.asiaq, &|k: &str| {
            find_kind(SETTINGS_KEYS, k).or_else(|| hostclass_default_kind(k))
        })?;
        check("test".to_string(), &self.raw.test, &|k: &str| find_kind(TEST_KEYS, k))?;
        for (name, table) in &self.raw.envtype {
            check(format!("envtype.{name}"), table, &|k: &str| {
                network_kind(k).filter(|_| k != "env_type")
            })?;
        }
        for (name, table) in &self.raw.env {
            check(format!("env.{name}"), table, &network_kind)?;
        }
        for (name, table) in &self.raw.hostclass {
            check(format!("hostclass.{name}"), table, &|k: &str| find_kind(HOSTCLASS_KEYS, k))?;
        }

        // Typed views must build for every environment the file mentions.
        for env in self.mentioned_environments() {
            self.settings(Some(&env))?;
        }
        self.settings(None)?;
        Ok(())
    }

    /// Environment names appearing as `[env.<name>]` or `@<name>` suffixes.
    pub fn mentioned_environments(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.raw.env.keys().cloned().collect();
        let sections = std::iter::once(&self.raw.asiaq)
            .chain(std::iter::once(&self.raw.test))
            .chain(self.raw.envtype.values())
            .chain(self.raw.env.values())
            .chain(self.raw.hostclass.values());
        for section in sections {
            for key in section.0.keys() {
                if let Some((_, env)) = key.split_once('@') {
                    names.insert(env.to_string());
                }
            }
        }
        names
    }

    /// Run-wide settings as seen from `env`.
    pub fn settings(&self, env: Option<&str>) -> ConfigResult<Settings> {
        let lookup = Lookup::new(env).layer("asiaq", Some(&self.raw.asiaq), "");
        let defaults = Settings::default();
        let secs = |key: &str, fallback: Duration| -> ConfigResult<Duration> {
            Ok(lookup.parse::<u64>(key)?.map(Duration::from_secs).unwrap_or(fallback))
        };

        let max_parallel = lookup.parse::<usize>("max_parallel")?.unwrap_or(defaults.max_parallel);
        if max_parallel == 0 {
            return Err(ConfigError::InvalidValue {
                section: "asiaq".to_string(),
                key: "max_parallel".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Settings {
            default_environment: lookup.non_empty("default_environment")?,
            default_env_type: lookup.non_empty("default_env_type")?,
            zones: lookup.list("zones")?.unwrap_or_default(),
            smoke_timeout: secs("smoke_timeout_secs", defaults.smoke_timeout)?,
            smoke_poll: secs("smoke_poll_secs", defaults.smoke_poll)?,
            autoscale_timeout: secs("autoscale_timeout_secs", defaults.autoscale_timeout)?,
            health_timeout: secs("health_timeout_secs", defaults.health_timeout)?,
            max_parallel,
            launch_retries: lookup.parse::<u32>("launch_retries")?.unwrap_or(defaults.launch_retries).max(1),
            retry_backoff: secs("retry_backoff_secs", defaults.retry_backoff)?,
            ami_stage: lookup.parse("ami_stage")?.unwrap_or(defaults.ami_stage),
            ssh_user: lookup.non_empty("ssh_user")?.unwrap_or(defaults.ssh_user),
        })
    }

    pub(crate) fn asiaq_section(&self) -> &Section {
        &self.raw.asiaq
    }

    pub(crate) fn test_section(&self) -> &Section {
        &self.raw.test
    }

    pub(crate) fn envtype_section(&self, env_type: &str) -> Option<&Section> {
        self.raw.envtype.get(env_type)
    }

    pub(crate) fn env_section(&self, env: &str) -> Option<&Section> {
        self.raw.env.get(env)
    }

    pub(crate) fn hostclass_section(&self, hostclass: &str) -> Option<&Section> {
        self.raw.hostclass.get(hostclass)
    }

    /// Hostclasses with their own `[hostclass.<name>]` section.
    pub fn configured_hostclasses(&self) -> Vec<String> {
        self.raw.hostclass.keys().cloned().collect()
    }
}
