//! Scenario catalog.
//!
//! A scenario names the workloads each side acts on, the target, the phase table, the
//! tools advertised to each side, the read-only telemetry probes run for the defense, and
//! extra denylist patterns. Catalogs are JSON documents of the form
//! `{"scenarios": [...]}`; missing fields take the values of the built-in
//! `dvwa_basic_pentest` scenario.

use std::{collections::HashSet, fs, path::Path};

use anyhow::{bail, ensure, Context};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    phase::{Phase, PhaseTable},
    sandbox::Denylist,
    side::Side,
};

/// Id of the built-in scenario.
pub const DEFAULT_SCENARIO: &str = "dvwa_basic_pentest";

/// A read-only command whose output is shown to the defense every round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryProbe {
    pub name: String,
    pub command: String,
}

impl TelemetryProbe {
    pub fn new(name: &str, command: &str) -> Self {
        TelemetryProbe {
            name: name.to_string(),
            command: command.to_string(),
        }
    }
}

/// An extra denylist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRule {
    pub pattern: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "defaults::difficulty")]
    pub difficulty: String,
    /// Workload the offensive side runs its commands in.
    #[serde(default = "defaults::attacker_workload")]
    pub attacker_workload: String,
    /// Workload under attack; the defensive side runs its commands there.
    #[serde(default = "defaults::target_workload", alias = "target_container")]
    pub target_workload: String,
    /// Network address of the target, as seen from the attacker.
    #[serde(default = "defaults::target_address")]
    pub target_address: String,
    #[serde(default = "defaults::flag_location")]
    pub flag_location: String,
    /// Default round limit.
    #[serde(default = "defaults::estimated_rounds")]
    pub estimated_rounds: u32,
    #[serde(default)]
    pub vulnerabilities: Vec<String>,
    /// Custom phase table; the standard one when absent.
    #[serde(default)]
    pub phases: Option<Vec<Phase>>,
    #[serde(default = "defaults::red_tools")]
    pub red_tools: Vec<String>,
    #[serde(default = "defaults::blue_tools")]
    pub blue_tools: Vec<String>,
    #[serde(default = "defaults::telemetry")]
    pub telemetry: Vec<TelemetryProbe>,
    /// Appended to the standard denylist.
    #[serde(default)]
    pub denylist: Vec<DenyRule>,
}

mod defaults {
    use super::TelemetryProbe;

    pub fn difficulty() -> String {
        "beginner".into()
    }

    pub fn attacker_workload() -> String {
        "red-kali".into()
    }

    pub fn target_workload() -> String {
        "blue-target".into()
    }

    pub fn target_address() -> String {
        "172.20.0.10".into()
    }

    pub fn flag_location() -> String {
        "/root/flag.txt".into()
    }

    pub fn estimated_rounds() -> u32 {
        30
    }

    pub fn red_tools() -> Vec<String> {
        [
            "nmap - network scanning",
            "curl - web requests",
            "wget - download files",
            "nc - netcat for connections",
            "nikto - web vulnerability scanner",
            "sqlmap - SQL injection tool",
            "hydra - password cracker",
            "ssh - secure shell client",
        ]
        .map(String::from)
        .to_vec()
    }

    pub fn blue_tools() -> Vec<String> {
        [
            "iptables -A INPUT -s <IP> -j DROP - block an address",
            "iptables -L INPUT -n - list firewall rules",
            "grep <pattern> /var/log/auth.log - search authentication logs",
            "grep <pattern> /var/log/apache2/access.log - search web logs",
            "ps aux - list processes",
            "netstat -tnp - list active connections",
            "service apache2 status - check the web server",
        ]
        .map(String::from)
        .to_vec()
    }

    pub fn telemetry() -> Vec<TelemetryProbe> {
        vec![
            TelemetryProbe::new(
                "active_connections",
                "netstat -tn 2>/dev/null | grep ESTABLISHED | wc -l",
            ),
            TelemetryProbe::new(
                "failed_auth_attempts",
                "grep 'Failed password' /var/log/auth.log 2>/dev/null | tail -5",
            ),
            TelemetryProbe::new("process_count", "ps aux | wc -l"),
            TelemetryProbe::new(
                "recent_web_requests",
                "tail -10 /var/log/apache2/access.log 2>/dev/null",
            ),
            TelemetryProbe::new(
                "recent_tmp_files",
                "find /tmp -type f -mmin -10 2>/dev/null | wc -l",
            ),
            TelemetryProbe::new(
                "blocked_ips_count",
                "iptables -L INPUT -n 2>/dev/null | grep DROP | wc -l",
            ),
        ]
    }
}

impl Scenario {
    /// The built-in DVWA web application pentest.
    pub fn dvwa_basic_pentest() -> Self {
        Scenario {
            id: DEFAULT_SCENARIO.into(),
            name: "DVWA Basic Web Application Pentest".into(),
            description: "Target a vulnerable web application".into(),
            difficulty: defaults::difficulty(),
            attacker_workload: defaults::attacker_workload(),
            target_workload: defaults::target_workload(),
            target_address: defaults::target_address(),
            flag_location: defaults::flag_location(),
            estimated_rounds: defaults::estimated_rounds(),
            vulnerabilities: vec![
                "SQL injection".into(),
                "Weak SSH credentials".into(),
                "Directory traversal".into(),
            ],
            phases: None,
            red_tools: defaults::red_tools(),
            blue_tools: defaults::blue_tools(),
            telemetry: defaults::telemetry(),
            denylist: vec![],
        }
    }

    /// Workload `side` runs its commands in.
    pub fn workload(&self, side: Side) -> &str {
        match side {
            Side::Red => &self.attacker_workload,
            Side::Blue => &self.target_workload,
        }
    }

    pub fn tools(&self, side: Side) -> &[String] {
        match side {
            Side::Red => &self.red_tools,
            Side::Blue => &self.blue_tools,
        }
    }

    /// # Errors
    /// When the custom phase table is malformed.
    pub fn phase_table(&self) -> anyhow::Result<PhaseTable> {
        match &self.phases {
            Some(phases) => PhaseTable::new(phases.clone())
                .with_context(|| format!("invalid phase table in scenario '{}'", self.id)),
            None => Ok(PhaseTable::standard()),
        }
    }

    /// The standard denylist extended with this scenario's rules.
    ///
    /// # Errors
    /// When a pattern is not a valid regular expression.
    pub fn denylist(&self) -> anyhow::Result<Denylist> {
        self.denylist
            .iter()
            .try_fold(Denylist::standard(), |list, rule| {
                list.with_pattern(&rule.pattern, rule.reason.clone())
            })
            .with_context(|| format!("invalid denylist in scenario '{}'", self.id))
    }

    /// # Errors
    /// Any field that would make a game impossible to start.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.id.trim().is_empty(), "scenario id is empty");
        ensure!(
            !self.attacker_workload.trim().is_empty() && !self.target_workload.trim().is_empty(),
            "scenario '{}' has an empty workload name",
            self.id
        );
        ensure!(
            self.estimated_rounds > 0,
            "scenario '{}' estimates zero rounds",
            self.id
        );
        for probe in &self.telemetry {
            ensure!(
                !probe.command.trim().is_empty(),
                "telemetry probe '{}' of scenario '{}' has no command",
                probe.name,
                self.id
            );
        }
        self.phase_table()?;
        self.denylist()?;
        Ok(())
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::dvwa_basic_pentest()
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    scenarios: Vec<Scenario>,
}

/// Validated set of scenarios with unique ids.
#[derive(Debug, Clone)]
pub struct ScenarioCatalog {
    scenarios: Vec<Scenario>,
}

impl ScenarioCatalog {
    /// # Errors
    /// Duplicate ids and invalid scenarios.
    pub fn new(scenarios: Vec<Scenario>) -> anyhow::Result<Self> {
        let mut ids = HashSet::new();
        for scenario in &scenarios {
            scenario.validate()?;
            ensure!(
                ids.insert(scenario.id.as_str()),
                "duplicate scenario id '{}'",
                scenario.id
            );
        }
        Ok(ScenarioCatalog { scenarios })
    }

    /// Catalog holding only the built-in scenario.
    pub fn builtin() -> Self {
        ScenarioCatalog {
            scenarios: vec![Scenario::dvwa_basic_pentest()],
        }
    }

    /// # Errors
    /// Malformed JSON, duplicate ids and invalid scenarios.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = serde_json::from_str(json).context("malformed scenario catalog")?;
        Self::new(file.scenarios)
    }

    /// # Errors
    /// Unreadable file, plus everything [`ScenarioCatalog::from_json`] rejects.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("could not read scenario catalog {}", path.display()))?;
        let catalog = Self::from_json(&json)
            .with_context(|| format!("in scenario catalog {}", path.display()))?;
        info!(path = %path.display(), count = catalog.scenarios.len(), "scenarios loaded");
        Ok(catalog)
    }

    /// # Errors
    /// Unknown id.
    pub fn get(&self, id: &str) -> anyhow::Result<&Scenario> {
        match self.scenarios.iter().find(|s| s.id == id) {
            Some(scenario) => Ok(scenario),
            None => bail!(
                "unknown scenario '{id}', available: {}",
                self.ids().collect::<Vec<_>>().join(", ")
            ),
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.scenarios.iter().map(|s| s.id.as_str())
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }
}

impl Default for ScenarioCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
