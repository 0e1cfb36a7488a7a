//! Live state gathered from the local system.
//!
//! Node processes come from the process table (`ps`), containers from
//! `docker network inspect`, and the host address from `ip` (falling back to
//! `ifconfig`). A missing `docker` binary means nothing is containerized; any
//! other tool failure is reported as `AllocError::ExternalToolFailure`.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::LazyLock;

use super::{HostAddressSource, LiveContainer, LiveProcess, LiveSnapshot, LiveStateSource};
use crate::error::{AllocError, Result};
use crate::types::{ChainId, Subnet};

static NETWORK_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)--networkid[ =](\d+)").unwrap());
static PORT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)--port[ =](\d+)").unwrap());
static DATADIR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)--datadir[ =](\S+)").unwrap());
static INET_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"inet (?:addr:)?(\d+\.\d+\.\d+\.\d+)").unwrap());
static CHAIN_NETWORK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^eth(\d+)$").unwrap());

/// Inspects the host with standard command-line tools
#[derive(Debug, Clone)]
pub struct SystemInspector {
    ps_program: String,
    docker_program: String,
}

impl Default for SystemInspector {
    fn default() -> Self {
        SystemInspector {
            ps_program: "ps".to_string(),
            docker_program: "docker".to_string(),
        }
    }
}

impl SystemInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different container CLI (e.g. `podman`)
    pub fn with_docker_program(mut self, program: impl Into<String>) -> Self {
        self.docker_program = program.into();
        self
    }

    fn node_processes(&self) -> Result<Vec<LiveProcess>> {
        let output = run(&self.ps_program, &["-eo", "args"])?.ok_or_else(|| {
            AllocError::tool(self.ps_program.clone(), "program not found")
        })?;
        Ok(parse_node_processes(&output))
    }

    fn containers(&self) -> Result<Vec<LiveContainer>> {
        let Some(listing) = run(&self.docker_program, &["network", "ls", "--quiet"])? else {
            log::debug!("{} not installed; assuming no live containers", self.docker_program);
            return Ok(Vec::new());
        };

        let ids: Vec<&str> = listing.split_whitespace().collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["network", "inspect"];
        args.extend(ids);
        let inspected = run(&self.docker_program, &args)?.ok_or_else(|| {
            AllocError::tool(self.docker_program.clone(), "program disappeared during inspection")
        })?;
        parse_docker_networks(&inspected)
            .map_err(|e| AllocError::tool(self.docker_program.clone(), e))
    }
}

impl LiveStateSource for SystemInspector {
    fn snapshot(&self) -> Result<LiveSnapshot> {
        let processes = self.node_processes()?;
        let containers = self.containers()?;
        log::debug!(
            "Live state: {} node processes, {} containers",
            processes.len(),
            containers.len()
        );
        Ok(LiveSnapshot { processes, containers })
    }
}

impl HostAddressSource for SystemInspector {
    fn primary_ipv4(&self) -> Result<Ipv4Addr> {
        let output = match run("ip", &["-4", "-o", "addr", "show"])? {
            Some(output) => output,
            None => run("ifconfig", &[])?.ok_or_else(|| {
                AllocError::HostAddressUnavailable("neither `ip` nor `ifconfig` is installed".to_string())
            })?,
        };
        parse_primary_ipv4(&output).ok_or_else(|| {
            AllocError::HostAddressUnavailable("no non-loopback IPv4 address found".to_string())
        })
    }
}

/// Run a program and capture stdout. `Ok(None)` if the program is not installed.
fn run(program: &str, args: &[&str]) -> Result<Option<String>> {
    let output = match Command::new(program).args(args).output() {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AllocError::tool(program, e.to_string())),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AllocError::tool(
            format!("{} {}", program, args.join(" ")),
            format!("exited with {}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
}

/// Extract node processes from `ps -eo args` output.
///
/// A line counts when it carries both `--networkid <n>` and `--port <p>`.
pub fn parse_node_processes(output: &str) -> Vec<LiveProcess> {
    output
        .lines()
        .filter_map(|line| {
            let chain_id = NETWORK_ID_PATTERN
                .captures(line)
                .and_then(|c| c[1].parse::<u64>().ok())
                .map(ChainId)?;
            let port = PORT_PATTERN.captures(line).and_then(|c| c[1].parse::<u16>().ok())?;
            let data_dir = DATADIR_PATTERN.captures(line).map(|c| c[1].to_string());
            Some(LiveProcess {
                chain_id: Some(chain_id),
                port,
                data_dir,
            })
        })
        .collect()
}

/// First non-loopback IPv4 address in `ip -o addr` or `ifconfig` output
pub fn parse_primary_ipv4(output: &str) -> Option<Ipv4Addr> {
    INET_PATTERN
        .captures_iter(output)
        .filter_map(|c| c[1].parse::<Ipv4Addr>().ok())
        .find(|ip| !ip.is_loopback() && !ip.is_unspecified())
}

#[derive(Debug, Deserialize)]
struct DockerNetwork {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "IPAM", default)]
    ipam: Option<DockerIpam>,
    #[serde(rename = "Containers", default)]
    containers: Option<HashMap<String, DockerContainer>>,
}

#[derive(Debug, Deserialize)]
struct DockerIpam {
    #[serde(rename = "Config", default)]
    config: Option<Vec<DockerIpamConfig>>,
}

#[derive(Debug, Deserialize)]
struct DockerIpamConfig {
    #[serde(rename = "Subnet", default)]
    subnet: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DockerContainer {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "IPv4Address", default)]
    ipv4_address: String,
}

/// Extract attached containers from `docker network inspect` JSON.
///
/// Every network is considered; the chain id is filled in for networks named
/// `eth<chainId>`.
pub fn parse_docker_networks(json: &str) -> std::result::Result<Vec<LiveContainer>, String> {
    let networks: Vec<DockerNetwork> =
        serde_json::from_str(json).map_err(|e| format!("unreadable network inspect output: {}", e))?;

    let mut containers = Vec::new();
    for network in networks {
        let chain_id = CHAIN_NETWORK_PATTERN
            .captures(&network.name)
            .and_then(|c| c[1].parse::<u64>().ok())
            .map(ChainId);
        let subnet = network
            .ipam
            .and_then(|ipam| ipam.config)
            .and_then(|configs| configs.into_iter().find_map(|c| c.subnet?.parse::<Subnet>().ok()));

        let mut attached: Vec<DockerContainer> =
            network.containers.unwrap_or_default().into_values().collect();
        attached.sort_by(|a, b| a.name.cmp(&b.name));

        for container in attached {
            let address = container.ipv4_address.split('/').next().unwrap_or_default();
            let Ok(ip) = address.parse::<Ipv4Addr>() else {
                continue;
            };
            containers.push(LiveContainer {
                ip,
                subnet,
                container_name: container.name,
                chain_id,
            });
        }
    }
    Ok(containers)
}
