//! Debugger wiring per runtime
//!
//! Node, Python and Java runtimes listen on the debug port inside the
//! container, so the port is published on the same host port. PHP and
//! PyCharm sessions dial out to the host instead and publish nothing.

use super::env::EnvVars;
use crate::{CoreError, Result};
use fclocal_provider::PortConfig;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DebugIde {
    #[default]
    VsCode,
    PyCharm,
}

impl FromStr for DebugIde {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vscode" => Ok(DebugIde::VsCode),
            "pycharm" => Ok(DebugIde::PyCharm),
            other => Err(CoreError::InvalidCommand(format!(
                "unsupported debug ide '{}', expected vscode or pycharm",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugConfig {
    pub port: u16,
    pub ide: DebugIde,
}

fn is_python(runtime: &str) -> bool {
    matches!(runtime, "python2.7" | "python3")
}

/// Debugger variables for a runtime
pub fn debug_env(runtime: &str, debug: &DebugConfig) -> Result<EnvVars> {
    let port = debug.port;
    let mut env = EnvVars::new();
    match runtime {
        "nodejs6" => env.set("DEBUG_OPTIONS", format!("--debug-brk={}", port)),
        "nodejs8" | "nodejs10" => {
            env.set("DEBUG_OPTIONS", format!("--inspect-brk=0.0.0.0:{}", port))
        }
        r if is_python(r) => {
            if debug.ide == DebugIde::VsCode {
                env.set(
                    "DEBUG_OPTIONS",
                    format!("-m ptvsd --host 0.0.0.0 --port {} --wait", port),
                );
            }
        }
        "java8" => env.set(
            "DEBUG_OPTIONS",
            format!(
                "-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,address={}",
                port
            ),
        ),
        "php7.2" => {
            let host = local_ip();
            tracing::info!("Using remote_host {} for xdebug", host);
            env.set(
                "XDEBUG_CONFIG",
                format!(
                    "remote_enable=1 remote_autostart=1 remote_port={} remote_host={}",
                    port, host
                ),
            );
        }
        other => {
            return Err(CoreError::InvalidCommand(format!(
                "debugging is not supported for runtime {}",
                other
            )))
        }
    }
    Ok(env)
}

/// Ports to publish for a debug session
pub fn debug_ports(runtime: &str, debug: &DebugConfig) -> Result<Vec<PortConfig>> {
    if debug.ide == DebugIde::PyCharm {
        if !is_python(runtime) {
            return Err(CoreError::InvalidCommand(
                "pycharm debug config only support for runtime python2.7 or python3".into(),
            ));
        }
        return Ok(Vec::new());
    }
    if runtime == "php7.2" {
        return Ok(Vec::new());
    }
    Ok(vec![PortConfig {
        container_port: debug.port,
        host_port: debug.port,
        protocol: "tcp".into(),
    }])
}

/// Outbound IPv4 address of this host, loopback when offline
pub fn local_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// `.vscode/launch.json` contents for attaching to a local debug session
pub fn vscode_launch_config(
    service: &str,
    function: &str,
    runtime: &str,
    code_source: &Path,
    port: u16,
) -> Result<serde_json::Value> {
    let code_dir = if code_source.is_dir() {
        code_source
    } else {
        code_source.parent().unwrap_or(code_source)
    };
    let local_root = code_dir.to_string_lossy();
    let name = format!("fc/{}/{}", service, function);

    let configuration = match runtime {
        "nodejs6" | "nodejs8" | "nodejs10" => {
            let protocol = if runtime == "nodejs6" { "legacy" } else { "inspector" };
            serde_json::json!({
                "name": name,
                "type": "node",
                "request": "attach",
                "address": "localhost",
                "port": port,
                "localRoot": local_root,
                "remoteRoot": "/code",
                "protocol": protocol,
                "stopOnEntry": false,
            })
        }
        r if is_python(r) => serde_json::json!({
            "name": name,
            "type": "python",
            "request": "attach",
            "host": "localhost",
            "port": port,
            "pathMappings": [{ "localRoot": local_root, "remoteRoot": "/code" }],
        }),
        "java8" => serde_json::json!({
            "name": name,
            "type": "java",
            "request": "attach",
            "hostName": "localhost",
            "port": port,
        }),
        "php7.2" => serde_json::json!({
            "name": name,
            "type": "php",
            "request": "launch",
            "port": port,
            "stopOnEntry": false,
            "pathMappings": { "/code": local_root },
            "ignore": ["/var/fc/runtime/**"],
        }),
        other => {
            return Err(CoreError::InvalidCommand(format!(
                "debugging is not supported for runtime {}",
                other
            )))
        }
    };

    Ok(serde_json::json!({
        "version": "0.2.0",
        "configurations": [configuration],
    }))
}
