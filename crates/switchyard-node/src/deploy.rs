//! Deployment descriptor generation.
//!
//! Turns node settings into docker-compose service metadata (port mapping,
//! hub dependency, environment) and Dockerfile `EXPOSE` lines. Nothing here
//! touches the runtime protocol.

use std::collections::BTreeMap;
use std::str::FromStr;
use switchyard_types::config::{ENV_PORT, ENV_REMOTE_HUB};
use switchyard_types::{Settings, SwitchyardError, SwitchyardResult, TransportKind};

/// Double-quoted YAML scalar. JSON string escapes are valid YAML escapes, so
/// values such as `yes`, `*x` or `a: b` stay plain strings.
fn quoted(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Indented line sink for YAML-ish descriptors.
#[derive(Debug, Clone, Default)]
pub struct DescriptorWriter {
    lines: Vec<String>,
    depth: usize,
}

impl DescriptorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line at the current indentation.
    pub fn line(&mut self, text: impl AsRef<str>) {
        self.lines
            .push(format!("{}{}", "  ".repeat(self.depth), text.as_ref()));
    }

    /// Run `f` one indentation level deeper.
    pub fn block<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn finish(self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }
}

/// State carried across the services of one compose run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeStore {
    /// Compose service name of the hub, once seen.
    pub hub_service: Option<String>,
    /// Port the hub listens on, once seen.
    pub hub_port: Option<u16>,
}

/// Address a worker container uses to reach the hub service.
fn default_remote_hub(kind: TransportKind, service: &str, port: u16) -> Option<String> {
    match kind {
        TransportKind::Channel => Some(format!("http://{service}:{port}")),
        TransportKind::WebSocket => Some(format!("ws://{service}:{port}")),
        TransportKind::Tcp => Some(format!("tcp://{service}:{port}")),
        TransportKind::Unix => None,
    }
}

/// Append compose metadata for one service.
///
/// A hub records itself in `store`; workers processed after it get a
/// `depends_on` entry and, unless they set `remoteHub` themselves, a
/// `REMOTE_HUB` pointing at the hub service.
pub fn compose_service(
    service: &str,
    settings: &Settings,
    store: &mut ComposeStore,
    out: &mut DescriptorWriter,
) -> SwitchyardResult<()> {
    if let Some(port) = settings.port {
        out.line("ports:");
        out.block(|out| out.line(format!("- \"{port}:{port}\"")));
    }

    let mut remote_hub = settings.remote_hub.clone();
    if settings.hub {
        if store.hub_service.is_some() {
            return Err(SwitchyardError::MultipleHubs);
        }
        store.hub_service = Some(service.to_string());
        store.hub_port = settings.port;
    } else if let Some(hub) = store.hub_service.clone() {
        if remote_hub.is_none() {
            remote_hub = store
                .hub_port
                .and_then(|port| default_remote_hub(settings.transport(), &hub, port));
        }
        out.line("depends_on:");
        out.block(|out| out.line(format!("- {hub}")));
    }

    let mut environment: Vec<(String, String)> = Vec::new();
    if let Some(port) = settings.port {
        environment.push((ENV_PORT.to_string(), port.to_string()));
    }
    if let Some(hub) = remote_hub {
        environment.push((ENV_REMOTE_HUB.to_string(), hub));
    }
    environment.extend(
        settings
            .environment
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );

    if !environment.is_empty() {
        out.line("environment:");
        out.block(|out| {
            for (key, value) in &environment {
                out.line(format!("{key}: {}", quoted(value)));
            }
        });
    }
    Ok(())
}

/// Render a `services:` document for a whole mesh. The hub is emitted first
/// so every worker can depend on it.
pub fn compose_mesh(
    services: &BTreeMap<String, Settings>,
    image: Option<&str>,
) -> SwitchyardResult<String> {
    let (hubs, workers): (Vec<_>, Vec<_>) = services.iter().partition(|(_, s)| s.hub);
    let mut store = ComposeStore::default();
    let mut out = DescriptorWriter::new();

    out.line("services:");
    out.block(|out| -> SwitchyardResult<()> {
        for (name, settings) in hubs.into_iter().chain(workers) {
            out.line(format!("{name}:"));
            out.block(|out| -> SwitchyardResult<()> {
                if let Some(image) = image {
                    out.line(format!("image: {image}"));
                }
                compose_service(name, settings, &mut store, out)
            })?;
        }
        Ok(())
    })?;
    Ok(out.finish())
}

/// Dockerfile insertion points offered to descriptor generators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerfilePlace {
    BeforeBuilder,
    AfterBuilder,
    BeforeRunner,
    AfterRunner,
}

impl FromStr for DockerfilePlace {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "beforebuilder" => Ok(Self::BeforeBuilder),
            "afterbuilder" => Ok(Self::AfterBuilder),
            "beforerunner" => Ok(Self::BeforeRunner),
            "afterrunner" => Ok(Self::AfterRunner),
            _ => Err(SwitchyardError::Config(format!(
                "unknown Dockerfile place '{s}'"
            ))),
        }
    }
}

/// Extra Dockerfile lines for `place`: one `EXPOSE` per service port after
/// the runner stage, nothing elsewhere.
pub fn dockerfile_extensions<'a>(
    place: DockerfilePlace,
    services: impl IntoIterator<Item = &'a Settings>,
) -> String {
    if place != DockerfilePlace::AfterRunner {
        return String::new();
    }
    services
        .into_iter()
        .filter_map(|s| s.port)
        .map(|port| format!("EXPOSE {port}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(port: u16) -> Settings {
        Settings {
            hub: true,
            port: Some(port),
            ..Settings::default()
        }
    }

    #[test]
    fn test_hub_then_worker() {
        let mut store = ComposeStore::default();
        let mut out = DescriptorWriter::new();
        compose_service("hub", &hub(7000), &mut store, &mut out).unwrap();
        assert_eq!(
            out.lines(),
            ["ports:", "  - \"7000:7000\"", "environment:", "  PORT: \"7000\""]
        );
        assert_eq!(store.hub_service.as_deref(), Some("hub"));
        assert_eq!(store.hub_port, Some(7000));

        let mut worker = Settings::default();
        worker.environment.insert("RUST_LOG".into(), "debug".into());
        let mut out = DescriptorWriter::new();
        compose_service("adder", &worker, &mut store, &mut out).unwrap();
        assert_eq!(
            out.lines(),
            [
                "depends_on:",
                "  - hub",
                "environment:",
                "  REMOTE_HUB: \"http://hub:7000\"",
                "  RUST_LOG: \"debug\"",
            ]
        );
    }

    #[test]
    fn test_explicit_remote_hub_kept() {
        let mut store = ComposeStore {
            hub_service: Some("hub".into()),
            hub_port: Some(7000),
        };
        let worker = Settings {
            transport: Some(TransportKind::Tcp),
            remote_hub: Some("tcp://elsewhere:1".into()),
            ..Settings::default()
        };
        let mut out = DescriptorWriter::new();
        compose_service("w", &worker, &mut store, &mut out).unwrap();
        assert!(out
            .lines()
            .contains(&"  REMOTE_HUB: \"tcp://elsewhere:1\"".to_string()));
    }

    #[test]
    fn test_environment_values_quoted() {
        let mut worker = Settings::default();
        worker.environment.insert("A_FLAG".into(), "yes".into());
        worker.environment.insert("B_GLOB".into(), "*.log".into());
        worker.environment.insert("C_PAIR".into(), "key: value".into());
        worker.environment.insert("D_QUOTE".into(), "say \"hi\"\\".into());
        let mut out = DescriptorWriter::new();
        compose_service("w", &worker, &mut ComposeStore::default(), &mut out).unwrap();
        assert_eq!(
            out.lines(),
            [
                "environment:",
                "  A_FLAG: \"yes\"",
                "  B_GLOB: \"*.log\"",
                "  C_PAIR: \"key: value\"",
                "  D_QUOTE: \"say \\\"hi\\\"\\\\\"",
            ]
        );
    }

    #[test]
    fn test_worker_before_hub_has_no_dependency() {
        let mut store = ComposeStore::default();
        let mut out = DescriptorWriter::new();
        compose_service("w", &Settings::default(), &mut store, &mut out).unwrap();
        assert!(out.lines().is_empty());
    }

    #[test]
    fn test_second_hub_rejected() {
        let mut store = ComposeStore::default();
        let mut out = DescriptorWriter::new();
        compose_service("a", &hub(1), &mut store, &mut out).unwrap();
        let err = compose_service("b", &hub(2), &mut store, &mut out).unwrap_err();
        assert!(matches!(err, SwitchyardError::MultipleHubs));
    }

    #[test]
    fn test_mesh_orders_hub_first() {
        let mut services = BTreeMap::new();
        services.insert("adder".to_string(), Settings::default());
        services.insert("zhub".to_string(), hub(9000));
        let yaml = compose_mesh(&services, Some("switchyard:latest")).unwrap();
        let expected = "\
services:
  zhub:
    image: switchyard:latest
    ports:
      - \"9000:9000\"
    environment:
      PORT: \"9000\"
  adder:
    image: switchyard:latest
    depends_on:
      - zhub
    environment:
      REMOTE_HUB: \"http://zhub:9000\"
";
        assert_eq!(yaml, expected);
    }

    #[test]
    fn test_dockerfile_expose() {
        let services = [hub(7000), Settings::default(), hub(7001)];
        assert_eq!(
            dockerfile_extensions(DockerfilePlace::AfterRunner, &services),
            "EXPOSE 7000\nEXPOSE 7001"
        );
        assert_eq!(
            dockerfile_extensions(DockerfilePlace::BeforeRunner, &services),
            ""
        );
        assert_eq!(
            "after-runner".parse::<DockerfilePlace>().unwrap(),
            DockerfilePlace::AfterRunner
        );
        assert!("middle".parse::<DockerfilePlace>().is_err());
    }
}
