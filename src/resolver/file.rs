//! Endpoint lists kept in a flat file.
//!
//! One endpoint per line:
//!
//! ```text
//! # comment
//! node-1.example
//! node-2.example;port=7101
//! node-3.example;port=7101&zone=us-east-1c
//! ```
//!
//! `port` sets the port for the resolver's role; a bare host gets the
//! resolver's default ports.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;

use super::{ClusterAddress, ClusterResolver, PortRole, ServicePorts};
use crate::error::ResolverError;

pub struct FileResolver {
    path: PathBuf,
    role: PortRole,
    defaults: ServicePorts,
    always_reload: bool,
    state: Mutex<FileState>,
}

#[derive(Default)]
struct FileState {
    modified: Option<SystemTime>,
    endpoints: Option<Vec<ClusterAddress>>,
}

impl FileResolver {
    pub fn new(path: impl Into<PathBuf>, role: PortRole, defaults: ServicePorts) -> Self {
        Self {
            path: path.into(),
            role,
            defaults,
            always_reload: false,
            state: Mutex::new(FileState::default()),
        }
    }

    /// Re-read the file on every resolution instead of only when its
    /// modification time changes.
    pub fn always_reload(mut self, always: bool) -> Self {
        self.always_reload = always;
        self
    }

    fn io_error(&self, cause: std::io::Error) -> ResolverError {
        ResolverError::Io {
            path: self.path.clone(),
            cause,
        }
    }
}

#[async_trait]
impl ClusterResolver for FileResolver {
    async fn resolve(&self) -> Result<Vec<ClusterAddress>, ResolverError> {
        let modified = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.modified().ok(),
            Err(e) => {
                let state = self.state.lock();
                return match &state.endpoints {
                    Some(endpoints) => {
                        warn!(
                            "{} is unreadable, keeping the last endpoint list: {}",
                            self.path.display(),
                            e
                        );
                        Ok(endpoints.clone())
                    }
                    None => Err(self.io_error(e)),
                };
            }
        };

        {
            let state = self.state.lock();
            if let Some(endpoints) = &state.endpoints {
                if !self.always_reload && modified.is_some() && state.modified == modified {
                    return Ok(endpoints.clone());
                }
            }
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        let endpoints = parse(&self.path, &content, self.role, self.defaults)?;

        let mut state = self.state.lock();
        if state.endpoints.as_ref() != Some(&endpoints) {
            info!("loaded {} endpoints from {}", endpoints.len(), self.path.display());
        }
        state.modified = modified;
        state.endpoints = Some(endpoints.clone());
        Ok(endpoints)
    }
}

/// Parses the endpoint file format. Errors name the 1-based line.
pub fn parse(
    path: &Path,
    content: &str,
    role: PortRole,
    defaults: ServicePorts,
) -> Result<Vec<ClusterAddress>, ResolverError> {
    let mut endpoints = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let syntax = |message: String| ResolverError::Syntax {
            path: path.to_owned(),
            line: index + 1,
            message,
        };

        let (host, params) = match line.split_once(';') {
            Some((host, params)) => (host.trim(), Some(params)),
            None => (line, None),
        };
        if host.is_empty() {
            return Err(syntax("missing host".into()));
        }

        let mut address = ClusterAddress::new(host, defaults);
        for param in params.into_iter().flat_map(|p| p.split('&')) {
            let Some((key, value)) = param.split_once('=') else {
                return Err(syntax(format!("expected key=value, found `{param}`")));
            };
            match key.trim() {
                "port" => {
                    let port = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|_| syntax(format!("invalid port `{}`", value.trim())))?;
                    address.ports = address.ports.with(role, port);
                }
                "zone" if !value.trim().is_empty() => address.zone = Some(value.trim().to_owned()),
                "zone" => return Err(syntax("empty zone".into())),
                other => return Err(syntax(format!("unknown parameter `{other}`"))),
            }
        }

        if address.port(role).is_none() {
            return Err(syntax(format!("missing port for {host}")));
        }
        endpoints.push(address);
    }
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn write(file: &mut tempfile::NamedTempFile, content: &str) {
        let handle = file.as_file_mut();
        handle.set_len(0).unwrap();
        std::io::Seek::rewind(handle).unwrap();
        handle.write_all(content.as_bytes()).unwrap();
        handle.sync_all().unwrap();
    }

    #[test]
    fn parses_hosts_with_and_without_parameters() {
        let content = "# peers\n\nnode-1\nnode-2;port=7101&zone=us-east-1c\n";
        let ports = ServicePorts::read(7001);
        let endpoints = parse(Path::new("peers"), content, PortRole::Interest, ports).unwrap();

        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].port(PortRole::Interest), Some(7001));
        assert_eq!(endpoints[1].port(PortRole::Interest), Some(7101));
        assert_eq!(endpoints[1].zone.as_deref(), Some("us-east-1c"));
    }

    #[test]
    fn syntax_errors_name_the_line() {
        let cases = [
            ("ok\nbad;port=x\n", 2, "invalid port"),
            ("bad;weight=3", 1, "unknown parameter"),
            ("a\nb\nbad;port", 3, "key=value"),
        ];
        for (content, line, text) in cases {
            let ports = ServicePorts::read(7001);
            let err = parse(Path::new("peers"), content, PortRole::Interest, ports).unwrap_err();
            match err {
                ResolverError::Syntax { line: at, message, .. } => {
                    assert_eq!(at, line);
                    assert!(message.contains(text), "{message}");
                }
                other => panic!("unexpected error {other}"),
            }
        }
    }

    #[test]
    fn bare_host_without_default_port_is_rejected() {
        let ports = ServicePorts::read(7001);
        let err = parse(Path::new("peers"), "node-1", PortRole::Replication, ports).unwrap_err();
        assert!(err.to_string().starts_with("peers:1: missing port"));
    }

    #[tokio::test]
    async fn missing_file_on_first_load_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let resolver = FileResolver::new(path, PortRole::Interest, ServicePorts::read(7001));
        assert!(matches!(resolver.resolve().await, Err(ResolverError::Io { .. })));
    }

    #[tokio::test]
    async fn rereads_only_when_the_modification_time_changes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        write(&mut file, "node-1\n");
        file.as_file().set_modified(stamp).unwrap();
        let resolver = FileResolver::new(file.path(), PortRole::Interest, ServicePorts::read(7001));
        assert_eq!(resolver.resolve().await.unwrap().len(), 1);

        // same mtime: the cached list is served
        write(&mut file, "node-1\nnode-2\n");
        file.as_file().set_modified(stamp).unwrap();
        assert_eq!(resolver.resolve().await.unwrap().len(), 1);

        file.as_file().set_modified(stamp + Duration::from_secs(10)).unwrap();
        assert_eq!(resolver.resolve().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn always_reload_picks_up_every_change() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write(&mut file, "node-1\n");
        let resolver = FileResolver::new(file.path(), PortRole::Interest, ServicePorts::read(7001))
            .always_reload(true);
        assert_eq!(resolver.resolve().await.unwrap().len(), 1);

        write(&mut file, "node-1\nnode-2\n");
        assert_eq!(resolver.resolve().await.unwrap().len(), 2);

        write(&mut file, "node-1;port=\n");
        assert!(matches!(resolver.resolve().await, Err(ResolverError::Syntax { line: 1, .. })));
    }
}
