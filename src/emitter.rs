//! Tunnel binary configuration
//!
//! Renders the YAML document the tunnel binary is started with. Writing
//! always overwrites, so a file left by an aborted session never leaks
//! into a new one.

use crate::config::Config;
use crate::error::Result;
use crate::journal::{Journal, Undo};
use crate::session::Session;
use std::fs;
use std::path::Path;

/// Every field of the tunnel binary's config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDocument {
    pub tunnel_name: String,
    pub mtu: u32,
    pub ipv4: String,
    pub socks5_address: String,
    pub socks5_port: u16,
    pub socks5_udp: String,
    pub log_file: String,
    pub log_level: String,
}

impl TunnelDocument {
    pub fn from_session(session: &Session, config: &Config) -> Result<Self> {
        let network = config.tunnel.network()?;
        Ok(Self {
            tunnel_name: config.tunnel.name.clone(),
            mtu: config.tunnel.mtu,
            ipv4: network.addr().to_string(),
            socks5_address: session.proxy_host.clone(),
            socks5_port: session.proxy_port,
            socks5_udp: config.tunnel.udp.clone(),
            log_file: session.log_file.display().to_string(),
            log_level: config.tunnel.log_level.clone(),
        })
    }

    /// YAML text in the layout the tunnel binary expects
    pub fn render(&self) -> String {
        let mut doc = String::new();
        doc.push_str("tunnel:\n");
        doc.push_str(&format!("  name: {}\n", self.tunnel_name));
        doc.push_str(&format!("  mtu: {}\n", self.mtu));
        doc.push_str(&format!("  ipv4: {}\n", self.ipv4));
        doc.push('\n');
        doc.push_str("socks5:\n");
        doc.push_str(&format!("  port: {}\n", self.socks5_port));
        doc.push_str(&format!("  address: {}\n", self.socks5_address));
        doc.push_str(&format!("  udp: '{}'\n", self.socks5_udp));
        doc.push('\n');
        doc.push_str("misc:\n");
        doc.push_str(&format!("  log-file: {}\n", self.log_file));
        doc.push_str(&format!("  log-level: {}\n", self.log_level));
        doc
    }
}

/// Write the document to `path`, journaling its removal
pub fn emit(document: &TunnelDocument, path: &Path, journal: &mut Journal) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    journal.record(
        format!("emit {}", path.display()),
        Undo::RemoveFile(path.to_path_buf()),
    );
    fs::write(path, document.render())?;
    log::info!("Tunnel config written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use crate::session::Architecture;
    use std::path::PathBuf;

    fn session(workspace: &Path) -> (Session, Config) {
        let mut config = Config::default();
        config.session.workspace = workspace.to_path_buf();
        let session = Session::new(
            &config,
            Architecture::X86_64,
            "hev-socks5-tunnel-linux-x86_64".to_string(),
            PathBuf::from("/bin/true"),
        );
        (session, config)
    }

    #[test]
    fn test_document_fields() {
        let (session, config) = session(Path::new("/opt/rwt"));
        let doc = TunnelDocument::from_session(&session, &config).unwrap();
        assert_eq!(doc.mtu, 8500);
        assert_eq!(doc.ipv4, "198.18.0.1");
        assert_eq!(doc.socks5_address, "192.168.49.1");
        assert_eq!(doc.socks5_port, 8000);

        let text = doc.render();
        assert!(text.contains("tunnel:\n  name: tun0\n  mtu: 8500\n  ipv4: 198.18.0.1\n"));
        assert!(text.contains("socks5:\n  port: 8000\n  address: 192.168.49.1\n  udp: 'udp'\n"));
        assert!(text.contains("  log-file: /opt/rwt/logs/pdanet_"));
        assert!(text.contains("  log-level: debug\n"));
    }

    #[test]
    fn test_emit_overwrites_stale_file_and_rollback_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let (session, config) = session(dir.path());
        fs::write(&session.config_file, "stale: true\n").unwrap();

        let doc = TunnelDocument::from_session(&session, &config).unwrap();
        let mut journal = Journal::new();
        emit(&doc, &session.config_file, &mut journal).unwrap();

        let written = fs::read_to_string(&session.config_file).unwrap();
        assert!(!written.contains("stale"));
        assert_eq!(written, doc.render());

        assert!(journal.rollback(&RecordingRunner::new()).is_empty());
        assert!(!session.config_file.exists());
    }
}
