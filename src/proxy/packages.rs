//! Package manager proxy surfaces

use super::edit::{enable_xfer_command, set_assignment, upsert_block};
use super::{edit_file, ProxyContext, ProxyTarget, TargetKind};
use crate::error::Result;
use crate::journal::Journal;

const APT_DIR: &str = "/etc/apt";
const APT_PROXY_FILE: &str = "/etc/apt/apt.conf.d/95pdanet-rwt-proxy";

const PACMAN_CONF: &str = "/etc/pacman.conf";
const WGETRC: &str = "/etc/wgetrc";
const WGET_XFER: &str = "/usr/bin/wget --passive-ftp -c -O %o %u";

const NIXOS_CONF: &str = "/etc/nixos/configuration.nix";
const NIX_BEGIN: &str = "# BEGIN pdanet-rwt proxy";
const NIX_END: &str = "# END pdanet-rwt proxy";

const MACPORTS_CONF: &str = "/opt/local/etc/macports/macports.conf";

/// Debian-family: a drop-in read by apt
pub struct AptTarget;

impl ProxyTarget for AptTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Apt
    }

    fn detect(&self, ctx: &ProxyContext) -> bool {
        ctx.path(APT_DIR).is_dir()
    }

    fn apply(&self, ctx: &ProxyContext, journal: &mut Journal) -> Result<()> {
        let url = ctx.endpoint.url();
        let content = format!("Acquire::http::Proxy \"{url}/\";\nAcquire::https::Proxy \"{url}/\";\n");
        edit_file(journal, "apt proxy", &ctx.path(APT_PROXY_FILE), |_| content)?;
        Ok(())
    }
}

/// Arch-family: pacman downloads through wget, which reads its proxy from
/// the global wgetrc
pub struct PacmanTarget;

impl ProxyTarget for PacmanTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Pacman
    }

    fn detect(&self, ctx: &ProxyContext) -> bool {
        ctx.path(PACMAN_CONF).is_file()
    }

    fn apply(&self, ctx: &ProxyContext, journal: &mut Journal) -> Result<()> {
        edit_file(journal, "pacman XferCommand", &ctx.path(PACMAN_CONF), |c| {
            enable_xfer_command(c, WGET_XFER)
        })?;

        let url = format!("{}/", ctx.endpoint.url());
        edit_file(journal, "wgetrc proxy", &ctx.path(WGETRC), |c| {
            let c = set_assignment(c, "use_proxy", " = ", "on");
            let c = set_assignment(&c, "http_proxy", " = ", &url);
            set_assignment(&c, "https_proxy", " = ", &url)
        })?;
        Ok(())
    }
}

/// NixOS: a marked block in the system configuration
pub struct NixosTarget;

impl ProxyTarget for NixosTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Nixos
    }

    fn detect(&self, ctx: &ProxyContext) -> bool {
        ctx.path(NIXOS_CONF).is_file()
    }

    fn apply(&self, ctx: &ProxyContext, journal: &mut Journal) -> Result<()> {
        let body = vec![
            format!("networking.proxy.default = \"{}/\";", ctx.endpoint.url()),
            "networking.proxy.noProxy = \"127.0.0.1,localhost\";".to_string(),
        ];
        edit_file(journal, "nixos proxy", &ctx.path(NIXOS_CONF), |c| {
            upsert_block(c, NIX_BEGIN, NIX_END, &body)
        })?;
        Ok(())
    }
}

/// MacPorts: `proxy_http` and `proxy_https` take a bare `host:port`
pub struct MacPortsTarget;

impl ProxyTarget for MacPortsTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Macports
    }

    fn detect(&self, ctx: &ProxyContext) -> bool {
        ctx.path(MACPORTS_CONF).is_file()
    }

    fn apply(&self, ctx: &ProxyContext, journal: &mut Journal) -> Result<()> {
        let authority = ctx.endpoint.authority();
        edit_file(journal, "macports proxy", &ctx.path(MACPORTS_CONF), |c| {
            let c = set_assignment(c, "proxy_http", " ", &authority);
            set_assignment(&c, "proxy_https", " ", &authority)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testing::{context, recording};
    use std::fs;

    #[test]
    fn test_apt_drop_in() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), recording());
        assert!(!AptTarget.detect(&ctx));

        fs::create_dir_all(dir.path().join("etc/apt")).unwrap();
        assert!(AptTarget.detect(&ctx));

        let mut journal = Journal::new();
        AptTarget.apply(&ctx, &mut journal).unwrap();
        let written = fs::read_to_string(dir.path().join("etc/apt/apt.conf.d/95pdanet-rwt-proxy")).unwrap();
        assert_eq!(
            written,
            "Acquire::http::Proxy \"http://192.168.49.1:8000/\";\nAcquire::https::Proxy \"http://192.168.49.1:8000/\";\n"
        );

        journal.rollback(ctx.runner.as_ref());
        assert!(!dir.path().join("etc/apt/apt.conf.d/95pdanet-rwt-proxy").exists());
    }

    #[test]
    fn test_pacman_and_wgetrc() {
        let dir = tempfile::tempdir().unwrap();
        let original = "[options]\nHoldPkg = pacman glibc\n#XferCommand = /usr/bin/curl -L -C - -f -o %o %u\n#XferCommand = /usr/bin/wget --passive-ftp -c -O %o %u\n";
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/pacman.conf"), original).unwrap();
        let ctx = context(dir.path(), recording());

        let mut journal = Journal::new();
        PacmanTarget.apply(&ctx, &mut journal).unwrap();

        let pacman = fs::read_to_string(dir.path().join("etc/pacman.conf")).unwrap();
        assert!(pacman.contains("\nXferCommand = /usr/bin/wget --passive-ftp -c -O %o %u\n"));
        let wgetrc = fs::read_to_string(dir.path().join("etc/wgetrc")).unwrap();
        assert_eq!(
            wgetrc,
            "use_proxy = on\nhttp_proxy = http://192.168.49.1:8000/\nhttps_proxy = http://192.168.49.1:8000/\n"
        );

        journal.rollback(ctx.runner.as_ref());
        assert_eq!(fs::read_to_string(dir.path().join("etc/pacman.conf")).unwrap(), original);
        assert!(!dir.path().join("etc/wgetrc").exists());
    }

    #[test]
    fn test_nixos_block_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/nixos/configuration.nix");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ config, pkgs, ... }:\n{\n  services.openssh.enable = true;\n}\n").unwrap();
        let ctx = context(dir.path(), recording());

        let mut journal = Journal::new();
        NixosTarget.apply(&ctx, &mut journal).unwrap();
        let once = fs::read_to_string(&path).unwrap();
        assert!(once.contains("  networking.proxy.default = \"http://192.168.49.1:8000/\";\n"));
        assert!(once.ends_with("  # END pdanet-rwt proxy\n}\n"));

        NixosTarget.apply(&ctx, &mut journal).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), once);
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn test_macports_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt/local/etc/macports/macports.conf");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "prefix              /opt/local\n#proxy_http          hostname:12345\n").unwrap();
        let ctx = context(dir.path(), recording());

        let mut journal = Journal::new();
        MacPortsTarget.apply(&ctx, &mut journal).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("\nproxy_http 192.168.49.1:8000\n"));
        assert!(written.contains("\nproxy_https 192.168.49.1:8000\n"));
        assert!(written.contains("#proxy_http          hostname:12345"));
    }
}
