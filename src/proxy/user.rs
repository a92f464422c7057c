//! Per-user surfaces of the desktop session owner

use super::desktop::{chown_to, DesktopUser};
use super::edit::{set_assignment, set_ini_key};
use super::{edit_file, FileChange, ProxyContext, ProxyTarget, TargetKind};
use crate::error::Result;
use crate::journal::Journal;
use std::path::Path;

const KIOSLAVERC: &str = ".config/kioslaverc";
const KDE_SECTION: &str = "Proxy Settings";
/// `ProxyType` value for a manually configured proxy
const KDE_MANUAL_PROXY: &str = "1";

const NPMRC: &str = ".npmrc";

/// Files the session creates in a user's home must belong to that user
fn hand_over(path: &Path, change: FileChange, user: &DesktopUser) {
    if change == FileChange::Created {
        if let Err(e) = chown_to(path, user) {
            log::warn!("Could not chown {} to {}: {e}", path.display(), user.name);
        }
    }
}

/// KDE: manual proxy in the user's kioslaverc
pub struct KdeTarget;

impl ProxyTarget for KdeTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Kde
    }

    fn detect(&self, ctx: &ProxyContext) -> bool {
        ctx.kde_session && ctx.desktop_user.is_some()
    }

    fn apply(&self, ctx: &ProxyContext, journal: &mut Journal) -> Result<()> {
        let Some(user) = ctx.desktop_user.as_ref() else {
            return Ok(());
        };

        // KDE separates host and port with a space
        let host = &ctx.endpoint.host;
        let port = ctx.endpoint.port;
        let http = format!("http://{host} {port}");
        let socks = format!("socks://{host} {port}");

        let path = ctx.user_path(user, KIOSLAVERC);
        let change = edit_file(journal, "kde proxy", &path, |c| {
            let c = set_ini_key(c, KDE_SECTION, "ProxyType", KDE_MANUAL_PROXY);
            let c = set_ini_key(&c, KDE_SECTION, "httpProxy", &http);
            let c = set_ini_key(&c, KDE_SECTION, "httpsProxy", &http);
            set_ini_key(&c, KDE_SECTION, "socksProxy", &socks)
        })?;
        hand_over(&path, change, user);
        Ok(())
    }
}

/// npm: per-user registry client config
pub struct NpmTarget;

impl ProxyTarget for NpmTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Npm
    }

    fn detect(&self, ctx: &ProxyContext) -> bool {
        ctx.desktop_user.is_some() && ctx.runner.which("npm")
    }

    fn apply(&self, ctx: &ProxyContext, journal: &mut Journal) -> Result<()> {
        let Some(user) = ctx.desktop_user.as_ref() else {
            return Ok(());
        };

        let url = ctx.endpoint.url();
        let path = ctx.user_path(user, NPMRC);
        let change = edit_file(journal, "npm proxy", &path, |c| {
            let c = set_assignment(c, "proxy", "=", &url);
            set_assignment(&c, "https-proxy", "=", &url)
        })?;
        hand_over(&path, change, user);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use crate::proxy::testing::context;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn current_user() -> DesktopUser {
        #[cfg(unix)]
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        #[cfg(not(unix))]
        let (uid, gid) = (1000, 1000);
        DesktopUser {
            name: "alice".to_string(),
            uid,
            gid,
            home: PathBuf::from("/home/alice"),
        }
    }

    #[test]
    fn test_kde_needs_a_session_and_a_user() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), Arc::new(RecordingRunner::new()));
        assert!(!KdeTarget.detect(&ctx));
        ctx.desktop_user = Some(current_user());
        assert!(!KdeTarget.detect(&ctx));
        ctx.kde_session = true;
        assert!(KdeTarget.detect(&ctx));
    }

    #[test]
    fn test_kde_rewrites_proxy_section() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), Arc::new(RecordingRunner::new()));
        ctx.desktop_user = Some(current_user());
        ctx.kde_session = true;

        let path = dir.path().join("home/alice/.config/kioslaverc");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let original = "[$Version]\nupdate_info=kioslave.upd:kde4.2\n\n[Proxy Settings]\nProxyType=0\nhttpProxy=\n";
        fs::write(&path, original).unwrap();

        let mut journal = Journal::new();
        KdeTarget.apply(&ctx, &mut journal).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("[Proxy Settings]\nProxyType=1\nhttpProxy=http://192.168.49.1 8000\n"));
        assert!(written.contains("httpsProxy=http://192.168.49.1 8000\n"));
        assert!(written.contains("socksProxy=socks://192.168.49.1 8000\n"));

        journal.rollback(ctx.runner.as_ref());
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn test_npm_only_for_desktop_user_with_npm() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new().with_programs(&["npm"]));
        let mut ctx = context(dir.path(), runner);
        assert!(!NpmTarget.detect(&ctx));
        ctx.desktop_user = Some(current_user());
        assert!(NpmTarget.detect(&ctx));

        let mut journal = Journal::new();
        NpmTarget.apply(&ctx, &mut journal).unwrap();
        let path = dir.path().join("home/alice/.npmrc");
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "proxy=http://192.168.49.1:8000\nhttps-proxy=http://192.168.49.1:8000\n"
        );

        journal.rollback(ctx.runner.as_ref());
        assert!(!path.exists());
    }
}
