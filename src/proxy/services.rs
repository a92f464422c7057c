//! Container runtime proxy

use super::{edit_file, FileChange, ProxyContext, ProxyTarget, TargetKind};
use crate::command::{run_with_retry, CommandSpec};
use crate::error::Result;
use crate::journal::{Journal, Undo};

const DOCKER_DROP_IN: &str = "/etc/systemd/system/docker.service.d/http-proxy.conf";

/// Docker: a systemd drop-in for the daemon's environment, picked up by a
/// reload and restart of the unit
pub struct DockerTarget;

impl DockerTarget {
    fn reload(ctx: &ProxyContext) -> CommandSpec {
        CommandSpec::new("systemctl", ["daemon-reload"]).with_timeout(ctx.service_timeout)
    }

    fn restart(ctx: &ProxyContext) -> CommandSpec {
        CommandSpec::new("systemctl", ["restart", "docker"]).with_timeout(ctx.service_timeout)
    }
}

impl ProxyTarget for DockerTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Docker
    }

    fn detect(&self, ctx: &ProxyContext) -> bool {
        ctx.runner.which("docker") && ctx.runner.which("systemctl")
    }

    fn apply(&self, ctx: &ProxyContext, journal: &mut Journal) -> Result<()> {
        let url = ctx.endpoint.url();
        let content = format!(
            "[Service]\nEnvironment=\"HTTP_PROXY={url}\"\nEnvironment=\"HTTPS_PROXY={url}\"\n"
        );

        let path = ctx.path(DOCKER_DROP_IN);
        let mark = journal.len();
        let change = edit_file(journal, "docker drop-in", &path, |_| content)?;
        if change == FileChange::Unchanged {
            return Ok(());
        }

        // Replayed after the drop-in is restored: reload, then restart
        let attempts = ctx.service_attempts;
        journal.insert(mark, "docker reload", Undo::Retried(Self::reload(ctx), attempts));
        journal.insert(mark, "docker restart", Undo::Retried(Self::restart(ctx), attempts));

        let runner = ctx.runner.as_ref();
        run_with_retry(runner, &Self::reload(ctx), attempts)?;
        run_with_retry(runner, &Self::restart(ctx), attempts)?;
        log::info!("Docker restarted with proxy {url}");
        Ok(())
    }
}
