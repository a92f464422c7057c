//! Command-line tool and process environment surfaces

use super::edit::set_assignment;
use super::{edit_file, ProxyContext, ProxyTarget, TargetKind};
use crate::command::CommandSpec;
use crate::error::Result;
use crate::journal::{Journal, Undo};

const CURLRC: &str = "/root/.curlrc";

/// Proxy variables read by most HTTP clients
pub const PROXY_ENV_VARS: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "http_proxy",
    "https_proxy",
    "ALL_PROXY",
    "all_proxy",
];

const GIT_KEYS: &[&str] = &["http.proxy", "https.proxy"];

/// curl: global config of the invoking root user
pub struct CurlTarget;

impl ProxyTarget for CurlTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Curl
    }

    fn detect(&self, ctx: &ProxyContext) -> bool {
        ctx.runner.which("curl")
    }

    fn apply(&self, ctx: &ProxyContext, journal: &mut Journal) -> Result<()> {
        let value = format!("\"{}\"", ctx.endpoint.url());
        edit_file(journal, "curl proxy", &ctx.path(CURLRC), |c| {
            set_assignment(c, "proxy", " = ", &value)
        })?;
        Ok(())
    }
}

/// git: global `http.proxy` and `https.proxy`
pub struct GitTarget;

impl GitTarget {
    fn config<'a>(args: impl IntoIterator<Item = &'a str>) -> CommandSpec {
        let mut argv = vec!["config", "--global"];
        argv.extend(args);
        CommandSpec::new("git", argv)
    }

    /// Current value of a global key; `None` when unset
    fn get(ctx: &ProxyContext, key: &str) -> Result<Option<String>> {
        let output = ctx.runner.run(&Self::config(["--get", key]))?;
        let value = output.stdout.trim();
        Ok((output.success && !value.is_empty()).then(|| value.to_string()))
    }
}

impl ProxyTarget for GitTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Git
    }

    fn detect(&self, ctx: &ProxyContext) -> bool {
        ctx.runner.which("git")
    }

    fn apply(&self, ctx: &ProxyContext, journal: &mut Journal) -> Result<()> {
        let url = ctx.endpoint.url();

        for key in GIT_KEYS {
            let prior = Self::get(ctx, key)?;
            if prior.as_deref() == Some(url.as_str()) {
                continue;
            }

            let inverse = match &prior {
                Some(value) => Self::config([*key, value.as_str()]),
                None => Self::config(["--unset", *key]),
            };
            journal.record(format!("git {key}"), Undo::Command(inverse));
            ctx.runner.run_checked(&Self::config([*key, url.as_str()]))?;
        }
        Ok(())
    }
}

/// The controller's own process environment, inherited by anything it
/// starts
pub struct EnvironmentTarget;

impl ProxyTarget for EnvironmentTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Environment
    }

    fn detect(&self, _ctx: &ProxyContext) -> bool {
        true
    }

    fn apply(&self, ctx: &ProxyContext, journal: &mut Journal) -> Result<()> {
        let url = ctx.endpoint.url();
        for key in PROXY_ENV_VARS {
            if std::env::var(key).ok().as_deref() != Some(url.as_str()) {
                journal.set_env(key, &url);
            }
        }
        Ok(())
    }
}
