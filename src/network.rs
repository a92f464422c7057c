//! Tunnel interface and routing management
//!
//! Creates the TUN device, moves the default route onto it and relaxes
//! reverse-path filtering. Every step is best-effort: a failing step is
//! logged and the next one still runs. Prior routing state is captured
//! first so rollback restores exactly what was there.

use crate::command::{CommandRunner, CommandSpec};
use crate::config::Config;
use crate::error::{Result, RwtError};
use crate::journal::{Journal, Undo};
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

const RP_FILTER_KEY: &str = "net.ipv4.conf.all.rp_filter";

/// One default route as shown by `ip -4 route show default`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: Option<Ipv4Addr>,
    pub device: Option<String>,
    pub proto: Option<String>,
    pub src: Option<Ipv4Addr>,
    pub metric: Option<u32>,
    pub onlink: bool,
}

impl DefaultRoute {
    /// Parse a single `default ...` line
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "default" {
            return None;
        }

        let mut route = DefaultRoute {
            gateway: None,
            device: None,
            proto: None,
            src: None,
            metric: None,
            onlink: false,
        };

        while let Some(token) = tokens.next() {
            match token {
                "via" => route.gateway = tokens.next().and_then(|v| v.parse().ok()),
                "dev" => route.device = tokens.next().map(str::to_string),
                "proto" => route.proto = tokens.next().map(str::to_string),
                "src" => route.src = tokens.next().and_then(|v| v.parse().ok()),
                "metric" => route.metric = tokens.next().and_then(|v| v.parse().ok()),
                "onlink" => route.onlink = true,
                // scope/linkdown and friends are not needed to recreate it
                _ => {}
            }
        }

        Some(route)
    }

    /// Parse every default route in `ip route` output
    pub fn parse_all(output: &str) -> Vec<Self> {
        output.lines().filter_map(Self::parse_line).collect()
    }

    /// Arguments after `ip route <verb>` that describe this route
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["default".to_string()];
        if let Some(gateway) = self.gateway {
            args.extend(["via".to_string(), gateway.to_string()]);
        }
        if let Some(ref device) = self.device {
            args.extend(["dev".to_string(), device.clone()]);
        }
        if let Some(ref proto) = self.proto {
            args.extend(["proto".to_string(), proto.clone()]);
        }
        if let Some(src) = self.src {
            args.extend(["src".to_string(), src.to_string()]);
        }
        if let Some(metric) = self.metric {
            args.extend(["metric".to_string(), metric.to_string()]);
        }
        if self.onlink {
            args.push("onlink".to_string());
        }
        args
    }

    fn command(&self, verb: &str) -> CommandSpec {
        let mut args = vec!["route".to_string(), verb.to_string()];
        args.extend(self.args());
        CommandSpec::new("ip", args)
    }
}

impl fmt::Display for DefaultRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args().join(" "))
    }
}

/// Network state captured and changed by one session
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkState {
    pub device: String,
    pub network: Ipv4Net,
    /// Default routes present before the session, in table order
    pub prior_routes: Vec<DefaultRoute>,
    /// rp_filter value present before the session, if readable
    pub prior_rp_filter: Option<String>,
}

/// Applies and reverts tunnel interface and routing changes
pub struct NetworkConfigurator {
    runner: Arc<dyn CommandRunner>,
    device: String,
    network: Ipv4Net,
    tunnel_metric: u32,
    fallback_metric: u32,
    rp_filter_fallback: u8,
    journal: Journal,
}

impl NetworkConfigurator {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        Ok(Self {
            runner,
            device: config.tunnel.name.clone(),
            network: config.tunnel.network()?,
            tunnel_metric: config.routing.tunnel_metric,
            fallback_metric: config.routing.fallback_metric,
            rp_filter_fallback: config.routing.rp_filter_fallback,
            journal: Journal::new(),
        })
    }

    /// Whether anything is waiting to be undone
    pub fn has_changes(&self) -> bool {
        !self.journal.is_empty()
    }

    /// Snapshot routing state, then bring up the tunnel and reroute
    pub fn configure(&mut self) -> NetworkState {
        log::info!("Configuring tunnel interface {}", self.device);

        let prior_routes = self.capture_default_routes();
        let prior_rp_filter = self.capture_rp_filter();
        let state = NetworkState {
            device: self.device.clone(),
            network: self.network,
            prior_routes: prior_routes.clone(),
            prior_rp_filter: prior_rp_filter.clone(),
        };

        // 1-3: device, address, link up. Deleting a device we created takes
        // the address and any routes through it along; a device that was
        // already there only loses what this session added to it.
        let device = self.device.clone();
        let created = self.step(
            "create tun device",
            CommandSpec::new("ip", ["tuntap", "add", "mode", "tun", "dev", device.as_str()]),
        );
        if created {
            self.journal.record(
                format!("create {device}"),
                Undo::Command(CommandSpec::new("ip", ["link", "delete", device.as_str()])),
            );
        } else {
            log::warn!("Reusing existing device {device}, it will be left in place on exit");
        }

        let address = self.network.to_string();
        let assigned = self.step(
            "assign tunnel address",
            CommandSpec::new("ip", ["addr", "add", address.as_str(), "dev", device.as_str()]),
        );
        if assigned && !created {
            self.journal.record(
                format!("assign {address} to {device}"),
                Undo::Command(CommandSpec::new("ip", ["addr", "del", address.as_str(), "dev", device.as_str()])),
            );
        }
        self.step(
            "bring tunnel up",
            CommandSpec::new("ip", ["link", "set", "dev", device.as_str(), "up"]),
        );

        // 4: default routes
        for route in &prior_routes {
            if self.step(&format!("remove default route {route}"), route.command("del")) {
                self.journal.record(
                    format!("restore default route {route}"),
                    Undo::Command(route.command("replace")),
                );
            }
        }

        let tunnel_route = DefaultRoute {
            gateway: None,
            device: Some(device.clone()),
            proto: None,
            src: None,
            metric: Some(self.tunnel_metric),
            onlink: false,
        };
        if self.step("route default via tunnel", tunnel_route.command("add")) {
            self.journal.record(
                format!("remove {tunnel_route}"),
                Undo::Command(tunnel_route.command("del")),
            );
        }

        match prior_routes.first() {
            Some(primary) => {
                let fallback = DefaultRoute {
                    gateway: primary.gateway,
                    device: primary.device.clone(),
                    proto: None,
                    src: None,
                    metric: Some(self.fallback_metric),
                    onlink: primary.onlink,
                };
                if self.step("add fallback default route", fallback.command("add")) {
                    self.journal.record(
                        format!("remove {fallback}"),
                        Undo::Command(fallback.command("del")),
                    );
                }
            }
            None => log::warn!("No default route before the session, skipping the fallback route"),
        }

        // 5: reverse-path filtering
        let restore_value = prior_rp_filter
            .clone()
            .unwrap_or_else(|| self.rp_filter_fallback.to_string());
        if self.step(
            "disable reverse-path filtering",
            CommandSpec::new("sysctl", ["-w".to_string(), format!("{RP_FILTER_KEY}=0")]),
        ) {
            self.journal.record(
                format!("restore {RP_FILTER_KEY}={restore_value}"),
                Undo::Command(CommandSpec::new(
                    "sysctl",
                    ["-w".to_string(), format!("{RP_FILTER_KEY}={restore_value}")],
                )),
            );
        }

        log::info!("Tunnel interface {} configured ({})", self.device, self.network);
        state
    }

    /// Undo everything [`configure`](Self::configure) changed
    pub fn revert(&mut self) -> Vec<RwtError> {
        if self.journal.is_empty() {
            return Vec::new();
        }
        log::info!("Restoring routing and removing {}", self.device);
        self.journal.rollback(self.runner.as_ref())
    }

    fn capture_default_routes(&self) -> Vec<DefaultRoute> {
        let spec = CommandSpec::new("ip", ["-4", "route", "show", "default"]);
        match self.runner.run_checked(&spec) {
            Ok(output) => {
                let routes = DefaultRoute::parse_all(&output.stdout);
                for route in &routes {
                    log::info!("Original default route: {route}");
                }
                routes
            }
            Err(e) => {
                log::warn!("{}", RwtError::InterfaceConfig(format!("cannot read routes: {e}")));
                Vec::new()
            }
        }
    }

    fn capture_rp_filter(&self) -> Option<String> {
        let spec = CommandSpec::new("sysctl", ["-n", RP_FILTER_KEY]);
        match self.runner.run_checked(&spec) {
            Ok(output) => {
                let value = output.stdout.trim().to_string();
                (!value.is_empty()).then_some(value)
            }
            Err(e) => {
                log::warn!(
                    "{}",
                    RwtError::InterfaceConfig(format!(
                        "cannot read {RP_FILTER_KEY}, will restore {}: {e}",
                        self.rp_filter_fallback
                    ))
                );
                None
            }
        }
    }

    /// Run one best-effort step; `true` when it succeeded
    fn step(&self, label: &str, spec: CommandSpec) -> bool {
        match self.runner.run_checked(&spec) {
            Ok(_) => {
                log::debug!("{label}: ok");
                true
            }
            Err(e) => {
                log::warn!("{}", RwtError::InterfaceConfig(format!("{label}: {e}")));
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod simulated {
    //! A tiny model of the kernel routing table, device list and sysctl
    //! store, driven through the same commands the configurator issues.

    use super::DefaultRoute;
    use crate::command::{CommandOutput, CommandRunner, CommandSpec};
    use crate::error::Result;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    #[derive(Debug, Default, Clone)]
    pub struct HostState {
        pub routes: Vec<DefaultRoute>,
        pub devices: BTreeSet<String>,
        pub sysctl: BTreeMap<String, String>,
    }

    pub struct SimulatedHost {
        pub state: Mutex<HostState>,
        pub log: Mutex<Vec<String>>,
    }

    impl SimulatedHost {
        pub fn new(routes: &str, rp_filter: &str) -> Self {
            let mut sysctl = BTreeMap::new();
            sysctl.insert(super::RP_FILTER_KEY.to_string(), rp_filter.to_string());
            Self {
                state: Mutex::new(HostState {
                    routes: DefaultRoute::parse_all(routes),
                    devices: ["lo", "wlan0"].iter().map(|d| d.to_string()).collect(),
                    sysctl,
                }),
                log: Mutex::new(Vec::new()),
            }
        }

        pub fn snapshot(&self) -> HostState {
            self.state.lock().unwrap().clone()
        }

        pub fn commands(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn matches(filter: &DefaultRoute, route: &DefaultRoute) -> bool {
            (filter.gateway.is_none() || filter.gateway == route.gateway)
                && (filter.device.is_none() || filter.device == route.device)
                && (filter.metric.is_none() || filter.metric == route.metric)
        }

        fn ip(&self, args: &[String]) -> CommandOutput {
            let mut state = self.state.lock().unwrap();
            let words: Vec<&str> = args.iter().map(String::as_str).collect();
            match words.as_slice() {
                ["-4", "route", "show", "default"] => {
                    let text: String = state.routes.iter().map(|r| format!("{r}\n")).collect();
                    CommandOutput::ok(&text)
                }
                ["tuntap", "add", "mode", "tun", "dev", name] => {
                    if state.devices.insert(name.to_string()) {
                        CommandOutput::ok("")
                    } else {
                        CommandOutput::failed("ioctl(TUNSETIFF): Device or resource busy")
                    }
                }
                ["link", "delete", name] => {
                    if state.devices.remove(*name) {
                        state.routes.retain(|r| r.device.as_deref() != Some(*name));
                        CommandOutput::ok("")
                    } else {
                        CommandOutput::failed("Cannot find device")
                    }
                }
                ["addr", ..] | ["link", "set", ..] => CommandOutput::ok(""),
                ["route", verb, rest @ ..] => {
                    let line = rest.join(" ");
                    let Some(route) = DefaultRoute::parse_line(&line) else {
                        return CommandOutput::failed("Error: unsupported route");
                    };
                    match *verb {
                        "add" => {
                            if state.routes.iter().any(|r| r.device == route.device && r.metric == route.metric) {
                                CommandOutput::failed("RTNETLINK answers: File exists")
                            } else {
                                state.routes.push(route);
                                CommandOutput::ok("")
                            }
                        }
                        "del" => match state.routes.iter().position(|r| Self::matches(&route, r)) {
                            Some(index) => {
                                state.routes.remove(index);
                                CommandOutput::ok("")
                            }
                            None => CommandOutput::failed("RTNETLINK answers: No such process"),
                        },
                        "replace" => {
                            state.routes.retain(|r| !(r.device == route.device && r.metric == route.metric));
                            state.routes.push(route);
                            CommandOutput::ok("")
                        }
                        _ => CommandOutput::failed("unknown verb"),
                    }
                }
                _ => CommandOutput::failed("unsupported ip invocation"),
            }
        }

        fn sysctl(&self, args: &[String]) -> CommandOutput {
            let mut state = self.state.lock().unwrap();
            match args.first().map(String::as_str) {
                Some("-n") => match args.get(1).and_then(|k| state.sysctl.get(k)) {
                    Some(value) => CommandOutput::ok(&format!("{value}\n")),
                    None => CommandOutput::failed("unknown key"),
                },
                Some("-w") => match args.get(1).and_then(|kv| kv.split_once('=')) {
                    Some((key, value)) => {
                        state.sysctl.insert(key.to_string(), value.to_string());
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed("malformed setting"),
                },
                _ => CommandOutput::failed("unsupported sysctl invocation"),
            }
        }
    }

    impl CommandRunner for SimulatedHost {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.log.lock().unwrap().push(spec.to_string());
            Ok(match spec.program.as_str() {
                "ip" => self.ip(&spec.args),
                "sysctl" => self.sysctl(&spec.args),
                _ => CommandOutput::ok(""),
            })
        }

        fn which(&self, _program: &str) -> bool {
            false
        }
    }
}
