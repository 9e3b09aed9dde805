//! `ip -4 route` based routing table.

use async_trait::async_trait;
use shared_utils::command::{run_command, CommandError};
use std::net::Ipv4Addr;
use tracing::{debug, info};

use super::{DefaultRoute, RouteOutcome, RouteSpec, RoutingError, RoutingResult, RoutingTable};

/// Linux routing table driven through iproute2.
#[derive(Debug, Default, Clone)]
pub struct LinuxRoutingTable;

impl LinuxRoutingTable {
    pub fn new() -> Self {
        LinuxRoutingTable
    }

    fn route_args<'a>(verb: &'a str, route: &'a RouteSpec, dest: &'a str, via: &'a str) -> Vec<&'a str> {
        let mut args = vec!["-4", "route", verb, dest];
        if route.via.is_some() {
            args.push("via");
            args.push(via);
        }
        args.push("dev");
        args.push(&route.device);
        args
    }
}

/// Extract the first default route from `ip -4 route show default` output.
pub fn parse_default_route(output: &str) -> RoutingResult<DefaultRoute> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("default"))
        .ok_or(RoutingError::NoDefaultRoute)?;

    let mut gateway = None;
    let mut device = None;
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "via" => {
                let raw = tokens
                    .next()
                    .ok_or_else(|| RoutingError::Parse(line.to_string()))?;
                let addr = raw
                    .parse::<Ipv4Addr>()
                    .map_err(|_| RoutingError::Parse(line.to_string()))?;
                gateway = Some(addr);
            }
            "dev" => device = tokens.next().map(str::to_string),
            _ => {}
        }
    }

    let device = device.ok_or_else(|| RoutingError::Parse(line.to_string()))?;
    Ok(DefaultRoute { gateway, device })
}

#[async_trait]
impl RoutingTable for LinuxRoutingTable {
    async fn default_route(&self) -> RoutingResult<DefaultRoute> {
        let output = run_command("ip", &["-4", "route", "show", "default"]).await?;
        let route = parse_default_route(&output)?;
        debug!(gateway = ?route.gateway, device = %route.device, "current default route");
        Ok(route)
    }

    async fn add_route(&self, route: &RouteSpec) -> RoutingResult<RouteOutcome> {
        let dest = route.destination.to_string();
        let via = route.via.map(|v| v.to_string()).unwrap_or_default();
        let args = Self::route_args("add", route, &dest, &via);

        match run_command("ip", &args).await {
            Ok(_) => {
                info!(route = %route, "route added");
                Ok(RouteOutcome::Installed)
            }
            Err(err @ CommandError::Failure { .. }) if err.stderr().contains("File exists") => {
                info!(route = %route, "route already present; leaving it alone");
                Ok(RouteOutcome::AlreadyPresent)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn remove_route(&self, route: &RouteSpec) -> RoutingResult<()> {
        let dest = route.destination.to_string();
        let via = route.via.map(|v| v.to_string()).unwrap_or_default();
        let args = Self::route_args("del", route, &dest, &via);

        match run_command("ip", &args).await {
            Ok(_) => {
                info!(route = %route, "route removed");
                Ok(())
            }
            Err(err @ CommandError::Failure { .. })
                if ["No such process", "Cannot find device", "No such device"]
                    .iter()
                    .any(|needle| err.stderr().contains(needle)) =>
            {
                info!(route = %route, "route already absent");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
