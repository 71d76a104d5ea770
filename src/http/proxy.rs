//! Trusted reverse-proxy IP resolution, mirroring
//! `getDirectOrForwardedRemoteIP`/`remoteIPisTrusted`: the socket peer is
//! only replaced by `X-Forwarded-For`'s first token when the peer itself is
//! inside a configured trusted CIDR range, preventing untrusted clients from
//! spoofing their own IP.

use std::net::IpAddr;

use crate::config::Settings;
use crate::error::AppError;

pub fn resolve_remote_ip(settings: &Settings, socket_ip: IpAddr, forwarded_for: Option<&str>) -> Result<String, AppError> {
    if !settings.trusted_ip(socket_ip) {
        return Ok(socket_ip.to_string());
    }

    let Some(header) = forwarded_for else {
        return Ok(socket_ip.to_string());
    };

    let first = header.split(',').next().unwrap_or("").trim();
    if first.is_empty() {
        return Ok(socket_ip.to_string());
    }

    first.parse::<IpAddr>().map(|ip| ip.to_string()).map_err(|_| AppError::BadRequest(format!("unparsable X-Forwarded-For address: {first}")))
}
