//! WinDivert filter expressions derived from a profile.

use std::net::IpAddr;

use crate::codec::Transport;
use crate::config;
use crate::core::{Profile, RedirectRule, TlsStrategy};

/// Which loop a handle feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleRole {
    Rst,
    Tls,
    Redirect,
}

impl HandleRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rst => "rst",
            Self::Tls => "tls",
            Self::Redirect => "redirect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSpec {
    pub role: HandleRole,
    pub filter: String,
    pub priority: i16,
}

/// RSTs in both directions, plus inbound SYN-ACKs from TLS servers to learn
/// peer TTLs.
pub fn rst_filter() -> String {
    format!(
        "tcp.Rst == 1 or (inbound and tcp.Syn == 1 and tcp.Ack == 1 and tcp.SrcPort == {})",
        config::TLS_PORT
    )
}

/// Outbound TLS payloads (optionally pinned to one host), plus the port 80
/// and UDP/443 clauses the profile asks for.
pub fn tls_filter(profile: &Profile) -> String {
    let mut clauses = Vec::new();
    if profile.tls_strategy != TlsStrategy::None || profile.ttl_trick.is_some() {
        let host = match profile.target {
            Some(IpAddr::V4(ip)) => format!(" and ip.DstAddr == {ip}"),
            Some(IpAddr::V6(ip)) => format!(" and ipv6.DstAddr == {ip}"),
            None => String::new(),
        };
        clauses.push(format!(
            "outbound and !impostor{host} and tcp.DstPort == {} and tcp.PayloadLength > 0",
            profile.target_port
        ));
    }
    if profile.http_host_tricks {
        clauses.push(format!(
            "outbound and !impostor and tcp.DstPort == {} and tcp.PayloadLength > 0",
            config::HTTP_PORT
        ));
    }
    if profile.drop_udp443 {
        clauses.push(format!("outbound and udp.DstPort == {}", config::TLS_PORT));
    }
    match clauses.len() {
        0 => "false".to_string(),
        1 => clauses.remove(0),
        _ => clauses
            .iter()
            .map(|c| format!("({c})"))
            .collect::<Vec<_>>()
            .join(" or "),
    }
}

/// One clause per protocol, ORing the distinct ports of its enabled rules.
pub fn redirect_filter<'a>(rules: impl IntoIterator<Item = &'a RedirectRule>) -> String {
    let mut tcp_ports: Vec<u16> = Vec::new();
    let mut udp_ports: Vec<u16> = Vec::new();
    for rule in rules.into_iter().filter(|r| r.enabled) {
        let ports = match rule.protocol {
            Transport::Tcp => &mut tcp_ports,
            Transport::Udp => &mut udp_ports,
        };
        if !ports.contains(&rule.port) {
            ports.push(rule.port);
        }
    }

    let group = |proto: &str, ports: &[u16]| {
        let cond = ports
            .iter()
            .map(|p| format!("{proto}.DstPort == {p}"))
            .collect::<Vec<_>>()
            .join(" or ");
        format!("outbound and !impostor and {proto} and ({cond})")
    };
    let mut parts = Vec::new();
    if !tcp_ports.is_empty() {
        parts.push(group("tcp", &tcp_ports));
    }
    if !udp_ports.is_empty() {
        parts.push(group("udp", &udp_ports));
    }
    if parts.is_empty() {
        "false".to_string()
    } else {
        parts.join(" or ")
    }
}

/// Handles to open for `profile`, in opening order.
pub fn handle_specs(profile: &Profile) -> Vec<HandleSpec> {
    let mut specs = Vec::new();
    if profile.needs_rst_handle() {
        specs.push(HandleSpec {
            role: HandleRole::Rst,
            filter: rst_filter(),
            priority: config::PRIORITY_RST,
        });
    }
    if profile.needs_tls_handle() {
        specs.push(HandleSpec {
            role: HandleRole::Tls,
            filter: tls_filter(profile),
            priority: config::PRIORITY_TLS,
        });
    }
    if profile.enabled_redirects().next().is_some() {
        specs.push(HandleSpec {
            role: HandleRole::Redirect,
            filter: redirect_filter(profile.enabled_redirects()),
            priority: config::PRIORITY_REDIRECT,
        });
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(protocol: Transport, port: u16, enabled: bool) -> RedirectRule {
        RedirectRule {
            name: format!("r{port}"),
            protocol,
            port,
            redirect_ip: "127.0.0.1".parse().unwrap(),
            redirect_port: 0,
            enabled,
            hosts: Vec::new(),
            resolved: Vec::new(),
        }
    }

    #[test]
    fn test_rst_filter_learns_only_from_tls_servers() {
        let f = rst_filter();
        assert!(f.starts_with("tcp.Rst == 1 or "));
        assert!(f.contains("tcp.Syn == 1 and tcp.Ack == 1 and tcp.SrcPort == 443"));
    }

    #[test]
    fn test_global_and_pinned_tls_filter() {
        let mut p = Profile {
            tls_strategy: TlsStrategy::Fragment,
            ..Profile::default()
        };
        assert_eq!(
            tls_filter(&p),
            "outbound and !impostor and tcp.DstPort == 443 and tcp.PayloadLength > 0"
        );
        p.target = Some("93.184.216.34".parse().unwrap());
        assert!(tls_filter(&p).contains("ip.DstAddr == 93.184.216.34 and tcp.DstPort == 443"));
        p.target = Some("2001:db8::1".parse().unwrap());
        assert!(tls_filter(&p).contains("ipv6.DstAddr == 2001:db8::1"));
    }

    #[test]
    fn test_tls_filter_unions_http_and_udp_clauses() {
        let p = Profile {
            tls_strategy: TlsStrategy::Disorder,
            http_host_tricks: true,
            drop_udp443: true,
            ..Profile::default()
        };
        let f = tls_filter(&p);
        assert!(f.starts_with("(outbound and !impostor and tcp.DstPort == 443"));
        assert!(f.contains(") or (outbound and !impostor and tcp.DstPort == 80"));
        assert!(f.ends_with("(outbound and udp.DstPort == 443)"));

        let udp_only = Profile {
            drop_udp443: true,
            ..Profile::default()
        };
        assert_eq!(tls_filter(&udp_only), "outbound and udp.DstPort == 443");
    }

    #[test]
    fn test_redirect_filter_groups_by_protocol() {
        let rules = vec![
            rule(Transport::Tcp, 80, true),
            rule(Transport::Tcp, 80, true),
            rule(Transport::Tcp, 8080, true),
            rule(Transport::Udp, 53, true),
            rule(Transport::Udp, 5353, false),
        ];
        assert_eq!(
            redirect_filter(&rules),
            "outbound and !impostor and tcp and (tcp.DstPort == 80 or tcp.DstPort == 8080) \
             or outbound and !impostor and udp and (udp.DstPort == 53)"
        );
        assert_eq!(redirect_filter(&rules[4..]), "false");
    }

    #[test]
    fn test_handle_specs_order_and_priorities() {
        let p = Profile {
            tls_strategy: TlsStrategy::Fragment,
            drop_rst: true,
            redirect_rules: vec![rule(Transport::Udp, 53, true)],
            ..Profile::default()
        };
        let specs = handle_specs(&p);
        let roles: Vec<_> = specs.iter().map(|s| s.role).collect();
        assert_eq!(roles, vec![HandleRole::Rst, HandleRole::Tls, HandleRole::Redirect]);
        assert_eq!(specs[1].priority, 200);
        assert!(handle_specs(&Profile::default()).is_empty());
    }
}
