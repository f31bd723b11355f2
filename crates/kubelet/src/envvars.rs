//! Service discovery through environment variables.

use api_types::EnvVar;
use api_types::Service;

/// Variables describing every service with a portal IP: `<NAME>_SERVICE_HOST`,
/// `<NAME>_SERVICE_PORT` (first port), `<NAME>_SERVICE_PORT_<PORT NAME>` per named port,
/// and the link-style `<NAME>_PORT*` variables.
pub fn from_services(services: &[Service]) -> Vec<EnvVar> {
    let mut result = Vec::new();
    for service in services.iter().filter(|s| s.has_portal_ip()) {
        let prefix = env_var_name(&service.metadata.name);
        let Some(first) = service.spec.ports.first() else {
            continue;
        };

        result.push(var(
            format!("{prefix}_SERVICE_HOST"),
            service.spec.portal_ip.clone(),
        ));
        let port_var = format!("{prefix}_SERVICE_PORT");
        result.push(var(port_var.clone(), first.port.to_string()));
        for port in service.spec.ports.iter().filter(|p| !p.name.is_empty()) {
            result.push(var(
                format!("{port_var}_{}", env_var_name(&port.name)),
                port.port.to_string(),
            ));
        }
        result.extend(link_variables(&prefix, service));
    }
    result
}

/// Docker link compatible variables; the first port also gets the bare `<NAME>_PORT`.
fn link_variables(prefix: &str, service: &Service) -> Vec<EnvVar> {
    let ip = &service.spec.portal_ip;
    let mut result = Vec::new();
    for (i, port) in service.spec.ports.iter().enumerate() {
        let protocol = port.protocol.as_str();
        let scheme = protocol.to_lowercase();
        let url = format!("{scheme}://{ip}:{}", port.port);
        if i == 0 {
            result.push(var(format!("{prefix}_PORT"), url.clone()));
        }
        let port_prefix = format!("{prefix}_PORT_{}_{protocol}", port.port);
        result.push(var(format!("{port_prefix}_PROTO"), scheme));
        result.push(var(format!("{port_prefix}_PORT"), port.port.to_string()));
        result.push(var(format!("{port_prefix}_ADDR"), ip.clone()));
        result.push(var(port_prefix, url));
    }
    result
}

fn env_var_name(name: &str) -> String {
    name.to_uppercase().replace('-', "_")
}

fn var(name: String, value: String) -> EnvVar {
    EnvVar { name, value }
}

#[cfg(test)]
mod tests {
    use api_types::ObjectMeta;
    use api_types::Protocol;
    use api_types::ServicePort;
    use api_types::ServiceSpec;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn service(name: &str, portal_ip: &str, ports: Vec<ServicePort>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec: ServiceSpec {
                ports,
                portal_ip: portal_ip.to_string(),
            },
        }
    }

    fn port(name: &str, protocol: Protocol, port: u16) -> ServicePort {
        ServicePort {
            name: name.to_string(),
            protocol,
            port,
        }
    }

    fn rendered(vars: Vec<EnvVar>) -> Vec<String> {
        let mut rendered: Vec<String> = vars
            .into_iter()
            .map(|v| format!("{}={}", v.name, v.value))
            .collect();
        rendered.sort();
        rendered
    }

    #[test]
    fn every_port_gets_link_variables() {
        let services = vec![service(
            "super-dns",
            "10.0.0.3",
            vec![
                port("", Protocol::Tcp, 53),
                port("dns-udp", Protocol::Udp, 5353),
            ],
        )];

        assert_eq!(
            rendered(from_services(&services)),
            vec![
                "SUPER_DNS_PORT=tcp://10.0.0.3:53",
                "SUPER_DNS_PORT_5353_UDP=udp://10.0.0.3:5353",
                "SUPER_DNS_PORT_5353_UDP_ADDR=10.0.0.3",
                "SUPER_DNS_PORT_5353_UDP_PORT=5353",
                "SUPER_DNS_PORT_5353_UDP_PROTO=udp",
                "SUPER_DNS_PORT_53_TCP=tcp://10.0.0.3:53",
                "SUPER_DNS_PORT_53_TCP_ADDR=10.0.0.3",
                "SUPER_DNS_PORT_53_TCP_PORT=53",
                "SUPER_DNS_PORT_53_TCP_PROTO=tcp",
                "SUPER_DNS_SERVICE_HOST=10.0.0.3",
                "SUPER_DNS_SERVICE_PORT=53",
                "SUPER_DNS_SERVICE_PORT_DNS_UDP=5353",
            ]
        );
    }

    #[test]
    fn services_without_portal_ip_are_skipped() {
        let ports = vec![port("", Protocol::Tcp, 80)];
        let services = vec![
            service("headless", "None", ports.clone()),
            service("pending", "", ports),
        ];
        assert!(from_services(&services).is_empty());
    }
}
