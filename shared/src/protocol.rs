/// mDNS service type for the hub's own API advertisement
pub const HUB_SERVICE_TYPE: &str = "_ledhub._tcp.local.";

/// Service type announced by raw UDP LED receivers
pub const UDPRAW_SERVICE_TYPE: &str = "_udpraw._udp.local.";

/// TXT record keys used in the hub advertisement
pub const TXT_VERSION: &str = "version";
pub const TXT_DEVICE: &str = "device";

/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Instance-name filter that matches every discovered service
pub const MATCH_ALL_FILTER: &str = ".*";

const LOCAL_DOMAIN: &str = "local.";

/// Brings a service type into the fully qualified form used as a
/// subscription key, so "_hue._tcp" and "_hue._tcp.local." are the same type.
pub fn normalize_service_type(service_type: &str) -> String {
    let trimmed = service_type.trim().trim_end_matches('.');
    if trimmed.ends_with(".local") {
        format!("{}.", trimmed)
    } else {
        format!("{}.{}", trimmed, LOCAL_DOMAIN)
    }
}

/// Strips the service type suffix from a DNS-SD full name,
/// e.g. "kitchen._hue._tcp.local." -> "kitchen".
pub fn instance_from_fullname<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    let service_type = normalize_service_type(service_type);
    fullname
        .trim_end_matches('.')
        .strip_suffix(service_type.trim_end_matches('.'))
        .map(|name| name.trim_end_matches('.'))
        .filter(|name| !name.is_empty())
        .unwrap_or(fullname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_service_type() {
        assert_eq!(normalize_service_type("_hue._tcp"), "_hue._tcp.local.");
        assert_eq!(normalize_service_type("_hue._tcp.local."), "_hue._tcp.local.");
        assert_eq!(normalize_service_type("_hue._tcp.local"), "_hue._tcp.local.");
    }

    #[test]
    fn test_instance_from_fullname() {
        assert_eq!(
            instance_from_fullname("kitchen._hue._tcp.local.", "_hue._tcp.local."),
            "kitchen"
        );
        assert_eq!(
            instance_from_fullname("Living Room._hue._tcp.local.", "_hue._tcp"),
            "Living Room"
        );
        // unrelated names are passed through untouched
        assert_eq!(
            instance_from_fullname("other._x._udp.local.", "_hue._tcp.local."),
            "other._x._udp.local."
        );
    }
}
