//! `/etc/os-release` parsing

use std::collections::HashMap;

use crate::models::host::OsFamily;

/// Detected OS family and version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsRelease {
    pub family: OsFamily,
    pub version: Option<String>,
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"').trim_matches('\'')
}

fn family_for(id: &str) -> OsFamily {
    match id {
        "ubuntu" => OsFamily::Ubuntu,
        "debian" => OsFamily::Debian,
        "centos" => OsFamily::Centos,
        "rhel" | "rocky" | "almalinux" => OsFamily::Rhel,
        _ => OsFamily::Unknown,
    }
}

pub fn parse_os_release(contents: &str) -> OsRelease {
    let fields: HashMap<&str, &str> = contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), unquote(value)))
        .collect();

    let id = fields.get("ID").map(|id| id.to_lowercase()).unwrap_or_default();
    let mut family = family_for(&id);

    if family == OsFamily::Unknown {
        if let Some(like) = fields.get("ID_LIKE") {
            family = like
                .split_whitespace()
                .map(|candidate| family_for(&candidate.to_lowercase()))
                .find(|f| *f != OsFamily::Unknown)
                .unwrap_or(OsFamily::Unknown);
        }
    }

    OsRelease {
        family,
        version: fields.get("VERSION_ID").map(|v| v.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ubuntu() {
        let release = parse_os_release(
            "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nID=ubuntu\nID_LIKE=debian\n",
        );
        assert_eq!(release.family, OsFamily::Ubuntu);
        assert_eq!(release.version.as_deref(), Some("22.04"));
    }

    #[test]
    fn test_rocky_maps_to_rhel() {
        let release = parse_os_release("ID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\nVERSION_ID=\"9.3\"\n");
        assert_eq!(release.family, OsFamily::Rhel);
    }

    #[test]
    fn test_id_like_fallback() {
        let release = parse_os_release("ID=linuxmint\nID_LIKE=\"ubuntu debian\"\n");
        assert_eq!(release.family, OsFamily::Ubuntu);
    }

    #[test]
    fn test_unknown() {
        let release = parse_os_release("ID=arch\n");
        assert_eq!(release.family, OsFamily::Unknown);
        assert!(release.version.is_none());
    }
}
