//! Install scripts per OS family
//!
//! Every step is guarded so re-running on a provisioned host changes nothing
//! and only replays progress.

use crate::models::host::{Capability, OsFamily};

/// Root of everything the orchestrator keeps on a host
pub const REMOTE_ROOT: &str = "/opt/dockhand";

/// Directories that must exist on a ready host
pub fn required_directories() -> [String; 3] {
    [
        format!("{}/apps", REMOTE_ROOT),
        format!("{}/backups", REMOTE_ROOT),
        format!("{}/databases", REMOTE_ROOT),
    ]
}

const PRELUDE: &str = r#"set -euo pipefail
SUDO=""
if [ "$(id -u)" -ne 0 ]; then SUDO="sudo -n"; fi
"#;

/// Only directories created here change owner; existing trees such as
/// database volumes keep theirs
fn directories_step() -> String {
    let dirs = required_directories().join(" ");
    format!(
        r#"echo "PROGRESS:90:Preparing directories"
for d in {root} {dirs}; do
  if [ ! -d "$d" ]; then
    $SUDO mkdir -p "$d"
    $SUDO chown "$(id -un)" "$d"
  fi
done
"#,
        dirs = dirs,
        root = REMOTE_ROOT
    )
}

const EPILOGUE: &str = r#"echo "PROGRESS:100:Provisioning complete"
echo "DONE"
"#;

fn debian_script(distro: &str) -> String {
    format!(
        r#"export DEBIAN_FRONTEND=noninteractive
echo "PROGRESS:5:Updating package index"
$SUDO apt-get update -y -qq
echo "PROGRESS:15:Installing base packages"
$SUDO apt-get install -y -qq ca-certificates curl gnupg git tar gzip
echo "PROGRESS:30:Installing container engine"
if ! command -v docker >/dev/null 2>&1; then
  $SUDO install -m 0755 -d /etc/apt/keyrings
  curl -fsSL https://download.docker.com/linux/{distro}/gpg | $SUDO tee /etc/apt/keyrings/docker.asc >/dev/null
  $SUDO chmod a+r /etc/apt/keyrings/docker.asc
  echo "deb [arch=$(dpkg --print-architecture) signed-by=/etc/apt/keyrings/docker.asc] https://download.docker.com/linux/{distro} $(. /etc/os-release && echo "$VERSION_CODENAME") stable" | $SUDO tee /etc/apt/sources.list.d/docker.list >/dev/null
  $SUDO apt-get update -y -qq
  $SUDO apt-get install -y -qq docker-ce docker-ce-cli containerd.io docker-buildx-plugin docker-compose-plugin
fi
$SUDO systemctl enable --now docker
echo "PROGRESS:55:Installing compose tool"
if ! docker compose version >/dev/null 2>&1; then
  $SUDO apt-get install -y -qq docker-compose-plugin
fi
echo "PROGRESS:70:Installing language runtime"
if ! command -v node >/dev/null 2>&1; then
  curl -fsSL https://deb.nodesource.com/setup_20.x | $SUDO bash -
  $SUDO apt-get install -y -qq nodejs
fi
"#,
        distro = distro
    )
}

fn redhat_script(distro: &str) -> String {
    format!(
        r#"PKG="$(command -v dnf || command -v yum)"
echo "PROGRESS:5:Installing base packages"
$SUDO "$PKG" install -y -q ca-certificates curl git tar gzip
echo "PROGRESS:30:Installing container engine"
if ! command -v docker >/dev/null 2>&1; then
  $SUDO "$PKG" install -y -q dnf-plugins-core yum-utils || true
  $SUDO yum-config-manager --add-repo https://download.docker.com/linux/{distro}/docker-ce.repo
  $SUDO "$PKG" install -y -q docker-ce docker-ce-cli containerd.io docker-buildx-plugin docker-compose-plugin
fi
$SUDO systemctl enable --now docker
echo "PROGRESS:55:Installing compose tool"
if ! docker compose version >/dev/null 2>&1; then
  $SUDO "$PKG" install -y -q docker-compose-plugin
fi
echo "PROGRESS:70:Installing language runtime"
if ! command -v node >/dev/null 2>&1; then
  curl -fsSL https://rpm.nodesource.com/setup_20.x | $SUDO bash -
  $SUDO "$PKG" install -y -q nodejs
fi
"#,
        distro = distro
    )
}

/// Full install script for `family`, or `None` when unsupported
pub fn install_script(family: OsFamily) -> Option<String> {
    let body = match family {
        OsFamily::Ubuntu => debian_script("ubuntu"),
        OsFamily::Debian => debian_script("debian"),
        OsFamily::Centos => redhat_script("centos"),
        OsFamily::Rhel => redhat_script("rhel"),
        OsFamily::Unknown => return None,
    };
    Some(format!("{}{}{}{}", PRELUDE, body, directories_step(), EPILOGUE))
}

/// Command exiting zero iff `capability` is present
pub fn capability_probe(capability: Capability) -> String {
    match capability {
        Capability::ContainerEngine => {
            "command -v docker >/dev/null 2>&1 && docker info >/dev/null 2>&1".to_string()
        }
        Capability::ComposeTool => {
            "docker compose version >/dev/null 2>&1 || command -v docker-compose >/dev/null 2>&1"
                .to_string()
        }
        Capability::VcsClient => "command -v git >/dev/null 2>&1".to_string(),
        Capability::LanguageRuntime => "command -v node >/dev/null 2>&1".to_string(),
        Capability::Directories => required_directories()
            .iter()
            .map(|d| format!("test -d {}", d))
            .collect::<Vec<_>>()
            .join(" && "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_has_no_script() {
        assert!(install_script(OsFamily::Unknown).is_none());
    }

    #[test]
    fn test_script_variants_select_repository() {
        let ubuntu = install_script(OsFamily::Ubuntu).unwrap();
        assert!(ubuntu.contains("download.docker.com/linux/ubuntu"));
        assert!(ubuntu.contains("apt-get"));

        let rhel = install_script(OsFamily::Rhel).unwrap();
        assert!(rhel.contains("download.docker.com/linux/rhel/docker-ce.repo"));
        assert!(!rhel.contains("apt-get"));
    }

    #[test]
    fn test_script_reports_progress_and_ends_with_done() {
        let script = install_script(OsFamily::Debian).unwrap();
        assert!(script.contains("PROGRESS:5:"));
        assert!(script.trim_end().ends_with("echo \"DONE\""));
        assert!(script.contains("if ! command -v docker"));
    }

    #[test]
    fn test_directories_never_chown_existing_trees() {
        for os in [OsFamily::Ubuntu, OsFamily::Debian, OsFamily::Centos, OsFamily::Rhel] {
            let script = install_script(os).unwrap();
            assert!(!script.contains("chown -R"), "{:?}", os);
            assert!(script.contains("if [ ! -d \"$d\" ]; then"));
            assert!(script.contains("$SUDO chown \"$(id -un)\" \"$d\""));
        }
    }

    #[test]
    fn test_directories_probe() {
        let probe = capability_probe(Capability::Directories);
        assert_eq!(
            probe,
            "test -d /opt/dockhand/apps && test -d /opt/dockhand/backups && test -d /opt/dockhand/databases"
        );
    }
}
