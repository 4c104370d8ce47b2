//! Provisioning script output protocol
//!
//! The install script reports `PROGRESS:<0-100>:<message>` lines and ends with
//! a bare `DONE` line on success.

use std::sync::OnceLock;

use regex::Regex;

pub const DONE_SENTINEL: &str = "DONE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressLine {
    pub percent: u8,
    pub message: String,
}

pub fn parse_progress(line: &str) -> Option<ProgressLine> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"^PROGRESS:(\d{1,3}):(.*)$").ok())
        .as_ref()?;
    let caps = re.captures(line.trim())?;
    let percent: u16 = caps.get(1)?.as_str().parse().ok()?;
    Some(ProgressLine {
        percent: percent.min(100) as u8,
        message: caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
    })
}

pub fn is_done(line: &str) -> bool {
    line.trim() == DONE_SENTINEL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress() {
        assert_eq!(
            parse_progress("PROGRESS:40:Installing container engine"),
            Some(ProgressLine {
                percent: 40,
                message: "Installing container engine".into()
            })
        );
        assert_eq!(parse_progress("PROGRESS:250:over").map(|p| p.percent), Some(100));
        assert!(parse_progress("Reading package lists...").is_none());
        assert!(parse_progress("PROGRESS:x:bad").is_none());
    }

    #[test]
    fn test_done_sentinel() {
        assert!(is_done("DONE"));
        assert!(is_done("DONE\r"));
        assert!(!is_done("DONE!"));
    }
}
