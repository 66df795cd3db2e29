//! Connection banner.
//!
//! The server writes one newline-terminated banner line immediately after
//! accepting a connection:
//!
//! ```text
//! SYSRELAY-<major>.<minor>-<platform>\n
//! ```
//!
//! The client reads up to the newline and validates the protocol id and
//! major version before attempting a handshake.

use crate::header::WireError;

/// Protocol identifier leading the banner line.
pub const PROTOCOL_ID: &str = "SYSRELAY";

/// Protocol major version; a mismatch refuses the connection.
pub const PROTOCOL_MAJOR: u32 = 1;

/// Protocol minor version; informational.
pub const PROTOCOL_MINOR: u32 = 0;

/// Upper bound on a banner line, newline included. A peer that streams
/// more than this before a newline is not speaking the protocol.
pub const MAX_BANNER_LEN: usize = 128;

/// A parsed banner line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    pub major: u32,
    pub minor: u32,
    pub platform: String,
}

/// Formats the banner line this build writes, newline included.
pub fn format_banner() -> String {
    format!(
        "{}-{}.{}-{}/{}\n",
        PROTOCOL_ID,
        PROTOCOL_MAJOR,
        PROTOCOL_MINOR,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Parses and validates a banner line. The line must end in a newline,
/// carry the expected protocol id, and match the major version.
pub fn parse_banner(line: &str) -> Result<Banner, WireError> {
    let stripped = line
        .strip_suffix('\n')
        .ok_or_else(|| WireError::BadBanner("missing newline terminator".to_string()))?;
    let mut parts = stripped.splitn(3, '-');
    let id = parts.next().unwrap_or_default();
    let version = parts
        .next()
        .ok_or_else(|| WireError::BadBanner("missing version field".to_string()))?;
    let platform = parts
        .next()
        .ok_or_else(|| WireError::BadBanner("missing platform field".to_string()))?;

    if id != PROTOCOL_ID {
        return Err(WireError::BadBanner(format!("unknown protocol id {id:?}")));
    }
    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| WireError::BadBanner(format!("malformed version {version:?}")))?;
    let major: u32 = major
        .parse()
        .map_err(|_| WireError::BadBanner(format!("malformed version {version:?}")))?;
    let minor: u32 = minor
        .parse()
        .map_err(|_| WireError::BadBanner(format!("malformed version {version:?}")))?;

    if major != PROTOCOL_MAJOR {
        return Err(WireError::VersionMismatch { major, minor });
    }
    Ok(Banner {
        major,
        minor,
        platform: platform.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_banner_parses() {
        let banner = parse_banner(&format_banner()).unwrap();
        assert_eq!(banner.major, PROTOCOL_MAJOR);
        assert_eq!(banner.minor, PROTOCOL_MINOR);
        assert!(!banner.platform.is_empty());
    }

    #[test]
    fn test_platform_may_contain_dashes() {
        let banner = parse_banner("SYSRELAY-1.0-linux-gnu/x86_64\n").unwrap();
        assert_eq!(banner.platform, "linux-gnu/x86_64");
    }

    #[test]
    fn test_missing_newline_rejected() {
        assert!(matches!(
            parse_banner("SYSRELAY-1.0-linux"),
            Err(WireError::BadBanner(_))
        ));
    }

    #[test]
    fn test_wrong_id_rejected() {
        assert!(matches!(
            parse_banner("SOMETHING-1.0-linux\n"),
            Err(WireError::BadBanner(_))
        ));
    }

    #[test]
    fn test_major_mismatch_rejected() {
        assert_eq!(
            parse_banner("SYSRELAY-2.0-linux\n"),
            Err(WireError::VersionMismatch { major: 2, minor: 0 })
        );
    }

    #[test]
    fn test_garbage_version_rejected() {
        assert!(matches!(
            parse_banner("SYSRELAY-one.zero-linux\n"),
            Err(WireError::BadBanner(_))
        ));
    }
}
