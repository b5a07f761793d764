//! Display geometry lookup for the screen recorder

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::is_geometry;

/// Source of the X display size
#[async_trait::async_trait]
pub trait DisplayInfo: Send + Sync {
    /// `WxH` of `display`, or `None` if it cannot be determined
    async fn geometry(&self, display: &str) -> Option<String>;
}

/// Queries `xdpyinfo`
pub struct XdpyInfo {
    program: String,
    timeout: Duration,
}

impl Default for XdpyInfo {
    fn default() -> Self {
        Self {
            program: "xdpyinfo".to_string(),
            timeout: Duration::from_secs(3),
        }
    }
}

impl XdpyInfo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DisplayInfo for XdpyInfo {
    async fn geometry(&self, display_name: &str) -> Option<String> {
        let output = Command::new(&self.program)
            .args(["-display", display_name])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) if output.status.success() => {
                parse_dimensions(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(Ok(output)) => {
                debug!(display = display_name, status = %output.status, "xdpyinfo failed");
                None
            }
            Ok(Err(e)) => {
                debug!(display = display_name, error = %e, "xdpyinfo unavailable");
                None
            }
            Err(_) => {
                debug!(display = display_name, "xdpyinfo timed out");
                None
            }
        }
    }
}

/// `WxH` from the `dimensions:` line of xdpyinfo output
pub fn parse_dimensions(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("dimensions:"))
        .and_then(|rest| rest.split_whitespace().next())
        .filter(|dims| is_geometry(dims))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dimensions() {
        let output = "name of display:    :1\n\
                      screen #0:\n  \
                      dimensions:    2560x1440 pixels (677x381 millimeters)\n  \
                      resolution:    96x96 dots per inch\n";
        assert_eq!(parse_dimensions(output).as_deref(), Some("2560x1440"));
        assert_eq!(parse_dimensions("no screens"), None);
        assert_eq!(parse_dimensions("  dimensions: unknown"), None);
    }

    #[tokio::test]
    async fn test_missing_tool_gives_none() {
        let info = XdpyInfo {
            program: "/nonexistent/xdpyinfo".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(info.geometry(":99").await, None);
    }
}
