//! PulseAudio readiness and virtual device provisioning
//!
//! Creates the devices the relay depends on, all through `pactl`:
//! - the output null sink whose monitor is captured,
//! - the mic null sink the playback process writes into,
//! - a remap source over the mic sink's monitor, since browsers hide
//!   monitor sources from device enumeration.
//!
//! Every step is idempotent; existing devices are left alone.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::{AppConfig, PulseConfig};
use crate::error::AudioError;

/// Limit on a single `pactl` invocation
const PACTL_TIMEOUT: Duration = Duration::from_secs(2);

/// Thin async wrapper around `pactl`
pub struct PulseAudio {
    program: String,
    /// Arguments placed before every subcommand
    base_args: Vec<String>,
    env: Vec<(String, String)>,
    poll_interval: Duration,
}

impl PulseAudio {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            program: "pactl".to_string(),
            base_args: Vec::new(),
            env: config.pulse_env(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Run `program base_args... <subcommand>` instead of `pactl`
    pub fn with_command(mut self, program: impl Into<String>, base_args: Vec<String>) -> Self {
        self.program = program.into();
        self.base_args = base_args;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn pactl(&self, args: &[&str]) -> Result<String, AudioError> {
        let command = format!("pactl {}", args.join(" "));
        let output = Command::new(&self.program)
            .args(&self.base_args)
            .args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(PACTL_TIMEOUT, output)
            .await
            .map_err(|_| AudioError::Provisioning(format!("{}: timed out", command)))?
            .map_err(|e| AudioError::Provisioning(format!("{}: {}", command, e)))?;

        if !output.status.success() {
            return Err(AudioError::Provisioning(format!(
                "{}: {} {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Poll `pactl info` until the server answers
    pub async fn wait_until_ready(&self, retries: u32) -> Result<(), AudioError> {
        for attempt in 1..=retries {
            if self.pactl(&["info"]).await.is_ok() {
                info!("PulseAudio is ready");
                return Ok(());
            }
            info!("Waiting for PulseAudio ({}/{})", attempt, retries);
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(AudioError::ServerNotReady(retries))
    }

    /// Names from `pactl list <kind> short`
    pub async fn list_names(&self, kind: &str) -> Result<Vec<String>, AudioError> {
        let output = self.pactl(&["list", kind, "short"]).await?;
        Ok(parse_short_list(&output))
    }

    /// Create a null sink unless one with this name exists.
    /// Returns whether it was created.
    pub async fn ensure_null_sink(&self, name: &str, description: &str) -> Result<bool, AudioError> {
        if self.list_names("sinks").await?.iter().any(|n| n == name) {
            info!(sink = name, "Null sink already exists");
            return Ok(false);
        }

        self.pactl(&[
            "load-module",
            "module-null-sink",
            &format!("sink_name={}", name),
            &format!("sink_properties=device.description={}", description),
        ])
        .await?;
        info!(sink = name, "Null sink created");
        Ok(true)
    }

    /// Wrap `master` as a plain (non-monitor) source
    pub async fn ensure_remap_source(&self, name: &str, master: &str, description: &str) -> Result<bool, AudioError> {
        if self.list_names("sources").await?.iter().any(|n| n == name) {
            info!(source = name, "Remap source already exists");
            return Ok(false);
        }

        self.pactl(&[
            "load-module",
            "module-remap-source",
            &format!("source_name={}", name),
            &format!("master={}", master),
            &format!("source_properties=device.description={}", description),
        ])
        .await?;
        info!(source = name, master, "Remap source created");
        Ok(true)
    }

    pub async fn set_default_sink(&self, name: &str) -> Result<(), AudioError> {
        self.pactl(&["set-default-sink", name]).await?;
        info!(sink = name, "Default sink set");
        Ok(())
    }

    pub async fn set_default_source(&self, name: &str) -> Result<(), AudioError> {
        self.pactl(&["set-default-source", name]).await?;
        info!(source = name, "Default source set");
        Ok(())
    }

    /// Wait for a sink to show up. Not finding it is only a warning.
    pub async fn wait_for_sink(&self, name: &str, retries: u32) -> bool {
        for attempt in 1..=retries {
            if let Ok(names) = self.list_names("sinks").await {
                if names.iter().any(|n| n == name) {
                    return true;
                }
            }
            info!(sink = name, "Waiting for sink ({}/{})", attempt, retries);
            tokio::time::sleep(self.poll_interval).await;
        }
        warn!(sink = name, "Sink not found, capture may fail");
        false
    }

    /// Output sink, mic sink and mic source. Step failures are logged and
    /// the remaining steps still run.
    pub async fn provision(&self, pulse: &PulseConfig) {
        let output = async {
            self.ensure_null_sink(&pulse.null_sink, "WebcodeAudio").await?;
            self.set_default_sink(&pulse.null_sink).await
        };
        if let Err(e) = output.await {
            error!(error = %e, "Setting up output sink failed");
        }

        self.wait_for_sink(&pulse.null_sink, pulse.sink_retries).await;

        let input = async {
            self.ensure_null_sink(&pulse.input_sink, "WebcodeMic").await?;
            let master = format!("{}.monitor", pulse.input_sink);
            self.ensure_remap_source(&pulse.mic_source, &master, "WebcodeMicrophone").await?;
            self.set_default_source(&pulse.mic_source).await
        };
        if let Err(e) = input.await {
            error!(error = %e, "Setting up mic input failed");
        }
    }
}

/// Second column of `pactl list ... short` output
fn parse_short_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `pactl` stand-in: a shell script receiving the subcommand as `$@`
    fn fake_pactl(script: &str) -> PulseAudio {
        PulseAudio::new(&AppConfig::default())
            .with_command("sh", vec!["-c".to_string(), script.to_string(), "pactl".to_string()])
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_parse_short_list() {
        let output = "1\twebcode_null\tmodule-null-sink.c\ts16le 2ch 48000Hz\tIDLE\n\
                      2\twebcode_input\tmodule-null-sink.c\ts16le 2ch 48000Hz\tSUSPENDED\n";
        assert_eq!(parse_short_list(output), vec!["webcode_null", "webcode_input"]);
        assert!(parse_short_list("").is_empty());
    }

    #[tokio::test]
    async fn test_never_ready_is_fatal() {
        let err = fake_pactl("exit 1").wait_until_ready(3).await.unwrap_err();
        assert!(matches!(err, AudioError::ServerNotReady(3)));
    }

    #[tokio::test]
    async fn test_provisioning_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        // webcode_null exists already; everything else must be created
        let pulse = fake_pactl(&format!(
            r#"case "$1" in
  info) exit 0 ;;
  list)
    if [ "$2" = sinks ]; then printf '1\twebcode_null\tmodule-null-sink.c\n'; fi ;;
  *) echo "$@" >> '{}' ;;
esac"#,
            log.display()
        ));

        pulse.wait_until_ready(1).await.unwrap();
        pulse.provision(&PulseConfig { sink_retries: 1, ..PulseConfig::default() }).await;

        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(
            calls,
            vec![
                "set-default-sink webcode_null",
                "load-module module-null-sink sink_name=webcode_input sink_properties=device.description=WebcodeMic",
                "load-module module-remap-source source_name=webcode_mic master=webcode_input.monitor source_properties=device.description=WebcodeMicrophone",
                "set-default-source webcode_mic",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_sink_is_not_fatal() {
        assert!(!fake_pactl("exit 0").wait_for_sink("webcode_null", 2).await);
    }
}
