//! External classic-stack tool bindings.
//!
//! Reachability pings and the textual SDP fallback go through userspace
//! tools on the host. Behind a trait so the rest of the classic stack can
//! run against scripted outputs in tests.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

/// Reachability ping statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct PingStats {
    pub rtt_avg_ms: f64,
    pub responses: u32,
}

#[async_trait]
pub trait ClassicTools: Send + Sync {
    /// L2CAP echo ping; `Err` carries a short cause suitable for surfacing.
    async fn l2ping(&self, mac: &str, count: u32, timeout_secs: u64) -> Result<PingStats, String>;

    /// Raw textual output of an SDP browse against the target.
    async fn sdp_browse(&self, mac: &str, timeout_secs: u64) -> Result<String, String>;

    /// Raw controller version line(s) for the local adapter.
    async fn controller_version(&self, adapter: &str) -> Result<String, String>;
}

/// Bindings to the host's `l2ping` / `sdptool` / `hciconfig` binaries.
pub struct SystemClassicTools;

async fn run_tool(program: &str, args: &[&str], timeout_secs: u64) -> Result<String, String> {
    let command = tokio::process::Command::new(program)
        .args(args)
        .output();
    let output = tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), command)
        .await
        .map_err(|_| format!("{program} timed out after {timeout_secs}s"))?
        .map_err(|e| format!("{program}: {e}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
            return Err("requires CAP_NET_RAW (run with elevated privileges)".to_string());
        }
        return Err(if stderr.is_empty() {
            format!("{program} exited with {}", output.status)
        } else {
            stderr
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Both the legacy `time 23.4ms` and the parenthesised `(23.4 ms)` output
/// shapes occur in the wild.
pub(crate) fn parse_rtts(output: &str) -> Vec<f64> {
    let rx = Regex::new(r"(?i)time\s*([0-9.]+)\s*ms|\(([0-9.]+)\s*ms\)").expect("static regex");
    rx.captures_iter(output)
        .filter_map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .and_then(|m| m.as_str().parse::<f64>().ok())
        })
        .collect()
}

#[async_trait]
impl ClassicTools for SystemClassicTools {
    async fn l2ping(&self, mac: &str, count: u32, timeout_secs: u64) -> Result<PingStats, String> {
        let mac = mac.trim().to_ascii_uppercase();
        let count_arg = count.to_string();
        debug!(target: "bleep::classic", mac = %mac, count, "running reachability ping");
        let output = run_tool("l2ping", &["-c", &count_arg, &mac], timeout_secs).await?;
        let rtts = parse_rtts(&output);
        if rtts.is_empty() {
            return Err("no echo responses parsed (check reachability and CAP_NET_RAW)".to_string());
        }
        Ok(PingStats {
            rtt_avg_ms: rtts.iter().sum::<f64>() / rtts.len() as f64,
            responses: rtts.len() as u32,
        })
    }

    async fn sdp_browse(&self, mac: &str, timeout_secs: u64) -> Result<String, String> {
        let mac = mac.trim().to_ascii_uppercase();
        // `browse --tree` is faster; `records` is the thorough fallback.
        match run_tool("sdptool", &["browse", "--tree", &mac], timeout_secs).await {
            Ok(output) if !output.trim().is_empty() => Ok(output),
            _ => run_tool("sdptool", &["records", &mac], timeout_secs * 2).await,
        }
    }

    async fn controller_version(&self, adapter: &str) -> Result<String, String> {
        run_tool("hciconfig", &["-a", adapter], 5).await
    }
}
