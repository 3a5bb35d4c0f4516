//! PBAP phonebook transfer over OBEX.
//!
//! Establishes an OBEX session targeted at PBAP, walks the requested
//! repositories, pulls each as vCard 2.1 or 3.0, moves the transferred file
//! into its destination and records a metadata row (repository, entry
//! count, content hash). A watchdog aborts the transfer when no progress is
//! observed within its window; the session is always disposed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lib_bus::{
    AgentCallbacks, AgentCapability, BusError, BusResult, BusSignal, BusTransport, IpcValue,
    OBEX_CLIENT_IFACE, OBEX_PBAP_IFACE, OBEX_ROOT_PATH, OBEX_SERVICE, OBEX_TRANSFER_IFACE,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::context::Context;

pub const DEFAULT_PBAP_REPOS: [&str; 7] = ["PB", "ICH", "OCH", "MCH", "CCH", "SPD", "FAV"];

const OBEX_AGENT_PATH: &str = "/bleep/obex_agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcardFormat {
    V21,
    V30,
}

impl VcardFormat {
    fn wire_name(self) -> &'static str {
        match self {
            VcardFormat::V21 => "vcard21",
            VcardFormat::V30 => "vcard30",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PbapOptions {
    pub repos: Vec<String>,
    pub vcard_format: VcardFormat,
    /// Abort when no transfer progress is seen within this window.
    pub watchdog: Duration,
    /// Destination directory; defaults to the dated reports directory.
    pub dest_dir: Option<PathBuf>,
    /// Register an in-process OBEX agent that auto-accepts authentication.
    pub auto_auth: bool,
}

impl Default for PbapOptions {
    fn default() -> Self {
        Self {
            repos: DEFAULT_PBAP_REPOS.iter().map(|r| r.to_string()).collect(),
            vcard_format: VcardFormat::V21,
            watchdog: Duration::from_secs(8),
            dest_dir: None,
            auto_auth: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhonebookPull {
    pub repo: String,
    pub path: PathBuf,
    pub entries: i64,
    pub hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct PbapResult {
    pub pulls: Vec<PhonebookPull>,
    /// Repositories the peer refused to select.
    pub skipped: Vec<String>,
}

/// Auto-accepting agent used for peers that insist on OBEX authentication.
struct AutoAcceptObexAgent;

#[async_trait]
impl AgentCallbacks for AutoAcceptObexAgent {
    async fn release(&self) {}
    async fn request_pin_code(&self, _device: &str) -> BusResult<String> {
        Ok(String::new())
    }
    async fn display_pin_code(&self, _device: &str, _pin: &str) -> BusResult<()> {
        Ok(())
    }
    async fn request_passkey(&self, _device: &str) -> BusResult<u32> {
        Ok(0)
    }
    async fn display_passkey(&self, _device: &str, _passkey: u32, _entered: u16) {}
    async fn request_confirmation(&self, _device: &str, _passkey: u32) -> BusResult<()> {
        Ok(())
    }
    async fn request_authorization(&self, _device: &str) -> BusResult<()> {
        Ok(())
    }
    async fn authorize_service(&self, _device: &str, _uuid: &str) -> BusResult<()> {
        Ok(())
    }
    async fn cancel(&self) {}
}

fn move_file(from: &PathBuf, to: &PathBuf) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)
}

async fn wait_for_transfer(
    ctx: &Arc<Context>,
    mut signals: tokio::sync::broadcast::Receiver<BusSignal>,
    transfer_path: &str,
    watchdog: Duration,
) -> BusResult<()> {
    loop {
        let event = tokio::time::timeout(watchdog, signals.recv()).await;
        match event {
            Err(_) => {
                // No progress inside the watchdog window.
                ctx.metrics.increment_counter("pbap.watchdog_aborts");
                return Err(BusError::OperationTimeout {
                    op: "pbap".to_string(),
                    budget: watchdog,
                    context: format!("no transfer progress on {transfer_path}"),
                });
            }
            Ok(Err(_)) => {
                return Err(BusError::NoReply("obex signal stream closed".to_string()));
            }
            Ok(Ok(BusSignal::PropertiesChanged {
                path,
                interface,
                changed,
                ..
            })) if path == transfer_path && interface == OBEX_TRANSFER_IFACE => {
                match changed.get("Status").and_then(IpcValue::as_str) {
                    Some("complete") => return Ok(()),
                    Some("error") => {
                        return Err(BusError::Failed(format!(
                            "transfer {transfer_path} reported an error"
                        )))
                    }
                    // queued/active updates kick the watchdog
                    _ => {}
                }
            }
            Ok(Ok(_)) => {}
        }
    }
}

/// Pull the requested phonebook repositories from a device.
pub async fn pull_phonebook(
    ctx: &Arc<Context>,
    mac: &str,
    opts: &PbapOptions,
) -> BusResult<PbapResult> {
    let mac = mac.trim().to_ascii_lowercase();
    let dest_dir = opts
        .dest_dir
        .clone()
        .unwrap_or_else(|| ctx.config.reports_dir());
    std::fs::create_dir_all(&dest_dir)
        .map_err(|e| BusError::Failed(format!("create {}: {e}", dest_dir.display())))?;

    let mut agent_registered = false;
    if opts.auto_auth {
        match ctx
            .bus
            .register_agent(
                OBEX_AGENT_PATH,
                AgentCapability::NoInputNoOutput,
                Arc::new(AutoAcceptObexAgent),
            )
            .await
        {
            Ok(()) => agent_registered = true,
            // An agent is already serving requests; good enough.
            Err(BusError::AlreadyExists(_)) => {}
            Err(err) => {
                warn!(target: "bleep::pbap", error = %err, "OBEX agent registration failed");
            }
        }
    }

    let result = pull_phonebook_inner(ctx, &mac, opts, &dest_dir).await;

    if agent_registered {
        let _ = ctx.bus.unregister_agent(OBEX_AGENT_PATH).await;
    }
    result
}

async fn pull_phonebook_inner(
    ctx: &Arc<Context>,
    mac: &str,
    opts: &PbapOptions,
    dest_dir: &PathBuf,
) -> BusResult<PbapResult> {
    let client = ctx
        .pool
        .get_proxy(OBEX_SERVICE, OBEX_ROOT_PATH, OBEX_CLIENT_IFACE)
        .await?;
    let mut session_args = std::collections::BTreeMap::new();
    session_args.insert("Target".to_string(), IpcValue::Str("PBAP".to_string()));
    let session_path = client
        .call(
            "CreateSession",
            vec![
                IpcValue::Str(mac.to_ascii_uppercase()),
                IpcValue::Dict(session_args),
            ],
        )
        .await?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| BusError::Failed("CreateSession returned no path".to_string()))?;

    let outcome = run_session(ctx, mac, opts, dest_dir, &session_path).await;

    // The session is disposed on success and on every failure path.
    let _ = client
        .call(
            "RemoveSession",
            vec![IpcValue::ObjectPath(session_path.clone())],
        )
        .await;

    outcome
}

async fn run_session(
    ctx: &Arc<Context>,
    mac: &str,
    opts: &PbapOptions,
    dest_dir: &PathBuf,
    session_path: &str,
) -> BusResult<PbapResult> {
    let pbap = ctx
        .pool
        .get_proxy(OBEX_SERVICE, session_path, OBEX_PBAP_IFACE)
        .await?;

    let mut result = PbapResult::default();
    for repo in &opts.repos {
        match pbap
            .call(
                "Select",
                vec![
                    IpcValue::Str("int".to_string()),
                    IpcValue::Str(repo.clone()),
                ],
            )
            .await
        {
            Ok(_) => {}
            Err(err) => {
                debug!(target: "bleep::pbap", repo = %repo, error = %err, "repository not selectable");
                result.skipped.push(repo.clone());
                continue;
            }
        }

        let mut filters = std::collections::BTreeMap::new();
        filters.insert(
            "Format".to_string(),
            IpcValue::Str(opts.vcard_format.wire_name().to_string()),
        );
        // Subscribe before the pull so no status flip is missed.
        let signals = ctx.bus.subscribe();
        let reply = pbap
            .call(
                "PullAll",
                vec![IpcValue::Str(String::new()), IpcValue::Dict(filters)],
            )
            .await?;
        let reply_dict = reply
            .as_dict()
            .ok_or_else(|| BusError::Failed("PullAll returned no transfer".to_string()))?;
        let transfer_path = reply_dict
            .get("Transfer")
            .and_then(IpcValue::as_str)
            .ok_or_else(|| BusError::Failed("PullAll reply lacks a transfer path".to_string()))?
            .to_string();
        let filename = reply_dict
            .get("Filename")
            .and_then(IpcValue::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| BusError::Failed("PullAll reply lacks a filename".to_string()))?;

        if let Err(err) = wait_for_transfer(ctx, signals, &transfer_path, opts.watchdog).await {
            // Abort: no partial phonebook file may remain.
            let _ = std::fs::remove_file(&filename);
            return Err(err);
        }

        let bytes = std::fs::read(&filename)
            .map_err(|e| BusError::Failed(format!("read {}: {e}", filename.display())))?;
        let dest = dest_dir.join(format!("{}_{}.vcf", mac.replace(':', ""), repo.to_lowercase()));
        move_file(&filename, &dest)
            .map_err(|e| BusError::Failed(format!("move to {}: {e}", dest.display())))?;

        let entries = bytes
            .windows(b"BEGIN:VCARD".len())
            .filter(|window| *window == b"BEGIN:VCARD")
            .count() as i64;
        let hash = hex::encode(Sha256::digest(&bytes));
        if let Err(err) = ctx
            .store
            .upsert_pbap_metadata(mac, repo, entries, &hash)
            .await
        {
            warn!(target: "bleep::pbap", error = %err, "metadata row write failed");
            ctx.metrics.increment_counter("store.write_failures");
        }
        info!(
            target: "bleep::pbap",
            mac,
            repo = %repo,
            entries,
            dest = %dest.display(),
            "phonebook repository pulled"
        );
        result.pulls.push(PhonebookPull {
            repo: repo.clone(),
            path: dest,
            entries,
            hash,
        });
    }
    Ok(result)
}
