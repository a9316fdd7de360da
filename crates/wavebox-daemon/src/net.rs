//! Link watcher and WPS provisioning runner.
//!
//! The watcher polls the kernel's view of the interface (carrier and signal
//! level) and emits events only on change, so the connectivity tracker sees
//! edges, not levels. Reconnect backoff is the supplicant's job; nothing
//! here retries.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use wavebox_core::connectivity::LinkEvent;

use crate::engine::EngineEvent;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const WPS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Parse `/sys/class/net/<if>/operstate` content.
pub fn parse_operstate(content: &str) -> bool {
    content.trim() == "up"
}

/// Extract the signal level in dBm for `interface` from `/proc/net/wireless`.
pub fn parse_wireless(content: &str, interface: &str) -> Option<i32> {
    for line in content.lines().skip(2) {
        let mut fields = line.split_whitespace();
        let name = fields.next()?.trim_end_matches(':');
        if name != interface {
            continue;
        }
        // status, link quality, then signal level (e.g. "-47.")
        let level = fields.nth(2)?.trim_end_matches('.');
        return level.parse::<f64>().ok().map(|v| v as i32);
    }
    None
}

/// Parse `wpa_cli status` output for the supplicant state.
pub fn parse_wpa_state(output: &str) -> Option<&str> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("wpa_state="))
        .map(str::trim)
}

pub fn spawn_link_watcher(
    interface: String,
    event_tx: mpsc::Sender<EngineEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let operstate_path = format!("/sys/class/net/{}/operstate", interface);
        let mut last_up: Option<bool> = None;
        let mut last_rssi: Option<i32> = None;
        let mut ticker = tokio::time::interval(POLL_INTERVAL);

        loop {
            ticker.tick().await;

            let up = match tokio::fs::read_to_string(&operstate_path).await {
                Ok(content) => parse_operstate(&content),
                Err(_) => false,
            };
            if last_up != Some(up) {
                last_up = Some(up);
                let event = if up {
                    LinkEvent::LinkUp
                } else {
                    LinkEvent::LinkDown
                };
                if event_tx.send(EngineEvent::Link(event)).await.is_err() {
                    return;
                }
            }

            let rssi = match tokio::fs::read_to_string("/proc/net/wireless").await {
                Ok(content) => parse_wireless(&content, &interface),
                Err(_) => None,
            };
            if rssi != last_rssi {
                last_rssi = rssi;
                if event_tx.send(EngineEvent::Rssi(rssi)).await.is_err() {
                    return;
                }
            }
        }
    })
}

/// Run the push-button pairing flow: start WPS, poll the supplicant until it
/// completes or the timeout expires. Exactly one outcome event is emitted.
pub fn spawn_wps(
    interface: String,
    timeout: Duration,
    event_tx: mpsc::Sender<EngineEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("WPS: starting push-button pairing on {}", interface);
        let outcome = run_wps(&interface, timeout).await;
        match &outcome {
            LinkEvent::ProvisioningSucceeded => info!("WPS: credentials acquired"),
            LinkEvent::ProvisioningTimedOut => {
                warn!("WPS: timed out, trying normal connect");
                cancel_wps(&interface).await;
            }
            _ => warn!("WPS: failed, trying normal connect"),
        }
        let _ = event_tx.send(EngineEvent::Link(outcome)).await;
    })
}

async fn run_wps(interface: &str, timeout: Duration) -> LinkEvent {
    match wpa_cli(interface, &["wps_pbc"]).await {
        Ok(out) if out.contains("OK") => {}
        Ok(out) => {
            warn!("WPS: wps_pbc rejected: {}", out.trim());
            return LinkEvent::ProvisioningFailed;
        }
        Err(e) => {
            warn!("WPS: could not run supplicant client: {}", e);
            return LinkEvent::ProvisioningFailed;
        }
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        tokio::time::sleep(WPS_POLL_INTERVAL).await;
        if tokio::time::Instant::now() >= deadline {
            return LinkEvent::ProvisioningTimedOut;
        }
        match wpa_cli(interface, &["status"]).await {
            Ok(out) => match parse_wpa_state(&out) {
                Some("COMPLETED") => return LinkEvent::ProvisioningSucceeded,
                Some("DISCONNECTED") | Some("INACTIVE") => {
                    // Supplicant gave up on the exchange.
                    return LinkEvent::ProvisioningFailed;
                }
                _ => {} // SCANNING / ASSOCIATING / WPS in progress
            },
            Err(e) => {
                warn!("WPS: status poll failed: {}", e);
                return LinkEvent::ProvisioningFailed;
            }
        }
    }
}

async fn cancel_wps(interface: &str) {
    let _ = wpa_cli(interface, &["wps_cancel"]).await;
}

/// Kick a normal association after provisioning ends, whatever the outcome.
pub async fn reassociate(interface: &str) {
    match wpa_cli(interface, &["reassociate"]).await {
        Ok(_) => info!("net: reassociate requested on {}", interface),
        Err(e) => warn!("net: reassociate failed: {}", e),
    }
}

async fn wpa_cli(interface: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::process::Command::new("wpa_cli")
        .arg("-i")
        .arg(interface)
        .args(args)
        .output()
        .await?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
