use std::net::IpAddr;

use thiserror::Error;
use tokio::process::Command;

use super::PacketFilter;

#[derive(Debug, Error)]
pub enum IptablesError {
    #[error("failed to invoke iptables: {0}")]
    Io(#[from] std::io::Error),
    #[error("iptables {0} returned a failure status")]
    Command(&'static str),
}

/// Forwarding-chain reject rule scoped to the subscriber source address,
/// managed through the system `iptables` utility.
#[derive(Debug, Default)]
pub struct Iptables;

impl Iptables {
    pub fn new() -> Self {
        Self
    }
}

impl PacketFilter for Iptables {
    type Error = IptablesError;

    async fn probe(&self, addr: IpAddr) -> Result<bool, IptablesError> {
        // The table holds state outside the lifetime of this process. `-C`
        // exits 0 when the rule is present and 1 when it is not.
        let status = Command::new("iptables")
            .args(["-C", "FORWARD", "-s", addr.to_string().as_str(), "-j", "REJECT"])
            .status()
            .await?;
        Ok(status.success())
    }

    async fn enable_block(&self, addr: IpAddr) -> Result<(), IptablesError> {
        // Never double insert: the delete path removes a single rule, and a
        // duplicate would survive it.
        if self.probe(addr).await? {
            tracing::warn!(addr = %addr, "forwarding filter already present");
            return Ok(());
        }

        let status = Command::new("iptables")
            .args(["-I", "FORWARD", "-s", addr.to_string().as_str(), "-j", "REJECT"])
            .status()
            .await?;
        if !status.success() {
            return Err(IptablesError::Command("insert"));
        }
        Ok(())
    }

    async fn disable_block(&self, addr: IpAddr) -> Result<(), IptablesError> {
        let status = Command::new("iptables")
            .args(["-D", "FORWARD", "-s", addr.to_string().as_str(), "-j", "REJECT"])
            .status()
            .await?;
        if !status.success() {
            // Deleting an absent rule fails with a nonzero exit; the rule may
            // legitimately be gone already after a crash.
            tracing::warn!(addr = %addr, "iptables delete reported failure");
        }
        Ok(())
    }
}
