use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use pnet::datalink::{self, Channel, Config, NetworkInterface};
use tokio::sync::mpsc;

use crate::classify::LinkKind;

/// Captured frames queued ahead of the ingress loop; the bound exerts
/// back-pressure on the capture thread when the fabric falls behind.
const CAPTURE_QUEUE_DEPTH: usize = 64;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// The capture source: a datalink channel on the tap interface, read from a
/// dedicated thread so the blocking receive never shares a task with
/// anything else.
pub struct CaptureSource {
    link: LinkKind,
    frames: mpsc::Receiver<Bytes>,
    running: Arc<AtomicBool>,
}

/// Cloneable handle that tells the capture thread to stop.
#[derive(Clone)]
pub struct CaptureStop(Arc<AtomicBool>);

impl CaptureStop {
    pub fn stop(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

impl CaptureSource {
    pub fn open(interface_name: &str) -> Result<Self> {
        let interface = find_interface(interface_name)?;
        // A device without a hardware address is a point-to-point tunnel
        // delivering bare IP; anything else arrives link-framed.
        let link = if interface.mac.is_some() {
            LinkKind::Ethernet
        } else {
            LinkKind::Tunnel
        };

        let config = Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };
        let mut rx = match datalink::channel(&interface, config)
            .with_context(|| format!("unable to open capture on {}", interface_name))?
        {
            Channel::Ethernet(_, rx) => rx,
            _ => anyhow::bail!("unsupported channel type for capture"),
        };

        let running = Arc::new(AtomicBool::new(true));
        let (tx, frames) = mpsc::channel(CAPTURE_QUEUE_DEPTH);
        let flag = Arc::clone(&running);
        let name = interface.name.clone();

        thread::spawn(move || {
            while flag.load(Ordering::Relaxed) {
                match rx.next() {
                    Ok(frame) => {
                        if tx.blocking_send(Bytes::copy_from_slice(frame)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        tracing::error!(interface = %name, error = %e, "unable to receive packet");
                    }
                }
            }
            tracing::debug!(interface = %name, "capture thread exiting");
        });

        Ok(Self {
            link,
            frames,
            running,
        })
    }

    pub fn link(&self) -> LinkKind {
        self.link
    }

    pub fn stop_handle(&self) -> CaptureStop {
        CaptureStop(Arc::clone(&self.running))
    }

    /// Next captured frame, or `None` once the source has stopped and the
    /// queue is empty.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        self.frames.recv().await
    }
}

fn find_interface(name: &str) -> Result<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .with_context(|| format!("interface not found: {}", name))
}
