// src/io/socketcan/reader.rs
//
// SocketCAN bus channel. A blocking worker owns the socket: it writes queued
// transmit frames between reads and hands received frames to the bridge
// through a bounded queue.
//
// This module is only compiled on Linux.

#[cfg(target_os = "linux")]
mod linux_impl {
    use async_trait::async_trait;
    use socketcan::{
        CanAnyFrame, CanDataFrame, CanFdFrame, CanFdSocket, CanRemoteFrame, EmbeddedFrame,
        ExtendedId, Frame, Id, Socket, StandardId,
    };
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        mpsc as std_mpsc, Arc,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::task::JoinHandle;
    use tracing::{debug, info};

    use crate::io::{now_us, BridgeError, BusChannel, CanFrame, CAN_EFF_MASK};
    use crate::settings::BusConfig;

    /// Transmit requests waiting for the worker.
    const TRANSMIT_QUEUE: usize = 64;

    /// What the worker reports to the bridge.
    enum BusEvent {
        Frame(CanFrame),
        /// A frame queued by `send` could not be written
        TransmitFailed(String),
        /// The socket is unusable; the worker has exited
        Failed(String),
    }

    // ============================================================================
    // Interface Configuration
    // ============================================================================

    /// `ip` argument lists that bring the interface down, set its bitrate (and
    /// FD mode) and bring it back up. Each list is one process, no shell.
    fn ip_link_commands(
        interface: &str,
        bitrate: u32,
        enable_fd: bool,
        data_bitrate: Option<u32>,
    ) -> Vec<Vec<String>> {
        let mut configure: Vec<String> = ["link", "set", interface, "type", "can", "bitrate"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        configure.push(bitrate.to_string());

        if enable_fd {
            configure.extend(["fd".to_string(), "on".to_string()]);
            if let Some(dbitrate) = data_bitrate {
                configure.extend(["dbitrate".to_string(), dbitrate.to_string()]);
            }
        }

        let link = |state: &str| -> Vec<String> {
            ["link", "set", interface, state].iter().map(|s| s.to_string()).collect()
        };

        vec![link("down"), configure, link("up")]
    }

    /// Reconfigure the interface with `ip link`. Needs CAP_NET_ADMIN.
    pub fn configure_interface(
        interface: &str,
        bitrate: u32,
        enable_fd: bool,
        data_bitrate: Option<u32>,
    ) -> Result<(), String> {
        use std::process::Command;

        info!(
            interface,
            bitrate,
            fd = enable_fd,
            ?data_bitrate,
            "configuring CAN interface"
        );

        for args in ip_link_commands(interface, bitrate, enable_fd, data_bitrate) {
            let output = Command::new("ip")
                .args(&args)
                .output()
                .map_err(|e| format!("failed to run ip: {}", e))?;

            if output.status.success() {
                continue;
            }

            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if !stderr.trim().is_empty() {
                stderr.trim().to_string()
            } else {
                format!("exit code: {:?}", output.status.code())
            };
            return if detail.contains("Operation not permitted") {
                Err("not permitted to configure network interfaces (needs CAP_NET_ADMIN)".to_string())
            } else {
                Err(format!("ip {} failed: {}", args.join(" "), detail))
            };
        }

        info!(interface, "CAN interface configured");
        Ok(())
    }

    // ============================================================================
    // Frame Conversion
    // ============================================================================

    /// Convert a received socket frame. Kernel error frames are not bridged.
    fn convert_any_frame(frame: CanAnyFrame) -> Option<CanFrame> {
        match frame {
            CanAnyFrame::Normal(f) => Some(CanFrame {
                arbitration_id: f.raw_id() & CAN_EFF_MASK,
                timestamp_us: now_us(),
                is_extended: f.is_extended(),
                is_remote: false,
                is_fd: false,
                error_state_indicator: false,
                payload: f.data().to_vec(),
            }),
            CanAnyFrame::Remote(f) => Some(CanFrame {
                arbitration_id: f.raw_id() & CAN_EFF_MASK,
                timestamp_us: now_us(),
                is_extended: f.is_extended(),
                is_remote: true,
                is_fd: false,
                error_state_indicator: false,
                payload: Vec::new(),
            }),
            CanAnyFrame::Fd(f) => Some(CanFrame {
                arbitration_id: f.raw_id() & CAN_EFF_MASK,
                timestamp_us: now_us(),
                is_extended: f.is_extended(),
                is_remote: false,
                is_fd: true,
                error_state_indicator: f.is_esi(),
                payload: f.data().to_vec(),
            }),
            CanAnyFrame::Error(f) => {
                debug!("skipping CAN error frame 0x{:08X}", f.raw_id());
                None
            }
        }
    }

    fn socket_id(frame: &CanFrame) -> Result<Id, String> {
        if frame.is_extended {
            ExtendedId::new(frame.arbitration_id)
                .map(Id::Extended)
                .ok_or_else(|| format!("invalid extended ID: 0x{:08X}", frame.arbitration_id))
        } else {
            u16::try_from(frame.arbitration_id)
                .ok()
                .and_then(StandardId::new)
                .map(Id::Standard)
                .ok_or_else(|| format!("invalid standard ID: 0x{:03X}", frame.arbitration_id))
        }
    }

    /// Write one frame to the socket (classic, remote or FD).
    fn transmit_frame(socket: &CanFdSocket, frame: &CanFrame) -> Result<(), String> {
        let id = socket_id(frame)?;

        let result = if frame.is_fd {
            let mut fd = CanFdFrame::new(id, &frame.payload)
                .ok_or_else(|| "failed to create FD frame".to_string())?;
            if frame.error_state_indicator {
                fd.set_esi(true);
            }
            socket.write_frame(&fd)
        } else if frame.is_remote {
            let remote = CanRemoteFrame::new_remote(id, 0)
                .ok_or_else(|| "failed to create remote frame".to_string())?;
            socket.write_frame(&remote)
        } else {
            let data = CanDataFrame::new(id, &frame.payload)
                .ok_or_else(|| "failed to create data frame".to_string())?;
            socket.write_frame(&data)
        };

        result.map_err(|e| format!("write error: {}", e))
    }

    // ============================================================================
    // SocketCAN Bus
    // ============================================================================

    /// SocketCAN bus channel (reads classic CAN and CAN FD).
    pub struct SocketCanBus {
        name: String,
        rx: mpsc::Receiver<BusEvent>,
        transmit_tx: std_mpsc::SyncSender<CanFrame>,
        stop_flag: Arc<AtomicBool>,
        worker: Option<JoinHandle<()>>,
    }

    impl SocketCanBus {
        /// Open the interface and start the reader worker.
        ///
        /// Must be called from within a tokio runtime.
        pub fn open(config: &BusConfig) -> Result<Self, BridgeError> {
            let name = format!("socketcan({})", config.channel);

            if config.configure_interface {
                configure_interface(
                    &config.channel,
                    config.bitrate,
                    config.enable_fd,
                    config.data_bitrate,
                )
                .map_err(|e| BridgeError::adapter_open(&name, e))?;
            }

            // FD socket reads both classic CAN and CAN FD frames
            let socket = CanFdSocket::open(&config.channel)
                .map_err(|e| BridgeError::adapter_open(&name, e.to_string()))?;

            socket
                .set_read_timeout(Duration::from_millis(config.read_timeout_ms))
                .map_err(|e| BridgeError::adapter_open(&name, format!("set read timeout: {}", e)))?;

            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            let (transmit_tx, transmit_rx) = std_mpsc::sync_channel::<CanFrame>(TRANSMIT_QUEUE);
            let stop_flag = Arc::new(AtomicBool::new(false));

            let worker_name = name.clone();
            let worker_stop = stop_flag.clone();
            let worker = tokio::task::spawn_blocking(move || {
                run_worker(worker_name, socket, transmit_rx, worker_stop, tx)
            });

            info!(bus = %name, "SocketCAN interface open (FD capable)");

            Ok(Self {
                name,
                rx,
                transmit_tx,
                stop_flag,
                worker: Some(worker),
            })
        }

        fn read_error(&self, message: impl Into<String>) -> BridgeError {
            BridgeError::adapter_read(&self.name, message)
        }
    }

    /// Blocking read loop. Runs until stopped, the bridge side goes away, or
    /// the socket fails.
    fn run_worker(
        name: String,
        socket: CanFdSocket,
        transmit_rx: std_mpsc::Receiver<CanFrame>,
        stop_flag: Arc<AtomicBool>,
        tx: mpsc::Sender<BusEvent>,
    ) {
        while !stop_flag.load(Ordering::Relaxed) {
            while let Ok(frame) = transmit_rx.try_recv() {
                if let Err(e) = transmit_frame(&socket, &frame) {
                    let message = format!("transmit of 0x{:X} failed: {}", frame.arbitration_id, e);
                    if tx.blocking_send(BusEvent::TransmitFailed(message)).is_err() {
                        return;
                    }
                }
            }

            match socket.read_frame() {
                Ok(frame) => {
                    if let Some(frame) = convert_any_frame(frame) {
                        if tx.blocking_send(BusEvent::Frame(frame)).is_err() {
                            break;
                        }
                    }
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    // Timeout - continue
                }
                Err(e) => {
                    let _ = tx.blocking_send(BusEvent::Failed(format!("read error: {}", e)));
                    return;
                }
            }
        }

        debug!(bus = %name, "reader stopped");
    }

    #[async_trait]
    impl BusChannel for SocketCanBus {
        fn name(&self) -> &str {
            &self.name
        }

        fn try_receive(&mut self) -> Result<Option<CanFrame>, BridgeError> {
            match self.rx.try_recv() {
                Ok(BusEvent::Frame(frame)) => Ok(Some(frame)),
                Ok(BusEvent::TransmitFailed(e)) => Err(BridgeError::adapter_write(&self.name, e)),
                Ok(BusEvent::Failed(e)) => Err(self.read_error(e)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(self.read_error("reader stopped")),
            }
        }

        fn send(&mut self, frame: &CanFrame) -> Result<(), BridgeError> {
            frame
                .validate()
                .map_err(|e| BridgeError::adapter_write(&self.name, e))?;

            self.transmit_tx.try_send(frame.clone()).map_err(|e| match e {
                std_mpsc::TrySendError::Full(_) => {
                    BridgeError::adapter_write(&self.name, "transmit queue full")
                }
                std_mpsc::TrySendError::Disconnected(_) => {
                    BridgeError::adapter_write(&self.name, "reader stopped")
                }
            })
        }

        async fn close(&mut self) {
            self.stop_flag.store(true, Ordering::Relaxed);
            // Unblocks a worker waiting on a full queue
            self.rx.close();

            if let Some(worker) = self.worker.take() {
                let _ = worker.await;
            }
            info!(bus = %self.name, "SocketCAN interface closed");
        }
    }

}

// Re-export for Linux
#[cfg(target_os = "linux")]
pub use linux_impl::SocketCanBus;

// ============================================================================
// Non-Linux Stub
// ============================================================================

#[cfg(not(target_os = "linux"))]
mod stub {
    use async_trait::async_trait;

    use crate::io::{BridgeError, BusChannel, CanFrame};
    use crate::settings::BusConfig;

    /// SocketCAN bus (stub for non-Linux, never constructed)
    pub struct SocketCanBus {
        name: String,
    }

    impl SocketCanBus {
        pub fn open(config: &BusConfig) -> Result<Self, BridgeError> {
            Err(BridgeError::adapter_open(
                &format!("socketcan({})", config.channel),
                "SocketCAN is only available on Linux",
            ))
        }
    }

    #[async_trait]
    impl BusChannel for SocketCanBus {
        fn name(&self) -> &str {
            &self.name
        }

        fn try_receive(&mut self) -> Result<Option<CanFrame>, BridgeError> {
            Err(BridgeError::adapter_read(&self.name, "SocketCAN is only available on Linux"))
        }

        fn send(&mut self, _frame: &CanFrame) -> Result<(), BridgeError> {
            Err(BridgeError::adapter_write(&self.name, "SocketCAN is only available on Linux"))
        }

        async fn close(&mut self) {}
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::SocketCanBus;
