// src/io/loopback.rs
//
// In-process virtual CAN bus. Frames sent on it are received back, and a
// handle can inject frames from elsewhere. Lets the bridge run without
// hardware.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::debug;

use super::{BridgeError, BusChannel, CanFrame};

/// Virtual bus backed by a bounded queue.
pub struct LoopbackBus {
    name: String,
    tx: mpsc::Sender<CanFrame>,
    rx: mpsc::Receiver<CanFrame>,
}

/// Injects frames into a [`LoopbackBus`] as if they arrived from the wire.
#[derive(Clone)]
pub struct LoopbackHandle {
    tx: mpsc::Sender<CanFrame>,
}

impl LoopbackBus {
    pub fn new(channel: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name: format!("virtual({})", channel),
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            tx: self.tx.clone(),
        }
    }
}

impl LoopbackHandle {
    /// Queue a frame for the bus to receive. Fails when the bus is full or closed.
    pub fn inject(&self, frame: CanFrame) -> Result<(), CanFrame> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(f) | TrySendError::Closed(f) => f,
        })
    }
}

#[async_trait]
impl BusChannel for LoopbackBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_receive(&mut self) -> Result<Option<CanFrame>, BridgeError> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(BridgeError::adapter_read(&self.name, "bus closed"))
            }
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), BridgeError> {
        frame
            .validate()
            .map_err(|e| BridgeError::adapter_write(&self.name, e))?;

        self.tx.try_send(frame.clone()).map_err(|e| match e {
            TrySendError::Full(_) => BridgeError::adapter_write(&self.name, "bus queue full"),
            TrySendError::Closed(_) => BridgeError::adapter_write(&self.name, "bus closed"),
        })
    }

    async fn close(&mut self) {
        self.rx.close();
        debug!(bus = %self.name, "virtual bus closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_loops_back() {
        let mut bus = LoopbackBus::new("vcan0", 8);
        assert_eq!(bus.try_receive().unwrap(), None);

        let frame = CanFrame::new(0x321, &[9, 8, 7]);
        bus.send(&frame).unwrap();
        assert_eq!(bus.try_receive().unwrap(), Some(frame));
        assert_eq!(bus.try_receive().unwrap(), None);
    }

    #[test]
    fn test_send_rejects_invalid_frame() {
        let mut bus = LoopbackBus::new("vcan0", 8);
        let frame = CanFrame::new(0x10, &[0; 9]);
        assert!(matches!(
            bus.send(&frame),
            Err(BridgeError::AdapterWrite { .. })
        ));
    }

    #[test]
    fn test_full_queue_is_a_write_error() {
        let mut bus = LoopbackBus::new("vcan0", 1);
        bus.send(&CanFrame::new(1, &[])).unwrap();
        let err = bus.send(&CanFrame::new(2, &[])).unwrap_err();
        assert!(err.to_string().contains("queue full"));
    }

    #[test]
    fn test_injected_frames_keep_order() {
        let mut bus = LoopbackBus::new("vcan0", 16);
        let handle = bus.handle();
        for id in 0..5 {
            handle.inject(CanFrame::new(id, &[id as u8])).unwrap();
        }

        let mut ids = Vec::new();
        while let Some(frame) = bus.try_receive().unwrap() {
            ids.push(frame.arbitration_id);
        }
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_inject_after_close_fails() {
        let mut bus = LoopbackBus::new("vcan0", 4);
        let handle = bus.handle();
        bus.close().await;
        assert!(handle.inject(CanFrame::new(1, &[])).is_err());
    }
}
