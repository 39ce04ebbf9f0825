//! The link task: one thread owning the connection manager
//!
//! Transport callbacks, write requests and control messages all arrive on one
//! channel, so the manager's state is only ever touched from this thread and
//! at most one scan or connect attempt can be in flight.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::LinkConfig;
use crate::supervisor::Supervisor;
use crate::{Link, LinkError, LinkWriter};

pub enum LinkMessage<E> {
    /// Translated platform callback
    Event(E),
    /// Bytes for the adapter; `reply` is `None` for fire-and-forget writes
    Write {
        data: Vec<u8>,
        reply: Option<oneshot::Sender<Result<(), LinkError>>>,
    },
    /// Close the link; discovery restarts on the next pass
    Disconnect,
    /// Close the link and end the task
    Shutdown,
}

pub type LinkSender<E> = Sender<LinkMessage<E>>;

pub struct LinkTask<L: Link> {
    link: L,
    supervisor: Supervisor,
    rx: Receiver<LinkMessage<L::Event>>,
    tick: Duration,
}

impl<L: Link> LinkTask<L> {
    pub fn new(link: L, config: &LinkConfig, rx: Receiver<LinkMessage<L::Event>>) -> Self {
        Self {
            link,
            supervisor: Supervisor::new(config, Instant::now()),
            rx,
            tick: Duration::from_millis(config.tick_ms),
        }
    }

    /// Run until shut down or every sender is gone. `heartbeat` is called on
    /// every pass (the firmware feeds its task watchdog there).
    pub fn run(mut self, mut heartbeat: impl FnMut()) -> L {
        info!("Link task started");
        self.link.start_discovery(Instant::now());

        loop {
            heartbeat();

            match self.rx.recv_timeout(self.tick) {
                Ok(LinkMessage::Event(event)) => self.link.handle_event(event, Instant::now()),
                Ok(LinkMessage::Write { data, reply }) => {
                    let result = self.link.write(&data);
                    if let Err(e) = result {
                        debug!("Write of {} bytes rejected: {e}", data.len());
                    }
                    if let Some(reply) = reply {
                        // Caller may have timed out already
                        let _ = reply.send(result);
                    }
                }
                Ok(LinkMessage::Disconnect) => self.link.disconnect(Instant::now()),
                Ok(LinkMessage::Shutdown) => {
                    info!("Link task shutting down");
                    self.link.disconnect(Instant::now());
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Link channel closed, stopping link task");
                    break;
                }
            }

            let now = Instant::now();
            self.link.poll(now);
            self.supervisor.tick(&mut self.link, now);
        }

        self.link
    }
}

/// Cloneable handle to a running link task
pub struct LinkHandle<E> {
    tx: LinkSender<E>,
    write_timeout: Duration,
}

impl<E> Clone for LinkHandle<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            write_timeout: self.write_timeout,
        }
    }
}

impl<E: Send + 'static> LinkHandle<E> {
    pub fn new(tx: LinkSender<E>, config: &LinkConfig) -> Self {
        Self {
            tx,
            write_timeout: Duration::from_millis(config.write_timeout_ms),
        }
    }

    /// Sender for the platform glue to post transport events
    pub fn events(&self) -> LinkSender<E> {
        self.tx.clone()
    }

    pub fn disconnect(&self) -> Result<(), LinkError> {
        self.tx
            .send(LinkMessage::Disconnect)
            .map_err(|_| LinkError::TaskGone)
    }

    pub fn shutdown(&self) -> Result<(), LinkError> {
        self.tx
            .send(LinkMessage::Shutdown)
            .map_err(|_| LinkError::TaskGone)
    }
}

impl<E: Send + 'static> LinkWriter for LinkHandle<E> {
    fn write(&self, data: &[u8]) -> Result<(), LinkError> {
        let (reply, response_rx) = oneshot::channel();
        self.tx
            .send(LinkMessage::Write {
                data: data.to_vec(),
                reply: Some(reply),
            })
            .map_err(|_| LinkError::TaskGone)?;

        response_rx
            .recv_timeout(self.write_timeout)
            .map_err(|_| LinkError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{GattConnectionManager, GattEvent};
    use crate::testing::{Call, Heard, RecordingListener, RecordingTransport};
    use crate::types::{AddrType, BtUuid, CharProperty, Characteristic, ServiceRange};
    use crate::{AtomicConnectionState, ConnectionState, NotifyStrategy};
    use std::sync::atomic::Ordering;
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn config() -> LinkConfig {
        LinkConfig {
            notify: NotifyStrategy::Single,
            tick_ms: 5,
            write_timeout_ms: 500,
            ..LinkConfig::default()
        }
    }

    #[test]
    fn test_task_reaches_ready_and_writes() {
        let config = config();
        let listener = Arc::new(RecordingListener::default());
        let shared = Arc::new(AtomicConnectionState::new(ConnectionState::Idle));
        let transport = RecordingTransport {
            characteristics: vec![Characteristic {
                uuid: BtUuid::U16(0xFFE1),
                handle: 0x2A,
                properties: CharProperty::Write | CharProperty::Notify,
            }],
            cccd: Some(0x2B),
            ..RecordingTransport::default()
        };
        let manager = GattConnectionManager::new(
            transport,
            config.clone(),
            listener.clone(),
            shared.clone(),
            Instant::now(),
        );

        let (tx, rx) = mpsc::channel();
        let handle = LinkHandle::new(tx, &config);
        let task = LinkTask::new(manager, &config, rx);
        let join = thread::spawn(move || task.run(|| {}));

        // Not ready yet
        assert_eq!(handle.write(b"ATZ\r"), Err(LinkError::NotReady));

        let events = handle.events();
        let target = config.target;
        for event in [
            GattEvent::ScanResult {
                addr: target,
                addr_type: AddrType::Public,
                rssi: -50,
            },
            GattEvent::ScanStopped,
            GattEvent::Connected { conn: 1, addr: target },
            GattEvent::ServiceFound {
                uuid: BtUuid::U16(0xFFE0),
                range: ServiceRange { start: 0x28, end: 0x30 },
            },
            GattEvent::ServiceSearchComplete { ok: true },
            GattEvent::NotifyRegistered { handle: 0x2A, ok: true },
            GattEvent::DescriptorWritten { handle: 0x2B, ok: true },
        ] {
            events.send(LinkMessage::Event(event)).unwrap();
        }

        // Messages are handled in order, so this write sees the Ready link
        assert_eq!(handle.write(b"ATZ\r"), Ok(()));
        assert_eq!(shared.load(Ordering::Relaxed), ConnectionState::Ready);
        assert_eq!(listener.heard(), vec![Heard::Ready { writable: true }]);

        handle.shutdown().unwrap();
        let manager = join.join().unwrap();
        assert!(manager
            .transport()
            .calls
            .contains(&Call::WriteChar(0x2A, b"ATZ\r".to_vec(), true)));
        assert!(manager.transport().calls.contains(&Call::Close(Some(1))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_handle_reports_task_gone() {
        let config = config();
        let (tx, rx) = mpsc::channel::<LinkMessage<GattEvent>>();
        drop(rx);
        let handle = LinkHandle::new(tx, &config);
        assert_eq!(handle.write(b"0100\r"), Err(LinkError::TaskGone));
        assert_eq!(handle.disconnect(), Err(LinkError::TaskGone));
    }
}
