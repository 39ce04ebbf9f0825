//! Recording fakes for the transport traits and the link listener

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::gatt::GattTransport;
use crate::spp::SppTransport;
use crate::types::{AddrType, BdAddr, BtUuid, Characteristic, ConnId, ServiceRange};
use crate::{LinkError, LinkListener};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan,
    StopScan,
    Open(BdAddr, AddrType),
    Close(Option<ConnId>),
    RequestMtu(u16),
    SearchServices,
    RegisterNotify(u16),
    WriteDescriptor(u16, Vec<u8>),
    WriteChar(u16, Vec<u8>, bool),
    StartInquiry,
    CancelInquiry,
    Connect(BdAddr, u8),
    Disconnect(u32),
    Write(u32, Vec<u8>),
}

#[derive(Default)]
pub struct RecordingTransport {
    pub calls: Vec<Call>,
    pub characteristics: Vec<Characteristic>,
    pub cccd: Option<u16>,
    pub fail_open: bool,
    pub fail_writes: bool,
}

impl RecordingTransport {
    pub fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    pub fn opens(&self) -> usize {
        self.calls.iter().filter(|c| matches!(c, Call::Open(..))).count()
    }

    pub fn take(&mut self) -> Vec<Call> {
        std::mem::take(&mut self.calls)
    }
}

impl GattTransport for RecordingTransport {
    fn start_scan(&mut self, _duration: Duration) -> Result<(), LinkError> {
        self.calls.push(Call::StartScan);
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), LinkError> {
        self.calls.push(Call::StopScan);
        Ok(())
    }

    fn open(&mut self, addr: BdAddr, addr_type: AddrType) -> Result<(), LinkError> {
        self.calls.push(Call::Open(addr, addr_type));
        if self.fail_open {
            return Err(LinkError::Transport { code: -1 });
        }
        Ok(())
    }

    fn close(&mut self, conn: Option<ConnId>) -> Result<(), LinkError> {
        self.calls.push(Call::Close(conn));
        Ok(())
    }

    fn request_mtu(&mut self, _conn: ConnId, mtu: u16) -> Result<(), LinkError> {
        self.calls.push(Call::RequestMtu(mtu));
        Ok(())
    }

    fn search_services(&mut self, _conn: ConnId) -> Result<(), LinkError> {
        self.calls.push(Call::SearchServices);
        Ok(())
    }

    fn characteristics(
        &mut self,
        _conn: ConnId,
        _range: ServiceRange,
    ) -> Result<Vec<Characteristic>, LinkError> {
        Ok(self.characteristics.clone())
    }

    fn descriptor(&mut self, _conn: ConnId, _char_handle: u16, _uuid: BtUuid) -> Option<u16> {
        self.cccd
    }

    fn register_for_notify(&mut self, _addr: BdAddr, handle: u16) -> Result<(), LinkError> {
        self.calls.push(Call::RegisterNotify(handle));
        Ok(())
    }

    fn write_descriptor(&mut self, _conn: ConnId, handle: u16, value: &[u8]) -> Result<(), LinkError> {
        self.calls.push(Call::WriteDescriptor(handle, value.to_vec()));
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        _conn: ConnId,
        handle: u16,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), LinkError> {
        self.calls.push(Call::WriteChar(handle, data.to_vec(), with_response));
        if self.fail_writes {
            return Err(LinkError::Transport { code: 0x85 });
        }
        Ok(())
    }
}

impl SppTransport for RecordingTransport {
    fn start_inquiry(&mut self, _duration: Duration) -> Result<(), LinkError> {
        self.calls.push(Call::StartInquiry);
        Ok(())
    }

    fn cancel_inquiry(&mut self) -> Result<(), LinkError> {
        self.calls.push(Call::CancelInquiry);
        Ok(())
    }

    fn connect(&mut self, addr: BdAddr, channel: u8) -> Result<(), LinkError> {
        self.calls.push(Call::Connect(addr, channel));
        if self.fail_open {
            return Err(LinkError::Transport { code: -1 });
        }
        Ok(())
    }

    fn disconnect(&mut self, handle: u32) -> Result<(), LinkError> {
        self.calls.push(Call::Disconnect(handle));
        Ok(())
    }

    fn write(&mut self, handle: u32, data: &[u8]) -> Result<(), LinkError> {
        self.calls.push(Call::Write(handle, data.to_vec()));
        if self.fail_writes {
            return Err(LinkError::Transport { code: -2 });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Heard {
    Ready { writable: bool },
    Bytes(Vec<u8>),
    Lost,
}

#[derive(Default)]
pub struct RecordingListener {
    heard: Mutex<Vec<Heard>>,
}

impl RecordingListener {
    pub fn heard(&self) -> Vec<Heard> {
        self.heard.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn push(&self, h: Heard) {
        self.heard.lock().unwrap_or_else(PoisonError::into_inner).push(h);
    }
}

impl LinkListener for RecordingListener {
    fn on_link_ready(&self, writable: bool) {
        self.push(Heard::Ready { writable });
    }

    fn on_bytes(&self, data: &[u8]) {
        self.push(Heard::Bytes(data.to_vec()));
    }

    fn on_link_lost(&self) {
        self.push(Heard::Lost);
    }
}
