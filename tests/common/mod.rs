//! In-process MightyWatt for integration tests.
//!
//! Each `open` creates a `tokio::io::duplex` pair: the host half becomes the
//! engine's transport, the device half is served by [`SimulatedDevice`],
//! which answers read commands like the firmware and records every write.

#![allow(dead_code)]

use async_trait::async_trait;
use mightywatt::error::LoadResult;
use mightywatt::events::LoadEvent;
use mightywatt::protocol::crc::verify_trailing_crc;
use mightywatt::protocol::{Payload, TelemetryFrame};
use mightywatt::transport::{Connector, LinkSettings, Transport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast::{self, error::RecvError};

pub const PORT: &str = "/dev/ttySIM0";

/// QDC lines of a healthy 10 A / 60 V / 300 W unit.
pub const QDC: [&str; 10] = [
    "2024-01-01",
    "3.1.4",
    "B",
    "10000000",
    "10000000",
    "60000000",
    "60000000",
    "300000000",
    "1000000",
    "85",
];

const FRAME_INTERVAL: Duration = Duration::from_millis(5);

/// A command the host wrote, as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub write: bool,
    pub id: u8,
    pub payload: Payload,
}

#[derive(Debug)]
struct DeviceState {
    identification: String,
    qdc: Vec<String>,
    error_table: Vec<String>,
    frame: TelemetryFrame,
    corrupt_frames: usize,
    silent: bool,
    received: Vec<Received>,
    bad_crc: usize,
}

#[derive(Debug)]
pub struct SimulatedDevice {
    state: Mutex<DeviceState>,
    opens: AtomicUsize,
}

impl SimulatedDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DeviceState {
                identification: "MightyWatt R3".to_string(),
                qdc: QDC.iter().map(|line| line.to_string()).collect(),
                error_table: (0..21).map(|bit| format!("Device error {bit}")).collect(),
                frame: TelemetryFrame {
                    temperature: 25,
                    ..TelemetryFrame::default()
                },
                corrupt_frames: 0,
                silent: false,
                received: Vec::new(),
                bad_crc: 0,
            }),
            opens: AtomicUsize::new(0),
        })
    }

    pub fn set_identification(&self, text: &str) {
        self.state.lock().identification = text.to_string();
    }

    pub fn set_firmware(&self, version: &str) {
        self.state.lock().qdc[1] = version.to_string();
    }

    /// Reported current (A) and voltage (V).
    pub fn set_measurement(&self, current: f64, voltage: f64) {
        let mut state = self.state.lock();
        state.frame.current_ua = (current * 1e6).round() as u32;
        state.frame.voltage_uv = (voltage * 1e6).round() as u32;
    }

    pub fn set_temperature(&self, celsius: u8) {
        self.state.lock().frame.temperature = celsius;
    }

    pub fn set_status(&self, status: u8) {
        self.state.lock().frame.status = status;
    }

    pub fn set_error_flags(&self, flags: u32) {
        self.state.lock().frame.error_flags = flags;
    }

    /// Send the next `count` telemetry frames with a broken CRC.
    pub fn corrupt_next(&self, count: usize) {
        self.state.lock().corrupt_frames = count;
    }

    /// Stop answering measurement requests.
    pub fn go_silent(&self) {
        self.state.lock().silent = true;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.lock().received.clone()
    }

    /// Payloads of every write with command id `id`, oldest first.
    pub fn writes(&self, id: u8) -> Vec<Payload> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|r| r.write && r.id == id)
            .map(|r| r.payload)
            .collect()
    }

    pub fn clear_received(&self) {
        self.state.lock().received.clear();
    }

    pub fn bad_crc_frames(&self) -> usize {
        self.state.lock().bad_crc
    }

    fn reply(&self, id: u8) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        match id {
            1 => {
                if state.silent {
                    return None;
                }
                let mut bytes = state.frame.encode();
                if state.corrupt_frames > 0 {
                    state.corrupt_frames -= 1;
                    bytes[15] ^= 0xFF;
                }
                Some(bytes.to_vec())
            }
            2 => Some(format!("{}\r\n", state.identification).into_bytes()),
            3 => Some(
                state
                    .qdc
                    .iter()
                    .flat_map(|line| format!("{line}\r\n").into_bytes())
                    .collect(),
            ),
            4 => {
                let mut bytes = vec![state.error_table.len() as u8];
                for line in &state.error_table {
                    bytes.extend_from_slice(line.as_bytes());
                    bytes.extend_from_slice(b"\r\n");
                }
                Some(bytes)
            }
            _ => None,
        }
    }

    async fn serve(self: Arc<Self>, mut stream: DuplexStream) {
        loop {
            let mut header = [0u8; 1];
            if stream.read_exact(&mut header).await.is_err() {
                return;
            }
            let header = header[0];
            let length = [0usize, 1, 2, 4][usize::from((header >> 5) & 0b11)];
            let mut rest = vec![0u8; length + 2];
            if stream.read_exact(&mut rest).await.is_err() {
                return;
            }

            let mut frame = vec![header];
            frame.extend_from_slice(&rest);
            if !verify_trailing_crc(&frame) {
                self.state.lock().bad_crc += 1;
                continue;
            }

            let payload = match length {
                0 => Payload::Empty,
                1 => Payload::U8(rest[0]),
                2 => Payload::U16(u16::from_le_bytes([rest[0], rest[1]])),
                _ => Payload::U32(u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]])),
            };
            let received = Received {
                write: header & 0x80 != 0,
                id: header & 0x1F,
                payload,
            };
            self.state.lock().received.push(received);
            if received.write {
                continue;
            }

            if received.id == 1 {
                tokio::time::sleep(FRAME_INTERVAL).await;
            }
            let reply = self.reply(received.id);
            if let Some(reply) = reply {
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Opens a fresh simulated link to `device` on every call.
#[derive(Debug, Clone)]
pub struct SimConnector {
    pub device: Arc<SimulatedDevice>,
}

#[async_trait]
impl Connector for SimConnector {
    async fn open(&self, _port: &str, settings: &LinkSettings) -> LoadResult<Transport> {
        self.device.opens.fetch_add(1, Ordering::SeqCst);
        let (host, device) = tokio::io::duplex(4096);
        tokio::spawn(Arc::clone(&self.device).serve(device));
        Ok(Transport::new(Box::new(host), settings))
    }
}

pub fn link() -> LinkSettings {
    LinkSettings {
        read_timeout: Duration::from_millis(200),
        write_timeout: Duration::from_millis(200),
        reset_delay: Duration::ZERO,
        rts_dtr: false,
    }
}

/// Wait for the first event matching `predicate`, skipping others.
pub async fn expect_event<F>(
    rx: &mut broadcast::Receiver<LoadEvent>,
    within: Duration,
    mut predicate: F,
) -> LoadEvent
where
    F: FnMut(&LoadEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    };
    tokio::time::timeout(within, wait)
        .await
        .unwrap_or_else(|_| panic!("no matching event within {within:?}"))
}

/// Poll `condition` every 5 ms until it holds.
pub async fn eventually<F>(within: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(within, wait)
        .await
        .unwrap_or_else(|_| panic!("condition not met within {within:?}"));
}
