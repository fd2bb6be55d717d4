//! Serial link to the laser sensor
//!
//! The sensor client talks to a [`SerialLink`] so the worker loop can be
//! driven by a real port or by an in-memory script in tests.

use crate::protocol::BAUD_RATE;
use anyhow::{Context, Result};
use serde::Serialize;
use serialport::{SerialPort, SerialPortType};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

/// Port read timeout; bounds every blocking read on the worker thread
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Longest partial line kept while waiting for its newline
pub const MAX_LINE_LEN: usize = 4096;

/// Substrings (lowercase) that identify the sensor's USB bridge
const SENSOR_PORT_KEYWORDS: [&str; 5] = ["ch340", "ch341", "arduino", "mega", "usb-serial"];

/// A line-oriented, non-blocking duplex link
pub trait SerialLink: Send {
    /// Write one line; the newline is appended here
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Return one complete line if available, without its terminator.
    /// Never blocks longer than the port's read timeout.
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// Opens links by port name
pub trait PortOpener: Send {
    fn open(&mut self, port: &str) -> Result<Box<dyn SerialLink>>;
}

/// Splits a byte stream into trimmed text lines.
///
/// A partial line that grows past [`MAX_LINE_LEN`] is dropped together with
/// everything up to its newline, so a port at the wrong baud rate cannot grow
/// the buffer without bound.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
    lines: VecDeque<String>,
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else {
                    let line = String::from_utf8_lossy(&self.partial).trim().to_string();
                    self.lines.push_back(line);
                }
                self.partial.clear();
            } else if self.discarding {
                continue;
            } else if self.partial.len() >= MAX_LINE_LEN {
                warn!("Dropping serial line longer than {} bytes", MAX_LINE_LEN);
                self.partial.clear();
                self.discarding = true;
            } else {
                self.partial.push(b);
            }
        }
    }

    pub fn next_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }

    /// Bytes held for the line still being received
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

// === serialport backend ===

pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
    lines: LineBuffer,
}

impl SerialPortLink {
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()
            .with_context(|| format!("failed to open serial port {}", path))?;
        Ok(Self {
            port,
            lines: LineBuffer::new(),
        })
    }
}

impl SerialLink for SerialPortLink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        if let Some(line) = self.lines.next_line() {
            return Ok(Some(line));
        }

        let available = self.port.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(None);
        }

        let mut chunk = vec![0u8; available.min(MAX_LINE_LEN)];
        match self.port.read(&mut chunk) {
            Ok(n) => self.lines.push(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(e) => return Err(e),
        }
        Ok(self.lines.next_line())
    }
}

/// Opens real serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOpener;

impl PortOpener for SystemPortOpener {
    fn open(&mut self, port: &str) -> Result<Box<dyn SerialLink>> {
        Ok(Box::new(SerialPortLink::open(port)?))
    }
}

// === Port discovery ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => {
            let parts: Vec<&str> = [usb.manufacturer.as_deref(), usb.product.as_deref()]
                .into_iter()
                .flatten()
                .collect();
            if parts.is_empty() {
                format!("USB {:04x}:{:04x}", usb.vid, usb.pid)
            } else {
                parts.join(" ")
            }
        }
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::Unknown => "n/a".to_string(),
    }
}

/// Every serial port the OS reports, sorted by name
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .context("failed to enumerate serial ports")?
        .into_iter()
        .map(|p| PortInfo {
            description: describe(&p.port_type),
            name: p.port_name,
        })
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(ports)
}

/// First port whose description looks like the sensor's USB bridge
pub fn find_sensor_port(ports: &[PortInfo]) -> Option<&PortInfo> {
    ports.iter().find(|p| {
        let desc = p.description.to_lowercase();
        SENSOR_PORT_KEYWORDS.iter().any(|kw| desc.contains(kw))
    })
}

/// Enumerate and pick the sensor port in one go
pub fn discover_sensor_port() -> Option<String> {
    let ports = match list_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Port discovery failed: {:#}", e);
            return None;
        }
    };
    find_sensor_port(&ports).map(|p| p.name.clone())
}
