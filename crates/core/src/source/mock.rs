//! A scripted report source for testing.
//!
//! Behaves like an hidapi device: not pollable, and `read_report` waits
//! internally for at most its timeout.

use super::ReportSource;
use crate::error::{Error, Result};
use crate::poll::{Deadline, Timeout};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

#[derive(Default)]
struct Script {
    inbound: VecDeque<Result<Vec<u8>>>,
    written: Vec<Vec<u8>>,
    writes_stalled: bool,
    features: HashMap<u8, Vec<u8>>,
}

/// Mock source whose input reports are queued by the test.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<Script>,
    arrived: Condvar,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an input report.
    pub fn emit(&self, report: Vec<u8>) {
        self.script.lock().inbound.push_back(Ok(report));
        self.arrived.notify_all();
    }

    /// Make the next read fail after already queued reports.
    pub fn emit_error(&self, error: Error) {
        self.script.lock().inbound.push_back(Err(error));
        self.arrived.notify_all();
    }

    /// While stalled, the device accepts no output reports.
    pub fn stall_writes(&self, stalled: bool) {
        self.script.lock().writes_stalled = stalled;
        self.arrived.notify_all();
    }

    /// Output reports written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.script.lock().written.clone()
    }

    /// Feature report stored for `report_id`.
    pub fn feature(&self, report_id: u8) -> Option<Vec<u8>> {
        self.script.lock().features.get(&report_id).cloned()
    }
}

impl ReportSource for ScriptedSource {
    fn read_report(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        let deadline = Deadline::after(timeout);
        let mut script = self.script.lock();
        loop {
            if let Some(next) = script.inbound.pop_front() {
                let report = next?;
                let n = report.len().min(buf.len());
                buf[..n].copy_from_slice(&report[..n]);
                return Ok(n);
            }
            match deadline.at() {
                None => self.arrived.wait(&mut script),
                Some(at) => {
                    if Instant::now() >= at {
                        return Ok(0);
                    }
                    self.arrived.wait_until(&mut script, at);
                }
            }
        }
    }

    fn write_report(&self, data: &[u8], timeout: Timeout) -> Result<usize> {
        let deadline = Deadline::after(timeout);
        let mut script = self.script.lock();
        while script.writes_stalled {
            match deadline.at() {
                None => self.arrived.wait(&mut script),
                Some(at) => {
                    if Instant::now() >= at {
                        return Ok(0);
                    }
                    self.arrived.wait_until(&mut script, at);
                }
            }
        }
        script.written.push(data.to_vec());
        Ok(data.len())
    }

    fn send_feature_report(&self, data: &[u8]) -> Result<()> {
        let id = *data
            .first()
            .ok_or_else(|| Error::InvalidInput("empty feature report".into()))?;
        self.script.lock().features.insert(id, data.to_vec());
        Ok(())
    }

    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize> {
        let id = *buf
            .first()
            .ok_or_else(|| Error::InvalidInput("empty feature buffer".into()))?;
        let script = self.script.lock();
        let stored = script
            .features
            .get(&id)
            .ok_or_else(|| Error::Io(format!("mock: no feature report 0x{id:02X}")))?;
        let n = stored.len().min(buf.len());
        buf[..n].copy_from_slice(&stored[..n]);
        Ok(n)
    }
}
