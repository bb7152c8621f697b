use std::collections::{HashMap, VecDeque};

use anyhow::Result;

use super::error::Error;
use super::loragw_com::LgwSpiMux;
use super::loragw_reg::{LgwRegister, LoragwRegTrait};

/* one register-level exchange seen by the mock */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Connect,
    Disconnect,
    SoftReset,
    Write(&'static str, i32),
    Read(&'static str),
    WriteBurst(&'static str, usize),
    ReadBurst(&'static str, usize),
    Wait(u64),
}

/// Scripted concentrator used by the unit tests.
///
/// Single reads pop the per-register queue first, then fall back to the last
/// written value and finally to the register default. Burst reads pop their
/// queue or echo the last burst written to the same register.
#[derive(Debug, Default)]
pub struct MockHal {
    pub ops: Vec<MockOp>,
    pub corrupt_echo_at: Option<usize>,
    pub fail_on: Option<&'static str>,
    pub fail_after: usize,
    accesses: HashMap<&'static str, usize>,
    values: HashMap<&'static str, i32>,
    reads: HashMap<&'static str, VecDeque<i32>>,
    bursts: HashMap<&'static str, VecDeque<Vec<u8>>>,
    last_burst: HashMap<&'static str, Vec<u8>>,
}

impl MockHal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&mut self, register: LgwRegister, value: i32) {
        self.values.insert(register.name, value);
    }

    pub fn queue_read(&mut self, register: LgwRegister, value: i32) {
        self.reads.entry(register.name).or_default().push_back(value);
    }

    pub fn queue_reads(&mut self, register: LgwRegister, values: &[i32]) {
        for v in values {
            self.queue_read(register, *v);
        }
    }

    pub fn queue_burst(&mut self, register: LgwRegister, data: Vec<u8>) {
        self.bursts.entry(register.name).or_default().push_back(data);
    }

    pub fn waits(&self) -> Vec<u64> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                MockOp::Wait(ms) => Some(*ms),
                _ => None,
            })
            .collect()
    }

    pub fn writes_to(&self, name: &str) -> Vec<i32> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                MockOp::Write(n, v) if *n == name => Some(*v),
                _ => None,
            })
            .collect()
    }

    /* `fail_on` register answers `fail_after` accesses, then errors */
    fn check_fail(&mut self, register: &LgwRegister) -> Result<()> {
        if self.fail_on != Some(register.name) {
            return Ok(());
        }
        let seen = self.accesses.entry(register.name).or_default();
        *seen += 1;
        if *seen > self.fail_after {
            return Err(Error::TransportError(format!("scripted failure on {}", register.name)).into());
        }
        Ok(())
    }
}

impl LoragwRegTrait for MockHal {
    fn lgw_connect(&mut self, _com_path: &str, _force_reset: bool, _tx_notch_freq: u32) -> Result<LgwSpiMux> {
        self.ops.push(MockOp::Connect);
        Ok(LgwSpiMux::default())
    }

    fn lgw_disconnect(&mut self) -> Result<()> {
        self.ops.push(MockOp::Disconnect);
        Ok(())
    }

    fn lgw_soft_reset(&mut self, _spi_mux: LgwSpiMux) -> Result<()> {
        self.ops.push(MockOp::SoftReset);
        Ok(())
    }

    fn lgw_reg_w(&mut self, _spi_mux: LgwSpiMux, register: LgwRegister, value: i32) -> Result<()> {
        self.check_fail(&register)?;
        if register.rdon {
            return Err(Error::ConfigurationError(format!("{} is read-only", register.name)).into());
        }
        self.ops.push(MockOp::Write(register.name, value));
        self.values.insert(register.name, value);
        Ok(())
    }

    fn lgw_reg_r(&mut self, _spi_mux: LgwSpiMux, register: LgwRegister) -> Result<i32> {
        self.check_fail(&register)?;
        self.ops.push(MockOp::Read(register.name));
        if let Some(v) = self.reads.get_mut(register.name).and_then(|q| q.pop_front()) {
            return Ok(v);
        }
        Ok(self.values.get(register.name).copied().unwrap_or(register.dflt))
    }

    fn lgw_reg_wb(&mut self, _spi_mux: LgwSpiMux, register: LgwRegister, data: &[u8]) -> Result<()> {
        self.check_fail(&register)?;
        self.ops.push(MockOp::WriteBurst(register.name, data.len()));
        self.last_burst.insert(register.name, data.to_vec());
        Ok(())
    }

    fn lgw_reg_rb(&mut self, _spi_mux: LgwSpiMux, register: LgwRegister, size: usize) -> Result<Vec<u8>> {
        self.check_fail(&register)?;
        self.ops.push(MockOp::ReadBurst(register.name, size));

        if let Some(mut data) = self.bursts.get_mut(register.name).and_then(|q| q.pop_front()) {
            data.resize(size, 0);
            return Ok(data);
        }

        match self.last_burst.get(register.name) {
            Some(written) if written.len() == size => {
                let mut data = written.clone();
                if let Some(offset) = self.corrupt_echo_at.filter(|o| *o < size) {
                    data[offset] ^= 0xFF;
                }
                Ok(data)
            }
            _ => Ok(vec![0; size]),
        }
    }

    fn lgw_wait_ms(&mut self, ms: u64) {
        self.ops.push(MockOp::Wait(ms));
    }
}
