use anyhow::{anyhow, Result};
use tracing::trace;

use super::{mcu::McuTrait, Hal};
use std::fmt;

const READ_ACCESS: u8 = 0x00;
const WRITE_ACCESS: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum LgwSpiMuxMode {
    #[default]
    LGW_SPI_MUX_MODE0 = 0x00,   /* direct SPI access to the SX1301 */
    LGW_SPI_MUX_MODE1 = 0x01,   /* FPGA in front of the SX1301, every frame is prefixed by a target byte */
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum  LgwSpiMuxTarget{
    #[default]
    LGW_SPI_MUX_TARGET_SX1301 = 0x00,
    LGW_SPI_MUX_TARGET_FPGA = 0x01,
    LGW_SPI_MUX_TARGET_EEPROM = 0x02,
    LGW_SPI_MUX_TARGET_SX1272 = 0x03,
}

impl fmt::Display for LgwSpiMuxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LgwSpiMuxMode::LGW_SPI_MUX_MODE0 => "LGW_SPI_MUX_MODE0",
            LgwSpiMuxMode::LGW_SPI_MUX_MODE1 => "LGW_SPI_MUX_MODE1",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for LgwSpiMuxTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LgwSpiMuxTarget::LGW_SPI_MUX_TARGET_SX1301 => "LGW_SPI_MUX_TARGET_SX1301",
            LgwSpiMuxTarget::LGW_SPI_MUX_TARGET_FPGA => "LGW_SPI_MUX_TARGET_FPGA",
            LgwSpiMuxTarget::LGW_SPI_MUX_TARGET_EEPROM => "LGW_SPI_MUX_TARGET_EEPROM",
            LgwSpiMuxTarget::LGW_SPI_MUX_TARGET_SX1272 => "LGW_SPI_MUX_TARGET_SX1272",
        };
        write!(f, "{}", s)
    }
}

/// Mux mode/target pair resolved at connect time, passed to every register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LgwSpiMux {
    pub mode: LgwSpiMuxMode,
    pub target: LgwSpiMuxTarget,
}

impl LgwSpiMux {
    pub fn new(mode: LgwSpiMuxMode, target: LgwSpiMuxTarget) -> Self {
        Self { mode, target }
    }

    /* SPI command header: [target] R/W|addr */
    pub fn spi_header(&self, address: u8, write: bool) -> Vec<u8> {
        let access = if write { WRITE_ACCESS } else { READ_ACCESS };
        let command = access | (address & 0x7F);
        match self.mode {
            LgwSpiMuxMode::LGW_SPI_MUX_MODE0 => vec![command],
            LgwSpiMuxMode::LGW_SPI_MUX_MODE1 => vec![self.target as u8, command],
        }
    }
}

impl fmt::Display for LgwSpiMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mode, self.target)
    }
}

pub trait LoragwComTrait {
    fn lgw_com_w(&mut self, spi_mux: LgwSpiMux, address: u8, value: u8) -> Result<()>;
    fn lgw_com_r(&mut self, spi_mux: LgwSpiMux, address: u8) -> Result<u8>;
    fn lgw_com_wb(&mut self, spi_mux: LgwSpiMux, address: u8, data: &[u8]) -> Result<()>;
    fn lgw_com_rb(&mut self, spi_mux: LgwSpiMux, address: u8, size: usize) -> Result<Vec<u8>>;
}

impl LoragwComTrait for Hal {
    /* Simple read */
    fn lgw_com_r(&mut self, spi_mux: LgwSpiMux, address: u8) -> Result<u8> {
        let data = self.mcu.lgw_rb(&spi_mux.spi_header(address, false), 1)?;
        let value = data.first().copied().ok_or_else(|| anyhow!("ERROR: empty SPI read"))?;
        trace!(address, value, "lgw_com_r");

        Ok(value)
    }

    fn lgw_com_w(&mut self, spi_mux: LgwSpiMux, address: u8, value: u8) -> Result<()> {
        trace!(address, value, "lgw_com_w");
        self.mcu.lgw_wb(&spi_mux.spi_header(address, true), &[value; 1])
    }

    fn lgw_com_wb(&mut self, spi_mux: LgwSpiMux, address: u8, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(anyhow!("ERROR: empty data array"));
        }

        trace!(address, size = data.len(), "lgw_com_wb");
        self.mcu.lgw_wb(&spi_mux.spi_header(address, true), data)
    }

    fn lgw_com_rb(&mut self, spi_mux: LgwSpiMux, address: u8, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Err(anyhow!("ERROR: empty data array"));
        }

        trace!(address, size, "lgw_com_rb");
        self.mcu.lgw_rb(&spi_mux.spi_header(address, false), size)
    }
}
