use std::path::Path;

use anyhow::Result;
use tracing::{debug, error, info};

use super::error::{Error, McuTarget};
use super::loragw_com::LgwSpiMux;
use super::loragw_reg::*;

/// Size of an MCU program memory image (14-bit words stored as byte pairs).
pub const MCU_FW_SIZE: usize = 8192;

pub const FW_VERSION_ADDR: u8 = 0x20;   /* Address of firmware version in data memory */
pub const FW_VERSION_CAL: u8 = 2;       /* Expected version of calibration firmware */
pub const FW_VERSION_AGC: u8 = 4;       /* Expected version of AGC firmware */
pub const FW_VERSION_ARB: u8 = 1;       /* Expected version of arbiter firmware */

/// The three MCU images needed to start the concentrator.
#[derive(Debug, Clone)]
pub struct LgwFirmware {
    pub cal: Vec<u8>,
    pub arb: Vec<u8>,
    pub agc: Vec<u8>,
}

fn check_image(name: &str, image: &[u8]) -> Result<()> {
    if image.len() != MCU_FW_SIZE {
        return Err(Error::ConfigurationError(format!(
            "{} firmware is {} bytes, expected {}",
            name,
            image.len(),
            MCU_FW_SIZE
        ))
        .into());
    }
    Ok(())
}

fn read_image(name: &str, path: &Path) -> Result<Vec<u8>> {
    let image = std::fs::read(path).map_err(|e| {
        Error::ConfigurationError(format!("cannot read {} firmware {}: {}", name, path.display(), e))
    })?;
    check_image(name, &image)?;
    Ok(image)
}

impl LgwFirmware {
    pub fn new(cal: Vec<u8>, arb: Vec<u8>, agc: Vec<u8>) -> Result<Self> {
        check_image("calibration", &cal)?;
        check_image("arbiter", &arb)?;
        check_image("AGC", &agc)?;

        Ok(Self { cal, arb, agc })
    }

    pub fn from_files<P: AsRef<Path>>(cal: P, arb: P, agc: P) -> Result<Self> {
        Ok(Self {
            cal: read_image("calibration", cal.as_ref())?,
            arb: read_image("arbiter", arb.as_ref())?,
            agc: read_image("AGC", agc.as_ref())?,
        })
    }
}

impl McuTarget {
    /* reset and program-RAM mux select registers of the MCU */
    fn registers(&self) -> (LgwRegister, LgwRegister) {
        match self {
            McuTarget::Arb => (MCU_RST_0, MCU_SELECT_MUX_0),
            McuTarget::Agc => (MCU_RST_1, MCU_SELECT_MUX_1),
        }
    }

    fn debug_ram(&self) -> (LgwRegister, LgwRegister) {
        match self {
            McuTarget::Arb => (DBG_ARB_MCU_RAM_ADDR, DBG_ARB_MCU_RAM_DATA),
            McuTarget::Agc => (DBG_AGC_MCU_RAM_ADDR, DBG_AGC_MCU_RAM_DATA),
        }
    }
}

pub trait LoragwFwTrait: LoragwRegTrait {
    /// Writes `firmware` into the program RAM of `target` and verifies it byte for byte.
    ///
    /// The MCU is left in reset; releasing it is up to the caller.
    fn lgw_load_firmware(&mut self, spi_mux: LgwSpiMux, target: McuTarget, firmware: &[u8]) -> Result<()> {
        check_image(&target.to_string(), firmware)?;
        let (reg_rst, reg_sel) = target.registers();

        /* reset the targeted MCU */
        self.lgw_reg_w(spi_mux, reg_rst, 1)?;

        /* set mux to access MCU program RAM and set address to 0 */
        self.lgw_reg_w(spi_mux, reg_sel, 0)?;
        self.lgw_reg_w(spi_mux, MCU_PROM_ADDR, 0)?;

        /* write the program in one burst */
        self.lgw_reg_wb(spi_mux, MCU_PROM_DATA, firmware)?;

        /* chip quirk: the first read after the write returns stale data, result discarded */
        let _ = self.lgw_reg_rb(spi_mux, MCU_PROM_DATA, firmware.len())?;
        let fw_check = self.lgw_reg_rb(spi_mux, MCU_PROM_DATA, firmware.len())?;

        let mismatch = firmware
            .iter()
            .zip(fw_check.iter())
            .position(|(written, read)| written != read)
            .or_else(|| (fw_check.len() != firmware.len()).then_some(fw_check.len().min(firmware.len())));

        if let Some(offset) = mismatch {
            error!(target=%target, offset, "ERROR: firmware readback mismatch");
            return Err(Error::FirmwareVerificationFailed { target, offset }.into());
        }

        /* give back control of the MCU program ram to the MCU */
        self.lgw_reg_w(spi_mux, reg_sel, 1)?;

        debug!(target=%target, size = firmware.len(), "firmware loaded and verified");
        Ok(())
    }

    /// Reads one byte of the MCU data memory through the debug port.
    fn lgw_mcu_ram_r(&mut self, spi_mux: LgwSpiMux, target: McuTarget, addr: u8) -> Result<u8> {
        let (reg_addr, reg_data) = target.debug_ram();
        self.lgw_reg_w(spi_mux, reg_addr, addr as i32)?;
        Ok(self.lgw_reg_r(spi_mux, reg_data)? as u8)
    }

    fn lgw_check_fw_version(&mut self, spi_mux: LgwSpiMux, target: McuTarget, firmware: &'static str, expected: u8) -> Result<()> {
        let actual = self.lgw_mcu_ram_r(spi_mux, target, FW_VERSION_ADDR)?;
        if actual != expected {
            error!(firmware, actual, expected, "ERROR: Version of firmware not expected");
            return Err(Error::FirmwareVersionMismatch { firmware, expected, actual }.into());
        }

        info!(firmware, version = actual, "firmware version checked");
        Ok(())
    }
}

impl<T: LoragwRegTrait + ?Sized> LoragwFwTrait for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{MockHal, MockOp};

    fn image() -> Vec<u8> {
        (0..MCU_FW_SIZE).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn echoed_image_is_verified() {
        let mut hal = MockHal::new();
        let mux = LgwSpiMux::default();

        hal.lgw_load_firmware(mux, McuTarget::Agc, &image()).unwrap();

        assert_eq!(
            hal.ops,
            vec![
                MockOp::Write("MCU_RST_1", 1),
                MockOp::Write("MCU_SELECT_MUX_1", 0),
                MockOp::Write("MCU_PROM_ADDR", 0),
                MockOp::WriteBurst("MCU_PROM_DATA", MCU_FW_SIZE),
                MockOp::ReadBurst("MCU_PROM_DATA", MCU_FW_SIZE),
                MockOp::ReadBurst("MCU_PROM_DATA", MCU_FW_SIZE),
                MockOp::Write("MCU_SELECT_MUX_1", 1),
            ]
        );
    }

    #[test]
    fn stale_first_readback_is_ignored() {
        let mut hal = MockHal::new();
        hal.queue_burst(MCU_PROM_DATA, vec![0xEE; MCU_FW_SIZE]);

        hal.lgw_load_firmware(LgwSpiMux::default(), McuTarget::Arb, &image()).unwrap();
        assert!(hal.ops.contains(&MockOp::Write("MCU_SELECT_MUX_0", 1)));
    }

    #[test]
    fn flipped_byte_fails_verification() {
        let mut hal = MockHal::new();
        hal.corrupt_echo_at = Some(4242);

        let err = hal.lgw_load_firmware(LgwSpiMux::default(), McuTarget::Arb, &image()).unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::FirmwareVerificationFailed { target, offset }) => {
                assert_eq!(*target, McuTarget::Arb);
                assert_eq!(*offset, 4242);
            }
            other => panic!("unexpected error {:?}", other),
        }
        /* program RAM is not handed back */
        assert!(!hal.ops.contains(&MockOp::Write("MCU_SELECT_MUX_0", 1)));
    }

    #[test]
    fn short_image_is_rejected_before_io() {
        let mut hal = MockHal::new();
        let err = hal.lgw_load_firmware(LgwSpiMux::default(), McuTarget::Arb, &[0u8; 100]).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ConfigurationError(_))));
        assert!(hal.ops.is_empty());
    }

    #[test]
    fn firmware_set_requires_full_images() {
        assert!(LgwFirmware::new(image(), image(), image()).is_ok());
        assert!(LgwFirmware::new(image(), vec![0; 10], image()).is_err());
    }

    #[test]
    fn version_mismatch_is_reported() {
        let mut hal = MockHal::new();
        hal.queue_read(DBG_ARB_MCU_RAM_DATA, 3);

        let err = hal.lgw_check_fw_version(LgwSpiMux::default(), McuTarget::Arb, "arbiter", FW_VERSION_ARB).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::FirmwareVersionMismatch { expected: 1, actual: 3, .. })
        ));
        assert_eq!(hal.ops[0], MockOp::Write("DBG_ARB_MCU_RAM_ADDR", FW_VERSION_ADDR as i32));
    }
}
