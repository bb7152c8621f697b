use anyhow::Result;
use tracing::{debug, error, info, warn};

use super::error::{CalibrationWarningKind, Error, McuTarget};
use super::loragw_com::LgwSpiMux;
use super::loragw_fw::{LoragwFwTrait, FW_VERSION_CAL};
use super::loragw_reg::*;
use super::*;

pub const CAL_TIME_MS: u64 = 2300;    /* measured between 2.1 and 2.2 sec, because 1 TX only */

/* calibration command word sent to the calibration firmware */
const CAL_RX_IQ_A: BitField = BitField::new(0, 1);      /* Rx IQ mismatch compensation on radio A */
const CAL_RX_IQ_B: BitField = BitField::new(1, 1);      /* Rx IQ mismatch compensation on radio B */
const CAL_TX_DC_A: BitField = BitField::new(2, 1);      /* Tx DC offset on radio A */
const CAL_TX_DC_B: BitField = BitField::new(3, 1);      /* Tx DC offset on radio B */
const CAL_DAC_GAIN_3: BitField = BitField::new(4, 1);   /* 0: calibrate with DAC gain=2, 1: with DAC gain=3 */
const CAL_SX1255: BitField = BitField::new(5, 1);       /* 0: SX1257, 1: SX1255 */
const CAL_BOARD_TYPE: BitField = BitField::new(6, 2);   /* 0: ref, 1: FPGA, 3: board X */

/* calibration status bits */
const CAL_STATUS_DONE: u8 = 0x80;
const CAL_STATUS_REG_ACCESS: u8 = 0x01;
const CAL_STATUS_RADIO_A: u8 = 0x02;
const CAL_STATUS_RADIO_B: u8 = 0x04;
const CAL_STATUS_IMG_REJ_A: u8 = 0x08;
const CAL_STATUS_IMG_REJ_B: u8 = 0x10;
const CAL_STATUS_TX_DC_A: u8 = 0x20;
const CAL_STATUS_TX_DC_B: u8 = 0x40;

/* calibration firmware scratch RAM holding the TX DC offsets */
const CAL_OFFSET_A_I: u8 = 0xA0;
const CAL_OFFSET_A_Q: u8 = 0xA8;
const CAL_OFFSET_B_I: u8 = 0xB0;
const CAL_OFFSET_B_Q: u8 = 0xB8;

/* AGC firmware status at each step of the init handshake */
const AGC_STATUS_READY: u8 = 0x10;
const AGC_STATUS_LUT: u8 = 0x30;
const AGC_STATUS_TX_FREQ: u8 = 0x33;
const AGC_STATUS_RUNNING: u8 = 0x40;
const AGC_TX_FREQ_MSB: i32 = 3;  /* always 3 if f > 768 for SX1257 or f > 384 for SX1255 */

const TX_GAIN_MIX: BitField = BitField::new(0, 4);
const TX_GAIN_DAC: BitField = BitField::new(4, 2);
const TX_GAIN_PA: BitField = BitField::new(6, 2);

#[allow(non_snake_case)]
pub fn IF_HZ_TO_REG(f: i32) -> i32 {
    (f << 5) / 15625
}

/// What to do with partial calibration results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationPolicy {
    /// Any missing sub-result aborts the start.
    #[default]
    Strict,
    /// Missing sub-results are logged and returned in the report.
    Permissive,
}

/// Outcome of the calibration firmware run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationReport {
    pub status: u8,
    pub warnings: Vec<CalibrationWarningKind>,
}

impl CalibrationReport {
    /// Interprets the calibration status byte against the RF chains that were asked for.
    ///
    /// bit 7: calibration finished, bit 0: could access SX1301 registers,
    /// bit 1/2: could access radio A/B registers, bit 3/4: radio A/B RX image rejection successful,
    /// bit 5/6: radio A/B TX DC offset correction successful.
    pub fn from_status(status: u8, rf_chain_cfg: &[LgwConfRxrf]) -> Result<Self> {
        let required = CAL_STATUS_DONE | CAL_STATUS_REG_ACCESS;
        if status & required != required {
            error!(status, "ERROR: CALIBRATION FAILURE");
            return Err(Error::CalibrationFailure { status }.into());
        }

        let enabled = |i: usize| rf_chain_cfg.get(i).map(|rf| rf.enable).unwrap_or(false);
        let tx_enabled = |i: usize| rf_chain_cfg.get(i).map(|rf| rf.enable && rf.tx_enable).unwrap_or(false);

        let checks = [
            (enabled(0), CAL_STATUS_RADIO_A, CalibrationWarningKind::RadioAccessA),
            (enabled(1), CAL_STATUS_RADIO_B, CalibrationWarningKind::RadioAccessB),
            (enabled(0), CAL_STATUS_IMG_REJ_A, CalibrationWarningKind::ImageRejectionA),
            (enabled(1), CAL_STATUS_IMG_REJ_B, CalibrationWarningKind::ImageRejectionB),
            (tx_enabled(0), CAL_STATUS_TX_DC_A, CalibrationWarningKind::TxDcOffsetA),
            (tx_enabled(1), CAL_STATUS_TX_DC_B, CalibrationWarningKind::TxDcOffsetB),
        ];

        let warnings = checks
            .iter()
            .filter(|(requested, bit, _)| *requested && status & bit == 0)
            .map(|(_, _, kind)| *kind)
            .collect();

        Ok(Self { status, warnings })
    }

    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Builds the calibration command word. One radio type is assumed for the whole board.
pub fn sx1301_cal_cmd(rf_chain_cfg: &[LgwConfRxrf; LGW_RF_CHAIN_NB as usize]) -> Result<u8> {
    let [a, b] = rf_chain_cfg;

    let sx1255 = match a._type {
        LgwRadioType::LGW_RADIO_TYPE_SX1255 => 1,
        LgwRadioType::LGW_RADIO_TYPE_SX1257 => 0,
        radio_type => {
            error!(radio_type=%radio_type, "ERROR: UNEXPECTED VALUE FOR RADIO TYPE");
            return Err(Error::UnsupportedRadioType { rf_chain: 0, radio_type }.into());
        }
    };

    let cmd = FieldPack::new()
        .with(CAL_RX_IQ_A, a.enable as u32)?
        .with(CAL_RX_IQ_B, b.enable as u32)?
        .with(CAL_TX_DC_A, (a.enable && a.tx_enable) as u32)?
        .with(CAL_TX_DC_B, (b.enable && b.tx_enable) as u32)?
        .with(CAL_DAC_GAIN_3, 1)?
        .with(CAL_SX1255, sx1255)?
        .with(CAL_BOARD_TYPE, 0)?;

    Ok(cmd.bits() as u8)
}

/* IF mapping to radio A/B of the multi-SF chains (per bit, 0=A, 1=B) */
pub fn sx1301_radio_select(if_chain_cfg: &[LgwConfRxIf]) -> u8 {
    if_chain_cfg
        .iter()
        .take(LGW_MULTI_NB as usize)
        .enumerate()
        .filter(|(_, ifc)| ifc.rf_chain == 1)
        .fold(0u8, |acc, (i, _)| acc | (1 << i))
}

/* saturated freq-to-time drift for the multi-SF and standalone modems */
pub fn sx1301_freq_to_time_drift(rf_freq_hz: u32) -> Result<(u32, u32)> {
    if rf_freq_hz >> 3 == 0 {
        return Err(Error::ConfigurationError("wrong configuration, rf_rx_freq[0] is not set".to_string()).into());
    }
    let multi = 4096000000 / (rf_freq_hz >> 1);   /* dividend: (4*2048*1000000) >> 1, rescaled to avoid 32b overflow */
    let mbwssf = 4096000000 / (rf_freq_hz >> 3);  /* dividend: (16*2048*1000000) >> 3, rescaled to avoid 32b overflow */
    Ok((multi.min(63), mbwssf.min(63)))
}

/* value loaded in the AGC firmware for one TX gain LUT entry */
pub fn sx1301_agc_gain_word(gain: &LgwTxGain) -> Result<i32> {
    let word = FieldPack::new()
        .with(TX_GAIN_MIX, gain.mix_gain as u32)?
        .with(TX_GAIN_DAC, gain.dac_gain as u32)?
        .with(TX_GAIN_PA, gain.pa_gain as u32)?;
    Ok(word.bits() as i32)
}

pub trait LoragwSx1301Trait: LoragwRegTrait {
    /// Loads the fixed tuning of the demodulators and of the TX path.
    fn sx1301_constant_adjust(&mut self, spi_mux: LgwSpiMux, lorawan_public: bool) -> Result<()> {
        /* (peak1, peak2) frame synch positions of the public and private sync words */
        let (peak1, peak2) = if lorawan_public { (3, 4) } else { (1, 2) };

        let adjust = [
            /* RSSI settings */
            (RSSI_BB_FILTER_ALPHA, 6),
            (RSSI_DEC_FILTER_ALPHA, 7),
            (RSSI_CHANN_FILTER_ALPHA, 7),
            (RSSI_BB_DEFAULT_VALUE, 23),
            (RSSI_CHANN_DEFAULT_VALUE, 85),
            (RSSI_DEC_DEFAULT_VALUE, 66),
            /* gains and SNR averaging */
            (DEC_GAIN_OFFSET, 7),
            (CHAN_GAIN_OFFSET, 6),
            (SNR_AVG_CST, 3),
            /* LoRa sync words, multi-SF and standalone */
            (FRAME_SYNCH_PEAK1_POS, peak1),
            (FRAME_SYNCH_PEAK2_POS, peak2),
            (MBWSSF_FRAME_SYNCH_PEAK1_POS, peak1),
            (MBWSSF_FRAME_SYNCH_PEAK2_POS, peak2),
            /* LoRa demodulator */
            (ADJUST_MODEM_START_OFFSET_RDX4, 1),
            (ADJUST_MODEM_START_OFFSET_SF12_RDX4, 4094),
            (CORR_MAC_GAIN, 7),
            /* FSK datapath */
            (FSK_RX_INVERT, 1),
            (FSK_MODEM_INVERT_IQ, 1),
            (FSK_RSSI_LENGTH, 4),
            (FSK_PKT_MODE, 1),
            (FSK_CRC_EN, 1),
            (FSK_DCFREE_ENC, 2),
            (FSK_ERROR_OSR_TOL, 10),
            (FSK_PKT_LENGTH, 255),
            (FSK_PATTERN_TIMEOUT_CFG, 128),
            /* TX */
            (TX_START_DELAY, TX_START_DELAY_DEFAULT),
            (TX_SWAP_IQ, 1),
            (TX_FRAME_SYNCH_PEAK1_POS, peak1),
            (TX_FRAME_SYNCH_PEAK2_POS, peak2),
            (FSK_TX_GAUSSIAN_SELECT_BT, 2),
        ];

        for (register, value) in adjust {
            self.lgw_reg_w(spi_mux, register, value)?;
        }

        debug!(lorawan_public, "constant adjust loaded");
        Ok(())
    }

    /// Runs the calibration firmware on the AGC MCU and reads its status.
    fn sx1301_calibrate(&mut self, spi_mux: LgwSpiMux, ctx: &LgwContext, cal_firmware: &[u8], policy: CalibrationPolicy) -> Result<CalibrationReport> {
        let cal_cmd = sx1301_cal_cmd(&ctx.rf_chain_cfg)?;

        /* Load the calibration firmware */
        self.lgw_load_firmware(spi_mux, McuTarget::Agc, cal_firmware)?;
        self.lgw_reg_w(spi_mux, FORCE_HOST_RADIO_CTRL, 0)?; /* gives to AGC MCU the control of the radios */
        self.lgw_reg_w(spi_mux, RADIO_SELECT, cal_cmd as i32)?; /* send calibration configuration word */
        self.lgw_reg_w(spi_mux, MCU_RST_1, 0)?;

        self.lgw_check_fw_version(spi_mux, McuTarget::Agc, "calibration", FW_VERSION_CAL)?;

        /* Calibration starts as soon as the MCU can talk to concentrator registers */
        self.lgw_reg_w(spi_mux, PAGE_REG, 3)?;
        self.lgw_reg_w(spi_mux, EMERGENCY_FORCE_HOST_CTRL, 0)?;

        info!(cal_cmd, cal_time_ms = CAL_TIME_MS, "Note: calibration started");
        self.lgw_wait_ms(CAL_TIME_MS);
        self.lgw_reg_w(spi_mux, EMERGENCY_FORCE_HOST_CTRL, 1)?; /* Take back control */

        let status = self.lgw_reg_r(spi_mux, MCU_AGC_STATUS)? as u8;
        let report = CalibrationReport::from_status(status, &ctx.rf_chain_cfg)?;
        info!(status, "Note: calibration finished");

        if !report.is_complete() {
            for kind in &report.warnings {
                warn!(status, "WARNING: {}", kind);
            }
            if policy == CalibrationPolicy::Strict {
                error!(status, "ERROR: partial calibration rejected");
                return Err(Error::CalibrationWarning { status, warnings: report.warnings }.into());
            }
        }

        Ok(report)
    }

    /// Reads the TX DC offsets left by the calibration firmware.
    fn sx1301_read_cal_offsets(&mut self, spi_mux: LgwSpiMux, offsets: &mut LgwTxCalOffsets) -> Result<()> {
        for i in 0..8u8 {
            let idx = i as usize;
            offsets.offset_i[0][idx] = self.lgw_mcu_ram_r(spi_mux, McuTarget::Agc, CAL_OFFSET_A_I + i)? as i8;
            offsets.offset_q[0][idx] = self.lgw_mcu_ram_r(spi_mux, McuTarget::Agc, CAL_OFFSET_A_Q + i)? as i8;
            offsets.offset_i[1][idx] = self.lgw_mcu_ram_r(spi_mux, McuTarget::Agc, CAL_OFFSET_B_I + i)? as i8;
            offsets.offset_q[1][idx] = self.lgw_mcu_ram_r(spi_mux, McuTarget::Agc, CAL_OFFSET_B_Q + i)? as i8;
        }

        debug!(offsets=?offsets, "TX DC offsets");
        Ok(())
    }

    fn sx1301_freq_drift_setup(&mut self, spi_mux: LgwSpiMux, rf_freq_hz: u32) -> Result<()> {
        let (multi, mbwssf) = sx1301_freq_to_time_drift(rf_freq_hz)?;
        self.lgw_reg_w(spi_mux, FREQ_TO_TIME_DRIFT, multi as i32)?; /* default 9 */
        self.lgw_reg_w(spi_mux, MBWSSF_FREQ_TO_TIME_DRIFT, mbwssf as i32)?; /* default 36 */
        Ok(())
    }

    /// Programs the multi-SF, standalone LoRa and FSK channels.
    fn sx1301_channels_setup(&mut self, spi_mux: LgwSpiMux, ctx: &LgwContext) -> Result<()> {
        /* LoRa 'multi' demodulators */
        for i in 0..LGW_MULTI_NB as usize {
            let ifc = &ctx.if_chain_cfg[i];
            self.lgw_reg_w(spi_mux, IF_FREQ[i], IF_HZ_TO_REG(ifc.freq_hz))?;
            let sfmask = if ifc.enable { ctx.lora_multi_sfmask[i] as i32 } else { 0 };
            self.lgw_reg_w(spi_mux, CORR_DETECT_EN[i], sfmask)?;
        }
        self.lgw_reg_w(spi_mux, PPM_OFFSET, 0x60)?; /* as the threshold is 16ms, use 0x60 to enable ppm_offset for SF12 and SF11 @125kHz*/
        self.lgw_reg_w(spi_mux, CONCENTRATOR_MODEM_ENABLE, 1)?;

        /* LoRa 'stand-alone' modem (IF8) */
        let lora_std = ctx.lora_std_cfg();
        self.lgw_reg_w(spi_mux, IF_FREQ[8], IF_HZ_TO_REG(lora_std.freq_hz))?;
        if lora_std.enable {
            let bw = match lora_std.bandwidth {
                BW_125KHZ => 0,
                BW_250KHZ => 1,
                BW_500KHZ => 2,
                bandwidth => {
                    error!(bandwidth, "ERROR: UNEXPECTED VALUE IN LORA STANDALONE BANDWIDTH");
                    return Err(Error::ConfigurationError(format!("LoRa standalone bandwidth code {}", bandwidth)).into());
                }
            };
            let sf = match lora_std.datarate {
                DR_LORA_SF7 => 7,
                DR_LORA_SF8 => 8,
                DR_LORA_SF9 => 9,
                DR_LORA_SF10 => 10,
                DR_LORA_SF11 => 11,
                DR_LORA_SF12 => 12,
                datarate => {
                    error!(datarate, "ERROR: UNEXPECTED VALUE IN LORA STANDALONE DATARATE");
                    return Err(Error::ConfigurationError(format!("LoRa standalone datarate 0x{:02X}", datarate)).into());
                }
            };
            self.lgw_reg_w(spi_mux, MBWSSF_RADIO_SELECT, lora_std.rf_chain as i32)?;
            self.lgw_reg_w(spi_mux, MBWSSF_MODEM_BW, bw)?;
            self.lgw_reg_w(spi_mux, MBWSSF_RATE_SF, sf)?;
            self.lgw_reg_w(spi_mux, MBWSSF_PPM_OFFSET, ctx.lora_rx_ppm_offset as i32)?;
            self.lgw_reg_w(spi_mux, MBWSSF_MODEM_ENABLE, 1)?;
        } else {
            self.lgw_reg_w(spi_mux, MBWSSF_MODEM_ENABLE, 0)?;
        }

        /* FSK modem (IF9) */
        let fsk = ctx.fsk_cfg();
        let sync_size = fsk.sync_word_size.clamp(1, 8);
        self.lgw_reg_w(spi_mux, IF_FREQ[9], IF_HZ_TO_REG(fsk.freq_hz))?;
        self.lgw_reg_w(spi_mux, FSK_PSIZE, (sync_size - 1) as i32)?;
        self.lgw_reg_w(spi_mux, FSK_TX_PSIZE, (sync_size - 1) as i32)?;
        let sync_word_reg = fsk.sync_word.checked_shl(8 * (8 - sync_size as u32)).unwrap_or(0);
        self.lgw_reg_w(spi_mux, FSK_REF_PATTERN_LSB, sync_word_reg as u32 as i32)?;
        self.lgw_reg_w(spi_mux, FSK_REF_PATTERN_MSB, (sync_word_reg >> 32) as u32 as i32)?;
        if fsk.enable {
            if fsk.datarate == 0 {
                return Err(Error::ConfigurationError("FSK datarate not set".to_string()).into());
            }
            self.lgw_reg_w(spi_mux, FSK_RADIO_SELECT, fsk.rf_chain as i32)?;
            self.lgw_reg_w(spi_mux, FSK_BR_RATIO, (LGW_XTAL_FREQU / fsk.datarate) as i32)?; /* setting the dividing ratio for datarate */
            self.lgw_reg_w(spi_mux, FSK_CH_BW_EXPO, fsk.bandwidth as i32)?;
            self.lgw_reg_w(spi_mux, FSK_MODEM_ENABLE, 1)?;
        } else {
            self.lgw_reg_w(spi_mux, FSK_MODEM_ENABLE, 0)?;
        }

        debug!(radio_select = sx1301_radio_select(&ctx.if_chain_cfg), "channels configured");
        Ok(())
    }

    /* one AGC firmware transaction: WAIT, value, then status check */
    fn sx1301_agc_cmd(&mut self, spi_mux: LgwSpiMux, value: i32, step: &'static str, expected: u8) -> Result<()> {
        self.lgw_reg_w(spi_mux, RADIO_SELECT, AGC_CMD_WAIT)?; /* start a transaction */
        self.lgw_wait_ms(1);
        self.lgw_reg_w(spi_mux, RADIO_SELECT, value)?;
        self.lgw_wait_ms(1);
        self.sx1301_agc_check(spi_mux, step, expected)
    }

    fn sx1301_agc_check(&mut self, spi_mux: LgwSpiMux, step: &'static str, expected: u8) -> Result<()> {
        let status = self.lgw_reg_r(spi_mux, MCU_AGC_STATUS)? as u8;
        if status != expected {
            error!(step, expected, status, "ERROR: AGC FIRMWARE INITIALIZATION FAILURE");
            return Err(Error::AgcInitFailure { step, expected, status }.into());
        }
        Ok(())
    }

    /// Uploads the TX gain LUT to the running AGC firmware and hands back RADIO_SELECT.
    fn sx1301_agc_init(&mut self, spi_mux: LgwSpiMux, ctx: &LgwContext) -> Result<()> {
        info!("Info: Initialising AGC firmware...");
        self.lgw_wait_ms(1);
        self.sx1301_agc_check(spi_mux, "init", AGC_STATUS_READY)?;

        let lut = ctx.tx_gain_lut.entries();
        for (i, gain) in lut.iter().enumerate() {
            let word = sx1301_agc_gain_word(gain)?;
            self.sx1301_agc_cmd(spi_mux, word, "tx gain lut", AGC_STATUS_LUT + i as u8)?;
        }

        /* the firmware waits for 16 entries, abort the transaction on a shorter table */
        if lut.len() < TX_GAIN_LUT_SIZE_MAX {
            self.sx1301_agc_cmd(spi_mux, AGC_CMD_ABORT, "tx gain lut abort", AGC_STATUS_LUT)?;
        }

        self.sx1301_agc_cmd(spi_mux, AGC_TX_FREQ_MSB, "tx freq msb", AGC_STATUS_TX_FREQ)?;
        self.sx1301_agc_cmd(spi_mux, 0, "chan_select", AGC_STATUS_LUT)?;

        let radio_select = sx1301_radio_select(&ctx.if_chain_cfg);
        self.sx1301_agc_cmd(spi_mux, radio_select as i32, "radio_select", AGC_STATUS_RUNNING)?;

        debug!(lut_size = lut.len(), radio_select, "AGC firmware running");
        Ok(())
    }
}

impl<T: LoragwRegTrait + ?Sized> LoragwSx1301Trait for T {}
