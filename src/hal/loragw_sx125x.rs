use anyhow::Result;
use tracing::{debug, error, trace};

use super::error::Error;
use super::loragw_com::LgwSpiMux;
use super::loragw_reg::*;
use super::{LgwRadioType, LGW_RF_CHAIN_NB};

pub const SX125X_32MHZ_FRAC: u32 = 15625;  /* irreductible fraction for PLL register caculation */
pub const PLL_LOCK_MAX_ATTEMPTS: u8 = 5;

/* SX125x register map */
const SX125X_REG_MODE: u8 = 0x00;
const SX125X_REG_FRF_RX_MSB: u8 = 0x01;
const SX125X_REG_FRF_RX_MID: u8 = 0x02;
const SX125X_REG_FRF_RX_LSB: u8 = 0x03;
const SX125X_REG_VERSION: u8 = 0x07;
const SX125X_REG_TX_GAIN: u8 = 0x08;
const SX125X_REG_TX_BW: u8 = 0x0A;
const SX125X_REG_TX_DAC_BW: u8 = 0x0B;
const SX125X_REG_RX_ANA_GAIN: u8 = 0x0C;
const SX125X_REG_RX_BW: u8 = 0x0D;
const SX125X_REG_RX_PLL_BW: u8 = 0x0E;
const SX125X_REG_CLK_SELECT: u8 = 0x10;
const SX125X_REG_MODE_STATUS: u8 = 0x11;
const SX1257_REG_XOSC: u8 = 0x26;
const SX1255_REG_XOSC: u8 = 0x28;

const SX125X_SPI_ADDR_MAX: u8 = 0x7F;

/* packed fields */
const MODE_XOSC_EN: BitField = BitField::new(0, 1);
const MODE_RX_EN: BitField = BitField::new(1, 1);
const STATUS_RX_PLL_LOCK: BitField = BitField::new(1, 1);
const TX_GAIN_MIX: BitField = BitField::new(0, 4);
const TX_GAIN_DAC: BitField = BitField::new(4, 2);
const TX_BW_ANA: BitField = BitField::new(0, 5);
const TX_BW_PLL: BitField = BitField::new(5, 2);
const TX_DAC_BW: BitField = BitField::new(0, 3);
const RX_ANA_ZIN: BitField = BitField::new(0, 1);
const RX_ANA_BB_GAIN: BitField = BitField::new(1, 4);
const RX_ANA_LNA_GAIN: BitField = BitField::new(5, 3);
const RX_BW_BB: BitField = BitField::new(0, 2);
const RX_BW_ADC_TRIM: BitField = BitField::new(2, 3);
const RX_BW_ADC: BitField = BitField::new(5, 3);
const RX_PLL_ADC_TEMP: BitField = BitField::new(0, 1);
const RX_PLL_BW: BitField = BitField::new(1, 2);
const CLK_SELECT_DAC: BitField = BitField::new(0, 1);
const CLK_SELECT_OUT: BitField = BitField::new(1, 1);
const XOSC_GM_STARTUP: BitField = BitField::new(0, 4);
const XOSC_DISABLE: BitField = BitField::new(4, 3);

/// Board-characterised analog settings of the SX125x radios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sx125xConf {
    pub tx_dac_clk_sel: u8,     /* 0:int, 1:ext */
    pub tx_dac_gain: u8,        /* 3:0, 2:-3, 1:-6, 0:-9 dBFS */
    pub tx_mix_gain: u8,        /* -38 + 2*TxMixGain dB */
    pub tx_pll_bw: u8,          /* 0:75, 1:150, 2:225, 3:300 kHz */
    pub tx_ana_bw: u8,          /* 17.5 / 2*(41-TxAnaBw) MHz */
    pub tx_dac_bw: u8,          /* 24 + 8*TxDacBw Nb FIR taps */
    pub rx_lna_gain: u8,        /* 1 to 6, 1 highest gain */
    pub rx_bb_gain: u8,         /* 0 to 15 , 15 highest gain */
    pub lna_zin: u8,            /* 0:50, 1:200 Ohms */
    pub rx_adc_bw: u8,          /* 0 to 7, 2:100<BW<200, 5:200<BW<400,7:400<BW kHz SSB */
    pub rx_adc_trim: u8,        /* 0 to 7, 6 for 32MHz ref, 5 for 36MHz ref */
    pub rx_bb_bw: u8,           /* 0:750, 1:500, 2:375; 3:250 kHz SSB */
    pub rx_pll_bw: u8,          /* 0:75, 1:150, 2:225, 3:300 kHz */
    pub adc_temp: u8,           /* ADC temperature measurement mode */
    pub xosc_gm_startup: u8,
    pub xosc_disable: u8,       /* bit0:regulator, bit1:core(gm), bit2:amplifier */
}

impl Default for Sx125xConf {
    fn default() -> Self {
        Self {
            tx_dac_clk_sel: 1,
            tx_dac_gain: 2,
            tx_mix_gain: 14,
            tx_pll_bw: 1,
            tx_ana_bw: 0,
            tx_dac_bw: 5,
            rx_lna_gain: 1,
            rx_bb_gain: 12,
            lna_zin: 1,
            rx_adc_bw: 7,
            rx_adc_trim: 6,
            rx_bb_bw: 0,
            rx_pll_bw: 0,
            adc_temp: 0,
            xosc_gm_startup: 13,
            xosc_disable: 2,
        }
    }
}

/* (integer shift, fractional shift) of the PLL word */
fn sx125x_pll_shifts(radio_type: LgwRadioType) -> Result<(u32, u32)> {
    match radio_type {
        LgwRadioType::LGW_RADIO_TYPE_SX1255 => Ok((7, 9)),
        LgwRadioType::LGW_RADIO_TYPE_SX1257 => Ok((8, 8)),
        other => Err(Error::ConfigurationError(format!("no PLL settings for radio type {}", other)).into()),
    }
}

/// Computes the RX PLL registers (MSB, MID, LSB) for `freq_hz`.
pub fn sx125x_pll_registers(radio_type: LgwRadioType, freq_hz: u32) -> Result<[u8; 3]> {
    let (shift, frac_shift) = sx125x_pll_shifts(radio_type)?;
    let step = (SX125X_32MHZ_FRAC as u64) << shift;

    let part_int = freq_hz as u64 / step;                                           /* integer part, gives the MSB */
    let part_frac = ((freq_hz as u64 % step) << frac_shift) / SX125X_32MHZ_FRAC as u64; /* fractional part, gives middle part and LSB */

    if part_int > 0xFF {
        return Err(Error::ConfigurationError(format!("frequency {} Hz out of range for {}", freq_hz, radio_type)).into());
    }

    Ok([part_int as u8, (part_frac >> 8) as u8, part_frac as u8])
}

/// Inverse of [`sx125x_pll_registers`], rounded down to the PLL resolution.
pub fn sx125x_pll_to_freq(radio_type: LgwRadioType, regs: [u8; 3]) -> Result<u32> {
    let (shift, frac_shift) = sx125x_pll_shifts(radio_type)?;
    let part_int = regs[0] as u64;
    let part_frac = ((regs[1] as u64) << 8) | regs[2] as u64;

    let freq = part_int * ((SX125X_32MHZ_FRAC as u64) << shift) + ((part_frac * SX125X_32MHZ_FRAC as u64) >> frac_shift);
    Ok(freq as u32)
}

/* SPI master registers driving the radio of an RF chain: (addr, data, cs, readback) */
fn sx125x_spi_registers(rf_chain: u8) -> Result<(LgwRegister, LgwRegister, LgwRegister, LgwRegister)> {
    match rf_chain {
        0 => Ok((SPI_RADIO_A__ADDR, SPI_RADIO_A__DATA, SPI_RADIO_A__CS, SPI_RADIO_A__DATA_READBACK)),
        1 => Ok((SPI_RADIO_B__ADDR, SPI_RADIO_B__DATA, SPI_RADIO_B__CS, SPI_RADIO_B__DATA_READBACK)),
        _ => Err(Error::ConfigurationError(format!("invalid RF chain {}", rf_chain)).into()),
    }
}

fn check_sx125x_addr(addr: u8) -> Result<()> {
    if addr >= SX125X_SPI_ADDR_MAX {
        return Err(Error::ConfigurationError(format!("SX125x address 0x{:02X} out of range", addr)).into());
    }
    Ok(())
}

pub trait LoragwSx125xTrait: LoragwRegTrait {
    fn sx125x_w(&mut self, spi_mux: LgwSpiMux, rf_chain: u8, addr: u8, data: u8) -> Result<()> {
        let (reg_add, reg_dat, reg_cs, _) = sx125x_spi_registers(rf_chain)?;
        check_sx125x_addr(addr)?;

        /* SPI master data write procedure */
        self.lgw_reg_w(spi_mux, reg_cs, 0)?;
        self.lgw_reg_w(spi_mux, reg_add, (0x80 | addr) as i32)?; /* MSB at 1 for write operation */
        self.lgw_reg_w(spi_mux, reg_dat, data as i32)?;
        self.lgw_reg_w(spi_mux, reg_cs, 1)?;
        self.lgw_reg_w(spi_mux, reg_cs, 0)?;

        trace!(rf_chain, addr, data, "sx125x_w");
        Ok(())
    }

    fn sx125x_r(&mut self, spi_mux: LgwSpiMux, rf_chain: u8, addr: u8) -> Result<u8> {
        let (reg_add, reg_dat, reg_cs, reg_rb) = sx125x_spi_registers(rf_chain)?;
        check_sx125x_addr(addr)?;

        /* SPI master data read procedure */
        self.lgw_reg_w(spi_mux, reg_cs, 0)?;
        self.lgw_reg_w(spi_mux, reg_add, addr as i32)?; /* MSB at 0 for read operation */
        self.lgw_reg_w(spi_mux, reg_dat, 0)?;
        self.lgw_reg_w(spi_mux, reg_cs, 1)?;
        self.lgw_reg_w(spi_mux, reg_cs, 0)?;
        let data = self.lgw_reg_r(spi_mux, reg_rb)? as u8;

        trace!(rf_chain, addr, data, "sx125x_r");
        Ok(data)
    }

    /// Configures the radio of `rf_chain` and, if enabled, locks its RX PLL on `freq_hz`.
    #[allow(clippy::too_many_arguments)]
    fn lgw_setup_sx125x(
        &mut self,
        spi_mux: LgwSpiMux,
        rf_chain: u8,
        rf_clkout: u8,
        rf_enable: bool,
        rf_radio_type: LgwRadioType,
        freq_hz: u32,
        conf: &Sx125xConf,
    ) -> Result<()> {
        if rf_chain >= LGW_RF_CHAIN_NB {
            return Err(Error::ConfigurationError(format!("invalid RF chain {}", rf_chain)).into());
        }

        /* Get version to identify SX1255/57 silicon revision */
        let version = self.sx125x_r(spi_mux, rf_chain, SX125X_REG_VERSION)?;
        debug!(rf_chain, "Note: SX125x #{} version register returned 0x{:02X}", rf_chain, version);

        /* General radio setup */
        let clk_select = FieldPack::new()
            .with(CLK_SELECT_DAC, conf.tx_dac_clk_sel as u32)?
            .with(CLK_SELECT_OUT, (rf_clkout == rf_chain) as u32)?;
        self.sx125x_w(spi_mux, rf_chain, SX125X_REG_CLK_SELECT, clk_select.bits() as u8)?;

        let xosc_addr = match rf_radio_type {
            LgwRadioType::LGW_RADIO_TYPE_SX1255 => SX1255_REG_XOSC,
            LgwRadioType::LGW_RADIO_TYPE_SX1257 => SX1257_REG_XOSC,
            radio_type => {
                error!(rf_chain, radio_type=%radio_type, "ERROR: UNEXPECTED VALUE FOR RADIO TYPE");
                return Err(Error::UnsupportedRadioType { rf_chain, radio_type }.into());
            }
        };
        let xosc = FieldPack::new()
            .with(XOSC_GM_STARTUP, conf.xosc_gm_startup as u32)?
            .with(XOSC_DISABLE, conf.xosc_disable as u32)?;
        self.sx125x_w(spi_mux, rf_chain, xosc_addr, xosc.bits() as u8)?;

        let tx_gain = FieldPack::new()
            .with(TX_GAIN_MIX, conf.tx_mix_gain as u32)?
            .with(TX_GAIN_DAC, conf.tx_dac_gain as u32)?;
        self.sx125x_w(spi_mux, rf_chain, SX125X_REG_TX_GAIN, tx_gain.bits() as u8)?;

        let tx_bw = FieldPack::new()
            .with(TX_BW_ANA, conf.tx_ana_bw as u32)?
            .with(TX_BW_PLL, conf.tx_pll_bw as u32)?;
        self.sx125x_w(spi_mux, rf_chain, SX125X_REG_TX_BW, tx_bw.bits() as u8)?;

        let tx_dac_bw = FieldPack::new().with(TX_DAC_BW, conf.tx_dac_bw as u32)?;
        self.sx125x_w(spi_mux, rf_chain, SX125X_REG_TX_DAC_BW, tx_dac_bw.bits() as u8)?;

        /* Rx gain and trim */
        let rx_ana_gain = FieldPack::new()
            .with(RX_ANA_ZIN, conf.lna_zin as u32)?
            .with(RX_ANA_BB_GAIN, conf.rx_bb_gain as u32)?
            .with(RX_ANA_LNA_GAIN, conf.rx_lna_gain as u32)?;
        self.sx125x_w(spi_mux, rf_chain, SX125X_REG_RX_ANA_GAIN, rx_ana_gain.bits() as u8)?;

        let rx_bw = FieldPack::new()
            .with(RX_BW_BB, conf.rx_bb_bw as u32)?
            .with(RX_BW_ADC_TRIM, conf.rx_adc_trim as u32)?
            .with(RX_BW_ADC, conf.rx_adc_bw as u32)?;
        self.sx125x_w(spi_mux, rf_chain, SX125X_REG_RX_BW, rx_bw.bits() as u8)?;

        let rx_pll_bw = FieldPack::new()
            .with(RX_PLL_ADC_TEMP, conf.adc_temp as u32)?
            .with(RX_PLL_BW, conf.rx_pll_bw as u32)?;
        self.sx125x_w(spi_mux, rf_chain, SX125X_REG_RX_PLL_BW, rx_pll_bw.bits() as u8)?;

        /* set RX PLL frequency */
        let [msb, mid, lsb] = sx125x_pll_registers(rf_radio_type, freq_hz)?;
        self.sx125x_w(spi_mux, rf_chain, SX125X_REG_FRF_RX_MSB, msb)?;
        self.sx125x_w(spi_mux, rf_chain, SX125X_REG_FRF_RX_MID, mid)?;
        self.sx125x_w(spi_mux, rf_chain, SX125X_REG_FRF_RX_LSB, lsb)?;
        let pll_freq_hz = sx125x_pll_to_freq(rf_radio_type, [msb, mid, lsb])?;
        debug!(rf_chain, freq_hz, pll_freq_hz, "SX125x RX PLL programmed");

        if !rf_enable {
            debug!(rf_chain, "SX125x kept in standby mode");
            return Ok(());
        }

        /* start and PLL lock */
        let xosc_on = FieldPack::new().with(MODE_XOSC_EN, 1)?.bits() as u8;
        let rx_on = FieldPack::new().with(MODE_XOSC_EN, 1)?.with(MODE_RX_EN, 1)?.bits() as u8;
        for attempt in 1..=PLL_LOCK_MAX_ATTEMPTS {
            self.sx125x_w(spi_mux, rf_chain, SX125X_REG_MODE, xosc_on)?;  /* enable Xtal oscillator */
            self.sx125x_w(spi_mux, rf_chain, SX125X_REG_MODE, rx_on)?;    /* Enable RX (PLL+FE) */
            self.lgw_wait_ms(1);

            let status = self.sx125x_r(spi_mux, rf_chain, SX125X_REG_MODE_STATUS)?;
            if STATUS_RX_PLL_LOCK.extract(status as u32) == 1 {
                debug!(rf_chain, attempt, "SX125x RX PLL locked");
                return Ok(());
            }
            trace!(rf_chain, attempt, status, "SX125x RX PLL not locked yet");
        }

        error!(rf_chain, "ERROR: FAIL TO LOCK PLL");
        Err(Error::PllLockTimeout { rf_chain, attempts: PLL_LOCK_MAX_ATTEMPTS }.into())
    }
}

impl<T: LoragwRegTrait + ?Sized> LoragwSx125xTrait for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{MockHal, MockOp};

    #[test]
    fn pll_words_round_trip_within_one_step() {
        for (radio_type, frac_shift) in [
            (LgwRadioType::LGW_RADIO_TYPE_SX1255, 9),
            (LgwRadioType::LGW_RADIO_TYPE_SX1257, 8),
        ] {
            for freq_hz in [433_175_000u32, 434_665_000, 470_300_000, 500_000_001] {
                if radio_type == LgwRadioType::LGW_RADIO_TYPE_SX1257 && freq_hz < 500_000_000 {
                    continue;
                }
                let regs = sx125x_pll_registers(radio_type, freq_hz).unwrap();
                let decoded = sx125x_pll_to_freq(radio_type, regs).unwrap();
                assert!(decoded <= freq_hz);
                assert!(freq_hz - decoded < (SX125X_32MHZ_FRAC >> frac_shift) + 2, "{} -> {}", freq_hz, decoded);
            }
        }

        for freq_hz in [867_500_000u32, 868_100_000, 902_300_000, 915_000_000, 923_200_000] {
            let regs = sx125x_pll_registers(LgwRadioType::LGW_RADIO_TYPE_SX1257, freq_hz).unwrap();
            let decoded = sx125x_pll_to_freq(LgwRadioType::LGW_RADIO_TYPE_SX1257, regs).unwrap();
            assert!(freq_hz - decoded < (SX125X_32MHZ_FRAC >> 8) + 2);
        }
    }

    #[test]
    fn pll_word_for_868mhz() {
        /* 868.5 MHz = 217 * 4 MHz + 0.5 MHz */
        let regs = sx125x_pll_registers(LgwRadioType::LGW_RADIO_TYPE_SX1257, 868_500_000).unwrap();
        assert_eq!(regs, [217, 0x20, 0x00]);
    }

    #[test]
    fn pll_rejects_other_radios_and_out_of_range() {
        assert!(sx125x_pll_registers(LgwRadioType::LGW_RADIO_TYPE_SX1272, 868_000_000).is_err());
        assert!(sx125x_pll_registers(LgwRadioType::LGW_RADIO_TYPE_SX1255, 868_000_000).is_err());
    }

    #[test]
    fn spi_write_sequence() {
        let mut hal = MockHal::new();
        hal.sx125x_w(LgwSpiMux::default(), 1, 0x0C, 0x39).unwrap();
        assert_eq!(
            hal.ops,
            vec![
                MockOp::Write("SPI_RADIO_B__CS", 0),
                MockOp::Write("SPI_RADIO_B__ADDR", 0x8C),
                MockOp::Write("SPI_RADIO_B__DATA", 0x39),
                MockOp::Write("SPI_RADIO_B__CS", 1),
                MockOp::Write("SPI_RADIO_B__CS", 0),
            ]
        );
    }

    #[test]
    fn spi_rejects_bad_chain_and_address() {
        let mut hal = MockHal::new();
        assert!(hal.sx125x_w(LgwSpiMux::default(), 2, 0x00, 0).is_err());
        assert!(hal.sx125x_r(LgwSpiMux::default(), 0, 0x7F).is_err());
        assert!(hal.ops.is_empty());
    }

    #[test]
    fn setup_locks_on_first_set_bit() {
        let mut hal = MockHal::new();
        hal.set_value(SPI_RADIO_A__DATA_READBACK, 0x00);
        /* version, then two unlocked polls, then locked */
        hal.queue_reads(SPI_RADIO_A__DATA_READBACK, &[0x11, 0x00, 0x01, 0x02]);

        hal.lgw_setup_sx125x(
            LgwSpiMux::default(),
            0,
            0,
            true,
            LgwRadioType::LGW_RADIO_TYPE_SX1257,
            867_500_000,
            &Sx125xConf::default(),
        )
        .unwrap();

        assert_eq!(hal.waits(), vec![1, 1, 1]);
        /* clock output enabled on the clock source chain */
        assert!(hal.ops.contains(&MockOp::Write("SPI_RADIO_A__DATA", 0x03)));
        /* analog defaults */
        assert!(hal.ops.contains(&MockOp::Write("SPI_RADIO_A__DATA", 14 + 2 * 16)));
        assert!(hal.ops.contains(&MockOp::Write("SPI_RADIO_A__DATA", 13 + 2 * 16)));
        assert!(hal.ops.contains(&MockOp::Write("SPI_RADIO_A__ADDR", 0x80 | 0x26)));
    }

    #[test]
    fn setup_times_out_without_lock() {
        let mut hal = MockHal::new();
        hal.set_value(SPI_RADIO_B__DATA_READBACK, 0xFD);

        let err = hal
            .lgw_setup_sx125x(
                LgwSpiMux::default(),
                1,
                0,
                true,
                LgwRadioType::LGW_RADIO_TYPE_SX1255,
                433_175_000,
                &Sx125xConf::default(),
            )
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::PllLockTimeout { rf_chain: 1, attempts: PLL_LOCK_MAX_ATTEMPTS })
        ));
        assert_eq!(hal.waits().len(), PLL_LOCK_MAX_ATTEMPTS as usize);
        assert!(hal.ops.contains(&MockOp::Write("SPI_RADIO_B__ADDR", 0x80 | 0x28)));
        /* no clock output on the other chain */
        assert!(hal.ops.contains(&MockOp::Write("SPI_RADIO_B__DATA", 0x01)));
    }

    #[test]
    fn setup_rejects_unsupported_radio() {
        let mut hal = MockHal::new();
        let err = hal
            .lgw_setup_sx125x(
                LgwSpiMux::default(),
                0,
                0,
                true,
                LgwRadioType::LGW_RADIO_TYPE_SX1276,
                868_000_000,
                &Sx125xConf::default(),
            )
            .unwrap_err();

        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnsupportedRadioType { rf_chain: 0, .. })));
    }

    #[test]
    fn disabled_radio_skips_lock() {
        let mut hal = MockHal::new();
        hal.lgw_setup_sx125x(
            LgwSpiMux::default(),
            1,
            0,
            false,
            LgwRadioType::LGW_RADIO_TYPE_SX1257,
            868_000_000,
            &Sx125xConf::default(),
        )
        .unwrap();
        assert!(hal.waits().is_empty());
    }
}
