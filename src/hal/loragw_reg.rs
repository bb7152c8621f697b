use anyhow::Result;
use tracing::{debug, error, info, trace};

use super::error::Error;
use super::helper;
use super::loragw_com::{LgwSpiMux, LgwSpiMuxMode, LgwSpiMuxTarget, LoragwComTrait};
use super::mcu::McuTrait;
use super::Hal;

/// Descriptor of one SX1301 register field.
///
/// `page` is -1 for registers visible from every page. Fields wider than a byte
/// start at bit 0 of `addr` and span consecutive addresses, least significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LgwRegister {
    pub name: &'static str,
    pub page: i8,
    pub addr: u8,
    pub offs: u8,
    pub sign: bool,
    pub leng: u8,
    pub rdon: bool,
    pub dflt: i32,
}

impl LgwRegister {
    pub const fn field(&self) -> BitField {
        BitField::new(self.offs, self.leng)
    }

    pub const fn byte_size(&self) -> usize {
        (self.offs as usize + self.leng as usize).div_ceil(8)
    }
}

macro_rules! lgw_regs {
    ($( $name:ident = { $page:expr, $addr:expr, $offs:expr, $sign:expr, $leng:expr, $rdon:expr, $dflt:expr } ),* $(,)?) => {
        $(
            pub const $name: LgwRegister = LgwRegister {
                name: stringify!($name),
                page: $page,
                addr: $addr,
                offs: $offs,
                sign: $sign,
                leng: $leng,
                rdon: $rdon,
                dflt: $dflt,
            };
        )*

        #[allow(dead_code)]
        pub const LGW_REGISTERS: &[LgwRegister] = &[ $( $name ),* ];
    };
}

/* SX1301 register map, from the register table of the SX1301 datasheet; only the fields this driver touches */
/* page, addr, offs, sign, leng, rdon, dflt */
lgw_regs! {
    PAGE_REG =                              {-1, 0, 0, false, 2, false, 0},
    SOFT_RESET =                            {-1, 0, 7, false, 1, false, 0},
    VERSION =                               {-1, 1, 0, false, 8, true, 103},
    RX_DATA_BUF_ADDR =                      {-1, 2, 0, false, 16, false, 0},
    RX_DATA_BUF_DATA =                      {-1, 4, 0, false, 8, false, 0},
    MCU_PROM_ADDR =                         {-1, 9, 0, false, 8, false, 0},
    MCU_PROM_DATA =                         {-1, 10, 0, false, 8, false, 0},
    RX_PACKET_DATA_FIFO_NUM_STORED =        {-1, 11, 0, false, 8, false, 0},
    MBWSSF_MODEM_ENABLE =                   {-1, 16, 0, false, 1, false, 0},
    CONCENTRATOR_MODEM_ENABLE =             {-1, 16, 1, false, 1, false, 0},
    FSK_MODEM_ENABLE =                      {-1, 16, 2, false, 1, false, 0},
    GLOBAL_EN =                             {-1, 16, 3, false, 1, false, 0},
    CLK32M_EN =                             {-1, 17, 0, false, 1, false, 1},
    GPIO_SELECT_OUTPUT =                    {-1, 24, 0, false, 4, false, 0},
    GPIO_MODE =                             {-1, 25, 0, false, 5, false, 0},
    MCU_AGC_STATUS =                        {-1, 28, 0, false, 8, true, 0},
    EMERGENCY_FORCE_HOST_CTRL =             {-1, 127, 0, false, 1, false, 1},

    /* page 0: LoRa multi-SF demodulators */
    IF_FREQ_0 =                             {0, 33, 0, true, 13, false, 0},
    IF_FREQ_1 =                             {0, 35, 0, true, 13, false, 0},
    IF_FREQ_2 =                             {0, 37, 0, true, 13, false, 0},
    IF_FREQ_3 =                             {0, 39, 0, true, 13, false, 0},
    IF_FREQ_4 =                             {0, 41, 0, true, 13, false, 0},
    IF_FREQ_5 =                             {0, 43, 0, true, 13, false, 0},
    IF_FREQ_6 =                             {0, 45, 0, true, 13, false, 0},
    IF_FREQ_7 =                             {0, 47, 0, true, 13, false, 0},
    IF_FREQ_8 =                             {0, 49, 0, true, 13, false, 0},
    IF_FREQ_9 =                             {0, 51, 0, true, 13, false, 0},
    RSSI_BB_FILTER_ALPHA =                  {0, 53, 0, false, 4, false, 7},
    RSSI_DEC_FILTER_ALPHA =                 {0, 54, 0, false, 4, false, 5},
    RSSI_CHANN_FILTER_ALPHA =               {0, 55, 0, false, 4, false, 8},
    RSSI_BB_DEFAULT_VALUE =                 {0, 56, 0, false, 8, false, 32},
    RSSI_DEC_DEFAULT_VALUE =                {0, 57, 0, false, 8, false, 100},
    RSSI_CHANN_DEFAULT_VALUE =              {0, 58, 0, false, 8, false, 100},
    DEC_GAIN_OFFSET =                       {0, 59, 0, false, 4, false, 8},
    CHAN_GAIN_OFFSET =                      {0, 59, 4, false, 4, false, 7},
    SNR_AVG_CST =                           {0, 60, 0, false, 2, false, 2},
    FRAME_SYNCH_PEAK1_POS =                 {0, 61, 0, false, 4, false, 1},
    FRAME_SYNCH_PEAK2_POS =                 {0, 61, 4, false, 4, false, 2},
    PPM_OFFSET =                            {0, 62, 0, false, 7, false, 0},
    CORR_MAC_GAIN =                         {0, 63, 0, false, 3, false, 5},
    CORR0_DETECT_EN =                       {0, 64, 0, false, 7, false, 0},
    CORR1_DETECT_EN =                       {0, 65, 0, false, 7, false, 0},
    CORR2_DETECT_EN =                       {0, 66, 0, false, 7, false, 0},
    CORR3_DETECT_EN =                       {0, 67, 0, false, 7, false, 0},
    CORR4_DETECT_EN =                       {0, 68, 0, false, 7, false, 0},
    CORR5_DETECT_EN =                       {0, 69, 0, false, 7, false, 0},
    CORR6_DETECT_EN =                       {0, 70, 0, false, 7, false, 0},
    CORR7_DETECT_EN =                       {0, 71, 0, false, 7, false, 0},
    ADJUST_MODEM_START_OFFSET_RDX4 =        {0, 72, 0, false, 12, false, 0},
    ADJUST_MODEM_START_OFFSET_SF12_RDX4 =   {0, 74, 0, false, 12, false, 4092},
    FREQ_TO_TIME_DRIFT =                    {0, 76, 0, false, 6, false, 9},
    RADIO_SELECT =                          {0, 77, 0, false, 8, false, 0},

    /* page 1: LoRa standalone and FSK demodulators */
    MBWSSF_FRAME_SYNCH_PEAK1_POS =          {1, 33, 0, false, 4, false, 1},
    MBWSSF_FRAME_SYNCH_PEAK2_POS =          {1, 33, 4, false, 4, false, 2},
    MBWSSF_RADIO_SELECT =                   {1, 34, 0, false, 1, false, 0},
    MBWSSF_MODEM_BW =                       {1, 34, 1, false, 2, false, 0},
    MBWSSF_RATE_SF =                        {1, 34, 3, false, 4, false, 7},
    MBWSSF_PPM_OFFSET =                     {1, 34, 7, false, 1, false, 0},
    MBWSSF_FREQ_TO_TIME_DRIFT =             {1, 35, 0, false, 6, false, 36},
    FSK_RX_INVERT =                         {1, 36, 0, false, 1, false, 0},
    FSK_MODEM_INVERT_IQ =                   {1, 36, 1, false, 1, false, 0},
    FSK_RADIO_SELECT =                      {1, 36, 2, false, 1, false, 0},
    FSK_PSIZE =                             {1, 36, 3, false, 3, false, 0},
    FSK_PKT_MODE =                          {1, 36, 6, false, 1, false, 0},
    FSK_CRC_EN =                            {1, 36, 7, false, 1, false, 0},
    FSK_RSSI_LENGTH =                       {1, 37, 0, false, 3, false, 0},
    FSK_DCFREE_ENC =                        {1, 37, 3, false, 2, false, 0},
    FSK_CH_BW_EXPO =                        {1, 37, 5, false, 3, false, 0},
    FSK_ERROR_OSR_TOL =                     {1, 38, 0, false, 5, false, 0},
    FSK_PKT_LENGTH =                        {1, 39, 0, false, 8, false, 0},
    FSK_PATTERN_TIMEOUT_CFG =               {1, 40, 0, false, 10, false, 0},
    FSK_BR_RATIO =                          {1, 42, 0, false, 16, false, 0},
    FSK_REF_PATTERN_LSB =                   {1, 44, 0, false, 32, false, 0},
    FSK_REF_PATTERN_MSB =                   {1, 48, 0, false, 32, false, 0},

    /* page 2: radio SPI masters, MCUs and TX */
    SPI_RADIO_A__DATA =                     {2, 33, 0, false, 8, false, 0},
    SPI_RADIO_A__DATA_READBACK =            {2, 34, 0, false, 8, true, 0},
    SPI_RADIO_A__ADDR =                     {2, 35, 0, false, 8, false, 0},
    SPI_RADIO_A__CS =                       {2, 37, 0, false, 1, false, 0},
    SPI_RADIO_B__DATA =                     {2, 38, 0, false, 8, false, 0},
    SPI_RADIO_B__DATA_READBACK =            {2, 39, 0, false, 8, true, 0},
    SPI_RADIO_B__ADDR =                     {2, 40, 0, false, 8, false, 0},
    SPI_RADIO_B__CS =                       {2, 42, 0, false, 1, false, 0},
    RADIO_A_EN =                            {2, 43, 0, false, 1, false, 0},
    RADIO_B_EN =                            {2, 43, 1, false, 1, false, 0},
    RADIO_RST =                             {2, 43, 2, false, 1, false, 1},
    FORCE_HOST_RADIO_CTRL =                 {2, 44, 0, false, 1, false, 1},
    FORCE_HOST_FE_CTRL =                    {2, 44, 1, false, 1, false, 1},
    FORCE_DEC_FILTER_GAIN =                 {2, 44, 2, false, 1, false, 1},
    MCU_RST_0 =                             {2, 45, 0, false, 1, false, 1},
    MCU_RST_1 =                             {2, 45, 1, false, 1, false, 1},
    MCU_SELECT_MUX_0 =                      {2, 45, 2, false, 1, false, 0},
    MCU_SELECT_MUX_1 =                      {2, 45, 3, false, 1, false, 0},
    DBG_ARB_MCU_RAM_ADDR =                  {2, 46, 0, false, 8, false, 0},
    DBG_ARB_MCU_RAM_DATA =                  {2, 47, 0, false, 8, true, 0},
    DBG_AGC_MCU_RAM_ADDR =                  {2, 48, 0, false, 8, false, 0},
    DBG_AGC_MCU_RAM_DATA =                  {2, 49, 0, false, 8, true, 0},
    TX_START_DELAY =                        {2, 50, 0, false, 16, false, 0},
    TX_SWAP_IQ =                            {2, 52, 0, false, 1, false, 0},
    TX_FRAME_SYNCH_PEAK1_POS =              {2, 53, 0, false, 4, false, 1},
    TX_FRAME_SYNCH_PEAK2_POS =              {2, 53, 4, false, 4, false, 2},
    FSK_TX_GAUSSIAN_SELECT_BT =             {2, 54, 0, false, 2, false, 0},
    FSK_TX_PSIZE =                          {2, 54, 2, false, 3, false, 0},
    GPS_EN =                                {2, 55, 0, false, 1, false, 0},
}

pub const IF_FREQ: [LgwRegister; 10] = [
    IF_FREQ_0, IF_FREQ_1, IF_FREQ_2, IF_FREQ_3, IF_FREQ_4,
    IF_FREQ_5, IF_FREQ_6, IF_FREQ_7, IF_FREQ_8, IF_FREQ_9,
];

pub const CORR_DETECT_EN: [LgwRegister; 8] = [
    CORR0_DETECT_EN, CORR1_DETECT_EN, CORR2_DETECT_EN, CORR3_DETECT_EN,
    CORR4_DETECT_EN, CORR5_DETECT_EN, CORR6_DETECT_EN, CORR7_DETECT_EN,
];

/// Named bit range inside a packed register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub offs: u8,
    pub leng: u8,
}

impl BitField {
    pub const fn new(offs: u8, leng: u8) -> Self {
        Self { offs, leng }
    }

    pub const fn mask(&self) -> u32 {
        ((1u64 << self.leng) - 1) as u32
    }

    pub fn extract(&self, raw: u32) -> u32 {
        (raw >> self.offs) & self.mask()
    }

    /* value is truncated to the field width */
    pub fn insert(&self, raw: u32, value: u32) -> u32 {
        let mask = self.mask() << self.offs;
        (raw & !mask) | ((value << self.offs) & mask)
    }
}

/// Builder for packed register values; every field is range checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldPack {
    bits: u32,
}

impl FieldPack {
    pub fn new() -> Self {
        Self { bits: 0 }
    }

    pub fn with(self, field: BitField, value: u32) -> Result<Self> {
        if value > field.mask() {
            return Err(Error::ConfigurationError(format!(
                "value {} does not fit in {} bit(s) at offset {}",
                value, field.leng, field.offs
            ))
            .into());
        }

        Ok(Self { bits: field.insert(self.bits, value) })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }
}

/* LSB first, truncated to the register width */
pub fn lgw_reg_encode(register: &LgwRegister, value: i32) -> Vec<u8> {
    let raw = (value as u32) & register.field().mask();
    raw.to_le_bytes()[..register.byte_size()].to_vec()
}

pub fn lgw_reg_decode(register: &LgwRegister, bytes: &[u8]) -> i32 {
    let raw = bytes
        .iter()
        .take(4)
        .enumerate()
        .fold(0u32, |acc, (i, b)| acc | ((*b as u32) << (8 * i)));
    let raw = register.field().extract(raw);

    if register.sign && register.leng < 32 && (raw >> (register.leng - 1)) & 1 == 1 {
        (raw as i64 - (1i64 << register.leng)) as i32
    } else {
        raw as i32
    }
}

/// Register transport to one concentrator.
///
/// Every call is a blocking, strictly ordered exchange with the chip.
pub trait LoragwRegTrait {
    fn lgw_connect(&mut self, com_path: &str, force_reset: bool, tx_notch_freq: u32) -> Result<LgwSpiMux>;
    fn lgw_disconnect(&mut self) -> Result<()>;
    fn lgw_soft_reset(&mut self, spi_mux: LgwSpiMux) -> Result<()>;
    fn lgw_reg_w(&mut self, spi_mux: LgwSpiMux, register: LgwRegister, value: i32) -> Result<()>;
    fn lgw_reg_r(&mut self, spi_mux: LgwSpiMux, register: LgwRegister) -> Result<i32>;
    fn lgw_reg_wb(&mut self, spi_mux: LgwSpiMux, register: LgwRegister, data: &[u8]) -> Result<()>;
    fn lgw_reg_rb(&mut self, spi_mux: LgwSpiMux, register: LgwRegister, size: usize) -> Result<Vec<u8>>;

    fn lgw_wait_ms(&mut self, ms: u64) {
        helper::wait_ms(ms);
    }
}

fn transport_error(e: anyhow::Error) -> anyhow::Error {
    match e.downcast_ref::<Error>() {
        Some(_) => e,
        None => Error::TransportError(e.to_string()).into(),
    }
}

impl Hal {
    fn lgw_page_switch(&mut self, spi_mux: LgwSpiMux, target: i8) -> Result<()> {
        let page = PAGE_REG.field().insert(0, target as u32) as u8;
        self.lgw_com_w(spi_mux, PAGE_REG.addr, page).map_err(transport_error)?;
        self.lgw_regpage = target;

        trace!(page = target, "lgw_page_switch");
        Ok(())
    }

    fn lgw_select_page(&mut self, spi_mux: LgwSpiMux, register: &LgwRegister) -> Result<()> {
        if register.page != -1 && register.page != self.lgw_regpage {
            self.lgw_page_switch(spi_mux, register.page)?;
        }
        Ok(())
    }
}

impl LoragwRegTrait for Hal {
    fn lgw_connect(&mut self, com_path: &str, force_reset: bool, tx_notch_freq: u32) -> Result<LgwSpiMux> {
        if let Err(e) = self.mcu.open(com_path, force_reset) {
            error!(e=%e, com_path, "ERROR: failed to open bridge MCU");
            return Err(Error::TransportError(format!("failed to open {}: {}", com_path, e)).into());
        }
        self.lgw_regpage = -1;

        let probes = [
            LgwSpiMux::new(LgwSpiMuxMode::LGW_SPI_MUX_MODE0, LgwSpiMuxTarget::LGW_SPI_MUX_TARGET_SX1301),
            LgwSpiMux::new(LgwSpiMuxMode::LGW_SPI_MUX_MODE1, LgwSpiMuxTarget::LGW_SPI_MUX_TARGET_SX1301),
        ];

        for spi_mux in probes {
            match self.lgw_com_r(spi_mux, VERSION.addr) {
                Ok(version) if version as i32 == VERSION.dflt => {
                    info!(spi_mux=%spi_mux, version, "concentrator detected");
                    if spi_mux.mode == LgwSpiMuxMode::LGW_SPI_MUX_MODE1 {
                        debug!(tx_notch_freq, "TX notch filter frequency is left to the FPGA default");
                    }
                    self.lgw_page_switch(spi_mux, 0)?;
                    return Ok(spi_mux);
                }
                Ok(version) => debug!(spi_mux=%spi_mux, version, "unexpected chip version"),
                Err(e) => debug!(spi_mux=%spi_mux, e=%e, "version probe failed"),
            }
        }

        self.mcu.close();
        error!("ERROR: NOT CONNECTED TO A SX1301 (VERSION != {})", VERSION.dflt);
        Err(Error::TransportError(format!("no SX1301 answered on {}", com_path)).into())
    }

    fn lgw_disconnect(&mut self) -> Result<()> {
        self.lgw_regpage = -1;
        self.mcu.lgw_disconnect()
    }

    fn lgw_soft_reset(&mut self, spi_mux: LgwSpiMux) -> Result<()> {
        let reset = SOFT_RESET.field().insert(0, 1) as u8;
        self.lgw_com_w(spi_mux, SOFT_RESET.addr, reset).map_err(transport_error)?;
        self.lgw_regpage = -1;

        debug!("concentrator soft reset");
        Ok(())
    }

    fn lgw_reg_w(&mut self, spi_mux: LgwSpiMux, register: LgwRegister, value: i32) -> Result<()> {
        if register == PAGE_REG {
            return self.lgw_page_switch(spi_mux, value as i8);
        }

        if register.rdon {
            return Err(Error::ConfigurationError(format!("register {} is read-only", register.name)).into());
        }

        self.lgw_select_page(spi_mux, &register)?;
        trace!(register = register.name, value, "lgw_reg_w");

        if register.leng == 8 && register.offs == 0 {
            /* direct write */
            self.lgw_com_w(spi_mux, register.addr, value as u8).map_err(transport_error)
        } else if register.offs + register.leng <= 8 {
            /* single-byte read-modify-write */
            let raw = self.lgw_com_r(spi_mux, register.addr).map_err(transport_error)?;
            let packed = register.field().insert(raw as u32, value as u32) as u8;
            self.lgw_com_w(spi_mux, register.addr, packed).map_err(transport_error)
        } else if register.offs == 0 && register.leng > 8 && register.leng <= 32 {
            /* multi-byte direct write */
            let bytes = lgw_reg_encode(&register, value);
            self.lgw_com_wb(spi_mux, register.addr, &bytes).map_err(transport_error)
        } else {
            Err(Error::ConfigurationError(format!("register {} has an unsupported size", register.name)).into())
        }
    }

    fn lgw_reg_r(&mut self, spi_mux: LgwSpiMux, register: LgwRegister) -> Result<i32> {
        self.lgw_select_page(spi_mux, &register)?;

        let value = if register.offs + register.leng <= 8 {
            let raw = self.lgw_com_r(spi_mux, register.addr).map_err(transport_error)?;
            lgw_reg_decode(&register, &[raw])
        } else if register.offs == 0 && register.leng > 8 && register.leng <= 32 {
            let bytes = self.lgw_com_rb(spi_mux, register.addr, register.byte_size()).map_err(transport_error)?;
            lgw_reg_decode(&register, &bytes)
        } else {
            return Err(Error::ConfigurationError(format!("register {} has an unsupported size", register.name)).into());
        };

        trace!(register = register.name, value, "lgw_reg_r");
        Ok(value)
    }

    fn lgw_reg_wb(&mut self, spi_mux: LgwSpiMux, register: LgwRegister, data: &[u8]) -> Result<()> {
        if register.rdon {
            return Err(Error::ConfigurationError(format!("register {} is read-only", register.name)).into());
        }

        self.lgw_select_page(spi_mux, &register)?;
        self.lgw_com_wb(spi_mux, register.addr, data).map_err(transport_error)
    }

    fn lgw_reg_rb(&mut self, spi_mux: LgwSpiMux, register: LgwRegister, size: usize) -> Result<Vec<u8>> {
        self.lgw_select_page(spi_mux, &register)?;
        self.lgw_com_rb(spi_mux, register.addr, size).map_err(transport_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bit_span(register: &LgwRegister) -> (u32, u32) {
        let start = register.addr as u32 * 8 + register.offs as u32;
        (start, start + register.leng as u32)
    }

    #[test]
    fn register_fields_do_not_overlap() {
        for (i, a) in LGW_REGISTERS.iter().enumerate() {
            for b in &LGW_REGISTERS[i + 1..] {
                let shared_page = a.page == b.page || a.page == -1 || b.page == -1;
                let (a0, a1) = bit_span(a);
                let (b0, b1) = bit_span(b);
                assert!(!(shared_page && a0 < b1 && b0 < a1), "{} overlaps {}", a.name, b.name);
            }
        }
    }

    #[test]
    fn register_names_follow_constants() {
        assert_eq!(MCU_AGC_STATUS.name, "MCU_AGC_STATUS");
        assert_eq!(IF_FREQ[9], IF_FREQ_9);
        assert_eq!(CORR_DETECT_EN[3].name, "CORR3_DETECT_EN");
    }

    #[test]
    fn field_pack_builds_and_extracts() {
        let mix = BitField::new(0, 4);
        let dac = BitField::new(4, 2);
        let packed = FieldPack::new().with(mix, 14).unwrap().with(dac, 2).unwrap().bits();
        assert_eq!(packed, 14 + 2 * 16);
        assert_eq!(mix.extract(packed), 14);
        assert_eq!(dac.extract(packed), 2);
    }

    #[test]
    fn field_pack_rejects_overflow() {
        let err = FieldPack::new().with(BitField::new(4, 2), 4).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ConfigurationError(_))));
    }

    #[test]
    fn insert_preserves_neighbour_bits() {
        assert_eq!(RADIO_B_EN.field().insert(0b0000_0101, 1), 0b0000_0111);
        assert_eq!(RADIO_RST.field().insert(0b0000_0111, 0), 0b0000_0011);
    }

    #[test]
    fn multi_byte_values_are_lsb_first() {
        assert_eq!(lgw_reg_encode(&TX_START_DELAY, 1497), vec![0xD9, 0x05]);
        assert_eq!(lgw_reg_encode(&FSK_REF_PATTERN_LSB, 0xC194C100u32 as i32), vec![0x00, 0xC1, 0x94, 0xC1]);
        assert_eq!(lgw_reg_decode(&TX_START_DELAY, &[0xD9, 0x05]), 1497);
    }

    #[test]
    fn signed_registers_are_sign_extended() {
        let bytes = lgw_reg_encode(&IF_FREQ_0, -300);
        assert_eq!(bytes.len(), 2);
        assert_eq!(lgw_reg_decode(&IF_FREQ_0, &bytes), -300);
        assert_eq!(lgw_reg_decode(&IF_FREQ_0, &lgw_reg_encode(&IF_FREQ_0, 4095)), 4095);
    }
}
