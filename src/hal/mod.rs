
pub mod error;
pub mod helper;
pub mod mcu;
mod loragw_usb_com;
pub mod loragw_com;
pub mod loragw_reg;
pub mod loragw_fw;
pub mod loragw_sx125x;
pub mod loragw_sx1301;
pub mod loragw_sx1301_timestamp;
pub mod loragw_sx1301_rx;
pub mod loragw_conf;
#[cfg(test)]
pub(crate) mod mock;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use error::{Error, LgwRxError, McuTarget};
use loragw_com::LgwSpiMux;
use loragw_fw::{LgwFirmware, LoragwFwTrait, FW_VERSION_AGC, FW_VERSION_ARB};
use loragw_reg::*;
use loragw_sx125x::{LoragwSx125xTrait, Sx125xConf};
use loragw_sx1301::{sx1301_agc_gain_word, CalibrationPolicy, CalibrationReport, LoragwSx1301Trait};
use loragw_sx1301_rx::LoragwSx1301RxTrait;


/* radio-specific parameters */
pub const LGW_XTAL_FREQU:u32 =      32000000;            /* frequency of the RF reference oscillator */
pub const LGW_RF_CHAIN_NB:u8 =     2;                   /* number of RF chains */

/* concentrator chipset-specific parameters */
pub const LGW_IF_CHAIN_NB:u8 =     10;      /* number of IF+modem RX chains */
pub const LGW_MULTI_NB:u8 =        8;       /* number of LoRa 'multi SF' chains */
pub const LGW_PKT_FIFO_SIZE:u8 =   16;      /* depth of the RX packet FIFO */
pub const RX_METADATA_NB:usize =   16;      /* size of the metadata trailer following each payload */

/* type of if_chain + modem */
pub const IF_UNDEFINED:u8 =        0;
pub const IF_LORA_STD:u8 =         0x10;    /* if + standard single-SF LoRa modem */
pub const IF_LORA_MULTI:u8 =       0x11;    /* if + LoRa receiver with multiple decoupled SF */
pub const IF_FSK_STD:u8 =          0x20;    /* if + standard FSK modem */

/* IF chain -> modem wiring of the reference board */
pub const LGW_IFMODEM_CONFIG: [u8; LGW_IF_CHAIN_NB as usize] = [
    IF_LORA_MULTI, IF_LORA_MULTI, IF_LORA_MULTI, IF_LORA_MULTI,
    IF_LORA_MULTI, IF_LORA_MULTI, IF_LORA_MULTI, IF_LORA_MULTI,
    IF_LORA_STD,
    IF_FSK_STD,
];

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum Modulation{
    UNDEFINED   =    0,
    LORA        =    0x10,
    FSK         =    0x20,
}

impl std::fmt::Display for Modulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modulation::UNDEFINED => write!(f, "Undefined"),
            Modulation::LORA => write!(f, "LoRa"),
            Modulation::FSK => write!(f, "FSK"),
        }
    }
}

/* values available for the 'bandwidth' parameters (LoRa & FSK) */
/* NOTE: directly encode FSK RX bandwidth, do not change */
pub const    BW_UNDEFINED:u8=    0;
pub const    BW_500KHZ:u8=       0x01;
pub const    BW_250KHZ:u8=       0x02;
pub const    BW_125KHZ:u8=       0x03;
pub const    BW_62K5HZ:u8=       0x04;
pub const    BW_31K2HZ:u8=       0x05;
pub const    BW_15K6HZ:u8=       0x06;
pub const    BW_7K8HZ:u8=        0x07;

/* values available for the 'datarate' parameters */
/* NOTE: LoRa values used directly to code SF bitmask in 'multi' modem, do not change */
pub const    DR_UNDEFINED:u32=    0;
pub const    DR_LORA_SF7:u32=     0x02;
pub const    DR_LORA_SF8:u32=     0x04;
pub const    DR_LORA_SF9:u32=     0x08;
pub const    DR_LORA_SF10:u32=    0x10;
pub const    DR_LORA_SF11:u32=    0x20;
pub const    DR_LORA_SF12:u32=    0x40;
pub const    DR_LORA_MULTI:u32=   0x7E;
pub const    DR_FSK_MIN:u32=      500;
pub const    DR_FSK_MAX:u32=      250000;

/* values available for the 'coderate' parameters (LoRa only) */
/* NOTE: arbitrary values */
pub const CR_UNDEFINED:u8=     0;
pub const CR_LORA_4_5 :u8=     0x01;
pub const CR_LORA_4_6 :u8=     0x02;
pub const CR_LORA_4_7 :u8=     0x03;
pub const CR_LORA_4_8 :u8=     0x04;

/* values available for the 'status' parameter */
/* NOTE: values according to hardware specification */
pub const STAT_UNDEFINED:u8 =  0x00;
pub const STAT_NO_CRC:u8 =     0x01;
pub const STAT_CRC_BAD:u8 =    0x11;
pub const STAT_CRC_OK:u8 =     0x10;

/* board-measured RSSI corrections */
pub const RSSI_MULTI_BIAS:f32 =   -35.0;    /* difference between "multi" modem RSSI and standalone modem RSSI */
pub const RSSI_FSK_POLY_0:f64 =   60.0;     /* polynomiam coefficients to linearize FSK RSSI */
pub const RSSI_FSK_POLY_1:f64 =   1.5351;
pub const RSSI_FSK_POLY_2:f64 =   0.003;

pub const TX_START_DELAY_DEFAULT:i32 = 1497; /* delay between TX trigger and RF start, in us */

/* AGC firmware commands */
pub const AGC_CMD_WAIT:i32 =   16;
pub const AGC_CMD_ABORT:i32 =  17;

pub const TX_GAIN_LUT_SIZE_MAX:usize = 16;

pub const FSK_SYNC_WORD_DEFAULT:u64 =       0xC194C1;
pub const FSK_SYNC_WORD_SIZE_DEFAULT:u8 =   3;

#[derive(Debug,Clone, Copy, Serialize, Deserialize)]
#[derive(PartialEq, Eq, Default)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum LgwRadioType {
    #[default]
    #[serde(rename = "NONE")]
    LGW_RADIO_TYPE_NONE,
    #[serde(rename = "SX1255")]
    LGW_RADIO_TYPE_SX1255,
    #[serde(rename = "SX1257")]
    LGW_RADIO_TYPE_SX1257,
    #[serde(rename = "SX1272")]
    LGW_RADIO_TYPE_SX1272,
    #[serde(rename = "SX1276")]
    LGW_RADIO_TYPE_SX1276,
}

impl LgwRadioType {
    /* radios the SX1301 can drive as RF front-end */
    pub fn is_sx125x(&self) -> bool {
        matches!(self, LgwRadioType::LGW_RADIO_TYPE_SX1255 | LgwRadioType::LGW_RADIO_TYPE_SX1257)
    }
}

impl std::fmt::Display for LgwRadioType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LgwRadioType::LGW_RADIO_TYPE_NONE => write!(f, "None"),
            LgwRadioType::LGW_RADIO_TYPE_SX1255 => write!(f, "SX1255"),
            LgwRadioType::LGW_RADIO_TYPE_SX1257 => write!(f, "SX1257"),
            LgwRadioType::LGW_RADIO_TYPE_SX1272 => write!(f, "SX1272"),
            LgwRadioType::LGW_RADIO_TYPE_SX1276 => write!(f, "SX1276"),
        }
    }
}

/**
@struct LgwConfRxrf
@brief Configuration structure for a RF chain
*/
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LgwConfRxrf {
    #[serde(default)]
    pub enable: bool,             //* enable or disable that RF chain */
    #[serde(rename="freq", default)]
    pub freq_hz: u32,           //* center frequency of the radio in Hz */
    #[serde(default)]
    pub rssi_offset: f32,        //* Board-specific RSSI correction factor */
    #[serde(rename = "type")]
    pub _type:LgwRadioType,              //* Radio type for that RF chain (SX1255, SX1257....) */
    #[serde(default)]
    pub tx_enable:bool,           //* enable or disable TX on that RF chain */
    #[serde(default)]
    pub tx_notch_freq: u32,       //* TX notch filter frequency [126KHz..250KHz], FPGA boards only */
}

/**
@struct LgwConfRxIf
@brief Configuration structure for an IF chain
*/
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LgwConfRxIf {
    #[serde(default)]
    pub        enable:bool,         //* enable or disable that IF chain */
    #[serde(rename="radio", default)]
    pub        rf_chain:u8,       //* to which RF chain is that IF chain associated */
    #[serde(rename="if", default)]
    pub        freq_hz:i32,        //* center frequ of the IF chain, relative to RF chain frequency */
    #[serde(default, with = "bandwidth_serde")]
    pub        bandwidth:u8,      //* RX bandwidth, 0 for default */
    #[serde(default)]
    pub        datarate:u32,       //* RX datarate, baud for FSK, SF code for LoRa */
    #[serde(default)]
    pub        sync_word_size:u8, //* size of FSK sync word (number of bytes, 0 for default) */
    #[serde(default)]
    pub        sync_word:u64,      //* FSK sync word (ALIGN RIGHT, eg. 0xC194C1) */
}

impl std::fmt::Display for LgwConfRxIf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LgwConfRxIf {{ enable: {}, rf_chain: {}, freq_hz: {}, bandwidth: {}, datarate: {}, sync_word_size: {}, sync_word: 0x{:X} }}",
            self.enable,
            self.rf_chain,
            self.freq_hz,
            self.bandwidth,
            self.datarate,
            self.sync_word_size,
            self.sync_word
        )
    }
}

impl Default for LgwConfRxIf {
    fn default() -> Self {
        Self {
            enable: false,
            rf_chain: 0,
            freq_hz: 0,
            bandwidth: BW_UNDEFINED,
            datarate: DR_UNDEFINED,
            sync_word_size: 0,
            sync_word: 0,
        }
    }
}

/* bandwidth in Hz <-> bandwidth code */
pub fn lgw_bw_getval(bw: u8) -> u32 {
    match bw {
        BW_500KHZ => 500000,
        BW_250KHZ => 250000,
        BW_125KHZ => 125000,
        BW_62K5HZ => 62500,
        BW_31K2HZ => 31200,
        BW_15K6HZ => 15600,
        BW_7K8HZ => 7800,
        _ => 0,
    }
}

pub fn lgw_bw_getcode(hz: u32) -> Option<u8> {
    match hz {
        500000 => Some(BW_500KHZ),
        250000 => Some(BW_250KHZ),
        125000 => Some(BW_125KHZ),
        62500 => Some(BW_62K5HZ),
        31200 => Some(BW_31K2HZ),
        15600 => Some(BW_15K6HZ),
        7800 => Some(BW_7K8HZ),
        0 => Some(BW_UNDEFINED),
        _ => None,
    }
}

mod bandwidth_serde {
    use std::fmt;

    use serde::{Deserialize, Deserializer, Serializer};
    use serde::de;

    use crate::hal::{lgw_bw_getcode, lgw_bw_getval, BW_UNDEFINED};

    pub fn serialize<S>(value: &u8, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(lgw_bw_getval(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u8, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BandwidthVisitor;

        impl<'de> de::Visitor<'de> for BandwidthVisitor {
            type Value = u8;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a bandwidth in Hz (500000 down to 7800), or null")
            }

            fn visit_u32<E>(self, value: u32) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                lgw_bw_getcode(value).ok_or_else(|| de::Error::custom(format!("Invalid bandwidth value: {}", value)))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(BW_UNDEFINED)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
            where
                D: Deserializer<'de>,
            {
                self.visit_u32(Deserialize::deserialize(deserializer)?)
            }
        }

        deserializer.deserialize_option(BandwidthVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LgwTxGain {
    #[serde(default)]
    pub     dig_gain:u8,   //* 2 bits: control of the digital gain of SX1301 */
    #[serde(default)]
    pub     pa_gain:u8,    //* 2 bits: control of the external PA (SX1301 I/O) */
    #[serde(default = "default_dac_gain")]
    pub     dac_gain:u8,   //* 2 bits: control of the radio DAC */
    #[serde(default = "default_mix_gain")]
    pub     mix_gain:u8,   //* 4 bits: control of the radio mixer */
    pub     rf_power: i8,   //* measured TX power at the board connector, in dBm */
}

fn default_mix_gain() -> u8 {
    8
}

fn default_dac_gain() -> u8 {
    3
}

impl Default for LgwTxGain {
    fn default() -> Self {
        Self {
            dig_gain: 0,
            pa_gain: 0,
            dac_gain: 3,
            mix_gain: 8,
            rf_power: 0,
        }
    }
}

/// TX gain table, uploaded to the AGC firmware in index order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LgwTxGainLut {
    pub     lut: [LgwTxGain; TX_GAIN_LUT_SIZE_MAX],  //* Array of Tx gain struct */
    pub     size:usize                      //* Number of LUT indexes */
}

impl LgwTxGainLut {
    pub fn from_entries(entries: &[LgwTxGain]) -> Result<Self> {
        if entries.len() > TX_GAIN_LUT_SIZE_MAX {
            return Err(Error::ConfigurationError(format!(
                "TX gain LUT has {} entries, at most {} supported",
                entries.len(),
                TX_GAIN_LUT_SIZE_MAX
            ))
            .into());
        }

        let mut lut = [LgwTxGain::default(); TX_GAIN_LUT_SIZE_MAX];
        lut[..entries.len()].copy_from_slice(entries);
        Ok(Self { lut, size: entries.len() })
    }

    pub fn entries(&self) -> &[LgwTxGain] {
        &self.lut[..self.size.min(TX_GAIN_LUT_SIZE_MAX)]
    }
}

impl Default for LgwTxGainLut {
    fn default() -> Self {
        let mut lut = [LgwTxGain::default(); TX_GAIN_LUT_SIZE_MAX];
        lut[0] = LgwTxGain { dig_gain: 0, pa_gain: 2, dac_gain: 3, mix_gain: 10, rf_power: 14 };
        lut[1] = LgwTxGain { dig_gain: 0, pa_gain: 3, dac_gain: 3, mix_gain: 14, rf_power: 27 };
        Self { lut, size: 2 }
    }
}

/// TX I/Q DC offsets measured by the calibration firmware, for mixer gain 8 to 15.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LgwTxCalOffsets {
    pub offset_i: [[i8; 8]; LGW_RF_CHAIN_NB as usize],
    pub offset_q: [[i8; 8]; LGW_RF_CHAIN_NB as usize],
}

/**
@struct LgwConfigBoard
@brief Configuration structure for board specificities
*/
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LgwConfigBoard {
    #[serde(default)]
    pub            lorawan_public: bool, //* Enable ONLY for *public* networks using the LoRa MAC protocol */
    #[serde(default)]
    pub            clksrc:u8,         //* Index of RF chain which provides clock to concentrator */
}

/// Hardware state the concentrator is started with.
///
/// Everything is read-only once started, except `cal_offsets` which the
/// calibration stage fills in.
#[derive(Debug, Clone)]
pub struct LgwContext {
    pub       board_cfg: LgwConfigBoard,
    pub       rf_chain_cfg:[LgwConfRxrf;LGW_RF_CHAIN_NB as usize],
    pub       if_chain_cfg:[LgwConfRxIf;LGW_IF_CHAIN_NB as usize],  /* 0-7 multi-SF, 8 LoRa standalone, 9 FSK */
    pub       lora_multi_sfmask:[u8;LGW_MULTI_NB as usize],        /* enables SF for LoRa 'multi' modems */
    pub       lora_rx_ppm_offset: bool,
    pub       tx_gain_lut: LgwTxGainLut,
    pub       sx125x_cfg: Sx125xConf,
    pub       cal_offsets: LgwTxCalOffsets,
}

impl Default for LgwContext {
    fn default() -> Self {
        let mut if_chain_cfg = [LgwConfRxIf::default(); LGW_IF_CHAIN_NB as usize];
        if_chain_cfg[9].sync_word_size = FSK_SYNC_WORD_SIZE_DEFAULT;
        if_chain_cfg[9].sync_word = FSK_SYNC_WORD_DEFAULT;

        Self {
            board_cfg: Default::default(),
            rf_chain_cfg: Default::default(),
            if_chain_cfg,
            lora_multi_sfmask: [DR_LORA_MULTI as u8; LGW_MULTI_NB as usize],
            lora_rx_ppm_offset: false,
            tx_gain_lut: Default::default(),
            sx125x_cfg: Default::default(),
            cal_offsets: Default::default(),
        }
    }
}

fn conf_error(msg: String) -> anyhow::Error {
    error!("ERROR: {}", msg);
    Error::ConfigurationError(msg).into()
}

impl LgwContext {
    pub fn lora_std_cfg(&self) -> &LgwConfRxIf {
        &self.if_chain_cfg[8]
    }

    pub fn fsk_cfg(&self) -> &LgwConfRxIf {
        &self.if_chain_cfg[9]
    }

    /// Rejects configurations that cannot be started, before any hardware access.
    pub fn validate(&self) -> Result<()> {
        if self.rf_chain_cfg[0].freq_hz == 0 {
            return Err(conf_error("wrong configuration, rf_rx_freq[0] is not set".to_string()));
        }
        if self.board_cfg.clksrc >= LGW_RF_CHAIN_NB {
            return Err(conf_error(format!("clock source {} is not a RF chain", self.board_cfg.clksrc)));
        }

        for (i, rf) in self.rf_chain_cfg.iter().enumerate() {
            if (i == 0 || rf.enable) && !rf._type.is_sx125x() {
                error!(rf_chain = i, radio_type=%rf._type, "ERROR: NOT A VALID RADIO TYPE");
                return Err(Error::UnsupportedRadioType { rf_chain: i as u8, radio_type: rf._type }.into());
            }
            if rf.enable && rf.freq_hz == 0 {
                return Err(conf_error(format!("RF chain {} is enabled without a frequency", i)));
            }
        }

        for (i, ifc) in self.if_chain_cfg.iter().enumerate() {
            if ifc.rf_chain >= LGW_RF_CHAIN_NB {
                return Err(conf_error(format!("IF chain {} bound to invalid RF chain {}", i, ifc.rf_chain)));
            }
        }

        let lora_std = self.lora_std_cfg();
        if lora_std.enable {
            if !matches!(lora_std.bandwidth, BW_125KHZ | BW_250KHZ | BW_500KHZ) {
                return Err(conf_error(format!("unsupported LoRa standalone bandwidth code {}", lora_std.bandwidth)));
            }
            if !matches!(lora_std.datarate, DR_LORA_SF7 | DR_LORA_SF8 | DR_LORA_SF9 | DR_LORA_SF10 | DR_LORA_SF11 | DR_LORA_SF12) {
                return Err(conf_error(format!("unsupported LoRa standalone datarate 0x{:02X}", lora_std.datarate)));
            }
        }

        let fsk = self.fsk_cfg();
        if fsk.enable {
            if !(DR_FSK_MIN..=DR_FSK_MAX).contains(&fsk.datarate) {
                return Err(conf_error(format!("FSK datarate {} out of range", fsk.datarate)));
            }
            if fsk.bandwidth == BW_UNDEFINED {
                return Err(conf_error("FSK channel enabled without a bandwidth".to_string()));
            }
            if !(1..=8).contains(&fsk.sync_word_size) {
                return Err(conf_error(format!("FSK sync word size {} out of range", fsk.sync_word_size)));
            }
        }

        if self.tx_gain_lut.size > TX_GAIN_LUT_SIZE_MAX {
            return Err(conf_error(format!("TX gain LUT size {} too large", self.tx_gain_lut.size)));
        }
        for (i, gain) in self.tx_gain_lut.entries().iter().enumerate() {
            if let Err(e) = sx1301_agc_gain_word(gain) {
                error!(lut_index = i, e=%e, "ERROR: TX gain LUT entry does not fit the AGC gain word");
                return Err(e);
            }
        }

        Ok(())
    }
}


/**
@struct LgwPktRx
@brief Structure containing the metadata of a packet that was received and its payload
*/
#[derive(Debug, Clone, PartialEq)]
pub struct LgwPktRx {
    pub freq_hz: u32,        /* central frequency of the IF chain */
    pub if_chain: u8,       /* by which IF chain was packet received */
    pub status: u8,         /* status of the received packet */
    pub count_us: u32,       /* internal concentrator counter for timestamping, 1 microsecond resolution */
    pub rf_chain: u8,       /* through which RF chain the packet was received */
    pub modulation: Modulation,     /* modulation used by the packet */
    pub bandwidth: u8,      /* modulation bandwidth (LoRa only) */
    pub datarate: u32,       /* RX datarate of the packet (SF for LoRa) */
    pub coderate: u8,       /* error-correcting code of the packet (LoRa only) */
    pub rssi: f32,         /* average packet RSSI in dB */
    pub snr: f32,          /* average packet SNR, in dB (LoRa only) */
    pub snr_min: f32,      /* minimum packet SNR, in dB (LoRa only) */
    pub snr_max: f32,      /* maximum packet SNR, in dB (LoRa only) */
    pub crc: u16,        /* CRC that was received in the payload */
    pub size: u16,           /* payload size in bytes */
    pub payload: Vec<u8>,   /* buffer containing the payload */
}

impl std::fmt::Display for LgwPktRx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LgwPktRx {{ freq_hz: {}, if_chain: {}, status: 0x{:02X}, count_us: {}, rf_chain: {}, modulation: {}, bandwidth: {}, datarate: {}, coderate: {}, rssi: {}, snr: {}, snr_min: {}, snr_max: {}, crc: 0x{:04X}, size: {}, payload: {:02X?} }}",
            self.freq_hz,
            self.if_chain,
            self.status,
            self.count_us,
            self.rf_chain,
            self.modulation,
            self.bandwidth,
            self.datarate,
            self.coderate,
            self.rssi,
            self.snr,
            self.snr_min,
            self.snr_max,
            self.crc,
            self.size,
            &self.payload
        )
    }
}

impl Default for LgwPktRx {
    fn default() -> Self {
        Self::new()
    }
}

impl LgwPktRx {
    pub fn new() -> Self {
        Self {
            freq_hz: 0,
            if_chain: 0,
            status: STAT_UNDEFINED,
            count_us: 0,
            rf_chain: 0,
            modulation: Modulation::UNDEFINED,
            bandwidth: BW_UNDEFINED,
            datarate: DR_UNDEFINED,
            coderate: CR_UNDEFINED,
            rssi: 0.0,
            snr: 0.0,
            snr_min: 0.0,
            snr_max: 0.0,
            crc: 0,
            size: 0,
            payload: Vec::new(),
        }
    }
}

/// Outcome of a successful start.
#[derive(Debug, Clone, PartialEq)]
pub struct LgwStartStatus {
    pub spi_mux: LgwSpiMux,
    pub calibration: CalibrationReport,
}


#[derive(Debug)]
pub struct Hal {
    pub mcu: mcu::Mcu,
    lgw_regpage: i8,
}

impl Default for Hal {
    fn default() -> Self {
        Self::new()
    }
}

impl Hal {
    pub fn new() -> Self {
        Self {
            mcu: mcu::Mcu::new(),
            lgw_regpage: -1,
        }
    }
}

pub trait LgwHal {
    fn lgw_start(&mut self, com_path: &str, ctx: &mut LgwContext, firmware: &LgwFirmware, policy: CalibrationPolicy) -> Result<LgwStartStatus>;
    fn lgw_receive(&mut self, spi_mux: LgwSpiMux, ctx: &LgwContext) -> Result<Vec<LgwPktRx>, LgwRxError>;
    fn lgw_stop(&mut self) -> Result<()>;
}

impl<T: LoragwRegTrait + ?Sized> LgwHal for T {
    fn lgw_start(&mut self, com_path: &str, ctx: &mut LgwContext, firmware: &LgwFirmware, policy: CalibrationPolicy) -> Result<LgwStartStatus> {
        ctx.validate()?;

        /* the notch filter only exists on FPGA boards, follow the TX chain */
        let notch_chain = if ctx.rf_chain_cfg[1].tx_enable { 1 } else { 0 };
        let spi_mux = self.lgw_connect(com_path, false, ctx.rf_chain_cfg[notch_chain].tx_notch_freq).map_err(|e| {
            error!(e=%e, com_path, "ERROR: FAIL TO CONNECT BOARD");
            e
        })?;

        /* reset the registers (also shuts the radios down) */
        self.lgw_soft_reset(spi_mux)?;

        /* gate clocks */
        self.lgw_reg_w(spi_mux, GLOBAL_EN, 0)?;
        self.lgw_reg_w(spi_mux, CLK32M_EN, 0)?;

        /* switch on and reset the radios (also starts the 32 MHz XTAL) */
        self.lgw_reg_w(spi_mux, RADIO_A_EN, 1)?;
        self.lgw_reg_w(spi_mux, RADIO_B_EN, 1)?;
        self.lgw_wait_ms(500);
        self.lgw_reg_w(spi_mux, RADIO_RST, 1)?;
        self.lgw_wait_ms(5);
        self.lgw_reg_w(spi_mux, RADIO_RST, 0)?;

        /* setup the radios */
        for (i, rf) in ctx.rf_chain_cfg.iter().enumerate() {
            let rf_chain = i as u8;
            if !rf.enable && !rf._type.is_sx125x() {
                debug!(rf_chain, radio_type=%rf._type, "no SX125x on disabled RF chain, setup skipped");
                continue;
            }
            if let Err(e) = self.lgw_setup_sx125x(spi_mux, rf_chain, ctx.board_cfg.clksrc, rf.enable, rf._type, rf.freq_hz, &ctx.sx125x_cfg) {
                error!(rf_chain, e=%e, "ERROR: Failed to setup sx125x radio");
                return Err(e);
            }
        }

        /* gives AGC control of GPIOs to enable Tx external digital filter */
        self.lgw_reg_w(spi_mux, GPIO_MODE, 31)?; /* Set all GPIOs as output */
        self.lgw_reg_w(spi_mux, GPIO_SELECT_OUTPUT, 2)?;

        /* Enable clocks */
        self.lgw_reg_w(spi_mux, GLOBAL_EN, 1)?;
        self.lgw_reg_w(spi_mux, CLK32M_EN, 1)?;

        let calibration = self.sx1301_calibrate(spi_mux, ctx, &firmware.cal, policy)?;
        self.sx1301_read_cal_offsets(spi_mux, &mut ctx.cal_offsets)?;
        let ctx: &LgwContext = ctx;

        /* load adjusted parameters */
        self.sx1301_constant_adjust(spi_mux, ctx.board_cfg.lorawan_public)?;
        self.sx1301_freq_drift_setup(spi_mux, ctx.rf_chain_cfg[0].freq_hz)?;
        self.sx1301_channels_setup(spi_mux, ctx)?;

        /* Load firmware */
        self.lgw_load_firmware(spi_mux, McuTarget::Arb, &firmware.arb)?;
        self.lgw_load_firmware(spi_mux, McuTarget::Agc, &firmware.agc)?;

        /* gives the AGC MCU control over radio, RF front-end and filter gain */
        self.lgw_reg_w(spi_mux, FORCE_HOST_RADIO_CTRL, 0)?;
        self.lgw_reg_w(spi_mux, FORCE_HOST_FE_CTRL, 0)?;
        self.lgw_reg_w(spi_mux, FORCE_DEC_FILTER_GAIN, 0)?;

        /* Get MCUs out of reset */
        self.lgw_reg_w(spi_mux, RADIO_SELECT, 0)?; /* MUST not be = to 1 or 2 at firmware init */
        self.lgw_reg_w(spi_mux, MCU_RST_0, 0)?;
        self.lgw_reg_w(spi_mux, MCU_RST_1, 0)?;

        /* Check firmware version */
        self.lgw_check_fw_version(spi_mux, McuTarget::Agc, "AGC", FW_VERSION_AGC)?;
        self.lgw_check_fw_version(spi_mux, McuTarget::Arb, "arbiter", FW_VERSION_ARB)?;

        self.sx1301_agc_init(spi_mux, ctx)?;

        /* enable GPS event capture */
        self.lgw_reg_w(spi_mux, GPS_EN, 1)?;

        info!(spi_mux=%spi_mux, cal_status = calibration.status, "concentrator started");
        Ok(LgwStartStatus { spi_mux, calibration })
    }

    fn lgw_receive(&mut self, spi_mux: LgwSpiMux, ctx: &LgwContext) -> Result<Vec<LgwPktRx>, LgwRxError> {
        match self.sx1301_fetch_packets(spi_mux, ctx) {
            Ok(pkts) => {
                for pkt in &pkts {
                    debug!(pkt=%pkt);
                }
                Ok(pkts)
            }
            Err(e) => {
                warn!(e=%e.cause, fetched = e.packets.len(), "WARNING: RX FIFO drain aborted");
                Err(e)
            }
        }
    }

    fn lgw_stop(&mut self) -> Result<()> {
        info!("INFO: Disconnecting");
        if let Err(e) = self.lgw_disconnect() {
            error!(e=?e, "ERROR: failed to disconnect concentrator");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::loragw_fw::{FW_VERSION_ADDR, FW_VERSION_CAL, MCU_FW_SIZE};
    use crate::hal::mock::{MockHal, MockOp};

    pub(crate) fn eu868_context() -> LgwContext {
        let mut ctx = LgwContext::default();
        ctx.board_cfg.lorawan_public = true;
        ctx.rf_chain_cfg[0] = LgwConfRxrf {
            enable: true,
            freq_hz: 867_500_000,
            rssi_offset: -166.0,
            _type: LgwRadioType::LGW_RADIO_TYPE_SX1257,
            tx_enable: true,
            tx_notch_freq: 0,
        };
        ctx.rf_chain_cfg[1] = LgwConfRxrf {
            enable: true,
            freq_hz: 868_500_000,
            rssi_offset: -166.0,
            _type: LgwRadioType::LGW_RADIO_TYPE_SX1257,
            tx_enable: false,
            tx_notch_freq: 0,
        };
        for (i, freq_hz) in [-400_000, -200_000, 0, -400_000, -200_000, 0, 200_000, 400_000].iter().enumerate() {
            ctx.if_chain_cfg[i] = LgwConfRxIf {
                enable: true,
                rf_chain: if i < 3 { 1 } else { 0 },
                freq_hz: *freq_hz,
                ..Default::default()
            };
        }
        ctx
    }

    fn firmware() -> LgwFirmware {
        let image = |seed: u8| (0..MCU_FW_SIZE).map(|i| (i as u8).wrapping_mul(seed)).collect::<Vec<u8>>();
        LgwFirmware::new(image(3), image(5), image(7)).unwrap()
    }

    fn script_healthy_chip(hal: &mut MockHal, lut_size: usize) {
        /* radio version read, then PLL locked on first poll, for both radios */
        hal.queue_reads(SPI_RADIO_A__DATA_READBACK, &[0x21, 0x02]);
        hal.queue_reads(SPI_RADIO_B__DATA_READBACK, &[0x21, 0x02]);
        /* calibration firmware version, TX DC offsets, then AGC firmware version */
        hal.queue_read(DBG_AGC_MCU_RAM_DATA, FW_VERSION_CAL as i32);
        hal.queue_reads(DBG_AGC_MCU_RAM_DATA, &[0; 32]);
        hal.queue_read(DBG_AGC_MCU_RAM_DATA, FW_VERSION_AGC as i32);
        hal.queue_read(DBG_ARB_MCU_RAM_DATA, FW_VERSION_ARB as i32);

        let mut status = vec![0xFF];
        status.push(0x10);
        status.extend((0..lut_size as i32).map(|i| 0x30 + i));
        if lut_size < TX_GAIN_LUT_SIZE_MAX {
            status.push(0x30);
        }
        status.extend([0x33, 0x30, 0x40]);
        hal.queue_reads(MCU_AGC_STATUS, &status);
    }

    #[test]
    fn start_runs_the_whole_sequence() {
        let mut hal = MockHal::new();
        let mut ctx = eu868_context();
        script_healthy_chip(&mut hal, ctx.tx_gain_lut.size);

        let status = hal.lgw_start("/dev/ttyACM0", &mut ctx, &firmware(), CalibrationPolicy::Strict).unwrap();

        assert_eq!(status.spi_mux, LgwSpiMux::default());
        assert_eq!(status.calibration.status, 0xFF);
        assert!(status.calibration.warnings.is_empty());

        assert_eq!(hal.ops[0], MockOp::Connect);
        assert_eq!(hal.ops[1], MockOp::SoftReset);
        assert_eq!(hal.ops.last(), Some(&MockOp::Write("GPS_EN", 1)));

        /* fixed waits: power-up, reset pulse, two PLL polls, calibration, AGC handshake */
        let waits = hal.waits();
        assert_eq!(&waits[..4], &[500, 5, 1, 1]);
        assert!(waits.contains(&2300));

        /* calibration command: both radios, TX DC offset on A, DAC gain 3, SX1257 */
        assert!(hal.ops.contains(&MockOp::Write("RADIO_SELECT", 0x01 | 0x02 | 0x04 | 0x10)));
        /* IF chains 0-2 on radio B */
        assert_eq!(
            hal.ops.iter().filter(|op| **op == MockOp::Write("RADIO_SELECT", 0x07)).count(),
            1
        );

        /* firmware version checked through the debug port */
        assert!(hal.ops.contains(&MockOp::Write("DBG_ARB_MCU_RAM_ADDR", FW_VERSION_ADDR as i32)));
        /* standalone and FSK modems disabled */
        assert!(hal.ops.contains(&MockOp::Write("MBWSSF_MODEM_ENABLE", 0)));
        assert!(hal.ops.contains(&MockOp::Write("FSK_MODEM_ENABLE", 0)));
    }

    #[test]
    fn start_rejects_bad_configuration_before_io() {
        let mut hal = MockHal::new();
        let mut ctx = eu868_context();
        ctx.rf_chain_cfg[0].freq_hz = 0;

        let err = hal.lgw_start("/dev/ttyACM0", &mut ctx, &firmware(), CalibrationPolicy::Strict).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ConfigurationError(_))));
        assert!(hal.ops.is_empty());
    }

    #[test]
    fn start_rejects_out_of_range_gain_before_io() {
        let mut hal = MockHal::new();
        let mut ctx = eu868_context();
        let mut entries = ctx.tx_gain_lut.entries().to_vec();
        entries[0].pa_gain = 4;
        ctx.tx_gain_lut = LgwTxGainLut::from_entries(&entries).unwrap();

        assert!(ctx.validate().is_err());
        let err = hal.lgw_start("/dev/ttyACM0", &mut ctx, &firmware(), CalibrationPolicy::Strict).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ConfigurationError(_))));
        assert!(hal.ops.is_empty());
    }

    #[test]
    fn start_propagates_transport_failure() {
        let mut hal = MockHal::new();
        let mut ctx = eu868_context();
        script_healthy_chip(&mut hal, ctx.tx_gain_lut.size);
        hal.fail_on = Some("GPIO_MODE");

        let err = hal.lgw_start("/dev/ttyACM0", &mut ctx, &firmware(), CalibrationPolicy::Strict).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::TransportError(_))));
        /* radios were set up, nothing after the failing write */
        assert!(hal.waits().contains(&500));
        assert!(!hal.waits().contains(&2300));
        assert!(!hal.ops.iter().any(|op| matches!(op, MockOp::WriteBurst("MCU_PROM_DATA", _))));
    }

    #[test]
    fn start_stops_on_pll_timeout() {
        let mut hal = MockHal::new();
        let mut ctx = eu868_context();
        hal.set_value(SPI_RADIO_A__DATA_READBACK, 0x00);

        let err = hal.lgw_start("/dev/ttyACM0", &mut ctx, &firmware(), CalibrationPolicy::Strict).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::PllLockTimeout { rf_chain: 0, .. })));
        assert!(!hal.ops.iter().any(|op| matches!(op, MockOp::WriteBurst("MCU_PROM_DATA", _))));
    }

    #[test]
    fn validate_checks_radio_and_channels() {
        let ctx = eu868_context();
        assert!(ctx.validate().is_ok());

        let mut bad = ctx.clone();
        bad.rf_chain_cfg[1]._type = LgwRadioType::LGW_RADIO_TYPE_SX1272;
        assert!(matches!(
            bad.validate().unwrap_err().downcast_ref::<Error>(),
            Some(Error::UnsupportedRadioType { rf_chain: 1, .. })
        ));

        /* a disabled chain may carry no radio */
        let mut spare = ctx.clone();
        spare.rf_chain_cfg[1].enable = false;
        spare.rf_chain_cfg[1]._type = LgwRadioType::LGW_RADIO_TYPE_NONE;
        assert!(spare.validate().is_ok());

        let mut bad = ctx.clone();
        bad.if_chain_cfg[4].rf_chain = 2;
        assert!(bad.validate().is_err());

        let mut bad = ctx.clone();
        bad.if_chain_cfg[8] = LgwConfRxIf { enable: true, bandwidth: BW_62K5HZ, datarate: DR_LORA_SF7, ..Default::default() };
        assert!(bad.validate().is_err());

        let mut bad = ctx.clone();
        bad.if_chain_cfg[9].enable = true;
        bad.if_chain_cfg[9].bandwidth = BW_125KHZ;
        bad.if_chain_cfg[9].datarate = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn gain_lut_keeps_order_and_size() {
        let entries = [
            LgwTxGain { dig_gain: 0, pa_gain: 1, dac_gain: 3, mix_gain: 9, rf_power: 10 },
            LgwTxGain { dig_gain: 0, pa_gain: 0, dac_gain: 3, mix_gain: 12, rf_power: 2 },
        ];
        let lut = LgwTxGainLut::from_entries(&entries).unwrap();
        assert_eq!(lut.entries(), &entries);
        assert!(LgwTxGainLut::from_entries(&[LgwTxGain::default(); 17]).is_err());
        assert_eq!(LgwTxGainLut::default().entries()[1].rf_power, 27);
    }

    #[test]
    fn stop_disconnects() {
        let mut hal = MockHal::new();
        hal.lgw_stop().unwrap();
        assert_eq!(hal.ops, vec![MockOp::Disconnect]);
    }
}
