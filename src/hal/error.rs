use std::fmt;

use super::{LgwRadioType, LgwPktRx};

/* firmware target, selects the reset/mux register pair */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McuTarget {
    Arb,
    Agc,
}

impl fmt::Display for McuTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McuTarget::Arb => write!(f, "ARB"),
            McuTarget::Agc => write!(f, "AGC"),
        }
    }
}

/* partial calibration results, reported as warnings */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationWarningKind {
    RadioAccessA,
    RadioAccessB,
    ImageRejectionA,
    ImageRejectionB,
    TxDcOffsetA,
    TxDcOffsetB,
}

impl fmt::Display for CalibrationWarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CalibrationWarningKind::RadioAccessA => "calibration could not access radio A",
            CalibrationWarningKind::RadioAccessB => "calibration could not access radio B",
            CalibrationWarningKind::ImageRejectionA => "problem in calibration of radio A for image rejection",
            CalibrationWarningKind::ImageRejectionB => "problem in calibration of radio B for image rejection",
            CalibrationWarningKind::TxDcOffsetA => "problem in calibration of radio A for TX DC offset",
            CalibrationWarningKind::TxDcOffsetB => "problem in calibration of radio B for TX DC offset",
        };
        write!(f, "{}", s)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("LGW_COM_ERROR: {0}")]
    TransportError(String),

    #[error("LGW_CONF_ERROR: {0}")]
    ConfigurationError(String),

    #[error("ERROR: failed to load {target} firmware, readback mismatch at byte {offset}")]
    FirmwareVerificationFailed { target: McuTarget, offset: usize },

    #[error("ERROR: version of {firmware} firmware not expected, actual:{actual} expected:{expected}")]
    FirmwareVersionMismatch { firmware: &'static str, expected: u8, actual: u8 },

    #[error("ERROR: failed to lock PLL of radio {rf_chain} after {attempts} attempts")]
    PllLockTimeout { rf_chain: u8, attempts: u8 },

    #[error("ERROR: CALIBRATION FAILURE (STATUS = 0x{status:02X})")]
    CalibrationFailure { status: u8 },

    #[error("WARNING: partial calibration (STATUS = 0x{status:02X}): {warnings:?}")]
    CalibrationWarning { status: u8, warnings: Vec<CalibrationWarningKind> },

    #[error("ERROR: AGC FIRMWARE INITIALIZATION FAILURE during {step}, expected 0x{expected:02X}, got 0x{status:02X}")]
    AgcInitFailure { step: &'static str, expected: u8, status: u8 },

    #[error("WARNING: {count} = INVALID NUMBER OF PACKETS TO FETCH, ABORTING")]
    CorruptFifoState { count: u8 },

    #[error("WARNING: {if_chain} NOT A VALID IF_CHAIN NUMBER, ABORTING")]
    InvalidIfChain { if_chain: u8 },

    #[error("ERROR: UNSUPPORTED RADIO TYPE {radio_type} (RF_CHAIN {rf_chain})")]
    UnsupportedRadioType { rf_chain: u8, radio_type: LgwRadioType },
}

/// A FIFO drain that stopped early. `packets` holds what was decoded before the failing packet.
#[derive(thiserror::Error, Debug)]
#[error("RX FIFO drain aborted after {} packet(s): {cause}", .packets.len())]
pub struct LgwRxError {
    pub packets: Vec<LgwPktRx>,
    pub cause: anyhow::Error,
}
