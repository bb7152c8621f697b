use std::fmt::Display;

/* orders understood by the USB-to-SPI bridge MCU */
#[repr(u8)]
pub enum OrderId {
    ReqPing            = 0x00,
    ReqGetStatus       = 0x01,
    ReqWriteGpio       = 0x04,
    ReqMultipleSpi     = 0x05,

    AckPing            = 0x40,
    AckGetStatus       = 0x41,
    AckWriteGpio       = 0x44,
    AckMultipleSpi     = 0x45,
}

#[repr(u8)]
pub enum CommandOrderOffset {
    Id,
    SizeMsb,
    SizeLsb,
    Cmd,
    Data
}

#[repr(u8)]
pub enum ECmdOffsetAckPing {
    AckPingUniqueId0,  AckPingUniqueId1,  AckPingUniqueId2,  AckPingUniqueId3,
    AckPingUniqueId4,  AckPingUniqueId5,  AckPingUniqueId6,  AckPingUniqueId7,
    AckPingUniqueId8,  AckPingUniqueId9,  AckPingUniqueId10, AckPingUniqueId11,
    AckPingVersion0,   AckPingVersion1,   AckPingVersion2,   AckPingVersion3,   AckPingVersion4,
    AckPingVersion5,   AckPingVersion6,   AckPingVersion7,   AckPingVersion8,
    AckPingSize,
}

#[repr(u8)]
pub enum ECmdOffsetAckGetStatus {
    AckGetStatusSystemTime31_24, AckGetStatusSystemTime23_16, AckGetStatusSystemTime15_8, AckGetStatusSystemTime7_0,
    AckGetStatusTemperature15_8, AckGetStatusTemperature7_0,
    AckGetStatusSize,
}

#[repr(u8)]
pub enum ECmdOffsetReqWriteGpio {
    ReqWriteGpioPort,
    ReqWriteGpioPin,
    ReqWriteGpioState,
    ReqWriteGpioSize,
}

#[repr(u8)]
pub enum ECmdOffsetAckGpioWrite {
    AckGpioWriteStatus,
    AckGpioWriteSize,
}

pub const MCU_SPI_REQ_TYPE_READ_WRITE: u8 = 0x01; /* Read/Write SPI request */

/* size of the request metadata prepended to each raw SPI frame */
pub const MCU_SPI_REQ_HEADER_SIZE: usize = 5;

#[derive(Debug, PartialEq)]
pub enum ESpiStatus {
    SpiStatusOk,
    SpiStatusFail,
    SpiStatusWrongParam,
    SpiStatusTimeout,
    SpiStatusUnknown(u8),
}

impl From<u8> for ESpiStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => ESpiStatus::SpiStatusOk,
            1 => ESpiStatus::SpiStatusFail,
            2 => ESpiStatus::SpiStatusWrongParam,
            3 => ESpiStatus::SpiStatusTimeout,
            v => ESpiStatus::SpiStatusUnknown(v),
        }
    }
}

impl Display for ESpiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ESpiStatus::SpiStatusOk => write!(f, "SpiStatusOk"),
            ESpiStatus::SpiStatusFail => write!(f, "SpiStatusFail"),
            ESpiStatus::SpiStatusWrongParam => write!(f, "SpiStatusWrongParam"),
            ESpiStatus::SpiStatusTimeout => write!(f, "SpiStatusTimeout"),
            ESpiStatus::SpiStatusUnknown(v) => write!(f, "SpiStatusUnknown(0x{:02X})", v),
        }
    }
}

#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum ECmdSpiTarget
{
    MCU_SPI_TARGET_SX1301,  /* SX1301 + SX125x through the SX1301 radio SPI masters */
}
