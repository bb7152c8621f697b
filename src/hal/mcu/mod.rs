pub mod command;
mod helper;

use command::*;
use tracing::{debug, error, trace};
use super::loragw_usb_com::UsbComPort;
use anyhow::{anyhow,Result};
use crate::hal::error::Error;

const MAX_SIZE_COMMAND:usize =  4200;
const MAX_SPI_COMMAND:usize  =   MAX_SIZE_COMMAND - CommandOrderOffset::Data as usize - 1 ;
const LGW_USB_BURST_CHUNK:usize =  4096 ;

const HEADER_CMD_SIZE:usize = 4;

/* bridge GPIOs wired to the concentrator board */
const GPIO_PORT_A: u8 = 0;
const GPIO_PIN_POWER_EN: u8 = 1;
const GPIO_PIN_SX1301_RESET: u8 = 2;


#[derive(Debug)]
pub struct PingInfo {
    pub unique_id_high: u32,
    pub unique_id_mid: u32,
    pub unique_id_low: u32,
    pub version: String /* format is V00.00.00\0 */
}

#[derive(Debug)]
pub struct Status{
    pub system_time_ms :u32,
    pub temperature: f32
}


impl Status {
    pub fn from_get_status(hdr: &[u8], payload:&[u8]) -> Result<Status> {
        if hdr[CommandOrderOffset::Cmd as usize] != OrderId::AckGetStatus as u8 {
            return Err(anyhow!("ERROR: received wrong ACK type {:}", hdr[CommandOrderOffset::Cmd as usize]));
        }

        Ok(Status {
            system_time_ms: helper::bytes_be_to_u32(&payload[ECmdOffsetAckGetStatus::AckGetStatusSystemTime31_24 as usize..])?,
            temperature: (((payload[ECmdOffsetAckGetStatus::AckGetStatusTemperature15_8 as usize] as u16) << 8) | (payload[ECmdOffsetAckGetStatus::AckGetStatusTemperature7_0 as usize] as u16)) as f32 / 100.0
        })
    }
}

impl PingInfo {
    pub fn from_ping(hdr: &[u8], payload:&[u8]) -> Result<PingInfo> {

        if hdr[CommandOrderOffset::Cmd as usize] != OrderId::AckPing as u8 {
            return Err(anyhow!("ERROR: received wrong ACK type {:}", hdr[CommandOrderOffset::Cmd as usize]));
        }

        let version = &payload[ECmdOffsetAckPing::AckPingVersion0 as usize..ECmdOffsetAckPing::AckPingSize as usize];
        Ok(PingInfo {
            unique_id_high: helper::bytes_be_to_u32(&payload[ECmdOffsetAckPing::AckPingUniqueId0 as usize..])?,
            unique_id_mid: helper::bytes_be_to_u32(&payload[ECmdOffsetAckPing::AckPingUniqueId4 as usize..])?,
            unique_id_low: helper::bytes_be_to_u32(&payload[ECmdOffsetAckPing::AckPingUniqueId8 as usize..])?,
            version: String::from_utf8_lossy(version).trim_end_matches('\0').to_string()
        })
    }

}

#[derive(Debug)]
pub struct Mcu {
    pub com: UsbComPort,
    pub ping_info: Option<PingInfo>,
    pub status: Option<Status>,
}

impl Default for Mcu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mcu {
    pub fn new () -> Self {
        Self {
            com: UsbComPort::new(),
            ping_info: None,
            status: None,
        }
    }

    pub fn open(&mut self, port_name: &str, force_reset: bool) -> Result<()> {
        self.com.open(port_name)?;

        let ping_info = self.mcu_ping()?;
        debug!(version=%ping_info.version, "bridge MCU answered ping");

        self.ping_info = Some(ping_info);
        self.status = Some(self.get_mcu_status()?);

        if force_reset {
            self.mcu_reset()?;
        }

        Ok(())
    }

    pub fn close(&mut self) {
        self.com.close();
    }

    fn write_req(&mut self, order:OrderId, payload: &[u8]) ->Result<()> {
        let buf_w = &mut [0u8; HEADER_CMD_SIZE];

        if payload.len() > MAX_SPI_COMMAND {
            return Err(anyhow!("Data too long"));
        }

        buf_w[0] = rand::random::<u8>();
        buf_w[1] = (payload.len() >> 8) as u8; // MSB
        buf_w[2] = (payload.len() & 0xFF) as u8; // LSB
        buf_w[3] = order as u8;

        let _n = self.com.write(buf_w)?;

        if _n < HEADER_CMD_SIZE {
            return Err(anyhow!("Failed to write to serial port"));
        }
        if !payload.is_empty() {
            let _n = self.com.write(payload)?;
            if _n < payload.len() {
                return Err(anyhow!("Failed to write to serial port"));
            }
        }

        trace!("write_req done");
        Ok(())
    }

    fn read_ack(&mut self, hdr: &mut [u8], buf: &mut [u8]) -> Result<()> {

        self.com.read_exact(hdr).map_err(|e| anyhow!("Failed to read HDR: {}", e))?;

        trace!("READ HD: {:02X?}", hdr);

        if  hdr[CommandOrderOffset::Cmd as usize] < OrderId::AckPing as u8 ||
            hdr[CommandOrderOffset::Cmd as usize] > OrderId::AckMultipleSpi as u8
        {
            return Err(anyhow!("ERROR: received wrong ACK type {:}", hdr[CommandOrderOffset::Cmd as usize]))
        }

        let size = (((hdr[1] as u16) << 8) | (hdr[2] as u16)) as usize;
        trace!("READ SIZE: {:}", size);

        if size > buf.len() {
            return Err(anyhow!("ERROR: ACK payload of {} bytes does not fit in {} bytes", size, buf.len()));
        }
        if size > 0 {
            self.com.read_exact(&mut buf[..size]).map_err(|e| anyhow!("Failed to read Payload: {}", e))?;
        }

        Ok(())
    }

    pub fn mcu_ping(&mut self) -> Result<PingInfo> {
        let mut buf_r = [0u8; ECmdOffsetAckPing::AckPingSize as usize];
        let mut buf_hdr = [0u8; HEADER_CMD_SIZE];

        self.write_req(OrderId::ReqPing, &[])?;
        self.read_ack(&mut buf_hdr, &mut buf_r)?;

        PingInfo::from_ping(&buf_hdr, &buf_r)
    }

    pub fn get_mcu_status(&mut self) -> Result<Status> {
        let mut buf_r = [0u8; ECmdOffsetAckGetStatus::AckGetStatusSize as usize];
        let mut buf_hdr = [0u8; HEADER_CMD_SIZE];

        self.write_req(OrderId::ReqGetStatus, &[])?;
        self.read_ack(&mut buf_hdr, &mut buf_r)?;

        Status::from_get_status(&buf_hdr, &buf_r)
    }

    fn decode_ack_gpio_access(hdr: &[u8], payload: &[u8]) -> Result<u8> {
        if hdr[CommandOrderOffset::Cmd as usize] != OrderId::AckWriteGpio as u8 {
            return Err(anyhow!("ERROR: received wrong ACK type {:}", hdr[CommandOrderOffset::Cmd as usize]));
        }

        Ok(payload[ECmdOffsetAckGpioWrite::AckGpioWriteStatus as usize])
    }

    fn cmd_get_size( bytes:& [u8]) -> usize {
        (((bytes[1] as u16) << 8) | (bytes[2] as u16)) as usize
    }

    /* request metadata + raw SPI frame (header then payload) */
    fn build_spi_req(req_id: u8, spi_header: &[u8], payload: &[u8]) -> Vec<u8> {
        let frame_size = spi_header.len() + payload.len();
        let mut in_out_buf = Vec::with_capacity(MCU_SPI_REQ_HEADER_SIZE + frame_size);

        in_out_buf.push(req_id);
        in_out_buf.push(MCU_SPI_REQ_TYPE_READ_WRITE);
        in_out_buf.push(ECmdSpiTarget::MCU_SPI_TARGET_SX1301 as u8);
        in_out_buf.push((frame_size >> 8) as u8);
        in_out_buf.push((frame_size & 0xFF) as u8);
        in_out_buf.extend_from_slice(spi_header);
        in_out_buf.extend_from_slice(payload);

        in_out_buf
    }

    fn decode_ack_spi_bulk(hdr: &[u8], payload: &[u8]) -> Result<()> {
        let mut i = 0;

        if hdr.is_empty() || payload.is_empty() {
            return Err(anyhow!("ERROR: invalid parameter"));
        }

        if hdr[CommandOrderOffset::Cmd as usize] != OrderId::AckMultipleSpi as u8 {
            return Err(anyhow!("ERROR: wrong ACK type for ACK_MULTIPLE_SPI (expected:0x{:02X}, got 0x{:02X})", OrderId::AckMultipleSpi as u8, hdr[CommandOrderOffset::Cmd as usize]));
        }

        let size = Self::cmd_get_size(hdr);
        while i < size {
            if i + MCU_SPI_REQ_HEADER_SIZE > payload.len() {
                return Err(anyhow!("ERROR: truncated ACK_MULTIPLE_SPI payload"));
            }
            let req_id = payload[i];
            let req_type = payload[i + 1];
            if req_type != MCU_SPI_REQ_TYPE_READ_WRITE {
                return Err(anyhow!("ERROR: wrong type for SPI request {} (0x{:02X})", req_id, req_type));
            }
            let req_status = ESpiStatus::from(payload[i + 2]);
            if req_status != ESpiStatus::SpiStatusOk {
                return Err(anyhow!("ERROR: SPI request {} failed with {}", req_id, req_status));
            }

            i += MCU_SPI_REQ_HEADER_SIZE + helper::spi_req_frame_size(&payload[i..]);
        }

        Ok(())
    }

    pub fn mcu_gpio_write(&mut self, gpio_port: u8, gpio_id: u8, gpio_value: u8) -> Result<()> {
        let mut buf_req = [0u8; ECmdOffsetReqWriteGpio::ReqWriteGpioSize as usize];
        let mut buf_ack = [0u8; ECmdOffsetAckGpioWrite::AckGpioWriteSize as usize];
        let mut buf_hdr = [0u8; HEADER_CMD_SIZE];

        buf_req[ECmdOffsetReqWriteGpio::ReqWriteGpioPort as usize] = gpio_port;
        buf_req[ECmdOffsetReqWriteGpio::ReqWriteGpioPin as usize] = gpio_id;
        buf_req[ECmdOffsetReqWriteGpio::ReqWriteGpioState as usize] = gpio_value;

        self.write_req(OrderId::ReqWriteGpio, &buf_req)?;

        self.read_ack(&mut buf_hdr, &mut buf_ack)?;

        let status = Mcu::decode_ack_gpio_access(&buf_hdr, &buf_ack)?;

        if status != 0 {
            return Err(anyhow!("ERROR: Failed to write GPIO (port:{} id:{} value:{})", gpio_port, gpio_id, gpio_value));
        }

        Ok(())
    }


    pub fn mcu_reset(&mut self) -> Result<()> {
        /* Reset SX1301 */
        self.mcu_gpio_write(GPIO_PORT_A, GPIO_PIN_POWER_EN, 1)?;     /*   set PA1 : POWER_EN */
        self.mcu_gpio_write(GPIO_PORT_A, GPIO_PIN_SX1301_RESET, 1)?; /*   set PA2 : SX1301_RESET active */
        self.mcu_gpio_write(GPIO_PORT_A, GPIO_PIN_SX1301_RESET, 0)?; /* unset PA2 : SX1301_RESET inactive */

        Ok(())
    }


    pub fn mcu_spi_write(&mut self, in_out_buf: &mut [u8]) -> Result<()> {

        trace!(in_out_buf=?in_out_buf, "mcu_spi_write");
        /* Check input parameters */
        if in_out_buf.is_empty() {
            return Err(anyhow!("Input buffer is null"));
        }

        self.write_req(OrderId::ReqMultipleSpi, in_out_buf)?;

        let mut buf_hdr = [0u8; HEADER_CMD_SIZE];

        self.read_ack(&mut buf_hdr, in_out_buf)?;

        Mcu::decode_ack_spi_bulk(&buf_hdr, in_out_buf)?;

        Ok(())
    }

    fn burst_chunk_size(spi_header: &[u8]) -> usize {
        LGW_USB_BURST_CHUNK - MCU_SPI_REQ_HEADER_SIZE - spi_header.len()
    }
}

/// Raw SPI frames to the SX1301, carried by the bridge MCU.
pub trait McuTrait {
    fn lgw_rb(&mut self, spi_header: &[u8], size: usize) -> Result<Vec<u8>>;
    fn lgw_wb(&mut self, spi_header: &[u8], data: &[u8]) -> Result<()>;
    fn lgw_disconnect(&mut self) -> Result<()>;
}

impl McuTrait for Mcu {
    fn lgw_disconnect(&mut self) -> Result<()> {

        /* Reset SX1301 before closing */
        if let Err(e) = self.mcu_reset() {
            error!(e=%e, "ERROR: failed to reset SX1301");
            self.close();
            return Err(Error::TransportError(format!("failed to reset SX1301: {}", e)).into());
        }

        /* close file & deallocate file descriptor */
        self.close();

        Ok(())
    }

    /* Burst (multiple-byte) read, the data register is re-addressed for every chunk */
    fn lgw_rb(&mut self, spi_header: &[u8], size: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(size);
        let chunk_size = Mcu::burst_chunk_size(spi_header);

        while data.len() < size {
            let chunk = chunk_size.min(size - data.len());
            let mut in_out_buf = Mcu::build_spi_req(0, spi_header, &vec![0u8; chunk]);

            if let Err(e) = self.mcu_spi_write(&mut in_out_buf) {
                error!("ERROR: USB READ BURST FAILURE");
                return Err(e);
            }

            let offset = MCU_SPI_REQ_HEADER_SIZE + spi_header.len();
            data.extend_from_slice(&in_out_buf[offset..offset + chunk]);
        }

        trace!("Note: USB read burst success");
        Ok(data)
    }

    fn lgw_wb(&mut self, spi_header: &[u8], data: &[u8]) -> Result<()> {

        if data.is_empty() {
            return Err(anyhow!("ERROR: empty data array"))
        }

        for (req_id, chunk) in data.chunks(Mcu::burst_chunk_size(spi_header)).enumerate() {
            let mut in_out_buf = Mcu::build_spi_req(req_id as u8, spi_header, chunk);
            self.mcu_spi_write(&mut in_out_buf).map_err(|e| anyhow!("ERROR: USB WRITE BURST FAILURE: {:}", e))?;
        }

        trace!("Note: USB write burst success");

        Ok(())
    }
}
