use anyhow::Result;
use tracing::{debug, trace, warn};

use super::error::{Error, LgwRxError};
use super::loragw_com::LgwSpiMux;
use super::loragw_reg::*;
use super::loragw_sx1301_timestamp::{corrected_count_us, lora_sf_to_dr, lora_timestamp_correction, FSK_TIMESTAMP_CORRECTION};
use super::*;

/* FIFO status header: packets stored, start address (2 bytes), CRC status, payload size */
const RX_FIFO_HEADER_NB: usize = 5;

const META_IF_CHAIN: usize = 0;
const META_RATE: usize = 1;
const META_SNR: usize = 2;
const META_SNR_MIN: usize = 3;
const META_SNR_MAX: usize = 4;
const META_RSSI: usize = 5;
const META_TIMESTAMP: usize = 6;
const META_CRC: usize = 10;

const META_RATE_CR: BitField = BitField::new(1, 3);
const META_RATE_SF: BitField = BitField::new(4, 4);
const FIFO_STATUS_CRC: BitField = BitField::new(0, 3);

/* SNR/RSSI reported when the modem gives none */
const SNR_NONE: f32 = -128.0;
const RSSI_NONE: f32 = -128.0;

/* FSK packets are always reported with these */
const FSK_RX_DATARATE: u32 = 50000;

/* (status, crc enabled) from the FIFO CRC status */
fn rx_crc_status(stat_fifo: u8) -> (u8, bool) {
    match FIFO_STATUS_CRC.extract(stat_fifo as u32) {
        5 => (STAT_CRC_OK, true),
        7 => (STAT_CRC_BAD, true),
        1 => (STAT_NO_CRC, false),
        _ => (STAT_UNDEFINED, false),
    }
}

fn rx_coderate(cr: u8) -> u8 {
    match cr {
        1 => CR_LORA_4_5,
        2 => CR_LORA_4_6,
        3 => CR_LORA_4_7,
        4 => CR_LORA_4_8,
        _ => CR_UNDEFINED,
    }
}

fn fsk_rssi_linearize(rssi: f32) -> f32 {
    let rssi = rssi as f64;
    (RSSI_FSK_POLY_0 + RSSI_FSK_POLY_1 * rssi + RSSI_FSK_POLY_2 * libm::pow(rssi, 2.0)) as f32
}

/// Decodes one FIFO entry. `buff` holds the payload followed by its metadata.
pub fn sx1301_decode_packet(ctx: &LgwContext, stat_fifo: u8, size: u16, buff: &[u8]) -> Result<LgwPktRx> {
    let sz = size as usize;
    if buff.len() < sz + RX_METADATA_NB {
        return Err(Error::TransportError(format!(
            "short RX buffer read, {} bytes for a {} bytes packet",
            buff.len(),
            sz
        ))
        .into());
    }
    let meta = &buff[sz..sz + RX_METADATA_NB];

    let if_chain = meta[META_IF_CHAIN];
    if if_chain >= LGW_IF_CHAIN_NB {
        return Err(Error::InvalidIfChain { if_chain }.into());
    }
    let ifmod = LGW_IFMODEM_CONFIG[if_chain as usize];
    let ifc = &ctx.if_chain_cfg[if_chain as usize];
    let rf = ctx
        .rf_chain_cfg
        .get(ifc.rf_chain as usize)
        .ok_or_else(|| Error::ConfigurationError(format!("IF chain {} bound to invalid RF chain {}", if_chain, ifc.rf_chain)))?;

    let mut pkt = LgwPktRx {
        freq_hz: rf.freq_hz.wrapping_add_signed(ifc.freq_hz),
        if_chain,
        rf_chain: ifc.rf_chain,
        rssi: meta[META_RSSI] as f32 + rf.rssi_offset,
        size,
        payload: buff[..sz].to_vec(),
        ..LgwPktRx::new()
    };

    let correction: i32 = if ifmod == IF_LORA_MULTI || ifmod == IF_LORA_STD {
        let (status, crc_en) = rx_crc_status(stat_fifo);
        let sf = META_RATE_SF.extract(meta[META_RATE] as u32) as u8;
        let cr = META_RATE_CR.extract(meta[META_RATE] as u32) as u8;

        pkt.status = status;
        pkt.modulation = Modulation::LORA;
        pkt.snr = (meta[META_SNR] as i8) as f32 / 4.0;
        pkt.snr_min = (meta[META_SNR_MIN] as i8) as f32 / 4.0;
        pkt.snr_max = (meta[META_SNR_MAX] as i8) as f32 / 4.0;
        pkt.bandwidth = if ifmod == IF_LORA_MULTI { BW_125KHZ } else { ctx.lora_std_cfg().bandwidth };
        pkt.datarate = lora_sf_to_dr(sf);
        pkt.coderate = rx_coderate(cr);

        if ifmod == IF_LORA_MULTI {
            pkt.rssi -= RSSI_MULTI_BIAS;
        }

        lora_timestamp_correction(ifmod, pkt.bandwidth, sf, cr, crc_en, size) as i32
    } else if ifmod == IF_FSK_STD {
        let (status, _) = rx_crc_status(stat_fifo);

        pkt.status = status;
        pkt.modulation = Modulation::FSK;
        pkt.snr = SNR_NONE;
        pkt.snr_min = SNR_NONE;
        pkt.snr_max = SNR_NONE;
        pkt.bandwidth = BW_125KHZ;
        pkt.datarate = FSK_RX_DATARATE;
        pkt.coderate = CR_UNDEFINED;
        pkt.rssi = fsk_rssi_linearize(pkt.rssi);

        FSK_TIMESTAMP_CORRECTION
    } else {
        warn!(if_chain, ifmod, "WARNING: packet received on an IF chain without modem");
        pkt.status = STAT_UNDEFINED;
        pkt.modulation = Modulation::UNDEFINED;
        pkt.rssi = RSSI_NONE;
        pkt.snr = SNR_NONE;
        pkt.snr_min = SNR_NONE;
        pkt.snr_max = SNR_NONE;
        pkt.bandwidth = BW_UNDEFINED;
        pkt.datarate = DR_UNDEFINED;
        pkt.coderate = CR_UNDEFINED;
        0
    };

    let raw_timestamp = u32::from_le_bytes([
        meta[META_TIMESTAMP],
        meta[META_TIMESTAMP + 1],
        meta[META_TIMESTAMP + 2],
        meta[META_TIMESTAMP + 3],
    ]);
    pkt.count_us = corrected_count_us(raw_timestamp, correction);
    pkt.crc = u16::from_le_bytes([meta[META_CRC], meta[META_CRC + 1]]);

    trace!(if_chain, raw_timestamp, correction, "packet decoded");
    Ok(pkt)
}

pub trait LoragwSx1301RxTrait: LoragwRegTrait {
    /// Reads one packet from the FIFO head, `None` when the FIFO is empty.
    fn sx1301_fetch_one(&mut self, spi_mux: LgwSpiMux, ctx: &LgwContext) -> Result<Option<LgwPktRx>> {
        let header = self.lgw_reg_rb(spi_mux, RX_PACKET_DATA_FIFO_NUM_STORED, RX_FIFO_HEADER_NB)?;
        let &[count, _addr_lsb, _addr_msb, stat_fifo, size] = header.as_slice() else {
            return Err(Error::TransportError(format!("short RX FIFO status read ({} bytes)", header.len())).into());
        };

        if count == 0 {
            return Ok(None);
        }
        if count > LGW_PKT_FIFO_SIZE {
            return Err(Error::CorruptFifoState { count }.into());
        }
        trace!(count, stat_fifo, size, "RX FIFO status");

        let buff = self.lgw_reg_rb(spi_mux, RX_DATA_BUF_DATA, size as usize + RX_METADATA_NB)?;
        let pkt = sx1301_decode_packet(ctx, stat_fifo, size as u16, &buff)?;

        /* advance packet FIFO */
        self.lgw_reg_w(spi_mux, RX_PACKET_DATA_FIFO_NUM_STORED, 0)?;
        Ok(Some(pkt))
    }

    /// Drains up to [`LGW_PKT_FIFO_SIZE`] packets.
    ///
    /// On failure the packets decoded before the failing one are handed back in the error.
    fn sx1301_fetch_packets(&mut self, spi_mux: LgwSpiMux, ctx: &LgwContext) -> Result<Vec<LgwPktRx>, LgwRxError> {
        let mut packets = Vec::new();

        for _ in 0..LGW_PKT_FIFO_SIZE {
            match self.sx1301_fetch_one(spi_mux, ctx) {
                Ok(Some(pkt)) => packets.push(pkt),
                Ok(None) => break,
                Err(cause) => return Err(LgwRxError { packets, cause }),
            }
        }

        debug!(nb_pkt = packets.len(), "RX FIFO drained");
        Ok(packets)
    }
}

impl<T: LoragwRegTrait + ?Sized> LoragwSx1301RxTrait for T {}
