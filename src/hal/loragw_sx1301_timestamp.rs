use tracing::warn;

use super::{IF_LORA_MULTI, IF_LORA_STD, BW_125KHZ, BW_250KHZ, BW_500KHZ, DR_LORA_SF11, DR_LORA_SF12};

/* fixed processing delay of the FSK demodulator, in us */
pub const FSK_TIMESTAMP_CORRECTION: i32 = (680000 / 50000) - 20;

/// Low datarate optimisation is on for symbols of 16 ms or more.
#[allow(non_snake_case)]
pub fn SET_PPM_ON(bandwidth: u8, datarate: u32) -> bool {
    (bandwidth == BW_125KHZ && (datarate == DR_LORA_SF11 || datarate == DR_LORA_SF12))
        || (bandwidth == BW_250KHZ && datarate == DR_LORA_SF12)
}

/* SF number -> datarate code */
pub fn lora_sf_to_dr(sf: u8) -> u32 {
    match sf {
        7..=12 => 1 << (sf - 6),
        _ => 0,
    }
}

/* (base delay, bandwidth ratio to 125 kHz) of the demodulator that received the packet */
fn lora_base_delay(ifmod: u8, bandwidth: u8) -> (i64, i64) {
    if ifmod == IF_LORA_STD {
        match bandwidth {
            BW_125KHZ => (64, 1),
            BW_250KHZ => (32, 2),
            BW_500KHZ => (16, 4),
            _ => {
                warn!(bandwidth, "WARNING: unexpected bandwidth for the standalone LoRa modem, no timestamp correction");
                (0, 0)
            }
        }
    } else if ifmod == IF_LORA_MULTI {
        /* multi-SF channels are fixed at 125 kHz */
        (114, 1)
    } else {
        (0, 0)
    }
}

/// Delay in us between the end of a LoRa packet and the moment the concentrator
/// latched its timestamp.
///
/// `sf` and `cr` are the raw values decoded from the packet metadata, `bandwidth`
/// is the bandwidth code of the demodulator. Returns 0 when `sf` is outside 6..=12
/// or the bandwidth is unknown.
pub fn lora_timestamp_correction(ifmod: u8, bandwidth: u8, sf: u8, cr: u8, crc_en: bool, size: u16) -> u32 {
    let (delay_x, bw_pow) = lora_base_delay(ifmod, bandwidth);
    if !(6..=12).contains(&sf) || bw_pow == 0 {
        return 0;
    }

    let ppm = SET_PPM_ON(bandwidth, lora_sf_to_dr(sf)) as i64;
    let sf = sf as i64;
    let cr = cr as i64;
    let coded_len = 2 * (size as i64 + 2 * crc_en as i64);

    let (delay_y, delay_z) = if coded_len - (sf - 7) <= 0 {
        /* payload fits entirely in first 8 symbols */
        (
            ((1 << (sf - 1)) * (sf + 1) + 3 * (1 << (sf - 4))) / bw_pow,
            32 * (coded_len + 5) / bw_pow,
        )
    } else {
        (
            ((1 << (sf - 1)) * (sf + 1) + (4 - ppm) * (1 << (sf - 4))) / bw_pow,
            (16 + 4 * cr) * (((coded_len - sf + 6) % (sf - 2 * ppm)) + 1) / bw_pow,
        )
    };

    (delay_x + delay_y + delay_z) as u32
}

/* counter value at the end of the packet; the counter wraps so this is modular */
pub fn corrected_count_us(raw_timestamp: u32, correction: i32) -> u32 {
    raw_timestamp.wrapping_sub(correction as u32)
}
