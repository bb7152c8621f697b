use std::path::Path;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use super::error::Error;
use super::loragw_sx1301_timestamp::{lora_sf_to_dr, SET_PPM_ON};
use super::*;

/// Configuration loaded from a gateway JSON file.
#[derive(Debug, Clone)]
pub struct LgwConf {
    pub context: LgwContext,
    pub gateway_id: Option<u64>,
}

/* standalone LoRa channel, SF given as a number */
#[derive(Debug, Deserialize)]
struct LgwConfLoraStd {
    #[serde(flatten)]
    chan: LgwConfRxIf,
    #[serde(default)]
    spread_factor: u8,
}

#[derive(Debug, Deserialize)]
struct LgwConfGateway {
    #[serde(rename = "gateway_ID")]
    gateway_id: Option<String>,
}

fn conf_error(msg: String) -> anyhow::Error {
    error!("ERROR: {}", msg);
    Error::ConfigurationError(msg).into()
}

fn parse_section<T: for<'de> Deserialize<'de>>(conf: &Map<String, Value>, key: &str) -> Result<Option<T>> {
    match conf.get(key) {
        None => Ok(None),
        Some(value) => T::deserialize(value)
            .map(Some)
            .map_err(|e| conf_error(format!("invalid {} configuration: {}", key, e))),
    }
}

fn parse_gateway_id(id: &str) -> Result<u64> {
    u64::from_str_radix(id.trim(), 16).map_err(|e| conf_error(format!("invalid gateway_ID {}: {}", id, e)))
}

/// Maps the `SX1301_conf` object onto the hardware state.
pub fn lgw_parse_sx1301_conf(conf: &Map<String, Value>) -> Result<LgwContext> {
    let mut ctx = LgwContext::default();

    if let Some(public) = parse_section::<bool>(conf, "lorawan_public")? {
        ctx.board_cfg.lorawan_public = public;
    }
    if let Some(clksrc) = parse_section::<u8>(conf, "clksrc")? {
        ctx.board_cfg.clksrc = clksrc;
    }
    debug!(lorawan_public = ctx.board_cfg.lorawan_public, clksrc = ctx.board_cfg.clksrc, "board configuration");

    for i in 0..LGW_RF_CHAIN_NB as usize {
        let key = format!("radio_{}", i);
        match parse_section::<LgwConfRxrf>(conf, &key)? {
            Some(rf) => {
                if !rf._type.is_sx125x() {
                    error!(rf_chain = i, radio_type=%rf._type, "ERROR: NOT A VALID RADIO TYPE");
                    return Err(Error::UnsupportedRadioType { rf_chain: i as u8, radio_type: rf._type }.into());
                }
                info!(rf_chain = i, enable = rf.enable, freq_hz = rf.freq_hz, radio_type=%rf._type, "radio configured");
                ctx.rf_chain_cfg[i] = rf;
            }
            None => info!(rf_chain = i, "no configuration for radio"),
        }
    }

    for i in 0..LGW_MULTI_NB as usize {
        let key = format!("chan_multiSF_{}", i);
        if let Some(chan) = parse_section::<LgwConfRxIf>(conf, &key)? {
            debug!(if_chain = i, enable = chan.enable, rf_chain = chan.rf_chain, freq_hz = chan.freq_hz, "LoRa multi-SF channel");
            ctx.if_chain_cfg[i] = LgwConfRxIf {
                enable: chan.enable,
                rf_chain: chan.rf_chain,
                freq_hz: chan.freq_hz,
                ..Default::default()
            };
        }
    }

    if let Some(std) = parse_section::<LgwConfLoraStd>(conf, "chan_Lora_std")? {
        let mut chan = std.chan;
        if chan.enable {
            chan.datarate = lora_sf_to_dr(std.spread_factor);
            if chan.datarate == DR_UNDEFINED {
                return Err(conf_error(format!("invalid spread_factor {} for chan_Lora_std", std.spread_factor)));
            }
            if chan.bandwidth == BW_UNDEFINED {
                return Err(conf_error("missing bandwidth for chan_Lora_std".to_string()));
            }
            ctx.lora_rx_ppm_offset = SET_PPM_ON(chan.bandwidth, chan.datarate);
        }
        debug!(chan=%chan, "LoRa standalone channel");
        ctx.if_chain_cfg[8] = chan;
    }

    if let Some(mut chan) = parse_section::<LgwConfRxIf>(conf, "chan_FSK")? {
        if chan.sync_word_size == 0 {
            chan.sync_word_size = FSK_SYNC_WORD_SIZE_DEFAULT;
            chan.sync_word = FSK_SYNC_WORD_DEFAULT;
        }
        if chan.enable && !(DR_FSK_MIN..=DR_FSK_MAX).contains(&chan.datarate) {
            return Err(conf_error(format!("invalid datarate {} for chan_FSK", chan.datarate)));
        }
        debug!(chan=%chan, "FSK channel");
        ctx.if_chain_cfg[9] = chan;
    }

    let mut lut = Vec::new();
    for i in 0..TX_GAIN_LUT_SIZE_MAX {
        let key = format!("tx_lut_{}", i);
        if let Some(gain) = parse_section::<LgwTxGain>(conf, &key)? {
            lut.push(gain);
        }
    }
    if !lut.is_empty() {
        ctx.tx_gain_lut = LgwTxGainLut::from_entries(&lut)?;
        info!(size = lut.len(), "TX gain LUT configured");
    } else {
        info!("no TX gain LUT configured, using the default table");
    }

    Ok(ctx)
}

/// Parses a gateway JSON configuration (`SX1301_conf` and optional `gateway_conf`).
pub fn lgw_parse_conf(json: &str) -> Result<LgwConf> {
    let root: Map<String, Value> =
        serde_json::from_str(json).map_err(|e| conf_error(format!("invalid JSON configuration: {}", e)))?;

    let sx1301 = match root.get("SX1301_conf") {
        Some(Value::Object(obj)) => obj,
        _ => return Err(conf_error("no SX1301_conf object in configuration".to_string())),
    };
    let context = lgw_parse_sx1301_conf(sx1301)?;

    let gateway_id = match parse_section::<LgwConfGateway>(&root, "gateway_conf")? {
        Some(LgwConfGateway { gateway_id: Some(id) }) => Some(parse_gateway_id(&id)?),
        _ => None,
    };

    Ok(LgwConf { context, gateway_id })
}

pub fn lgw_load_conf<P: AsRef<Path>>(path: P) -> Result<LgwConf> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
        .map_err(|e| conf_error(format!("cannot read configuration {}: {}", path.display(), e)))?;
    info!(path=%path.display(), "loading configuration");
    lgw_parse_conf(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GLOBAL_CONF: &str = r#"{
        "SX1301_conf": {
            "lorawan_public": true,
            "clksrc": 1,
            "radio_0": { "enable": true, "type": "SX1257", "freq": 867500000, "rssi_offset": -166.0, "tx_enable": true, "tx_notch_freq": 129000 },
            "radio_1": { "enable": true, "type": "SX1257", "freq": 868500000, "rssi_offset": -166.0, "tx_enable": false },
            "chan_multiSF_0": { "enable": true, "radio": 1, "if": -400000 },
            "chan_multiSF_1": { "enable": true, "radio": 1, "if": -200000 },
            "chan_multiSF_7": { "enable": false, "radio": 0, "if": 400000 },
            "chan_Lora_std": { "enable": true, "radio": 1, "if": -200000, "bandwidth": 250000, "spread_factor": 12 },
            "chan_FSK": { "enable": true, "radio": 1, "if": 300000, "bandwidth": 125000, "datarate": 50000 },
            "tx_lut_0": { "pa_gain": 0, "mix_gain": 8, "rf_power": -6, "dig_gain": 0 },
            "tx_lut_1": { "pa_gain": 1, "mix_gain": 10, "rf_power": 14, "dig_gain": 0, "dac_gain": 3 }
        },
        "gateway_conf": { "gateway_ID": "AA555A0000000101", "server_address": "localhost" }
    }"#;

    #[test]
    fn parses_reference_configuration() {
        let conf = lgw_parse_conf(GLOBAL_CONF).unwrap();
        let ctx = &conf.context;

        assert_eq!(conf.gateway_id, Some(0xAA555A0000000101));
        assert!(ctx.board_cfg.lorawan_public);
        assert_eq!(ctx.board_cfg.clksrc, 1);

        assert_eq!(ctx.rf_chain_cfg[0]._type, LgwRadioType::LGW_RADIO_TYPE_SX1257);
        assert_eq!(ctx.rf_chain_cfg[0].freq_hz, 867_500_000);
        assert_eq!(ctx.rf_chain_cfg[0].tx_notch_freq, 129_000);
        assert!(!ctx.rf_chain_cfg[1].tx_enable);

        assert_eq!(ctx.if_chain_cfg[1].rf_chain, 1);
        assert_eq!(ctx.if_chain_cfg[1].freq_hz, -200_000);
        assert!(!ctx.if_chain_cfg[7].enable);
        assert_eq!(ctx.lora_multi_sfmask[0], DR_LORA_MULTI as u8);

        let std = ctx.lora_std_cfg();
        assert_eq!(std.bandwidth, BW_250KHZ);
        assert_eq!(std.datarate, DR_LORA_SF12);
        assert!(ctx.lora_rx_ppm_offset);

        let fsk = ctx.fsk_cfg();
        assert_eq!(fsk.bandwidth, BW_125KHZ);
        assert_eq!(fsk.datarate, 50_000);
        assert_eq!(fsk.sync_word_size, 3);
        assert_eq!(fsk.sync_word, 0xC194C1);

        assert_eq!(ctx.tx_gain_lut.size, 2);
        assert_eq!(ctx.tx_gain_lut.lut[0].rf_power, -6);
        assert_eq!(ctx.tx_gain_lut.lut[0].dac_gain, 3);
        assert_eq!(ctx.tx_gain_lut.lut[1].mix_gain, 10);

        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn missing_sections_keep_defaults() {
        let conf = lgw_parse_conf(r#"{ "SX1301_conf": { "radio_0": { "enable": false, "type": "SX1255", "freq": 433000000 } } }"#).unwrap();
        assert_eq!(conf.gateway_id, None);
        assert_eq!(conf.context.tx_gain_lut, LgwTxGainLut::default());
        assert_eq!(conf.context.fsk_cfg().sync_word, FSK_SYNC_WORD_DEFAULT);
        assert_eq!(conf.context.rf_chain_cfg[1]._type, LgwRadioType::LGW_RADIO_TYPE_NONE);
    }

    #[test]
    fn unknown_radio_type_is_rejected() {
        let err = lgw_parse_conf(r#"{ "SX1301_conf": { "radio_0": { "enable": true, "type": "SX9999", "freq": 868000000 } } }"#)
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ConfigurationError(_))));
    }

    #[test]
    fn non_sx125x_radio_is_rejected_at_parse_time() {
        let err = lgw_parse_conf(r#"{ "SX1301_conf": { "radio_1": { "enable": false, "type": "SX1272", "freq": 0 } } }"#)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnsupportedRadioType { rf_chain: 1, radio_type: LgwRadioType::LGW_RADIO_TYPE_SX1272 })
        ));
    }

    #[test]
    fn bad_channel_values_are_rejected() {
        let bad_sf = r#"{ "SX1301_conf": { "chan_Lora_std": { "enable": true, "bandwidth": 125000, "spread_factor": 6 } } }"#;
        assert!(lgw_parse_conf(bad_sf).is_err());

        let bad_bw = r#"{ "SX1301_conf": { "chan_Lora_std": { "enable": true, "bandwidth": 100000, "spread_factor": 7 } } }"#;
        assert!(lgw_parse_conf(bad_bw).is_err());

        let bad_fsk = r#"{ "SX1301_conf": { "chan_FSK": { "enable": true, "bandwidth": 125000, "datarate": 100 } } }"#;
        assert!(lgw_parse_conf(bad_fsk).is_err());

        /* disabled channels are not checked */
        let disabled = r#"{ "SX1301_conf": { "chan_Lora_std": { "enable": false, "spread_factor": 0 } } }"#;
        assert!(lgw_parse_conf(disabled).is_ok());
    }

    #[test]
    fn oversized_lut_is_ignored_past_sixteen() {
        let mut sx1301 = Map::new();
        for i in 0..20 {
            sx1301.insert(format!("tx_lut_{}", i), serde_json::json!({ "rf_power": i }));
        }
        let ctx = lgw_parse_sx1301_conf(&sx1301).unwrap();
        assert_eq!(ctx.tx_gain_lut.size, TX_GAIN_LUT_SIZE_MAX);
        assert_eq!(ctx.tx_gain_lut.lut[15].rf_power, 15);
    }

    #[test]
    fn rejects_documents_without_sx1301_conf() {
        assert!(lgw_parse_conf("{}").is_err());
        assert!(lgw_parse_conf("not json").is_err());
        assert!(lgw_parse_conf(r#"{ "SX1301_conf": {}, "gateway_conf": { "gateway_ID": "zz" } }"#).is_err());
    }
}
